use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Lifecycle status stamped on records and messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Processed,
    Generated,
}

/// A record persisted by exactly one pipeline stage
pub trait PipelineRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table (or tree) holding records of this type
    const TABLE: &'static str;

    /// Stage-assigned entity id
    fn id(&self) -> &str;

    /// Transaction id shared by every record of one pipeline run
    fn correlation_id(&self) -> &str;
}

/// Billing stage record, written on HTTP entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingRecord {
    pub transaction_id: String,
    pub correlation_id: String,
    pub customer_id: String,
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl PipelineRecord for BillingRecord {
    const TABLE: &'static str = "billing_records";

    fn id(&self) -> &str {
        &self.transaction_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Payment stage record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub correlation_id: String,
    pub transaction_id: String,
    pub customer_id: String,
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    pub processor_reference: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl PipelineRecord for PaymentRecord {
    const TABLE: &'static str = "payment_records";

    fn id(&self) -> &str {
        &self.payment_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Invoice stage record; the pipeline's terminal output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub correlation_id: String,
    pub transaction_id: String,
    pub payment_id: String,
    pub customer_id: String,
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    pub processor_reference: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl PipelineRecord for InvoiceRecord {
    const TABLE: &'static str = "invoice_records";

    fn id(&self) -> &str {
        &self.invoice_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}
