use super::record::{BillingRecord, RecordStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Body of `POST /api/billing`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BillingRequest {
    #[serde(alias = "customerId")]
    #[validate(length(min = 1, max = 255))]
    pub customer_id: String,

    #[serde(alias = "productId")]
    #[validate(length(min = 1, max = 255))]
    pub product_id: String,

    #[validate(range(min = 0.01))]
    pub amount: f64,

    /// ISO 4217 code
    #[validate(length(equal = 3))]
    pub currency: String,
}

/// Response of `POST /api/billing` and `GET /api/billing/:transaction_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BillingResponse {
    pub transaction_id: String,
    pub customer_id: String,
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl From<BillingRecord> for BillingResponse {
    fn from(record: BillingRecord) -> Self {
        Self {
            transaction_id: record.transaction_id,
            customer_id: record.customer_id,
            product_id: record.product_id,
            amount: record.amount,
            currency: record.currency,
            status: record.status,
            created_at: record.created_at,
        }
    }
}
