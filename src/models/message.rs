use super::record::RecordStatus;
use crate::messaging::TypedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message flowing between stages of one pipeline run
pub trait PipelineMessage: TypedMessage {
    /// Transaction id the run was started with
    fn correlation_id(&self) -> &str;

    /// Payload-level type discriminator
    fn message_type(&self) -> &str;
}

/// Emitted by the billing stage for every accepted request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingMessage {
    #[serde(alias = "transactionId")]
    pub transaction_id: String,
    #[serde(alias = "customerId")]
    pub customer_id: String,
    #[serde(alias = "productId")]
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: RecordStatus,
    #[serde(alias = "messageType", default = "billing_message_type")]
    pub message_type: String,
    #[serde(alias = "createdAt", alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

fn billing_message_type() -> String {
    BillingMessage::MESSAGE_TYPE.to_string()
}

impl TypedMessage for BillingMessage {
    const MESSAGE_TYPE: &'static str = "BILLING_CREATED";

    fn message_key(&self) -> String {
        self.transaction_id.clone()
    }
}

impl PipelineMessage for BillingMessage {
    fn correlation_id(&self) -> &str {
        &self.transaction_id
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }
}

/// Emitted by the payment stage once a payment record exists
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentMessage {
    #[serde(alias = "paymentId")]
    pub payment_id: String,
    #[serde(alias = "transactionId")]
    pub transaction_id: String,
    #[serde(alias = "customerId")]
    pub customer_id: String,
    #[serde(alias = "productId")]
    pub product_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(alias = "paymentMethod")]
    pub payment_method: String,
    #[serde(alias = "processorReference")]
    pub processor_reference: String,
    pub status: RecordStatus,
    #[serde(alias = "messageType", default = "payment_message_type")]
    pub message_type: String,
    #[serde(alias = "processedAt", alias = "timestamp")]
    pub processed_at: DateTime<Utc>,
}

fn payment_message_type() -> String {
    PaymentMessage::MESSAGE_TYPE.to_string()
}

impl TypedMessage for PaymentMessage {
    const MESSAGE_TYPE: &'static str = "PAYMENT_PROCESSED";

    fn message_key(&self) -> String {
        self.transaction_id.clone()
    }
}

impl PipelineMessage for PaymentMessage {
    fn correlation_id(&self) -> &str {
        &self.transaction_id
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_message_accepts_camel_case() {
        let json = r#"{
            "transactionId": "T1",
            "customerId": "C1",
            "productId": "P1",
            "amount": 123.45,
            "currency": "USD",
            "status": "PENDING",
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;

        let message: BillingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.transaction_id, "T1");
        assert_eq!(message.message_type, "BILLING_CREATED");
        assert_eq!(message.status, RecordStatus::Pending);
        assert_eq!(message.message_key(), "T1");
    }

    #[test]
    fn test_payment_message_serializes_snake_case() {
        let message = PaymentMessage {
            payment_id: "P-1".to_string(),
            transaction_id: "T1".to_string(),
            customer_id: "C1".to_string(),
            product_id: "P1".to_string(),
            amount: 10.0,
            currency: "EUR".to_string(),
            payment_method: "PAYPAL".to_string(),
            processor_reference: "REF-P-1".to_string(),
            status: RecordStatus::Processed,
            message_type: PaymentMessage::MESSAGE_TYPE.to_string(),
            processed_at: Utc::now(),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["payment_id"], "P-1");
        assert_eq!(value["status"], "PROCESSED");
        assert_eq!(value["message_type"], "PAYMENT_PROCESSED");
    }
}
