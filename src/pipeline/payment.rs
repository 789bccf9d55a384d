//! Payment stage: `BILLING_CREATED` in, payment record and `PAYMENT_PROCESSED` out

use crate::config::StageKind;
use crate::messaging::{
    HandlerResult, MessageHeaders, MessageTransport, MessageTransportExt, Propagator,
    TraceContext, TypedMessage,
};
use crate::models::{BillingMessage, PaymentMessage, PaymentRecord, RecordStatus};
use crate::pipeline::metrics::STAGE_METRICS;
use crate::pipeline::stage::Stage;
use crate::state::RecordStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const PAYMENT_METHODS: [&str; 4] = ["CREDIT_CARD", "DEBIT_CARD", "PAYPAL", "BANK_TRANSFER"];

/// Deterministic payment method for a customer.
///
/// Polynomial (31) string hash over UTF-16 units, so a customer always maps
/// to the same method across restarts and hosts.
pub fn payment_method_for(customer_id: &str) -> &'static str {
    let hash = customer_id
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32));
    let index = (hash % PAYMENT_METHODS.len() as i32).unsigned_abs() as usize;
    PAYMENT_METHODS[index]
}

/// Processor reference derived from the payment id
pub fn processor_reference(payment_id: &str) -> String {
    let prefix: String = payment_id.chars().take(8).collect();
    format!("REF-{}", prefix)
}

pub struct PaymentStage {
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn RecordStore<PaymentRecord>>,
    destination: String,
    propagator: Propagator,
}

impl PaymentStage {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn RecordStore<PaymentRecord>>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            destination: destination.into(),
            propagator: Propagator::new(),
        }
    }
}

#[async_trait]
impl Stage for PaymentStage {
    type Input = BillingMessage;
    const KIND: StageKind = StageKind::Payment;

    async fn process(&self, input: BillingMessage, context: &TraceContext) -> HandlerResult {
        let payment_id = Uuid::new_v4().to_string();
        let record = PaymentRecord {
            payment_id: payment_id.clone(),
            correlation_id: input.transaction_id.clone(),
            transaction_id: input.transaction_id,
            payment_method: payment_method_for(&input.customer_id).to_string(),
            processor_reference: processor_reference(&payment_id),
            customer_id: input.customer_id,
            product_id: input.product_id,
            amount: input.amount,
            currency: input.currency,
            status: RecordStatus::Processed,
            created_at: Utc::now(),
        };
        self.store.save(&record).await?;
        STAGE_METRICS
            .records_saved
            .with_label_values(&[StageKind::Payment.as_ref()])
            .inc();

        let message = PaymentMessage {
            payment_id: record.payment_id.clone(),
            transaction_id: record.transaction_id.clone(),
            customer_id: record.customer_id.clone(),
            product_id: record.product_id.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            payment_method: record.payment_method.clone(),
            processor_reference: record.processor_reference.clone(),
            status: record.status,
            message_type: PaymentMessage::MESSAGE_TYPE.to_string(),
            processed_at: record.created_at,
        };

        let mut headers = MessageHeaders::new();
        self.propagator.inject(context, &mut headers);
        self.transport
            .publish_json(&self.destination, &message, headers)
            .await?;

        info!(
            transaction_id = %record.transaction_id,
            payment_id = %record.payment_id,
            payment_method = %record.payment_method,
            destination = %self.destination,
            "Payment processed and published"
        );
        Ok(())
    }
}
