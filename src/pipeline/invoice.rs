//! Invoice stage: `PAYMENT_PROCESSED` in, invoice record out. Terminal.
//!
//! The store write is handed to a bounded executor that carries the stage's
//! trace context onto the worker task; the handler awaits its outcome so a
//! failed write still reaches the retry policy.

use crate::config::StageKind;
use crate::messaging::{
    current_context, ContextPropagatingExecutor, HandlerError, HandlerResult, TraceContext,
};
use crate::models::{InvoiceRecord, PaymentMessage, RecordStatus};
use crate::pipeline::metrics::STAGE_METRICS;
use crate::pipeline::stage::Stage;
use crate::state::RecordStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct InvoiceStage {
    store: Arc<dyn RecordStore<InvoiceRecord>>,
    executor: ContextPropagatingExecutor,
}

impl InvoiceStage {
    pub fn new(store: Arc<dyn RecordStore<InvoiceRecord>>, workers: usize) -> Self {
        Self {
            store,
            executor: ContextPropagatingExecutor::new(workers),
        }
    }
}

#[async_trait]
impl Stage for InvoiceStage {
    type Input = PaymentMessage;
    const KIND: StageKind = StageKind::Invoice;

    async fn process(&self, input: PaymentMessage, context: &TraceContext) -> HandlerResult {
        let record = InvoiceRecord {
            invoice_id: Uuid::new_v4().to_string(),
            correlation_id: input.transaction_id.clone(),
            transaction_id: input.transaction_id,
            payment_id: input.payment_id,
            customer_id: input.customer_id,
            product_id: input.product_id,
            amount: input.amount,
            currency: input.currency,
            payment_method: input.payment_method,
            processor_reference: input.processor_reference,
            status: RecordStatus::Generated,
            created_at: Utc::now(),
        };

        let store = self.store.clone();
        let write = self.executor.spawn(context.clone(), async move {
            store.save(&record).await?;
            if let Some(active) = current_context() {
                info!(
                    invoice_id = %record.invoice_id,
                    payment_id = %record.payment_id,
                    transaction_id = %record.transaction_id,
                    trace_id = %active.trace_id(),
                    span_id = %active.span_id(),
                    "Invoice saved"
                );
            }
            Ok::<_, HandlerError>(())
        });

        match write.await {
            Ok(result) => {
                result?;
                STAGE_METRICS
                    .records_saved
                    .with_label_values(&[StageKind::Invoice.as_ref()])
                    .inc();
                Ok(())
            }
            Err(e) => Err(HandlerError::processing(format!(
                "invoice write task failed: {}",
                e
            ))),
        }
    }
}
