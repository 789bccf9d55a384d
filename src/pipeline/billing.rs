//! Entry stage: HTTP request to billing record and `BILLING_CREATED` message

use crate::config::StageKind;
use crate::error::Result;
use crate::messaging::{
    MessageHeaders, MessageTransport, MessageTransportExt, Propagator, TraceContext, TypedMessage,
};
use crate::models::{BillingMessage, BillingRecord, BillingRequest, BillingResponse, RecordStatus};
use crate::pipeline::metrics::STAGE_METRICS;
use crate::state::RecordStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use validator::Validate;

pub struct BillingService {
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn RecordStore<BillingRecord>>,
    destination: String,
    propagator: Propagator,
}

impl BillingService {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn RecordStore<BillingRecord>>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            destination: destination.into(),
            propagator: Propagator::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Accept a billing request under a fresh transaction id.
    ///
    /// `inbound` is the caller's trace context, if the request carried one.
    pub async fn create_billing(
        &self,
        request: BillingRequest,
        inbound: Option<TraceContext>,
    ) -> Result<BillingResponse> {
        self.create_billing_as(Uuid::new_v4().to_string(), request, inbound)
            .await
    }

    /// Accept a billing request under a caller-chosen transaction id
    pub async fn create_billing_as(
        &self,
        transaction_id: String,
        request: BillingRequest,
        inbound: Option<TraceContext>,
    ) -> Result<BillingResponse> {
        request.validate()?;

        let context = inbound
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::new_root);
        let span = info_span!(
            "stage",
            stage = %StageKind::Billing,
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            correlation_id = %transaction_id,
        );

        let result = self
            .submit(transaction_id, request, &context)
            .instrument(span)
            .await;

        STAGE_METRICS
            .processed
            .with_label_values(&[
                StageKind::Billing.as_ref(),
                if result.is_ok() { "success" } else { "error" },
            ])
            .inc();
        result
    }

    async fn submit(
        &self,
        transaction_id: String,
        request: BillingRequest,
        context: &TraceContext,
    ) -> Result<BillingResponse> {
        let record = BillingRecord {
            transaction_id: transaction_id.clone(),
            correlation_id: transaction_id,
            customer_id: request.customer_id,
            product_id: request.product_id,
            amount: request.amount,
            currency: request.currency,
            status: RecordStatus::Pending,
            created_at: Utc::now(),
        };
        self.store.save(&record).await?;
        STAGE_METRICS
            .records_saved
            .with_label_values(&[StageKind::Billing.as_ref()])
            .inc();

        let message = BillingMessage {
            transaction_id: record.transaction_id.clone(),
            customer_id: record.customer_id.clone(),
            product_id: record.product_id.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            status: record.status,
            message_type: BillingMessage::MESSAGE_TYPE.to_string(),
            created_at: record.created_at,
        };

        let mut headers = MessageHeaders::new();
        self.propagator.inject(context, &mut headers);
        self.transport
            .publish_json(&self.destination, &message, headers)
            .await?;

        info!(
            transaction_id = %record.transaction_id,
            amount = record.amount,
            currency = %record.currency,
            destination = %self.destination,
            "Billing record created and published"
        );
        Ok(record.into())
    }

    pub async fn find_billing(&self, transaction_id: &str) -> Result<Option<BillingRecord>> {
        Ok(self.store.find_by_id(transaction_id).await?)
    }
}
