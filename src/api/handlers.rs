use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::messaging::{DeadLetter, HttpHeaderReader, Propagator};
use crate::models::{BillingRecord, BillingRequest, BillingResponse, InvoiceRecord, PaymentRecord};
use crate::pipeline::FaultInjectionStatus;
use crate::telemetry::gather_metrics;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker_connected = state.transport.is_connected().await;
    let status = if broker_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if broker_connected { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            messaging_system: state.transport.system().to_string(),
            broker_connected,
            uptime_seconds: state.started_at.elapsed().as_secs(),
        }),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub messaging_system: String,
    pub broker_connected: bool,
    pub uptime_seconds: u64,
}

/// Prometheus scrape endpoint
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Accept a billing request; an inbound `traceparent` becomes the parent context
pub async fn create_billing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BillingRequest>,
) -> Result<Json<BillingResponse>> {
    tracing::info!(customer_id = %request.customer_id, "Received billing request");

    let inbound = Propagator::new().try_extract(&HttpHeaderReader(&headers));
    let response = state.billing.create_billing(request, inbound).await?;
    Ok(Json(response))
}

/// Get a billing record by transaction id
pub async fn get_billing(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<BillingResponse>> {
    let record = state
        .billing
        .find_billing(&transaction_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Billing {} not found", transaction_id)))?;

    Ok(Json(record.into()))
}

/// Every record of one pipeline run
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<PipelineView>> {
    let billing = state.stores.billing.find_by_id(&transaction_id).await?;
    let payments = state
        .stores
        .payment
        .find_by_correlation_id(&transaction_id)
        .await?;
    let invoices = state
        .stores
        .invoice
        .find_by_correlation_id(&transaction_id)
        .await?;

    if billing.is_none() && payments.is_empty() && invoices.is_empty() {
        return Err(AppError::NotFound(format!(
            "Transaction {} not found",
            transaction_id
        )));
    }

    let complete = billing.is_some() && !invoices.is_empty();
    Ok(Json(PipelineView {
        transaction_id,
        complete,
        billing,
        payments,
        invoices,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineView {
    pub transaction_id: String,
    /// Billing and at least one invoice exist
    pub complete: bool,
    pub billing: Option<BillingRecord>,
    pub payments: Vec<PaymentRecord>,
    pub invoices: Vec<InvoiceRecord>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Recent dead letters, newest first
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>> {
    let sink = state.dead_letters.as_ref().ok_or_else(|| {
        AppError::NotFound("Dead-letter inspection is disabled".to_string())
    })?;

    let mut entries = sink.entries();
    entries.truncate(query.limit);
    Ok(Json(entries))
}

/// Current fault injection settings
pub async fn get_fault_injection(State(state): State<AppState>) -> Json<FaultInjectionStatus> {
    Json(state.faults.status())
}

#[derive(Debug, Deserialize)]
pub struct FaultInjectionUpdate {
    pub enabled: Option<bool>,
    pub probability: Option<f64>,
}

/// Toggle fault injection at runtime
pub async fn update_fault_injection(
    State(state): State<AppState>,
    Json(update): Json<FaultInjectionUpdate>,
) -> Result<Json<FaultInjectionStatus>> {
    if let Some(probability) = update.probability {
        if !(0.0..=1.0).contains(&probability) {
            return Err(AppError::Validation(format!(
                "probability must be within 0.0..=1.0, got {}",
                probability
            )));
        }
        state.faults.set_probability(probability);
    }

    if let Some(enabled) = update.enabled {
        if state.faults.set_enabled(enabled) != enabled {
            return Err(AppError::Validation(
                "fault injection is not compiled into this build".to_string(),
            ));
        }
    }

    Ok(Json(state.faults.status()))
}
