use crate::api::{handlers, AppState};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Routes for the billing entry point and pipeline inspection
pub fn build_router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        // Operations
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics));

    if state.billing_enabled {
        // Entry stage
        router = router
            .route("/api/billing", post(handlers::create_billing))
            .route("/api/billing/:transaction_id", get(handlers::get_billing));
    }

    router
        // Inspection
        .route("/api/pipeline/:transaction_id", get(handlers::get_pipeline))
        .route("/api/dead-letters", get(handlers::list_dead_letters))
        .route(
            "/api/admin/fault-injection",
            get(handlers::get_fault_injection).put(handlers::update_fault_injection),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
}
