pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::messaging::{InMemoryDeadLetterSink, MessageTransport};
use crate::pipeline::{BillingService, FaultInjector, PipelineRuntime};
use crate::state::StoreSet;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub stores: StoreSet,
    pub faults: Arc<FaultInjector>,
    pub transport: Arc<dyn MessageTransport>,
    pub dead_letters: Option<Arc<InMemoryDeadLetterSink>>,
    pub started_at: Instant,
    /// Billing routes are mounted only where the billing stage runs
    pub billing_enabled: bool,
}

impl AppState {
    pub fn new(runtime: &PipelineRuntime) -> Self {
        Self {
            billing: runtime.billing(),
            stores: runtime.stores().clone(),
            faults: runtime.faults(),
            transport: runtime.transport(),
            dead_letters: None,
            started_at: Instant::now(),
            billing_enabled: runtime.hosts_billing(),
        }
    }

    /// Expose recent dead letters through the API
    pub fn with_dead_letters(mut self, dead_letters: Arc<InMemoryDeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }
}
