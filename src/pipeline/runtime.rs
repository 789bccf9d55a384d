use crate::config::{Config, StageKind};
use crate::error::Result;
use crate::messaging::{MessageHandler, MessageTransport, Subscription};
use crate::pipeline::billing::BillingService;
use crate::pipeline::fault::FaultInjector;
use crate::pipeline::invoice::InvoiceStage;
use crate::pipeline::payment::PaymentStage;
use crate::pipeline::stage::StageRunner;
use crate::state::StoreSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Running pipeline: the entry service plus the consuming stages hosted here
pub struct PipelineRuntime {
    billing: Arc<BillingService>,
    faults: Arc<FaultInjector>,
    stores: StoreSet,
    transport: Arc<dyn MessageTransport>,
    subscriptions: Vec<Subscription>,
    hosts_billing: bool,
}

impl PipelineRuntime {
    /// Subscribe every consuming stage listed in `config.pipeline.stages`
    pub async fn start(
        config: &Config,
        transport: Arc<dyn MessageTransport>,
        stores: StoreSet,
    ) -> Result<Self> {
        let destinations = config.messaging.destinations().clone();
        let concurrency = config.messaging.concurrency();
        let faults = Arc::new(FaultInjector::new(&config.pipeline.fault_injection));

        let billing = Arc::new(BillingService::new(
            transport.clone(),
            stores.billing.clone(),
            destinations.billing.clone(),
        ));

        let mut subscriptions = Vec::new();

        if config.pipeline.hosts(StageKind::Payment) {
            let stage = Arc::new(PaymentStage::new(
                transport.clone(),
                stores.payment.clone(),
                destinations.payment.clone(),
            ));
            let handler: Arc<dyn MessageHandler> =
                Arc::new(StageRunner::new(stage, faults.clone()));
            subscriptions.push(
                transport
                    .subscribe(&destinations.billing, concurrency, handler)
                    .await?,
            );
        }

        if config.pipeline.hosts(StageKind::Invoice) {
            let stage = Arc::new(InvoiceStage::new(
                stores.invoice.clone(),
                config.pipeline.invoice_workers,
            ));
            let handler: Arc<dyn MessageHandler> =
                Arc::new(StageRunner::new(stage, faults.clone()));
            subscriptions.push(
                transport
                    .subscribe(&destinations.payment, concurrency, handler)
                    .await?,
            );
        }

        info!(
            system = %transport.system(),
            stages = ?config.pipeline.stages,
            subscriptions = subscriptions.len(),
            "Pipeline started"
        );

        Ok(Self {
            billing,
            faults,
            stores,
            transport,
            subscriptions,
            hosts_billing: config.pipeline.hosts(StageKind::Billing),
        })
    }

    /// Whether this process serves the HTTP entry stage
    pub fn hosts_billing(&self) -> bool {
        self.hosts_billing
    }

    pub fn billing(&self) -> Arc<BillingService> {
        self.billing.clone()
    }

    pub fn faults(&self) -> Arc<FaultInjector> {
        self.faults.clone()
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn transport(&self) -> Arc<dyn MessageTransport> {
        self.transport.clone()
    }

    /// Destinations with an active subscription
    pub fn subscribed(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.destination()).collect()
    }

    /// Drain subscriptions, then close the broker connection
    pub async fn shutdown(self) {
        for subscription in self.subscriptions {
            subscription.shutdown().await;
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Transport close failed");
        }
        info!("Pipeline stopped");
    }
}
