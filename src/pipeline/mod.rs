//! Billing → payment → invoice stages
//!
//! Billing is the HTTP entry point and only publishes. Payment and invoice
//! consume through [`StageRunner`], which owns context extraction, payload
//! decoding and fault injection so each stage only holds its business step.

pub mod billing;
pub mod fault;
pub mod invoice;
pub mod metrics;
pub mod payment;
pub mod runtime;
pub mod stage;

pub use billing::BillingService;
pub use fault::{FaultInjectionStatus, FaultInjector};
pub use invoice::InvoiceStage;
pub use metrics::{init_stage_metrics, STAGE_METRICS};
pub use payment::{payment_method_for, processor_reference, PaymentStage};
pub use runtime::PipelineRuntime;
pub use stage::{Stage, StageRunner};
