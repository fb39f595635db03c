//! Trait definitions (hexagonal ports). Depend only on domain.
//!
//! Ports are the seams between the lifecycle core and its collaborators:
//! persistence, the provisioning API, the marketplace fulfillment API, the
//! telemetry pipeline, the billing API, and the audit sink. Adapters in
//! `crate::adapter` implement them.

mod audit;
mod fulfillment;
mod metering;
mod provisioning;
mod store;
mod telemetry;

pub use audit::{AuditKind, AuditRecord, AuditSink};
pub use fulfillment::{ActivatedSubscription, FulfillmentClient, OperationStatus, OperationUpdate};
pub use metering::MeteringClient;
pub use provisioning::{DeploymentStatus, ProvisioningClient};
pub use store::{CatalogStore, IpPool, SubscriptionPatch, SubscriptionStore, UsageStore};
pub use telemetry::TelemetryConnector;
