//! Adapters implementing the ports in `crate::port`.
//!
//! `memory` backs the persistence-side ports with process-local state;
//! `rest` speaks JSON over HTTP to the outbound collaborators.

pub mod memory;
pub mod rest;

pub use memory::{
    MemoryAuditSink, MemoryCatalogStore, MemoryIpPool, MemorySubscriptionStore, MemoryUsageStore,
};
pub use rest::{
    RestFulfillmentClient, RestMeteringClient, RestProvisioningClient, RestTelemetryConnector,
};
