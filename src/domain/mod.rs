//! Domain types shared across the lifecycle manager.
//!
//! Everything here is collaborator-agnostic: subscriptions and their
//! provisioning state machine, the offer catalog, custom meters and usage
//! bookkeeping, and ARM template parameter extraction.

mod ids;
mod meter;
mod offer;
mod subscription;
pub mod template;

pub use ids::{MeterName, OfferName, PlanName, SubscriptionId};
pub use meter::{
    floor_to_hour, BatchUsageResponse, CustomMeter, MeterDimension, MeterEventRecord,
    SubscriptionMeterUsage, UsageError, UsageErrorDetail, UsageEvent, UsageResult, UsageStatus,
};
pub use offer::{Offer, Plan};
pub use subscription::{
    FulfillmentState, ProvisioningState, ProvisioningType, Subscription, SubscriptionParameter,
    SubscriptionProvision, TRANSITIONS,
};
pub use template::{parse_parameters, TemplateParameter};
