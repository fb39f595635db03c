//! Persistence ports.
//!
//! The lifecycle manager never owns a schema; it reads and writes records
//! through these traits. Implementations must be thread-safe and must back
//! [`SubscriptionStore::transition`] with a real compare-and-swap (row
//! lock or equivalent), since the orchestrator may run on multiple
//! instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    CustomMeter, FulfillmentState, MeterName, Offer, OfferName, Plan, PlanName, ProvisioningState,
    ProvisioningType, Subscription, SubscriptionId, SubscriptionMeterUsage, SubscriptionParameter,
};
use crate::error::StoreError;

/// Field updates applied atomically by [`SubscriptionStore::transition`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub provisioning_state: Option<ProvisioningState>,
    pub provisioning_type: Option<ProvisioningType>,
    pub operation_id: Option<Uuid>,
    pub plan: Option<PlanName>,
    pub quantity: Option<i64>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

/// Subscription records and their resolved parameters.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError>;

    async fn exists(&self, id: SubscriptionId) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Create a new subscription record; conflict if the id exists.
    async fn create(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Atomically apply `patch` if the record is currently in
    /// `expected_state` (and `expected_status`, when given). This is the
    /// exclusivity check for webhook-driven operations: check-then-act
    /// against persisted state, not a process-local lock.
    ///
    /// Returns [`StoreError::Conflict`] when the expectation does not hold.
    async fn transition(
        &self,
        id: SubscriptionId,
        expected_state: ProvisioningState,
        expected_status: Option<FulfillmentState>,
        patch: SubscriptionPatch,
    ) -> Result<Subscription, StoreError>;

    /// Persist a resolved parameter value unless one already exists.
    async fn save_parameter(&self, parameter: &SubscriptionParameter) -> Result<(), StoreError>;

    async fn parameters_for(
        &self,
        id: SubscriptionId,
    ) -> Result<Vec<SubscriptionParameter>, StoreError>;

    /// Remove the subscription's dependent data (resolved parameters and
    /// anything else provisioned alongside it). The subscription record
    /// itself remains, with `Purged` status set by the caller.
    async fn delete_data(&self, id: SubscriptionId) -> Result<(), StoreError>;
}

/// Offer catalog: offers, plans, templates, meters, dimension mappings and
/// declared parameter expressions. Configuration-time data, read-mostly.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn offer(&self, name: &OfferName) -> Result<Offer, StoreError>;

    async fn offers(&self) -> Result<Vec<Offer>, StoreError>;

    async fn plan(&self, offer: &OfferName, name: &PlanName) -> Result<Plan, StoreError>;

    /// The JSON content of a named ARM template.
    async fn arm_template(&self, offer: &OfferName, name: &str) -> Result<String, StoreError>;

    /// Declared parameter expressions for an offer (ARM template and
    /// webhook parameters combined), in declaration order.
    async fn parameter_expressions(
        &self,
        offer: &OfferName,
    ) -> Result<Vec<(String, String)>, StoreError>;

    async fn meters(&self, offer: &OfferName) -> Result<Vec<CustomMeter>, StoreError>;

    /// Whether (offer, plan, meter) maps to a billable dimension.
    async fn dimension_exists(
        &self,
        offer: &OfferName,
        plan: &PlanName,
        meter: &MeterName,
    ) -> Result<bool, StoreError>;
}

/// Per-(subscription, meter) usage bookkeeping. Meter names are the
/// billing dimensions and are unique across offers.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get(
        &self,
        subscription: SubscriptionId,
        meter: &MeterName,
    ) -> Result<Option<SubscriptionMeterUsage>, StoreError>;

    async fn create(&self, usage: &SubscriptionMeterUsage) -> Result<(), StoreError>;

    async fn update(&self, usage: &SubscriptionMeterUsage) -> Result<(), StoreError>;

    /// Earliest enabled watermark for a meter, floored to the hour; `None`
    /// when no enabled usage record exists (the meter is unused).
    async fn effective_start_time(
        &self,
        meter: &MeterName,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Advance every enabled usage for `meter` whose watermark and error
    /// marker are both behind `window_end`; disables records past their
    /// unsubscribe time. Covers subscriptions that produced no events in
    /// the settled window.
    async fn advance_unreported(
        &self,
        meter: &MeterName,
        window_end: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stamp the unsubscribe time onto every enabled usage record of a
    /// subscription.
    async fn mark_unsubscribed(
        &self,
        subscription: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Address-pool collaborator backing the `GetIpRange` helper.
///
/// Synchronous on purpose: it is called from inside the expression
/// evaluator, which runs single-pass without suspension points. Which
/// offsets are in use is this collaborator's bookkeeping, not the
/// allocator's.
pub trait IpPool: Send + Sync {
    /// Assign (and mark used) a fresh range for the subscription from the
    /// named pool of the offer.
    fn assign_range(
        &self,
        subscription: SubscriptionId,
        offer: &OfferName,
        config_name: &str,
    ) -> Result<String, StoreError>;
}
