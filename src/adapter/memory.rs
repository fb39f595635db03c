//! In-memory implementations of the persistence ports.
//!
//! Backed by `parking_lot` locks; the compare-and-swap in
//! [`MemorySubscriptionStore::transition`] holds the write lock across the
//! check and the update, which is the single-process equivalent of a row
//! lock. Also the substrate the integration tests run against.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::cidr;
use crate::domain::{
    floor_to_hour, CustomMeter, FulfillmentState, MeterName, Offer, OfferName, Plan, PlanName,
    ProvisioningState, Subscription, SubscriptionId, SubscriptionMeterUsage, SubscriptionParameter,
};
use crate::error::StoreError;
use crate::port::{
    AuditRecord, AuditSink, CatalogStore, IpPool, SubscriptionPatch, SubscriptionStore, UsageStore,
};

/// Subscriptions and their resolved parameters.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    parameters: RwLock<BTreeMap<(SubscriptionId, String), SubscriptionParameter>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        self.subscriptions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "subscription",
                key: id.to_string(),
            })
    }

    async fn exists(&self, id: SubscriptionId) -> Result<bool, StoreError> {
        Ok(self.subscriptions.read().contains_key(&id))
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.subscriptions.read().values().cloned().collect())
    }

    async fn create(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::Conflict {
                kind: "subscription",
                key: subscription.id.to_string(),
                reason: "already exists".to_string(),
            });
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.write();
        if !subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::NotFound {
                kind: "subscription",
                key: subscription.id.to_string(),
            });
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn transition(
        &self,
        id: SubscriptionId,
        expected_state: ProvisioningState,
        expected_status: Option<FulfillmentState>,
        patch: SubscriptionPatch,
    ) -> Result<Subscription, StoreError> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "subscription",
            key: id.to_string(),
        })?;

        if subscription.provisioning_state != expected_state {
            return Err(StoreError::Conflict {
                kind: "subscription",
                key: id.to_string(),
                reason: subscription.provisioning_state.to_string(),
            });
        }
        if let Some(status) = expected_status {
            if subscription.status != status {
                return Err(StoreError::Conflict {
                    kind: "subscription",
                    key: id.to_string(),
                    reason: format!("status {}", subscription.status),
                });
            }
        }

        if let Some(state) = patch.provisioning_state {
            subscription.provisioning_state = state;
        }
        if let Some(operation) = patch.provisioning_type {
            subscription.provisioning_type = operation;
        }
        if let Some(operation_id) = patch.operation_id {
            subscription.operation_id = Some(operation_id);
        }
        if let Some(plan) = patch.plan {
            subscription.plan = plan;
        }
        if let Some(quantity) = patch.quantity {
            subscription.quantity = quantity;
        }
        if let Some(t) = patch.last_updated_time {
            subscription.last_updated_time = t;
        }

        Ok(subscription.clone())
    }

    async fn save_parameter(&self, parameter: &SubscriptionParameter) -> Result<(), StoreError> {
        let key = (parameter.subscription_id, parameter.name.clone());
        let mut parameters = self.parameters.write();
        // First write wins; re-evaluation never rewrites history.
        parameters.entry(key).or_insert_with(|| parameter.clone());
        Ok(())
    }

    async fn parameters_for(
        &self,
        id: SubscriptionId,
    ) -> Result<Vec<SubscriptionParameter>, StoreError> {
        Ok(self
            .parameters
            .read()
            .values()
            .filter(|p| p.subscription_id == id)
            .cloned()
            .collect())
    }

    async fn delete_data(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.parameters
            .write()
            .retain(|(subscription, _), _| *subscription != id);
        Ok(())
    }
}

/// Offer catalog: configuration-time data, populated at startup.
#[derive(Default)]
pub struct MemoryCatalogStore {
    offers: RwLock<BTreeMap<OfferName, Offer>>,
    plans: RwLock<BTreeMap<(OfferName, PlanName), Plan>>,
    templates: RwLock<BTreeMap<(OfferName, String), String>>,
    parameters: RwLock<BTreeMap<OfferName, Vec<(String, String)>>>,
    meters: RwLock<BTreeMap<OfferName, Vec<CustomMeter>>>,
    dimensions: RwLock<Vec<(OfferName, PlanName, MeterName)>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_offer(&self, offer: Offer) {
        self.offers.write().insert(offer.name.clone(), offer);
    }

    pub fn add_plan(&self, plan: Plan) {
        self.plans
            .write()
            .insert((plan.offer.clone(), plan.name.clone()), plan);
    }

    pub fn add_template(&self, offer: OfferName, name: impl Into<String>, content: impl Into<String>) {
        self.templates
            .write()
            .insert((offer, name.into()), content.into());
    }

    /// Declare a parameter expression for an offer; declaration order is
    /// preserved.
    pub fn add_parameter(&self, offer: OfferName, name: impl Into<String>, expression: impl Into<String>) {
        self.parameters
            .write()
            .entry(offer)
            .or_default()
            .push((name.into(), expression.into()));
    }

    pub fn add_meter(&self, meter: CustomMeter) {
        self.meters
            .write()
            .entry(meter.offer.clone())
            .or_default()
            .push(meter);
    }

    pub fn add_dimension(&self, offer: OfferName, plan: PlanName, meter: MeterName) {
        self.dimensions.write().push((offer, plan, meter));
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn offer(&self, name: &OfferName) -> Result<Offer, StoreError> {
        self.offers
            .read()
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "offer",
                key: name.to_string(),
            })
    }

    async fn offers(&self) -> Result<Vec<Offer>, StoreError> {
        Ok(self.offers.read().values().cloned().collect())
    }

    async fn plan(&self, offer: &OfferName, name: &PlanName) -> Result<Plan, StoreError> {
        self.plans
            .read()
            .get(&(offer.clone(), name.clone()))
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "plan",
                key: format!("{offer}/{name}"),
            })
    }

    async fn arm_template(&self, offer: &OfferName, name: &str) -> Result<String, StoreError> {
        self.templates
            .read()
            .get(&(offer.clone(), name.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "arm template",
                key: format!("{offer}/{name}"),
            })
    }

    async fn parameter_expressions(
        &self,
        offer: &OfferName,
    ) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self.parameters.read().get(offer).cloned().unwrap_or_default())
    }

    async fn meters(&self, offer: &OfferName) -> Result<Vec<CustomMeter>, StoreError> {
        Ok(self.meters.read().get(offer).cloned().unwrap_or_default())
    }

    async fn dimension_exists(
        &self,
        offer: &OfferName,
        plan: &PlanName,
        meter: &MeterName,
    ) -> Result<bool, StoreError> {
        Ok(self
            .dimensions
            .read()
            .iter()
            .any(|(o, p, m)| o == offer && p == plan && m == meter))
    }
}

/// Per-(subscription, meter) usage bookkeeping.
#[derive(Default)]
pub struct MemoryUsageStore {
    usages: RwLock<BTreeMap<(SubscriptionId, MeterName), SubscriptionMeterUsage>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(
        &self,
        subscription: SubscriptionId,
        meter: &MeterName,
    ) -> Result<Option<SubscriptionMeterUsage>, StoreError> {
        Ok(self
            .usages
            .read()
            .get(&(subscription, meter.clone()))
            .cloned())
    }

    async fn create(&self, usage: &SubscriptionMeterUsage) -> Result<(), StoreError> {
        let key = (usage.subscription_id, usage.meter.clone());
        let mut usages = self.usages.write();
        if usages.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: "meter usage",
                key: format!("{}/{}", usage.subscription_id, usage.meter),
                reason: "already exists".to_string(),
            });
        }
        usages.insert(key, usage.clone());
        Ok(())
    }

    async fn update(&self, usage: &SubscriptionMeterUsage) -> Result<(), StoreError> {
        let key = (usage.subscription_id, usage.meter.clone());
        let mut usages = self.usages.write();
        if !usages.contains_key(&key) {
            return Err(StoreError::NotFound {
                kind: "meter usage",
                key: format!("{}/{}", usage.subscription_id, usage.meter),
            });
        }
        usages.insert(key, usage.clone());
        Ok(())
    }

    async fn effective_start_time(
        &self,
        meter: &MeterName,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .usages
            .read()
            .values()
            .filter(|u| &u.meter == meter && u.enabled)
            .map(|u| u.last_updated_time)
            .min()
            .map(floor_to_hour))
    }

    async fn advance_unreported(
        &self,
        meter: &MeterName,
        window_end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut usages = self.usages.write();
        for usage in usages.values_mut() {
            let eligible = usage.meter == *meter
                && usage.enabled
                && usage.last_updated_time < window_end
                && usage
                    .last_error_reported_time
                    .map_or(true, |t| t < window_end);
            if eligible {
                usage.last_updated_time = window_end;
                if usage.unsubscribed_time.is_some_and(|t| t < window_end) {
                    usage.enabled = false;
                    usage.disabled_time = Some(window_end);
                }
            }
        }
        Ok(())
    }

    async fn mark_unsubscribed(
        &self,
        subscription: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut usages = self.usages.write();
        for usage in usages.values_mut() {
            if usage.subscription_id == subscription && usage.enabled {
                usage.unsubscribed_time = Some(at);
            }
        }
        Ok(())
    }
}

struct PoolState {
    cidr: String,
    range_size: u64,
    next_offset: u64,
    assigned: BTreeMap<SubscriptionId, String>,
}

/// Address pools keyed by (offer, ip config name). Hands out consecutive
/// non-overlapping sub-ranges and remembers each subscription's
/// assignment, so re-evaluation is stable.
#[derive(Default)]
pub struct MemoryIpPool {
    pools: RwLock<BTreeMap<(OfferName, String), PoolState>>,
}

impl MemoryIpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool carved into `range_size`-address sub-ranges.
    pub fn add_pool(
        &self,
        offer: OfferName,
        config_name: impl Into<String>,
        pool_cidr: impl Into<String>,
        range_size: u64,
    ) {
        self.pools.write().insert(
            (offer, config_name.into()),
            PoolState {
                cidr: pool_cidr.into(),
                range_size,
                next_offset: 0,
                assigned: BTreeMap::new(),
            },
        );
    }
}

impl IpPool for MemoryIpPool {
    fn assign_range(
        &self,
        subscription: SubscriptionId,
        offer: &OfferName,
        config_name: &str,
    ) -> Result<String, StoreError> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(&(offer.clone(), config_name.to_string()))
            .ok_or(StoreError::NotFound {
                kind: "ip pool",
                key: format!("{offer}/{config_name}"),
            })?;

        if let Some(existing) = pool.assigned.get(&subscription) {
            return Ok(existing.clone());
        }

        let range = cidr::subdivide(&pool.cidr, pool.next_offset, pool.range_size)
            .map_err(|e| StoreError::Other(format!("ip pool {offer}/{config_name}: {e}")))?;
        pool.next_offset += pool.range_size;
        pool.assigned.insert(subscription, range.clone());
        Ok(range)
    }
}

/// Collects audit records in memory; `records()` is for assertions.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.records.write().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProvisioningType;
    use chrono::TimeZone;

    fn subscription(state: ProvisioningState, status: FulfillmentState) -> Subscription {
        let mut s = Subscription::new(
            SubscriptionId::random(),
            OfferName::from("contoso"),
            PlanName::from("basic"),
            "owner@contoso.example",
            1,
            Utc::now(),
        );
        s.provisioning_state = state;
        s.status = status;
        s
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn transition_applies_patch_when_expectation_holds() {
        let store = MemorySubscriptionStore::new();
        let s = subscription(ProvisioningState::Succeeded, FulfillmentState::Subscribed);
        store.create(&s).await.unwrap();

        let updated = store
            .transition(
                s.id,
                ProvisioningState::Succeeded,
                Some(FulfillmentState::Subscribed),
                SubscriptionPatch {
                    provisioning_state: Some(ProvisioningState::ArmTemplatePending),
                    provisioning_type: Some(ProvisioningType::Suspend),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.provisioning_state, ProvisioningState::ArmTemplatePending);
        assert_eq!(updated.provisioning_type, ProvisioningType::Suspend);
    }

    #[tokio::test]
    async fn transition_conflicts_on_state_mismatch() {
        let store = MemorySubscriptionStore::new();
        let s = subscription(
            ProvisioningState::ArmTemplatePending,
            FulfillmentState::Subscribed,
        );
        store.create(&s).await.unwrap();

        let err = store
            .transition(
                s.id,
                ProvisioningState::Succeeded,
                Some(FulfillmentState::Subscribed),
                SubscriptionPatch::default(),
            )
            .await
            .unwrap_err();

        match err {
            StoreError::Conflict { reason, .. } => assert_eq!(reason, "ArmTemplatePending"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_parameter_is_first_write_wins() {
        let store = MemorySubscriptionStore::new();
        let id = SubscriptionId::random();
        let first = SubscriptionParameter {
            subscription_id: id,
            name: "vnet".into(),
            value: "10.0.0.0/24".into(),
        };
        let second = SubscriptionParameter {
            value: "10.1.0.0/24".into(),
            ..first.clone()
        };

        store.save_parameter(&first).await.unwrap();
        store.save_parameter(&second).await.unwrap();

        let saved = store.parameters_for(id).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].value, "10.0.0.0/24");
    }

    #[tokio::test]
    async fn effective_start_time_is_min_enabled_floored() {
        let store = MemoryUsageStore::new();
        let meter = MeterName::from("api-calls");

        let mut a = SubscriptionMeterUsage::new(SubscriptionId::random(), meter.clone(), hour(5));
        a.last_updated_time = Utc.with_ymd_and_hms(2026, 3, 14, 5, 30, 0).unwrap();
        let b = SubscriptionMeterUsage::new(SubscriptionId::random(), meter.clone(), hour(3));
        let mut c = SubscriptionMeterUsage::new(SubscriptionId::random(), meter.clone(), hour(1));
        c.enabled = false;

        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store.create(&c).await.unwrap();

        assert_eq!(
            store.effective_start_time(&meter).await.unwrap(),
            Some(hour(3))
        );
    }

    #[tokio::test]
    async fn advance_unreported_skips_errored_records() {
        let store = MemoryUsageStore::new();
        let meter = MeterName::from("api-calls");

        let quiet = SubscriptionMeterUsage::new(SubscriptionId::random(), meter.clone(), hour(1));
        let mut errored = SubscriptionMeterUsage::new(SubscriptionId::random(), meter.clone(), hour(1));
        errored.last_error_reported_time = Some(hour(2));

        store.create(&quiet).await.unwrap();
        store.create(&errored).await.unwrap();

        store.advance_unreported(&meter, hour(2)).await.unwrap();

        let quiet = store.get(quiet.subscription_id, &meter).await.unwrap().unwrap();
        let errored = store.get(errored.subscription_id, &meter).await.unwrap().unwrap();
        assert_eq!(quiet.last_updated_time, hour(2));
        assert_eq!(errored.last_updated_time, hour(1), "errored record must not advance");
    }

    #[test]
    fn ip_pool_hands_out_disjoint_ranges_and_is_stable_per_subscription() {
        let pool = MemoryIpPool::new();
        let offer = OfferName::from("contoso");
        pool.add_pool(offer.clone(), "vnet", "10.0.0.0/24", 16);

        let first = SubscriptionId::random();
        let second = SubscriptionId::random();

        let a = pool.assign_range(first, &offer, "vnet").unwrap();
        let b = pool.assign_range(second, &offer, "vnet").unwrap();
        let a_again = pool.assign_range(first, &offer, "vnet").unwrap();

        assert_eq!(a, "10.0.0.0/28");
        assert_eq!(b, "10.0.0.16/28");
        assert_eq!(a, a_again);
    }

    #[test]
    fn ip_pool_exhaustion_is_an_error() {
        let pool = MemoryIpPool::new();
        let offer = OfferName::from("contoso");
        pool.add_pool(offer.clone(), "vnet", "10.0.0.0/28", 16);

        pool.assign_range(SubscriptionId::random(), &offer, "vnet").unwrap();
        let err = pool
            .assign_range(SubscriptionId::random(), &offer, "vnet")
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
    }
}
