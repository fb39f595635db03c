//! Shared test harness: in-memory stores plus scripted fake collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use url::Url;
use uuid::Uuid;

use steward::adapter::{
    MemoryAuditSink, MemoryCatalogStore, MemoryIpPool, MemorySubscriptionStore, MemoryUsageStore,
};
use steward::domain::{
    BatchUsageResponse, CustomMeter, FulfillmentState, MeterEventRecord, MeterName, Offer,
    OfferName, Plan, PlanName, ProvisioningState, Subscription, SubscriptionId,
    SubscriptionMeterUsage, UsageError, UsageEvent, UsageResult, UsageStatus,
};
use steward::error::{MeteringError, ProvisioningError};
use steward::metering::{MeteringConfig, MeteringReconciler};
use steward::port::{
    ActivatedSubscription, DeploymentStatus, FulfillmentClient, MeteringClient, OperationUpdate,
    ProvisioningClient, TelemetryConnector,
};
use steward::provision::{OrchestratorConfig, ProvisioningOrchestrator};

pub const HOST_SUBSCRIPTION: Uuid = Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);

/// How a scripted failure behaves.
#[derive(Debug, Clone)]
pub struct FailureScript {
    pub reason: String,
    pub retryable: bool,
    /// One-shot failures clear after firing once.
    pub one_shot: bool,
}

/// Scripted provisioning collaborator. Responses are queues popped per
/// call; empty queues fall back to benign defaults.
#[derive(Default)]
pub struct FakeProvisioningClient {
    /// Per-operation failure scripts, keyed by port method name.
    pub failures: Mutex<HashMap<&'static str, FailureScript>>,
    /// Queue of answers for `resource_group_exists` (default `false`).
    pub rg_exists: Mutex<Vec<bool>>,
    /// Queue of answers for `deployment_status` (default `Succeeded`).
    pub deployment_statuses: Mutex<Vec<DeploymentStatus>>,
    pub created_groups: Mutex<Vec<(String, String)>>,
    pub deployments: Mutex<Vec<(String, serde_json::Value)>>,
    pub webhooks: Mutex<Vec<Url>>,
}

impl FakeProvisioningClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_once(&self, operation: &'static str, reason: &str, retryable: bool) {
        self.failures.lock().insert(
            operation,
            FailureScript {
                reason: reason.to_string(),
                retryable,
                one_shot: true,
            },
        );
    }

    pub fn fail_always(&self, operation: &'static str, reason: &str, retryable: bool) {
        self.failures.lock().insert(
            operation,
            FailureScript {
                reason: reason.to_string(),
                retryable,
                one_shot: false,
            },
        );
    }

    fn check_failure(&self, operation: &'static str) -> Result<(), ProvisioningError> {
        let mut failures = self.failures.lock();
        let Some(script) = failures.get(operation).cloned() else {
            return Ok(());
        };
        if script.one_shot {
            failures.remove(operation);
        }
        Err(ProvisioningError::Client {
            operation,
            resource: "scripted".to_string(),
            reason: script.reason,
            retryable: script.retryable,
        })
    }
}

#[async_trait]
impl ProvisioningClient for FakeProvisioningClient {
    async fn resource_group_exists(
        &self,
        _host_subscription: Uuid,
        _resource_group: &str,
    ) -> Result<bool, ProvisioningError> {
        self.check_failure("resource_group_exists")?;
        let mut queue = self.rg_exists.lock();
        Ok(if queue.is_empty() {
            false
        } else {
            queue.remove(0)
        })
    }

    async fn create_resource_group(
        &self,
        _host_subscription: Uuid,
        resource_group: &str,
        location: &str,
    ) -> Result<(), ProvisioningError> {
        self.check_failure("create_resource_group")?;
        self.created_groups
            .lock()
            .push((resource_group.to_string(), location.to_string()));
        Ok(())
    }

    async fn deploy_template(
        &self,
        _host_subscription: Uuid,
        _resource_group: &str,
        deployment_name: &str,
        _template: &str,
        parameters: &serde_json::Value,
    ) -> Result<(), ProvisioningError> {
        self.check_failure("deploy_template")?;
        self.deployments
            .lock()
            .push((deployment_name.to_string(), parameters.clone()));
        Ok(())
    }

    async fn deployment_status(
        &self,
        _host_subscription: Uuid,
        _resource_group: &str,
        _deployment_name: &str,
    ) -> Result<DeploymentStatus, ProvisioningError> {
        self.check_failure("deployment_status")?;
        let mut queue = self.deployment_statuses.lock();
        Ok(if queue.is_empty() {
            DeploymentStatus::Succeeded
        } else {
            queue.remove(0)
        })
    }

    async fn execute_webhook(&self, url: Url) -> Result<(), ProvisioningError> {
        self.check_failure("execute_webhook")?;
        self.webhooks.lock().push(url);
        Ok(())
    }
}

/// Scripted fulfillment collaborator; records what the orchestrator sends.
#[derive(Default)]
pub struct FakeFulfillmentClient {
    pub activations: Mutex<Vec<(SubscriptionId, ActivatedSubscription)>>,
    pub operation_updates: Mutex<Vec<(SubscriptionId, Uuid, OperationUpdate)>>,
}

impl FakeFulfillmentClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FulfillmentClient for FakeFulfillmentClient {
    async fn activate_subscription(
        &self,
        subscription: SubscriptionId,
        activation: &ActivatedSubscription,
    ) -> Result<(), ProvisioningError> {
        self.activations
            .lock()
            .push((subscription, activation.clone()));
        Ok(())
    }

    async fn update_operation(
        &self,
        subscription: SubscriptionId,
        operation: Uuid,
        update: &OperationUpdate,
    ) -> Result<(), ProvisioningError> {
        self.operation_updates
            .lock()
            .push((subscription, operation, update.clone()));
        Ok(())
    }
}

/// Telemetry source with pre-loaded events keyed by window start.
#[derive(Default)]
pub struct FakeTelemetryConnector {
    pub events: Mutex<HashMap<DateTime<Utc>, Vec<MeterEventRecord>>>,
    pub queries: Mutex<Vec<DateTime<Utc>>>,
}

impl FakeTelemetryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, window_start: DateTime<Utc>, event: MeterEventRecord) {
        self.events.lock().entry(window_start).or_default().push(event);
    }
}

#[async_trait]
impl TelemetryConnector for FakeTelemetryConnector {
    async fn meter_events_by_hour(
        &self,
        start: DateTime<Utc>,
        _query: &str,
    ) -> Result<Vec<MeterEventRecord>, MeteringError> {
        self.queries.lock().push(start);
        Ok(self.events.lock().get(&start).cloned().unwrap_or_default())
    }
}

/// Next scripted billing behavior; the default (empty queue) accepts
/// every event.
pub enum BillingScript {
    /// Classify every event in the batch with this status.
    AllWith(UsageStatus),
    /// Classify per resource id; anything unlisted is Accepted.
    PerResource(HashMap<String, UsageStatus>),
    /// Fail the whole submission (transport-level).
    Fail(String),
}

/// Scripted billing collaborator; records every submission.
#[derive(Default)]
pub struct FakeMeteringClient {
    pub scripts: Mutex<Vec<BillingScript>>,
    pub calls: Mutex<Vec<(Uuid, Uuid, Vec<UsageEvent>)>>,
}

impl FakeMeteringClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, script: BillingScript) {
        self.scripts.lock().push(script);
    }

    fn classify(events: &[UsageEvent], status_for: impl Fn(&UsageEvent) -> UsageStatus) -> BatchUsageResponse {
        BatchUsageResponse {
            results: events
                .iter()
                .map(|e| {
                    let status = status_for(e);
                    let error = match &status {
                        UsageStatus::Accepted | UsageStatus::Duplicate | UsageStatus::Expired => None,
                        other => Some(UsageError {
                            code: other.to_string(),
                            message: "scripted failure".to_string(),
                            target: None,
                            details: Vec::new(),
                        }),
                    };
                    UsageResult {
                        resource_id: e.resource_id.to_string(),
                        dimension: e.dimension.clone(),
                        effective_start_time: e.effective_start_time,
                        status,
                        error,
                    }
                })
                .collect(),
        }
    }
}

#[async_trait]
impl MeteringClient for FakeMeteringClient {
    async fn record_batch_usage(
        &self,
        request_id: Uuid,
        correlation_id: Uuid,
        events: &[UsageEvent],
    ) -> Result<BatchUsageResponse, MeteringError> {
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                None
            } else {
                Some(scripts.remove(0))
            }
        };

        let response = match script {
            None => Self::classify(events, |_| UsageStatus::Accepted),
            Some(BillingScript::AllWith(status)) => {
                Self::classify(events, |_| status.clone())
            }
            Some(BillingScript::PerResource(map)) => Self::classify(events, |e| {
                map.get(&e.resource_id.to_string())
                    .cloned()
                    .unwrap_or(UsageStatus::Accepted)
            }),
            Some(BillingScript::Fail(reason)) => {
                return Err(MeteringError::Transport { reason });
            }
        };

        self.calls
            .lock()
            .push((request_id, correlation_id, events.to_vec()));
        Ok(response)
    }
}

/// Everything a test needs, wired over the in-memory adapters.
pub struct TestEnv {
    pub subscriptions: Arc<MemorySubscriptionStore>,
    pub catalog: Arc<MemoryCatalogStore>,
    pub usage: Arc<MemoryUsageStore>,
    pub ip_pool: Arc<MemoryIpPool>,
    pub audit: Arc<MemoryAuditSink>,
    pub provisioning: Arc<FakeProvisioningClient>,
    pub fulfillment: Arc<FakeFulfillmentClient>,
    pub telemetry: Arc<FakeTelemetryConnector>,
    pub billing: Arc<FakeMeteringClient>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(MemorySubscriptionStore::new()),
            catalog: Arc::new(MemoryCatalogStore::new()),
            usage: Arc::new(MemoryUsageStore::new()),
            ip_pool: Arc::new(MemoryIpPool::new()),
            audit: Arc::new(MemoryAuditSink::new()),
            provisioning: Arc::new(FakeProvisioningClient::new()),
            fulfillment: Arc::new(FakeFulfillmentClient::new()),
            telemetry: Arc::new(FakeTelemetryConnector::new()),
            billing: Arc::new(FakeMeteringClient::new()),
        }
    }

    pub fn orchestrator(&self) -> ProvisioningOrchestrator {
        ProvisioningOrchestrator::new(
            self.subscriptions.clone(),
            self.catalog.clone(),
            self.usage.clone(),
            self.provisioning.clone(),
            self.fulfillment.clone(),
            self.ip_pool.clone(),
            OrchestratorConfig::default(),
        )
        .with_rng_seed(42)
    }

    pub fn reconciler(&self) -> MeteringReconciler {
        let mut connectors: HashMap<String, Arc<dyn TelemetryConnector>> = HashMap::new();
        connectors.insert("test".to_string(), self.telemetry.clone());
        MeteringReconciler::new(
            self.catalog.clone(),
            self.subscriptions.clone(),
            self.usage.clone(),
            connectors,
            self.billing.clone(),
            self.audit.clone(),
            MeteringConfig::default(),
        )
    }

    /// Seed the standard offer/plan pair used across tests.
    pub fn seed_offer(&self) -> (OfferName, PlanName) {
        let offer = OfferName::from("contoso");
        let plan = PlanName::from("basic");
        self.catalog.add_offer(Offer {
            name: offer.clone(),
            host_subscription: HOST_SUBSCRIPTION,
        });
        self.catalog.add_plan(Plan {
            offer: offer.clone(),
            name: plan.clone(),
            data_retention_days: 0,
            subscribe_template: None,
            unsubscribe_template: None,
            suspend_template: None,
            delete_data_template: None,
            subscribe_webhook: None,
            unsubscribe_webhook: None,
            suspend_webhook: None,
            delete_data_webhook: None,
        });
        (offer, plan)
    }

    /// Replace the seeded plan wholesale.
    pub fn set_plan(&self, plan: Plan) {
        self.catalog.add_plan(plan);
    }

    pub async fn seed_subscription(
        &self,
        offer: &OfferName,
        plan: &PlanName,
        state: ProvisioningState,
        status: FulfillmentState,
    ) -> SubscriptionId {
        use steward::port::SubscriptionStore;

        let mut subscription = Subscription::new(
            SubscriptionId::random(),
            offer.clone(),
            plan.clone(),
            "owner@contoso.example",
            1,
            Utc::now(),
        );
        subscription.provisioning_state = state;
        subscription.status = status;
        self.subscriptions.create(&subscription).await.unwrap();
        subscription.id
    }

    pub async fn seed_meter(&self, offer: &OfferName, plan: &PlanName) -> MeterName {
        let meter = MeterName::from("api-calls");
        self.catalog.add_meter(CustomMeter {
            offer: offer.clone(),
            name: meter.clone(),
            telemetry_connector: "test".to_string(),
            telemetry_query: "requests | summarize".to_string(),
        });
        self.catalog
            .add_dimension(offer.clone(), plan.clone(), meter.clone());
        meter
    }

    pub async fn seed_usage(
        &self,
        subscription: SubscriptionId,
        meter: &MeterName,
        watermark: DateTime<Utc>,
    ) -> SubscriptionMeterUsage {
        use steward::port::UsageStore;

        let usage = SubscriptionMeterUsage::new(subscription, meter.clone(), watermark);
        self.usage.create(&usage).await.unwrap();
        usage
    }

    pub async fn subscription(&self, id: SubscriptionId) -> Subscription {
        use steward::port::SubscriptionStore;
        self.subscriptions.get(id).await.unwrap()
    }

    pub async fn usage_record(
        &self,
        id: SubscriptionId,
        meter: &MeterName,
    ) -> SubscriptionMeterUsage {
        use steward::port::UsageStore;
        self.usage.get(id, meter).await.unwrap().unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A usage event as the telemetry pipeline would report it.
pub fn meter_event(subscription: SubscriptionId, at: DateTime<Utc>) -> MeterEventRecord {
    MeterEventRecord {
        resource_id: subscription.to_string(),
        quantity: rust_decimal::Decimal::new(25, 0),
        dimension: "api-calls".to_string(),
        effective_start_time: at,
    }
}

/// The shared shutdown channel tests pass as a cancellation token.
pub fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    // Leak the sender so the channel stays open for the test's lifetime.
    std::mem::forget(tx);
    rx
}
