//! The provisioning orchestrator and its driver loop.
//!
//! Each public step performs exactly one external side-effect and persists
//! the resulting state before returning; the scheduler re-invokes the
//! machine one step per poll cycle. Failure handling is state-scoped:
//! transient errors leave the subscription where it is for the next poll,
//! everything else moves it to `Failed` with the cause recorded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::domain::{
    FulfillmentState, Offer, Plan, ProvisioningState, ProvisioningType, Subscription,
    SubscriptionId, SubscriptionParameter, SubscriptionProvision,
};
use crate::error::{ProvisioningError, StoreError};
use crate::expr::{Context, Evaluator, Value};
use crate::port::{
    CatalogStore, FulfillmentClient, IpPool, ProvisioningClient, SubscriptionStore, UsageStore,
};

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Transient failures are retried in place this many times before the
    /// subscription moves to `Failed`.
    pub max_retry: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_retry: 3 }
    }
}

/// Drives subscriptions through the provisioning state machine.
pub struct ProvisioningOrchestrator {
    pub(crate) subscriptions: Arc<dyn SubscriptionStore>,
    pub(crate) catalog: Arc<dyn CatalogStore>,
    pub(crate) usage: Arc<dyn UsageStore>,
    pub(crate) provisioning: Arc<dyn ProvisioningClient>,
    pub(crate) fulfillment: Arc<dyn FulfillmentClient>,
    pub(crate) ip_pool: Arc<dyn IpPool>,
    pub(crate) config: OrchestratorConfig,
    rng: Mutex<StdRng>,
    rng_seed: Option<u64>,
}

impl ProvisioningOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn CatalogStore>,
        usage: Arc<dyn UsageStore>,
        provisioning: Arc<dyn ProvisioningClient>,
        fulfillment: Arc<dyn FulfillmentClient>,
        ip_pool: Arc<dyn IpPool>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            usage,
            provisioning,
            fulfillment,
            ip_pool,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            rng_seed: None,
        }
    }

    /// Use deterministic randomness for deployment names and expression
    /// evaluation; for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self.rng_seed = Some(seed);
        self
    }

    /// Perform the one step appropriate for the subscription's current
    /// state. Returns `None` when there is nothing to do (terminal state
    /// with no cleanup pending).
    pub async fn advance(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, ProvisioningError> {
        let provision = self.load(id).await?.provision_view();
        self.advance_provision(&provision).await
    }

    /// List every subscription the driver loop should touch this cycle.
    ///
    /// Unsubscribed subscriptions still inside their plan's data-retention
    /// window are skipped; so is everything in a terminal state that has
    /// no cleanup pending.
    pub async fn in_progress_provisions(
        &self,
    ) -> Result<Vec<SubscriptionProvision>, ProvisioningError> {
        let mut provisions = Vec::new();
        for subscription in self.subscriptions.list().await? {
            if subscription.status == FulfillmentState::Unsubscribed {
                let plan = self
                    .catalog
                    .plan(&subscription.offer, &subscription.plan)
                    .await?;
                let retained_until = subscription
                    .unsubscribed_time
                    .map(|t| t + chrono::Duration::days(plan.data_retention_days));
                if retained_until.is_some_and(|t| t > Utc::now()) {
                    continue;
                }
            } else if subscription.provisioning_state.is_terminal() {
                continue;
            }
            provisions.push(subscription.provision_view());
        }
        Ok(provisions)
    }

    /// The driver loop: one step per active subscription, serially, with
    /// per-subscription failure isolation. A failing subscription is
    /// logged and left for the next cycle; it never aborts the batch.
    pub async fn process_active_provisions(&self) -> Result<usize, ProvisioningError> {
        let provisions = self.in_progress_provisions().await?;
        let mut processed = 0usize;

        for provision in &provisions {
            info!(
                subscription = %provision.subscription_id,
                state = %provision.provisioning_state,
                operation = %provision.provisioning_type,
                "Advancing subscription"
            );
            match self.advance_provision(provision).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    error!(
                        subscription = %provision.subscription_id,
                        state = %provision.provisioning_state,
                        error = %e,
                        "Provisioning step failed; continuing with next subscription"
                    );
                }
            }
        }

        Ok(processed)
    }

    async fn advance_provision(
        &self,
        provision: &SubscriptionProvision,
    ) -> Result<Option<Subscription>, ProvisioningError> {
        let id = provision.subscription_id;
        let subscription = match provision.provisioning_state {
            ProvisioningState::ProvisioningPending => self.create_resource_group(id).await?,
            ProvisioningState::DeployResourceGroupRunning => self.check_resource_group(id).await?,
            ProvisioningState::ArmTemplatePending => self.deploy_template(id).await?,
            ProvisioningState::ArmTemplateRunning => self.check_deployment(id).await?,
            ProvisioningState::WebhookPending => self.execute_webhook(id).await?,
            ProvisioningState::NotificationPending => {
                if provision.provisioning_type == ProvisioningType::Subscribe {
                    self.activate_subscription(id).await?
                } else {
                    self.complete_operation(id).await?
                }
            }
            ProvisioningState::Succeeded => {
                // Terminal-and-unsubscribed gets its own arm: past the
                // retention window the subscription re-enters the machine
                // to run its data-deletion operation.
                if provision.subscription_status == FulfillmentState::Unsubscribed {
                    info!(subscription = %id, "Starting data deletion");
                    self.start_delete_data(id).await?
                } else {
                    return Ok(None);
                }
            }
            ProvisioningState::Failed | ProvisioningState::NotSpecified => {
                warn!(
                    subscription = %id,
                    state = %provision.provisioning_state,
                    "Subscription requires operator attention; skipping"
                );
                return Ok(None);
            }
        };
        Ok(Some(subscription))
    }

    pub(crate) async fn load(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        self.subscriptions.get(id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => ProvisioningError::SubscriptionNotFound {
                subscription: id.as_uuid(),
            },
            other => ProvisioningError::Store(other),
        })
    }

    pub(crate) fn ensure_state(
        subscription: &Subscription,
        step: &'static str,
        expected: ProvisioningState,
    ) -> Result<(), ProvisioningError> {
        if subscription.provisioning_state != expected {
            return Err(ProvisioningError::WrongState {
                step,
                state: subscription.provisioning_state.to_string(),
            });
        }
        Ok(())
    }

    /// Persist a transition, enforcing the transition table. Retry count
    /// resets on every successful move.
    pub(crate) async fn transit(
        &self,
        subscription: &mut Subscription,
        to: ProvisioningState,
    ) -> Result<(), ProvisioningError> {
        if !subscription.provisioning_state.can_transition(to) {
            return Err(ProvisioningError::InvalidTransition {
                from: subscription.provisioning_state.to_string(),
                to: to.to_string(),
            });
        }

        info!(
            subscription = %subscription.id,
            from = %subscription.provisioning_state,
            to = %to,
            "Provisioning state transition"
        );

        subscription.provisioning_state = to;
        subscription.retry_count = 0;
        subscription.last_updated_time = Utc::now();
        self.subscriptions.update(subscription).await?;
        Ok(())
    }

    /// Record a step failure on the subscription: transient errors stay in
    /// place and burn a retry, everything else (or an exhausted retry
    /// budget) moves to `Failed`.
    pub(crate) async fn record_step_failure(
        &self,
        subscription: &mut Subscription,
        step: &'static str,
        error: ProvisioningError,
    ) -> ProvisioningError {
        error!(
            subscription = %subscription.id,
            step,
            error = %error,
            "Provisioning step error"
        );

        if !error.is_retryable() || subscription.retry_count >= self.config.max_retry {
            subscription.provisioning_state = ProvisioningState::Failed;
            subscription.retry_count = 0;
        } else {
            subscription.retry_count += 1;
        }
        subscription.last_exception = Some(error.to_string());
        subscription.last_updated_time = Utc::now();

        if let Err(persist) = self.subscriptions.update(subscription).await {
            error!(
                subscription = %subscription.id,
                error = %persist,
                "Failed to persist step failure"
            );
        }

        error
    }

    /// Seed an evaluation context with system parameters and every value
    /// already persisted for the subscription.
    pub(crate) async fn build_context(
        &self,
        offer: &Offer,
        plan: &Plan,
        subscription: &Subscription,
    ) -> Result<Context, ProvisioningError> {
        let mut context = Context::new(
            &offer.name,
            &subscription.owner,
            subscription.id,
            &plan.name,
            subscription.provisioning_type,
        )
        .with_ip_pool(Arc::clone(&self.ip_pool));
        if let Some(seed) = self.rng_seed {
            context = context.with_rng_seed(seed);
        }

        for parameter in self.subscriptions.parameters_for(subscription.id).await? {
            context.insert_if_absent(&parameter.name, Value::Str(parameter.value));
        }

        Ok(context)
    }

    /// Evaluate the offer's declared parameters in dependency order and
    /// persist any newly resolved values for later passes.
    pub(crate) async fn evaluate_parameters(
        &self,
        offer: &Offer,
        plan: &Plan,
        subscription: &Subscription,
    ) -> Result<BTreeMap<String, Value>, ProvisioningError> {
        let context = self.build_context(offer, plan, subscription).await?;
        let declarations = self.catalog.parameter_expressions(&offer.name).await?;

        let mut evaluator = Evaluator::new(context);
        evaluator.evaluate_all(&declarations)?;

        for (name, value) in evaluator.context().parameters() {
            self.subscriptions
                .save_parameter(&SubscriptionParameter {
                    subscription_id: subscription.id,
                    name: name.clone(),
                    value: value.to_string(),
                })
                .await?;
        }

        let context = evaluator.into_context();
        Ok(context.parameters().clone())
    }

    /// Deployment names carry a random 4-digit suffix so redeployments
    /// within a plan don't collide.
    pub(crate) fn deployment_name(&self, offer: &Offer, plan: &Plan) -> String {
        let suffix: u16 = self.rng.lock().gen_range(0..10_000);
        format!("{}{}{suffix:04}", plan.name, offer.name)
    }
}
