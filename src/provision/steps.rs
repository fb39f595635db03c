//! Per-state step handlers.
//!
//! Every step follows the same shape: load the subscription, check the
//! step's input state, run the single external side-effect, persist the
//! resulting transition. Errors are recorded through
//! `record_step_failure`, which decides between retry-in-place and
//! `Failed`.

use chrono::Utc;
use serde_json::json;
use tracing::info;
use url::Url;

use super::orchestrator::ProvisioningOrchestrator;
use crate::domain::{
    self, FulfillmentState, Offer, Plan, ProvisioningState, ProvisioningType, Subscription,
    SubscriptionId,
};
use crate::error::ProvisioningError;
use crate::port::{ActivatedSubscription, DeploymentStatus, OperationStatus, OperationUpdate};

impl ProvisioningOrchestrator {
    /// `ProvisioningPending` -> `DeployResourceGroupRunning` (or straight
    /// to `WebhookPending` when the plan deploys nothing).
    pub async fn create_resource_group(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "create_resource_group",
            ProvisioningState::ProvisioningPending,
        )?;

        match self.do_create_resource_group(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "create_resource_group", e)
                    .await)
            }
        }
    }

    async fn do_create_resource_group(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let offer = self.catalog.offer(&subscription.offer).await?;
        let plan = self
            .catalog
            .plan(&subscription.offer, &subscription.plan)
            .await?;

        let parameters = self.evaluate_parameters(&offer, &plan, subscription).await?;
        subscription.entry_point_url = parameters.get("entryPointUrl").map(|v| v.to_string());

        if plan.template_for(subscription.provisioning_type).is_none() {
            // Nothing to deploy for this plan; go straight to the webhook.
            return self.transit(subscription, ProvisioningState::WebhookPending).await;
        }

        let location = parameters
            .get("resourceGroupLocation")
            .map(|v| v.to_string())
            .ok_or_else(|| ProvisioningError::MissingParameter {
                name: "resourceGroupLocation".to_string(),
            })?;

        let resource_group = format!("{}-{}", offer.name, subscription.id);

        if self
            .provisioning
            .resource_group_exists(offer.host_subscription, &resource_group)
            .await?
        {
            return Err(ProvisioningError::ResourceGroupExists {
                name: resource_group,
            });
        }

        self.provisioning
            .create_resource_group(offer.host_subscription, &resource_group, &location)
            .await?;

        info!(
            subscription = %subscription.id,
            resource_group = %resource_group,
            location = %location,
            "Deploying resource group"
        );

        subscription.resource_group = Some(resource_group);
        self.transit(subscription, ProvisioningState::DeployResourceGroupRunning)
            .await
    }

    /// Poll resource-group creation; stays in
    /// `DeployResourceGroupRunning` until the group exists.
    pub async fn check_resource_group(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "check_resource_group",
            ProvisioningState::DeployResourceGroupRunning,
        )?;

        match self.do_check_resource_group(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "check_resource_group", e)
                    .await)
            }
        }
    }

    async fn do_check_resource_group(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let offer = self.catalog.offer(&subscription.offer).await?;
        let resource_group = subscription.resource_group.clone().ok_or_else(|| {
            ProvisioningError::Client {
                operation: "check_resource_group",
                resource: subscription.id.to_string(),
                reason: "no resource group is recorded for the subscription".to_string(),
                retryable: false,
            }
        })?;

        if self
            .provisioning
            .resource_group_exists(offer.host_subscription, &resource_group)
            .await?
        {
            info!(
                subscription = %subscription.id,
                resource_group = %resource_group,
                "Resource group deployment succeeded"
            );
            self.transit(subscription, ProvisioningState::ArmTemplatePending)
                .await
        } else {
            info!(
                subscription = %subscription.id,
                resource_group = %resource_group,
                "Resource group deployment in progress"
            );
            self.transit(subscription, ProvisioningState::DeployResourceGroupRunning)
                .await
        }
    }

    /// `ArmTemplatePending` -> `ArmTemplateRunning`. Falls back to
    /// `ProvisioningPending` when the resource group is missing, and skips
    /// to `WebhookPending` when the operation has no template.
    pub async fn deploy_template(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "deploy_template",
            ProvisioningState::ArmTemplatePending,
        )?;

        match self.do_deploy_template(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "deploy_template", e)
                    .await)
            }
        }
    }

    async fn do_deploy_template(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let Some(resource_group) = subscription.resource_group.clone() else {
            // The group was never created; go back and create it first.
            return self
                .transit(subscription, ProvisioningState::ProvisioningPending)
                .await;
        };

        let offer = self.catalog.offer(&subscription.offer).await?;
        let plan = self
            .catalog
            .plan(&subscription.offer, &subscription.plan)
            .await?;

        let Some(template_name) = plan.template_for(subscription.provisioning_type) else {
            // No template for this operation; nothing to deploy.
            return self.transit(subscription, ProvisioningState::WebhookPending).await;
        };

        // Subscribe evaluates parameters while creating the resource
        // group; every other operation re-evaluates here.
        if subscription.provisioning_type != ProvisioningType::Subscribe {
            self.evaluate_parameters(&offer, &plan, subscription).await?;
        }

        let content = self.catalog.arm_template(&offer.name, template_name).await?;
        let declared = domain::parse_parameters(&content)?;

        let context = self.build_context(&offer, &plan, subscription).await?;
        let mut values = serde_json::Map::new();
        for parameter in &declared {
            let value = context.get(&parameter.name).ok_or_else(|| {
                ProvisioningError::MissingParameter {
                    name: parameter.name.clone(),
                }
            })?;
            values.insert(parameter.name.clone(), json!({ "value": parameter_json(value) }));
        }

        let deployment_name = self.deployment_name(&offer, &plan);

        self.provisioning
            .deploy_template(
                offer.host_subscription,
                &resource_group,
                &deployment_name,
                &content,
                &serde_json::Value::Object(values),
            )
            .await?;

        info!(
            subscription = %subscription.id,
            resource_group = %resource_group,
            deployment = %deployment_name,
            "Running ARM deployment"
        );

        subscription.deployment_name = Some(deployment_name);
        self.transit(subscription, ProvisioningState::ArmTemplateRunning)
            .await
    }

    /// Poll the ARM deployment; `ArmTemplateRunning` -> `WebhookPending`
    /// on success.
    pub async fn check_deployment(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "check_deployment",
            ProvisioningState::ArmTemplateRunning,
        )?;

        match self.do_check_deployment(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "check_deployment", e)
                    .await)
            }
        }
    }

    async fn do_check_deployment(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let offer = self.catalog.offer(&subscription.offer).await?;
        let (resource_group, deployment_name) = match (
            subscription.resource_group.clone(),
            subscription.deployment_name.clone(),
        ) {
            (Some(rg), Some(d)) => (rg, d),
            _ => {
                return Err(ProvisioningError::Client {
                    operation: "check_deployment",
                    resource: subscription.id.to_string(),
                    reason: "no deployment is recorded for the subscription".to_string(),
                    retryable: false,
                })
            }
        };

        match self
            .provisioning
            .deployment_status(offer.host_subscription, &resource_group, &deployment_name)
            .await?
        {
            DeploymentStatus::Succeeded => {
                info!(
                    subscription = %subscription.id,
                    deployment = %deployment_name,
                    "ARM deployment succeeded"
                );
                self.transit(subscription, ProvisioningState::WebhookPending)
                    .await
            }
            DeploymentStatus::Running => {
                info!(
                    subscription = %subscription.id,
                    deployment = %deployment_name,
                    "ARM deployment in progress"
                );
                self.transit(subscription, ProvisioningState::ArmTemplateRunning)
                    .await
            }
            DeploymentStatus::Failed => Err(ProvisioningError::DeploymentFailed {
                name: deployment_name,
            }),
        }
    }

    /// `WebhookPending` -> `NotificationPending`, invoking the
    /// per-operation webhook when one is configured.
    pub async fn execute_webhook(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "execute_webhook",
            ProvisioningState::WebhookPending,
        )?;

        match self.do_execute_webhook(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "execute_webhook", e)
                    .await)
            }
        }
    }

    async fn do_execute_webhook(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let offer = self.catalog.offer(&subscription.offer).await?;
        let plan = self
            .catalog
            .plan(&subscription.offer, &subscription.plan)
            .await?;

        if let Some(raw) = plan.webhook_for(subscription.provisioning_type) {
            let url = self
                .substitute_webhook_parameters(raw, &offer, &plan, subscription)
                .await?;

            self.provisioning.execute_webhook(url.clone()).await?;

            info!(
                subscription = %subscription.id,
                webhook = %url,
                "Webhook executed"
            );
        }

        self.transit(subscription, ProvisioningState::NotificationPending)
            .await
    }

    /// Replace `{name}` query placeholders with values from the evaluation
    /// context, re-evaluating the parameter set once if a placeholder is
    /// not yet resolved.
    async fn substitute_webhook_parameters(
        &self,
        raw: &str,
        offer: &Offer,
        plan: &Plan,
        subscription: &Subscription,
    ) -> Result<Url, ProvisioningError> {
        let mut url = Url::parse(raw).map_err(|e| ProvisioningError::Client {
            operation: "execute_webhook",
            resource: raw.to_string(),
            reason: format!("webhook URL does not parse: {e}"),
            retryable: false,
        })?;

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut context = self.build_context(offer, plan, subscription).await?;
        let mut reevaluated = false;
        let mut resolved = Vec::with_capacity(pairs.len());

        for (key, value) in pairs {
            let substituted = match placeholder_name(&value) {
                None => value,
                Some(name) => match context.get(name) {
                    Some(v) => v.to_string(),
                    None => {
                        if !reevaluated {
                            // The value may come from a parameter added
                            // after the last evaluation pass.
                            self.evaluate_parameters(offer, plan, subscription).await?;
                            context = self.build_context(offer, plan, subscription).await?;
                            reevaluated = true;
                        }
                        match context.get(name) {
                            Some(v) => v.to_string(),
                            None => {
                                return Err(ProvisioningError::MissingParameter {
                                    name: name.to_string(),
                                })
                            }
                        }
                    }
                },
            };
            resolved.push((key, substituted));
        }

        if resolved.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(resolved);
        }

        Ok(url)
    }

    /// Terminal step of the Subscribe flow: activate with the marketplace
    /// and settle into `Succeeded`.
    pub async fn activate_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "activate_subscription",
            ProvisioningState::NotificationPending,
        )?;

        match self.do_activate_subscription(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "activate_subscription", e)
                    .await)
            }
        }
    }

    async fn do_activate_subscription(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let plan = self
            .catalog
            .plan(&subscription.offer, &subscription.plan)
            .await?;

        self.fulfillment
            .activate_subscription(
                subscription.id,
                &ActivatedSubscription {
                    plan: plan.name.clone(),
                    quantity: subscription.quantity,
                },
            )
            .await?;

        info!(
            subscription = %subscription.id,
            plan = %plan.name,
            quantity = subscription.quantity,
            "Subscription activated"
        );

        subscription.status = FulfillmentState::Subscribed;
        subscription.activated_time = Some(Utc::now());
        subscription.activated_by = Some("system".to_string());
        self.transit(subscription, ProvisioningState::Succeeded).await
    }

    /// Terminal step for every non-Subscribe operation: report completion
    /// to the marketplace and settle the subscription status by operation.
    pub async fn complete_operation(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let mut subscription = self.load(id).await?;
        Self::ensure_state(
            &subscription,
            "complete_operation",
            ProvisioningState::NotificationPending,
        )?;

        match self.do_complete_operation(&mut subscription).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                Err(self
                    .record_step_failure(&mut subscription, "complete_operation", e)
                    .await)
            }
        }
    }

    async fn do_complete_operation(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), ProvisioningError> {
        let plan = self
            .catalog
            .plan(&subscription.offer, &subscription.plan)
            .await?;

        // Data deletion is internal; the marketplace has no operation for it.
        if subscription.provisioning_type != ProvisioningType::DeleteData {
            self.fulfillment
                .update_operation(
                    subscription.id,
                    subscription.operation_id.unwrap_or_else(uuid::Uuid::nil),
                    &OperationUpdate {
                        plan: plan.name.clone(),
                        quantity: subscription.quantity,
                        status: OperationStatus::Success,
                    },
                )
                .await?;
        }

        let now = Utc::now();
        match subscription.provisioning_type {
            ProvisioningType::Update | ProvisioningType::Reinstate => {
                subscription.status = FulfillmentState::Subscribed;
            }
            ProvisioningType::Suspend => {
                subscription.last_suspended_time = Some(now);
                subscription.status = FulfillmentState::Suspended;
            }
            ProvisioningType::Unsubscribe => {
                subscription.unsubscribed_time = Some(now);
                subscription.status = FulfillmentState::Unsubscribed;
            }
            ProvisioningType::DeleteData => {
                self.subscriptions.delete_data(subscription.id).await?;
                subscription.status = FulfillmentState::Purged;
            }
            ProvisioningType::Subscribe => {
                return Err(ProvisioningError::Client {
                    operation: "complete_operation",
                    resource: subscription.id.to_string(),
                    reason: "Subscribe operations complete through activation".to_string(),
                    retryable: false,
                })
            }
        }

        info!(
            subscription = %subscription.id,
            operation = %subscription.provisioning_type,
            status = %subscription.status,
            "Operation completed"
        );

        self.transit(subscription, ProvisioningState::Succeeded).await
    }
}

/// `{name}` query values are placeholders; anything else passes through.
fn placeholder_name(value: &str) -> Option<&str> {
    value
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

fn parameter_json(value: &crate::expr::Value) -> serde_json::Value {
    match value {
        crate::expr::Value::Int(n) => json!(n),
        crate::expr::Value::Str(s) => json!(s),
    }
}
