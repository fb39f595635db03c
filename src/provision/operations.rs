//! Webhook-driven subscription operations.
//!
//! These arrive asynchronously from the billing platform and are decoupled
//! from the polling loop. At most one provisioning operation may be in
//! flight per subscription: every entry point here goes through the
//! store's compare-and-swap, which atomically requires the subscription to
//! be settled (`Succeeded`) before accepting new work.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::orchestrator::ProvisioningOrchestrator;
use crate::domain::{
    FulfillmentState, PlanName, ProvisioningState, ProvisioningType, Subscription, SubscriptionId,
};
use crate::error::{ProvisioningError, StoreError};
use crate::port::SubscriptionPatch;

impl ProvisioningOrchestrator {
    /// Begin unsubscribing. Also stamps the unsubscribe time onto the
    /// subscription's meter usage records so metering can wind down.
    pub async fn unsubscribe(
        &self,
        id: SubscriptionId,
        operation_id: Uuid,
    ) -> Result<Subscription, ProvisioningError> {
        let now = Utc::now();
        let subscription = self
            .begin_operation(
                id,
                FulfillmentState::Subscribed,
                ProvisioningType::Unsubscribe,
                operation_id,
                SubscriptionPatch::default(),
            )
            .await?;

        self.usage.mark_unsubscribed(id, now).await?;

        info!(subscription = %id, operation = %operation_id, "Unsubscribe accepted");
        Ok(subscription)
    }

    /// Begin suspending a subscription (payment issues, typically).
    pub async fn suspend(
        &self,
        id: SubscriptionId,
        operation_id: Uuid,
    ) -> Result<Subscription, ProvisioningError> {
        let subscription = self
            .begin_operation(
                id,
                FulfillmentState::Subscribed,
                ProvisioningType::Suspend,
                operation_id,
                SubscriptionPatch::default(),
            )
            .await?;

        info!(subscription = %id, operation = %operation_id, "Suspend accepted");
        Ok(subscription)
    }

    /// Begin reinstating a suspended subscription.
    pub async fn reinstate(
        &self,
        id: SubscriptionId,
        operation_id: Uuid,
    ) -> Result<Subscription, ProvisioningError> {
        let subscription = self
            .begin_operation(
                id,
                FulfillmentState::Suspended,
                ProvisioningType::Reinstate,
                operation_id,
                SubscriptionPatch::default(),
            )
            .await?;

        info!(subscription = %id, operation = %operation_id, "Reinstate accepted");
        Ok(subscription)
    }

    /// Begin a plan change; re-provisions under the new plan.
    pub async fn change_plan(
        &self,
        id: SubscriptionId,
        new_plan: PlanName,
        operation_id: Uuid,
    ) -> Result<Subscription, ProvisioningError> {
        let current = self.load(id).await?;
        // Validate the target plan exists before touching any state.
        self.catalog.plan(&current.offer, &new_plan).await?;

        let subscription = self
            .begin_operation(
                id,
                FulfillmentState::Subscribed,
                ProvisioningType::Update,
                operation_id,
                SubscriptionPatch {
                    plan: Some(new_plan.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            subscription = %id,
            operation = %operation_id,
            plan = %new_plan,
            "Plan change accepted"
        );
        Ok(subscription)
    }

    /// Change the purchased quantity. Guarded like every other operation
    /// but needs no re-provisioning: the quantity updates in place.
    pub async fn change_quantity(
        &self,
        id: SubscriptionId,
        quantity: i64,
        operation_id: Uuid,
    ) -> Result<Subscription, ProvisioningError> {
        let subscription = self
            .subscriptions
            .transition(
                id,
                ProvisioningState::Succeeded,
                Some(FulfillmentState::Subscribed),
                SubscriptionPatch {
                    quantity: Some(quantity),
                    operation_id: Some(operation_id),
                    last_updated_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::operation_conflict(id, e))?;

        info!(
            subscription = %id,
            operation = %operation_id,
            quantity,
            "Quantity updated without re-provisioning"
        );
        Ok(subscription)
    }

    /// Re-enter the state machine to run the data-deletion operation for
    /// an unsubscribed subscription past its retention window.
    pub(crate) async fn start_delete_data(
        &self,
        id: SubscriptionId,
    ) -> Result<Subscription, ProvisioningError> {
        let subscription = self
            .subscriptions
            .transition(
                id,
                ProvisioningState::Succeeded,
                Some(FulfillmentState::Unsubscribed),
                SubscriptionPatch {
                    provisioning_state: Some(ProvisioningState::ArmTemplatePending),
                    provisioning_type: Some(ProvisioningType::DeleteData),
                    last_updated_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::operation_conflict(id, e))?;

        Ok(subscription)
    }

    /// The shared exclusivity gate: atomically move a settled subscription
    /// into a new operation at `ArmTemplatePending`.
    async fn begin_operation(
        &self,
        id: SubscriptionId,
        expected_status: FulfillmentState,
        operation: ProvisioningType,
        operation_id: Uuid,
        extra: SubscriptionPatch,
    ) -> Result<Subscription, ProvisioningError> {
        self.subscriptions
            .transition(
                id,
                ProvisioningState::Succeeded,
                Some(expected_status),
                SubscriptionPatch {
                    provisioning_state: Some(ProvisioningState::ArmTemplatePending),
                    provisioning_type: Some(operation),
                    operation_id: Some(operation_id),
                    last_updated_time: Some(Utc::now()),
                    ..extra
                },
            )
            .await
            .map_err(|e| Self::operation_conflict(id, e))
    }

    fn operation_conflict(id: SubscriptionId, error: StoreError) -> ProvisioningError {
        match error {
            StoreError::Conflict { reason, .. } => ProvisioningError::OperationInFlight {
                subscription: id.as_uuid(),
                state: reason,
            },
            StoreError::NotFound { .. } => ProvisioningError::SubscriptionNotFound {
                subscription: id.as_uuid(),
            },
            other => ProvisioningError::Store(other),
        }
    }
}
