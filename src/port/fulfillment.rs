//! Marketplace fulfillment port: activation and operation completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{PlanName, SubscriptionId};
use crate::error::ProvisioningError;

/// Payload confirming a subscription's activated plan and quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedSubscription {
    pub plan: PlanName,
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Success,
    Failure,
}

/// Completion report for a marketplace-initiated operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub plan: PlanName,
    pub quantity: i64,
    pub status: OperationStatus,
}

/// Outbound calls to the marketplace billing platform.
#[async_trait]
pub trait FulfillmentClient: Send + Sync {
    async fn activate_subscription(
        &self,
        subscription: SubscriptionId,
        activation: &ActivatedSubscription,
    ) -> Result<(), ProvisioningError>;

    async fn update_operation(
        &self,
        subscription: SubscriptionId,
        operation: Uuid,
        update: &OperationUpdate,
    ) -> Result<(), ProvisioningError>;
}
