//! Subscription lifecycle state.
//!
//! Provisioning progresses through a closed set of states; every legal move
//! is listed in [`TRANSITIONS`] and anything else is rejected. Polling
//! states may transition to themselves (the "still running" case).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{OfferName, PlanName, SubscriptionId};

/// Provisioning state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Initial/error marker; not a step in the happy path.
    NotSpecified,
    ProvisioningPending,
    DeployResourceGroupRunning,
    ArmTemplatePending,
    ArmTemplateRunning,
    WebhookPending,
    NotificationPending,
    /// Terminal success.
    Succeeded,
    /// Terminal failure; requires operator intervention.
    Failed,
}

/// Every legal state transition. `Succeeded -> ArmTemplatePending` is the
/// re-entry point for webhook-driven operations on a settled subscription.
pub const TRANSITIONS: &[(ProvisioningState, ProvisioningState)] = &[
    (ProvisioningState::NotSpecified, ProvisioningState::ProvisioningPending),
    (ProvisioningState::ProvisioningPending, ProvisioningState::DeployResourceGroupRunning),
    (ProvisioningState::ProvisioningPending, ProvisioningState::WebhookPending),
    (ProvisioningState::ProvisioningPending, ProvisioningState::Failed),
    (ProvisioningState::DeployResourceGroupRunning, ProvisioningState::DeployResourceGroupRunning),
    (ProvisioningState::DeployResourceGroupRunning, ProvisioningState::ArmTemplatePending),
    (ProvisioningState::DeployResourceGroupRunning, ProvisioningState::Failed),
    (ProvisioningState::ArmTemplatePending, ProvisioningState::ArmTemplateRunning),
    (ProvisioningState::ArmTemplatePending, ProvisioningState::WebhookPending),
    (ProvisioningState::ArmTemplatePending, ProvisioningState::ProvisioningPending),
    (ProvisioningState::ArmTemplatePending, ProvisioningState::Failed),
    (ProvisioningState::ArmTemplateRunning, ProvisioningState::ArmTemplateRunning),
    (ProvisioningState::ArmTemplateRunning, ProvisioningState::WebhookPending),
    (ProvisioningState::ArmTemplateRunning, ProvisioningState::Failed),
    (ProvisioningState::WebhookPending, ProvisioningState::NotificationPending),
    (ProvisioningState::WebhookPending, ProvisioningState::Failed),
    (ProvisioningState::NotificationPending, ProvisioningState::Succeeded),
    (ProvisioningState::NotificationPending, ProvisioningState::Failed),
    (ProvisioningState::Succeeded, ProvisioningState::ArmTemplatePending),
];

impl ProvisioningState {
    /// Whether this state ends the provisioning workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Succeeded | ProvisioningState::Failed)
    }

    /// Whether the transition table allows moving from `self` to `to`.
    pub fn can_transition(&self, to: ProvisioningState) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningState::NotSpecified => "NotSpecified",
            ProvisioningState::ProvisioningPending => "ProvisioningPending",
            ProvisioningState::DeployResourceGroupRunning => "DeployResourceGroupRunning",
            ProvisioningState::ArmTemplatePending => "ArmTemplatePending",
            ProvisioningState::ArmTemplateRunning => "ArmTemplateRunning",
            ProvisioningState::WebhookPending => "WebhookPending",
            ProvisioningState::NotificationPending => "NotificationPending",
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// The marketplace operation a provisioning pass is carrying out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningType {
    Subscribe,
    Update,
    Suspend,
    Reinstate,
    Unsubscribe,
    DeleteData,
}

impl fmt::Display for ProvisioningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningType::Subscribe => "Subscribe",
            ProvisioningType::Update => "Update",
            ProvisioningType::Suspend => "Suspend",
            ProvisioningType::Reinstate => "Reinstate",
            ProvisioningType::Unsubscribe => "Unsubscribe",
            ProvisioningType::DeleteData => "DeleteData",
        };
        write!(f, "{name}")
    }
}

/// Marketplace-facing subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FulfillmentState {
    PendingFulfillmentStart,
    Subscribed,
    Suspended,
    Unsubscribed,
    Purged,
}

impl fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FulfillmentState::PendingFulfillmentStart => "PendingFulfillmentStart",
            FulfillmentState::Subscribed => "Subscribed",
            FulfillmentState::Suspended => "Suspended",
            FulfillmentState::Unsubscribed => "Unsubscribed",
            FulfillmentState::Purged => "Purged",
        };
        write!(f, "{name}")
    }
}

/// A marketplace subscription and its provisioning bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub offer: OfferName,
    pub plan: PlanName,
    pub owner: String,
    pub quantity: i64,
    pub provisioning_state: ProvisioningState,
    pub provisioning_type: ProvisioningType,
    pub status: FulfillmentState,
    /// Marketplace operation id for the in-flight operation, if any.
    pub operation_id: Option<Uuid>,
    pub resource_group: Option<String>,
    pub deployment_name: Option<String>,
    pub entry_point_url: Option<String>,
    pub retry_count: u32,
    pub last_exception: Option<String>,
    pub created_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    pub activated_time: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub last_suspended_time: Option<DateTime<Utc>>,
    pub unsubscribed_time: Option<DateTime<Utc>>,
}

impl Subscription {
    /// A freshly created subscription entering the provisioning workflow.
    pub fn new(
        id: SubscriptionId,
        offer: OfferName,
        plan: PlanName,
        owner: impl Into<String>,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            offer,
            plan,
            owner: owner.into(),
            quantity,
            provisioning_state: ProvisioningState::ProvisioningPending,
            provisioning_type: ProvisioningType::Subscribe,
            status: FulfillmentState::PendingFulfillmentStart,
            operation_id: None,
            resource_group: None,
            deployment_name: None,
            entry_point_url: None,
            retry_count: 0,
            last_exception: None,
            created_time: now,
            last_updated_time: now,
            activated_time: None,
            activated_by: None,
            last_suspended_time: None,
            unsubscribed_time: None,
        }
    }

    /// The driver-loop projection of this subscription.
    pub fn provision_view(&self) -> SubscriptionProvision {
        SubscriptionProvision {
            subscription_id: self.id,
            provisioning_state: self.provisioning_state,
            provisioning_type: self.provisioning_type,
            subscription_status: self.status,
            retry_count: self.retry_count,
            last_exception: self.last_exception.clone(),
        }
    }
}

/// Projection the driver loop dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionProvision {
    pub subscription_id: SubscriptionId,
    pub provisioning_state: ProvisioningState,
    pub provisioning_type: ProvisioningType,
    pub subscription_status: FulfillmentState,
    pub retry_count: u32,
    pub last_exception: Option<String>,
}

/// A resolved parameter value persisted for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParameter {
    pub subscription_id: SubscriptionId,
    pub name: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_in_the_table() {
        let path = [
            ProvisioningState::ProvisioningPending,
            ProvisioningState::DeployResourceGroupRunning,
            ProvisioningState::ArmTemplatePending,
            ProvisioningState::ArmTemplateRunning,
            ProvisioningState::WebhookPending,
            ProvisioningState::NotificationPending,
            ProvisioningState::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn polling_states_may_stay_put() {
        assert!(ProvisioningState::DeployResourceGroupRunning
            .can_transition(ProvisioningState::DeployResourceGroupRunning));
        assert!(
            ProvisioningState::ArmTemplateRunning.can_transition(ProvisioningState::ArmTemplateRunning)
        );
    }

    #[test]
    fn illegal_jumps_are_rejected() {
        assert!(!ProvisioningState::ProvisioningPending.can_transition(ProvisioningState::Succeeded));
        assert!(!ProvisioningState::Succeeded.can_transition(ProvisioningState::ProvisioningPending));
        assert!(!ProvisioningState::Failed.can_transition(ProvisioningState::ProvisioningPending));
        assert!(!ProvisioningState::WebhookPending.can_transition(ProvisioningState::Succeeded));
    }

    #[test]
    fn succeeded_reenters_at_arm_template_pending() {
        assert!(ProvisioningState::Succeeded.can_transition(ProvisioningState::ArmTemplatePending));
    }

    #[test]
    fn terminal_states() {
        assert!(ProvisioningState::Succeeded.is_terminal());
        assert!(ProvisioningState::Failed.is_terminal());
        assert!(!ProvisioningState::WebhookPending.is_terminal());
        assert!(!ProvisioningState::NotSpecified.is_terminal());
    }
}
