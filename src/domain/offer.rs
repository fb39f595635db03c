//! Offer catalog entities: offers, plans, and their per-operation hooks.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{OfferName, PlanName};
use super::subscription::ProvisioningType;

/// A marketplace offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub name: OfferName,
    /// The host Azure subscription resources are provisioned into.
    pub host_subscription: Uuid,
}

/// A plan within an offer, carrying the per-operation template and webhook
/// hooks. A `None` hook means the operation has nothing to run for that
/// stage and the state machine skips ahead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub offer: OfferName,
    pub name: PlanName,
    /// How long unsubscribed data is retained before deletion.
    pub data_retention_days: i64,
    pub subscribe_template: Option<String>,
    pub unsubscribe_template: Option<String>,
    pub suspend_template: Option<String>,
    pub delete_data_template: Option<String>,
    pub subscribe_webhook: Option<String>,
    pub unsubscribe_webhook: Option<String>,
    pub suspend_webhook: Option<String>,
    pub delete_data_webhook: Option<String>,
}

impl Plan {
    /// A plan with no hooks configured.
    pub fn bare(offer: OfferName, name: PlanName) -> Self {
        Self {
            offer,
            name,
            data_retention_days: 0,
            subscribe_template: None,
            unsubscribe_template: None,
            suspend_template: None,
            delete_data_template: None,
            subscribe_webhook: None,
            unsubscribe_webhook: None,
            suspend_webhook: None,
            delete_data_webhook: None,
        }
    }

    /// The ARM template name for an operation. Update and Reinstate reuse
    /// the subscribe template.
    pub fn template_for(&self, operation: ProvisioningType) -> Option<&str> {
        let template = match operation {
            ProvisioningType::Subscribe | ProvisioningType::Update | ProvisioningType::Reinstate => {
                &self.subscribe_template
            }
            ProvisioningType::Unsubscribe => &self.unsubscribe_template,
            ProvisioningType::Suspend => &self.suspend_template,
            ProvisioningType::DeleteData => &self.delete_data_template,
        };
        template.as_deref()
    }

    /// The webhook URL for an operation, with the same operation mapping as
    /// [`Plan::template_for`].
    pub fn webhook_for(&self, operation: ProvisioningType) -> Option<&str> {
        let webhook = match operation {
            ProvisioningType::Subscribe | ProvisioningType::Update | ProvisioningType::Reinstate => {
                &self.subscribe_webhook
            }
            ProvisioningType::Unsubscribe => &self.unsubscribe_webhook,
            ProvisioningType::Suspend => &self.suspend_webhook,
            ProvisioningType::DeleteData => &self.delete_data_webhook,
        };
        webhook.as_deref()
    }
}
