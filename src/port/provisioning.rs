//! Provisioning API port: resource groups, template deployments, webhooks.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::error::ProvisioningError;

/// Status of an in-flight resource deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Running,
    Succeeded,
    Failed,
}

/// Outbound provisioning operations. Every call is one remote
/// side-effect; retry policy lives with the caller (re-poll on the next
/// scheduler tick), not here.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn resource_group_exists(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
    ) -> Result<bool, ProvisioningError>;

    async fn create_resource_group(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        location: &str,
    ) -> Result<(), ProvisioningError>;

    /// Submit an ARM template deployment with resolved parameter values.
    async fn deploy_template(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        deployment_name: &str,
        template: &str,
        parameters: &Value,
    ) -> Result<(), ProvisioningError>;

    async fn deployment_status(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        deployment_name: &str,
    ) -> Result<DeploymentStatus, ProvisioningError>;

    /// Invoke a customer webhook with its fully substituted URL.
    async fn execute_webhook(&self, url: Url) -> Result<(), ProvisioningError>;
}
