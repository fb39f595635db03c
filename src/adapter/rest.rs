//! REST implementations of the outbound collaborator ports.
//!
//! Each client speaks plain JSON to a configured collaborator base URL.
//! Authentication, retries and schema evolution are the collaborator
//! gateway's concern; here a call is one request with its status mapped
//! onto the error taxonomy (5xx/connect/timeout retryable, 4xx not).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::domain::{
    BatchUsageResponse, MeterEventRecord, MeterName, UsageError, UsageErrorDetail, UsageEvent,
    UsageResult, UsageStatus,
};
use crate::error::{MeteringError, ProvisioningError};
use crate::port::{
    ActivatedSubscription, DeploymentStatus, FulfillmentClient, MeteringClient, OperationUpdate,
    ProvisioningClient, TelemetryConnector,
};

fn client_error(
    operation: &'static str,
    resource: &str,
    error: reqwest::Error,
) -> ProvisioningError {
    let retryable = error.is_timeout()
        || error.is_connect()
        || error.status().map_or(true, |s| s.is_server_error());
    ProvisioningError::Client {
        operation,
        resource: resource.to_string(),
        reason: error.to_string(),
        retryable,
    }
}

/// REST client for the resource-provisioning collaborator.
pub struct RestProvisioningClient {
    client: Client,
    base_url: String,
}

impl RestProvisioningClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateResourceGroupRequest<'a> {
    location: &'a str,
}

#[derive(Debug, Serialize)]
struct DeploymentRequest<'a> {
    template: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeploymentStatusResponse {
    status: String,
}

#[async_trait]
impl ProvisioningClient for RestProvisioningClient {
    async fn resource_group_exists(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
    ) -> Result<bool, ProvisioningError> {
        let url = format!(
            "{}/subscriptions/{host_subscription}/resourceGroups/{resource_group}",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| client_error("resource_group_exists", resource_group, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response
            .error_for_status()
            .map_err(|e| client_error("resource_group_exists", resource_group, e))?;
        Ok(true)
    }

    async fn create_resource_group(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        location: &str,
    ) -> Result<(), ProvisioningError> {
        let url = format!(
            "{}/subscriptions/{host_subscription}/resourceGroups/{resource_group}",
            self.base_url
        );
        info!(resource_group, location, "Creating resource group");
        self.client
            .put(&url)
            .json(&CreateResourceGroupRequest { location })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("create_resource_group", resource_group, e))?;
        Ok(())
    }

    async fn deploy_template(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        deployment_name: &str,
        template: &str,
        parameters: &serde_json::Value,
    ) -> Result<(), ProvisioningError> {
        let url = format!(
            "{}/subscriptions/{host_subscription}/resourceGroups/{resource_group}/deployments/{deployment_name}",
            self.base_url
        );
        info!(resource_group, deployment = deployment_name, "Submitting deployment");
        self.client
            .put(&url)
            .json(&DeploymentRequest {
                template,
                parameters,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("deploy_template", deployment_name, e))?;
        Ok(())
    }

    async fn deployment_status(
        &self,
        host_subscription: Uuid,
        resource_group: &str,
        deployment_name: &str,
    ) -> Result<DeploymentStatus, ProvisioningError> {
        let url = format!(
            "{}/subscriptions/{host_subscription}/resourceGroups/{resource_group}/deployments/{deployment_name}",
            self.base_url
        );
        let response: DeploymentStatusResponse = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("deployment_status", deployment_name, e))?
            .json()
            .await
            .map_err(|e| client_error("deployment_status", deployment_name, e))?;

        debug!(deployment = deployment_name, status = %response.status, "Deployment status");

        match response.status.as_str() {
            "Succeeded" => Ok(DeploymentStatus::Succeeded),
            "Failed" => Ok(DeploymentStatus::Failed),
            "Running" | "Accepted" | "Updating" => Ok(DeploymentStatus::Running),
            other => Err(ProvisioningError::Client {
                operation: "deployment_status",
                resource: deployment_name.to_string(),
                reason: format!("unexpected deployment status '{other}'"),
                retryable: false,
            }),
        }
    }

    async fn execute_webhook(&self, url: Url) -> Result<(), ProvisioningError> {
        info!(webhook = %url, "Executing webhook");
        self.client
            .post(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("execute_webhook", url.as_str(), e))?;
        Ok(())
    }
}

/// REST client for the marketplace fulfillment collaborator.
pub struct RestFulfillmentClient {
    client: Client,
    base_url: String,
}

impl RestFulfillmentClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl FulfillmentClient for RestFulfillmentClient {
    async fn activate_subscription(
        &self,
        subscription: crate::domain::SubscriptionId,
        activation: &ActivatedSubscription,
    ) -> Result<(), ProvisioningError> {
        let url = format!("{}/subscriptions/{subscription}/activate", self.base_url);
        self.client
            .post(&url)
            .json(activation)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("activate_subscription", &subscription.to_string(), e))?;
        Ok(())
    }

    async fn update_operation(
        &self,
        subscription: crate::domain::SubscriptionId,
        operation: Uuid,
        update: &OperationUpdate,
    ) -> Result<(), ProvisioningError> {
        let url = format!(
            "{}/subscriptions/{subscription}/operations/{operation}",
            self.base_url
        );
        self.client
            .patch(&url)
            .json(update)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| client_error("update_operation", &subscription.to_string(), e))?;
        Ok(())
    }
}

/// REST client for the telemetry query collaborator.
pub struct RestTelemetryConnector {
    client: Client,
    base_url: String,
}

impl RestTelemetryConnector {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryQueryRequest<'a> {
    start_time: DateTime<Utc>,
    query: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterEventWire {
    resource_id: String,
    quantity: Decimal,
    dimension: String,
    effective_start_time: DateTime<Utc>,
}

#[async_trait]
impl TelemetryConnector for RestTelemetryConnector {
    async fn meter_events_by_hour(
        &self,
        start: DateTime<Utc>,
        query: &str,
    ) -> Result<Vec<MeterEventRecord>, MeteringError> {
        let url = format!("{}/events/query", self.base_url);
        let events: Vec<MeterEventWire> = self
            .client
            .post(&url)
            .json(&TelemetryQueryRequest {
                start_time: start,
                query,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MeteringError::Telemetry {
                meter: query.to_string(),
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| MeteringError::Telemetry {
                meter: query.to_string(),
                reason: e.to_string(),
            })?;

        debug!(count = events.len(), "Fetched meter events");

        Ok(events
            .into_iter()
            .map(|e| MeterEventRecord {
                resource_id: e.resource_id,
                quantity: e.quantity,
                dimension: e.dimension,
                effective_start_time: e.effective_start_time,
            })
            .collect())
    }
}

/// REST client for the metered-billing collaborator.
///
/// The request id rides the `x-ms-requestid` header; submitting the same
/// batch under the same identity yields `Duplicate` per event.
pub struct RestMeteringClient {
    client: Client,
    base_url: String,
}

impl RestMeteringClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageEventWire<'a> {
    resource_id: String,
    plan_id: &'a str,
    dimension: &'a str,
    quantity: Decimal,
    effective_start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct BatchUsageRequest<'a> {
    request: Vec<UsageEventWire<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageErrorDetailWire {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageErrorWire {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    details: Vec<UsageErrorDetailWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResultWire {
    resource_id: String,
    dimension: String,
    effective_start_time: DateTime<Utc>,
    status: String,
    #[serde(default)]
    error: Option<UsageErrorWire>,
}

#[derive(Debug, Deserialize)]
struct BatchUsageResponseWire {
    #[serde(default)]
    result: Vec<UsageResultWire>,
}

#[async_trait]
impl MeteringClient for RestMeteringClient {
    async fn record_batch_usage(
        &self,
        request_id: Uuid,
        correlation_id: Uuid,
        events: &[UsageEvent],
    ) -> Result<BatchUsageResponse, MeteringError> {
        let url = format!("{}/batchUsageEvent", self.base_url);
        let request = BatchUsageRequest {
            request: events
                .iter()
                .map(|e| UsageEventWire {
                    resource_id: e.resource_id.to_string(),
                    plan_id: e.plan.as_str(),
                    dimension: e.dimension.as_str(),
                    quantity: e.quantity,
                    effective_start_time: e.effective_start_time,
                })
                .collect(),
        };

        let response: BatchUsageResponseWire = self
            .client
            .post(&url)
            .header("x-ms-requestid", request_id.to_string())
            .header("x-ms-correlationid", correlation_id.to_string())
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MeteringError::Transport {
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| MeteringError::Transport {
                reason: e.to_string(),
            })?;

        Ok(BatchUsageResponse {
            results: response
                .result
                .into_iter()
                .map(|r| UsageResult {
                    resource_id: r.resource_id,
                    dimension: MeterName::from(r.dimension),
                    effective_start_time: r.effective_start_time,
                    status: UsageStatus::parse(&r.status),
                    error: r.error.map(|e| UsageError {
                        code: e.code,
                        message: e.message,
                        target: e.target,
                        details: e
                            .details
                            .into_iter()
                            .map(|d| UsageErrorDetail {
                                code: d.code,
                                message: d.message,
                                target: d.target,
                            })
                            .collect(),
                    }),
                })
                .collect(),
        })
    }
}
