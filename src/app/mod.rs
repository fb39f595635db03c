//! Application wiring and the scheduler loop.
//!
//! `App::run` builds the adapters from configuration and drives the two
//! timers the core is designed around: the provisioning poll and the
//! metering catch-up. Inbound marketplace webhooks are the embedding
//! application's concern; the orchestrator's operation entry points are
//! exposed for it on the library surface.

mod catalog;

pub use catalog::load_catalog;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::adapter::{
    MemoryAuditSink, MemoryCatalogStore, MemoryIpPool, MemorySubscriptionStore, MemoryUsageStore,
    RestFulfillmentClient, RestMeteringClient, RestProvisioningClient, RestTelemetryConnector,
};
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::metering::MeteringReconciler;
use crate::port::TelemetryConnector;
use crate::provision::ProvisioningOrchestrator;

/// Main application struct.
pub struct App;

impl App {
    /// Run the scheduler until the process is signalled.
    pub async fn run(config: Config) -> Result<()> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        Self::run_with_shutdown(config, shutdown_rx).await
    }

    pub async fn run_with_shutdown(
        config: Config,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Starting steward");

        let (catalog, ip_pool) = match &config.catalog {
            Some(path) => load_catalog(Path::new(path))?,
            None => (MemoryCatalogStore::new(), MemoryIpPool::new()),
        };
        let catalog = Arc::new(catalog);
        let ip_pool = Arc::new(ip_pool);
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let usage = Arc::new(MemoryUsageStore::new());
        let audit = Arc::new(MemoryAuditSink::new());

        let provisioning_url = required(&config.endpoints.provisioning_url, "endpoints.provisioning_url")?;
        let fulfillment_url = required(&config.endpoints.fulfillment_url, "endpoints.fulfillment_url")?;
        let metering_url = required(&config.endpoints.metering_url, "endpoints.metering_url")?;

        let orchestrator = ProvisioningOrchestrator::new(
            subscriptions.clone(),
            catalog.clone(),
            usage.clone(),
            Arc::new(RestProvisioningClient::new(provisioning_url)),
            Arc::new(RestFulfillmentClient::new(fulfillment_url)),
            ip_pool.clone(),
            config.provisioning.to_core_config(),
        );

        let mut connectors: HashMap<String, Arc<dyn TelemetryConnector>> = HashMap::new();
        for (name, url) in &config.endpoints.telemetry_connectors {
            connectors.insert(
                name.clone(),
                Arc::new(RestTelemetryConnector::new(url.clone())),
            );
        }
        info!(connectors = connectors.len(), "Telemetry connectors initialized");

        let reconciler = MeteringReconciler::new(
            catalog,
            subscriptions,
            usage,
            connectors,
            Arc::new(RestMeteringClient::new(metering_url)),
            audit,
            config.metering.to_core_config(),
        );

        let mut provision_interval = tokio::time::interval(std::time::Duration::from_secs(
            config.scheduler.provision_poll_secs,
        ));
        provision_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut metering_interval = tokio::time::interval(std::time::Duration::from_secs(
            config.scheduler.metering_poll_secs,
        ));
        metering_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let cancel = shutdown.clone();

        info!(
            provision_poll_secs = config.scheduler.provision_poll_secs,
            metering_poll_secs = config.scheduler.metering_poll_secs,
            "Scheduler running"
        );

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    match result {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            info!("Shutdown channel closed");
                            break;
                        }
                    }
                }
                _ = provision_interval.tick() => {
                    match orchestrator.process_active_provisions().await {
                        Ok(processed) if processed > 0 => {
                            info!(processed, "Provisioning poll complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Provisioning poll failed"),
                    }
                }
                _ = metering_interval.tick() => {
                    match reconciler.run_catch_up(&cancel).await {
                        Ok(windows) if windows > 0 => {
                            info!(windows, "Metering catch-up complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Metering catch-up failed"),
                    }
                }
            }
        }

        Ok(())
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| ConfigError::MissingField { field }.into())
}
