//! The per-meter hourly catch-up loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    BatchUsageResponse, CustomMeter, Offer, SubscriptionId, UsageError, UsageEvent, UsageStatus,
};
use crate::error::{Error, MeteringError, Result};
use crate::port::{
    AuditKind, AuditRecord, AuditSink, CatalogStore, MeteringClient, SubscriptionStore,
    TelemetryConnector, UsageStore,
};

/// Tuning knobs for reconciliation.
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Windows younger than this are left alone so the telemetry pipeline
    /// can finish landing data.
    pub grace_period_hours: i64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            grace_period_hours: 2,
        }
    }
}

/// Reconciles metered usage against the billing API, one hourly window at
/// a time per meter.
pub struct MeteringReconciler {
    catalog: Arc<dyn CatalogStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    usage: Arc<dyn UsageStore>,
    connectors: HashMap<String, Arc<dyn TelemetryConnector>>,
    billing: Arc<dyn MeteringClient>,
    audit: Arc<dyn AuditSink>,
    config: MeteringConfig,
}

impl MeteringReconciler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        usage: Arc<dyn UsageStore>,
        connectors: HashMap<String, Arc<dyn TelemetryConnector>>,
        billing: Arc<dyn MeteringClient>,
        audit: Arc<dyn AuditSink>,
        config: MeteringConfig,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            usage,
            connectors,
            billing,
            audit,
            config,
        }
    }

    /// Catch every meter up to the grace boundary.
    ///
    /// Per-meter failures are logged and isolated; one meter's trouble
    /// never blocks the rest. Returns the number of windows settled.
    /// Cancellation is checked between windows; the only suspension
    /// points are the telemetry and billing calls themselves.
    pub async fn run_catch_up(&self, cancel: &watch::Receiver<bool>) -> Result<usize> {
        let mut windows = 0usize;

        for offer in self.catalog.offers().await? {
            for meter in self.catalog.meters(&offer.name).await? {
                if *cancel.borrow() {
                    info!("Metering catch-up cancelled");
                    return Ok(windows);
                }
                match self.catch_up_meter(&offer, &meter, cancel).await {
                    Ok(n) => windows += n,
                    Err(e) => {
                        error!(
                            meter = %meter.name,
                            error = %e,
                            "Meter catch-up failed; continuing with next meter"
                        );
                    }
                }
            }
        }

        Ok(windows)
    }

    /// Replay unprocessed windows for one meter until it is caught up,
    /// cancelled, or blocked on a failure.
    async fn catch_up_meter(
        &self,
        offer: &Offer,
        meter: &CustomMeter,
        cancel: &watch::Receiver<bool>,
    ) -> Result<usize> {
        let grace = Duration::hours(self.config.grace_period_hours);
        let mut windows = 0usize;
        let mut previous: Option<DateTime<Utc>> = None;

        loop {
            if *cancel.borrow() {
                info!(meter = %meter.name, "Meter catch-up cancelled");
                break;
            }

            // The earliest enabled watermark is the single source of truth
            // for the next window; it is re-read every iteration so
            // settled usage moves the frontier.
            let Some(watermark) = self.usage.effective_start_time(&meter.name).await? else {
                if windows == 0 {
                    info!(meter = %meter.name, "Meter is not used by any subscription");
                }
                break;
            };

            if previous == Some(watermark) {
                // A failure kept the watermark in place; leave the window
                // for the next scheduled run rather than spinning on it.
                warn!(
                    meter = %meter.name,
                    watermark = %watermark,
                    "No forward progress; window will be retried next cycle"
                );
                break;
            }

            if watermark > Utc::now() - grace {
                info!(
                    meter = %meter.name,
                    watermark = %watermark,
                    "Meter is caught up to the grace boundary"
                );
                break;
            }

            let window_end = watermark + Duration::hours(1);
            info!(
                meter = %meter.name,
                window_start = %watermark,
                window_end = %window_end,
                "Reporting meter events"
            );

            self.process_window(offer, meter, watermark, window_end).await?;
            windows += 1;
            previous = Some(watermark);
        }

        Ok(windows)
    }

    /// Query, filter, submit and classify one `[start, start+1h)` window.
    async fn process_window(
        &self,
        offer: &Offer,
        meter: &CustomMeter,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        let connector = self.connectors.get(&meter.telemetry_connector).ok_or_else(|| {
            Error::Metering(MeteringError::Telemetry {
                meter: meter.name.to_string(),
                reason: format!(
                    "telemetry connector '{}' is not configured",
                    meter.telemetry_connector
                ),
            })
        })?;

        let events = connector
            .meter_events_by_hour(window_start, &meter.telemetry_query)
            .await?;

        let billable = self.filter_billable(offer, meter, events, window_end).await?;

        let response = if billable.is_empty() {
            // Nothing qualified; settle the window with an explicit empty
            // success instead of calling the billing API.
            BatchUsageResponse::empty()
        } else {
            let request_id = Uuid::new_v4();
            let correlation_id = Uuid::new_v4();
            info!(
                meter = %meter.name,
                events = billable.len(),
                request = %request_id,
                correlation = %correlation_id,
                "Submitting usage batch"
            );
            self.billing
                .record_batch_usage(request_id, correlation_id, &billable)
                .await?
        };

        for result in &response.results {
            self.apply_result(meter, result, window_end).await?;
        }

        // Everyone else in this window had nothing to report; move their
        // watermarks forward too (skipping anything holding an error).
        self.usage.advance_unreported(&meter.name, window_end).await?;

        info!(
            meter = %meter.name,
            window_start = %window_start,
            "Completed reporting meter events"
        );
        Ok(())
    }

    /// Keep only the events that are actually billable in this window.
    async fn filter_billable(
        &self,
        offer: &Offer,
        meter: &CustomMeter,
        events: Vec<crate::domain::MeterEventRecord>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>> {
        let mut billable = Vec::new();

        for event in events {
            let Some(subscription_id) = SubscriptionId::parse(&event.resource_id) else {
                warn!(
                    resource = %event.resource_id,
                    "Resource id is not a valid subscription id (expected a GUID)"
                );
                continue;
            };

            if !self.subscriptions.exists(subscription_id).await? {
                warn!(
                    subscription = %subscription_id,
                    dimension = %event.dimension,
                    "Subscription doesn't exist; meter event will not be reported"
                );
                continue;
            }
            let subscription = self.subscriptions.get(subscription_id).await?;

            let Some(usage) = self.usage.get(subscription_id, &meter.name).await? else {
                warn!(
                    subscription = %subscription_id,
                    meter = %meter.name,
                    "No usage record for subscription; meter event will not be reported"
                );
                continue;
            };

            let billable_here = self
                .catalog
                .dimension_exists(&offer.name, &subscription.plan, &meter.name)
                .await?
                && usage.enabled
                && usage.last_updated_time < window_end
                && !usage.has_unresolved_error_after(window_end);

            if billable_here {
                billable.push(UsageEvent {
                    resource_id: subscription_id,
                    plan: subscription.plan.clone(),
                    dimension: meter.name.clone(),
                    quantity: event.quantity,
                    effective_start_time: event.effective_start_time,
                });
            }
        }

        Ok(billable)
    }

    /// Apply one classified result to the usage bookkeeping.
    async fn apply_result(
        &self,
        meter: &CustomMeter,
        result: &crate::domain::UsageResult,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        let Some(subscription_id) = SubscriptionId::parse(&result.resource_id) else {
            warn!(resource = %result.resource_id, "Billing result for an unparseable resource id");
            return Ok(());
        };
        let Some(mut usage) = self.usage.get(subscription_id, &meter.name).await? else {
            warn!(
                subscription = %subscription_id,
                meter = %meter.name,
                "Billing result for a subscription without a usage record"
            );
            return Ok(());
        };

        match &result.status {
            status if status.is_settled() => {
                info!(
                    subscription = %subscription_id,
                    dimension = %result.dimension,
                    effective_start = %result.effective_start_time,
                    status = %status,
                    "Meter event reported"
                );
                usage.settle(window_end);
                self.audit
                    .record(AuditRecord {
                        kind: AuditKind::Reported,
                        resource_id: result.resource_id.clone(),
                        dimension: result.dimension.clone(),
                        effective_start_time: result.effective_start_time,
                        status: status.to_string(),
                        detail: None,
                    })
                    .await?;
            }
            UsageStatus::Expired => {
                warn!(
                    subscription = %subscription_id,
                    dimension = %result.dimension,
                    effective_start = %result.effective_start_time,
                    "Meter event expired"
                );
                usage.settle(window_end);
                self.audit
                    .record(AuditRecord {
                        kind: AuditKind::Expired,
                        resource_id: result.resource_id.clone(),
                        dimension: result.dimension.clone(),
                        effective_start_time: result.effective_start_time,
                        status: result.status.to_string(),
                        detail: None,
                    })
                    .await?;
            }
            status => {
                let detail = UsageError::compose(result.error.as_ref());
                error!(
                    subscription = %subscription_id,
                    dimension = %result.dimension,
                    effective_start = %result.effective_start_time,
                    status = %status,
                    detail = %detail,
                    "Meter event failed to report"
                );
                // The watermark stays put so this window replays; only the
                // failure marker moves.
                usage.last_error_reported_time = Some(window_end);
                usage.last_error = Some(format!(
                    "Meter event failed with status {status}. Details: {detail}"
                ));
                self.audit
                    .record(AuditRecord {
                        kind: AuditKind::Failed,
                        resource_id: result.resource_id.clone(),
                        dimension: result.dimension.clone(),
                        effective_start_time: result.effective_start_time,
                        status: status.to_string(),
                        detail: Some(detail),
                    })
                    .await?;

                // An unsubscribed resource disappearing underneath the
                // telemetry tail is an expected race; stop metering it.
                if *status == UsageStatus::ResourceNotFound
                    && usage.unsubscribed_time.is_some_and(|t| window_end > t)
                {
                    usage.enabled = false;
                    usage.disabled_time = Some(window_end);
                }
            }
        }

        self.usage.update(&usage).await?;
        Ok(())
    }
}
