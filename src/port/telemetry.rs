//! Telemetry source port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::MeterEventRecord;
use crate::error::MeteringError;

/// Queries the telemetry pipeline for metered usage.
#[async_trait]
pub trait TelemetryConnector: Send + Sync {
    /// Events with an effective start inside `[start, start + 1h)`,
    /// produced by running the meter's configured query.
    async fn meter_events_by_hour(
        &self,
        start: DateTime<Utc>,
        query: &str,
    ) -> Result<Vec<MeterEventRecord>, MeteringError>;
}
