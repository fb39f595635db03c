//! Append-only audit sink for metering outcomes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::MeterName;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Reported,
    Expired,
    Failed,
}

/// One metering attempt, as it was classified.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: AuditKind,
    /// Raw resource id as reported by the billing API.
    pub resource_id: String,
    pub dimension: MeterName,
    pub effective_start_time: DateTime<Utc>,
    pub status: String,
    pub detail: Option<String>,
}

/// Append-only record of reported/expired/failed metering attempts.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), StoreError>;
}
