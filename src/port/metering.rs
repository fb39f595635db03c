//! Billing API port for metered usage submission.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{BatchUsageResponse, UsageEvent};
use crate::error::MeteringError;

/// Submits usage batches to the billing API.
///
/// Submission is idempotent on (request id, event identity): replaying a
/// window returns `Duplicate` per event instead of double-charging.
#[async_trait]
pub trait MeteringClient: Send + Sync {
    async fn record_batch_usage(
        &self,
        request_id: Uuid,
        correlation_id: Uuid,
        events: &[UsageEvent],
    ) -> Result<BatchUsageResponse, MeteringError>;
}
