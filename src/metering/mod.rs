//! Metered-usage reconciliation.
//!
//! [`MeteringReconciler`] replays every unprocessed hourly window per meter
//! up to a grace boundary, submitting billable events idempotently and
//! classifying the billing API's per-event verdicts. The per-usage
//! watermark never advances past an unresolved failure, so a failed window
//! is retried on the next cycle with the identical event set.

mod reconciler;

pub use reconciler::{MeteringConfig, MeteringReconciler};
