//! Custom meters and per-subscription usage bookkeeping.
//!
//! `SubscriptionMeterUsage::last_updated_time` is the reconciliation
//! watermark: the single source of truth for the next hour to process. It
//! only ever moves forward, and never past an unresolved failure.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{MeterName, OfferName, PlanName, SubscriptionId};

/// A custom meter defined on an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMeter {
    pub offer: OfferName,
    pub name: MeterName,
    pub telemetry_connector: String,
    pub telemetry_query: String,
}

/// Maps a (offer, plan, meter) triple to a billable dimension. Usage for a
/// subscription is only reported while its plan carries the mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterDimension {
    pub offer: OfferName,
    pub plan: PlanName,
    pub meter: MeterName,
}

/// Per-(subscription, meter) reconciliation bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionMeterUsage {
    pub subscription_id: SubscriptionId,
    pub meter: MeterName,
    pub enabled: bool,
    /// Reconciliation watermark; usage up to this instant is settled.
    pub last_updated_time: DateTime<Utc>,
    pub last_error_reported_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unsubscribed_time: Option<DateTime<Utc>>,
    pub disabled_time: Option<DateTime<Utc>>,
}

impl SubscriptionMeterUsage {
    pub fn new(subscription_id: SubscriptionId, meter: MeterName, start: DateTime<Utc>) -> Self {
        Self {
            subscription_id,
            meter,
            enabled: true,
            last_updated_time: start,
            last_error_reported_time: None,
            last_error: None,
            unsubscribed_time: None,
            disabled_time: None,
        }
    }

    /// Whether an unresolved failure is recorded for a window later than
    /// the one ending at `window_end`.
    ///
    /// The error marker carries the failed window's end, so replaying that
    /// same window is allowed (it must re-submit) while any earlier window
    /// being reprocessed for other subscriptions skips this record.
    pub fn has_unresolved_error_after(&self, window_end: DateTime<Utc>) -> bool {
        self.last_error_reported_time.is_some_and(|t| t > window_end)
    }

    /// Settle this usage through `window_end`, clearing any recorded error
    /// and disabling further reporting once past the unsubscribe time.
    pub fn settle(&mut self, window_end: DateTime<Utc>) {
        if window_end > self.last_updated_time {
            self.last_updated_time = window_end;
        }
        self.last_error = None;
        self.last_error_reported_time = None;
        if self.unsubscribed_time.is_some_and(|t| window_end > t) {
            self.enabled = false;
            self.disabled_time = Some(window_end);
        }
    }
}

/// Round a timestamp down to the containing hour.
pub fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-hour fields cannot fail")
}

/// A raw event from the telemetry connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEventRecord {
    /// Reported resource id; expected to parse as a subscription GUID.
    pub resource_id: String,
    pub quantity: Decimal,
    pub dimension: String,
    pub effective_start_time: DateTime<Utc>,
}

/// A billable usage event submitted to the billing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub resource_id: SubscriptionId,
    pub plan: PlanName,
    pub dimension: MeterName,
    pub quantity: Decimal,
    pub effective_start_time: DateTime<Utc>,
}

/// Billing API classification of one submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageStatus {
    Accepted,
    Duplicate,
    Expired,
    Forbidden,
    Conflict,
    BadRequest,
    ResourceNotFound,
    Other(String),
}

impl UsageStatus {
    /// Parse the status string the billing API returns. Unknown statuses
    /// are carried verbatim rather than dropped.
    pub fn parse(s: &str) -> Self {
        match s {
            s if s.eq_ignore_ascii_case("Accepted") => UsageStatus::Accepted,
            s if s.eq_ignore_ascii_case("Duplicate") => UsageStatus::Duplicate,
            s if s.eq_ignore_ascii_case("Expired") => UsageStatus::Expired,
            s if s.eq_ignore_ascii_case("Forbidden") => UsageStatus::Forbidden,
            s if s.eq_ignore_ascii_case("Conflict") => UsageStatus::Conflict,
            s if s.eq_ignore_ascii_case("BadRequest") => UsageStatus::BadRequest,
            s if s.eq_ignore_ascii_case("ResourceNotFound") => UsageStatus::ResourceNotFound,
            other => UsageStatus::Other(other.to_string()),
        }
    }

    /// Accepted and Duplicate both mean the window is settled (idempotent
    /// replay returns Duplicate instead of double-charging).
    pub fn is_settled(&self) -> bool {
        matches!(self, UsageStatus::Accepted | UsageStatus::Duplicate)
    }
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageStatus::Accepted => write!(f, "Accepted"),
            UsageStatus::Duplicate => write!(f, "Duplicate"),
            UsageStatus::Expired => write!(f, "Expired"),
            UsageStatus::Forbidden => write!(f, "Forbidden"),
            UsageStatus::Conflict => write!(f, "Conflict"),
            UsageStatus::BadRequest => write!(f, "BadRequest"),
            UsageStatus::ResourceNotFound => write!(f, "ResourceNotFound"),
            UsageStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Structured error detail attached to a failed usage result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageError {
    pub code: String,
    pub message: String,
    pub target: Option<String>,
    #[serde(default)]
    pub details: Vec<UsageErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageErrorDetail {
    pub code: String,
    pub message: String,
    pub target: Option<String>,
}

impl UsageError {
    /// Flatten the error chain into one loggable line.
    pub fn compose(error: Option<&UsageError>) -> String {
        let Some(error) = error else {
            return "unknown".to_string();
        };

        let mut message = format!(
            "Code: {}, Message: {}, Target: {}.",
            error.code,
            error.message,
            error.target.as_deref().unwrap_or("")
        );
        if !error.details.is_empty() {
            message.push_str(" Details:");
            for detail in &error.details {
                message.push_str(&format!(
                    " Code: {}, Message: {}, Target: {};",
                    detail.code,
                    detail.message,
                    detail.target.as_deref().unwrap_or("")
                ));
            }
        }
        message
    }
}

/// Classification of one event from a batch submission.
#[derive(Debug, Clone)]
pub struct UsageResult {
    pub resource_id: String,
    pub dimension: MeterName,
    pub effective_start_time: DateTime<Utc>,
    pub status: UsageStatus,
    pub error: Option<UsageError>,
}

/// Per-event results of one idempotent batch submission.
#[derive(Debug, Clone, Default)]
pub struct BatchUsageResponse {
    pub results: Vec<UsageResult>,
}

impl BatchUsageResponse {
    /// The explicit success used when a window produced no billable events.
    pub fn empty() -> Self {
        Self::default()
    }
}
