use thiserror::Error;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// CIDR arithmetic errors. Always user errors, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid CIDR notation '{input}': expected a.b.c.d/n with n in 0..=32")]
    InvalidFormat { input: String },

    #[error("sub-range length {length} is not a power of two")]
    InvalidLength { length: u64 },

    #[error("sub-range {start}..{end} is out of range for a pool of {size} addresses")]
    OutOfRange { start: u64, end: u64, size: u64 },
}

/// Parameter expression errors.
#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("cannot parse expression '{expression}' for parameter {name}: {reason}")]
    Parse {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("cannot evaluate expression '{expression}' for parameter {name}: {reason}")]
    Eval {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("circular reference detected in the parameter list; check the parameter value definitions and remove the circular expression")]
    CircularDependency,

    #[error("expression for parameter {name} exceeds the nesting limit of {limit}")]
    DepthExceeded { name: String, limit: usize },
}

/// Provisioning state machine errors.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("subscription {subscription} not found")]
    SubscriptionNotFound { subscription: uuid::Uuid },

    #[error("cannot run step {step} while subscription provisioning state is {state}")]
    WrongState { step: &'static str, state: String },

    #[error("transition {from} -> {to} is not in the transition table")]
    InvalidTransition { from: String, to: String },

    #[error("another operation is in flight for subscription {subscription} (provisioning state {state})")]
    OperationInFlight {
        subscription: uuid::Uuid,
        state: String,
    },

    #[error("the ARM template doesn't contain a parameters object")]
    TemplateParameters,

    #[error("required parameter {name} was not produced by evaluation")]
    MissingParameter { name: String },

    #[error("resource group {name} already exists")]
    ResourceGroupExists { name: String },

    #[error("{operation} failed for {resource}: {reason}")]
    Client {
        operation: &'static str,
        resource: String,
        reason: String,
        retryable: bool,
    },

    #[error("deployment {name} failed")]
    DeploymentFailed { name: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisioningError {
    /// Whether the next poll cycle should retry the same step in place.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisioningError::Client { retryable, .. } => *retryable,
            // A flaky store read is worth another poll; missing records
            // and conflicts are not.
            ProvisioningError::Store(StoreError::Other(_)) => true,
            _ => false,
        }
    }
}

/// Metering reconciliation errors.
#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("telemetry query for meter {meter} failed: {reason}")]
    Telemetry { meter: String, reason: String },

    #[error("billing submission failed: {reason}")]
    Transport { reason: String },
}

/// Persistence collaborator errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("conflict updating {kind} {key}: {reason}")]
    Conflict {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("store error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Metering(#[from] MeteringError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
