//! Configuration loading from TOML files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::error::{ConfigError, Result};
use crate::metering::MeteringConfig;
use crate::provision::OrchestratorConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSettings,
    pub provisioning: ProvisioningSettings,
    pub metering: MeteringSettings,
    pub endpoints: EndpointSettings,
    /// Optional catalog seed file (offers, plans, templates, meters).
    pub catalog: Option<String>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between provisioning poll cycles.
    pub provision_poll_secs: u64,
    /// Seconds between metering catch-up runs.
    pub metering_poll_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            provision_poll_secs: 60,
            metering_poll_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub max_retry: u32,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self { max_retry: 3 }
    }
}

impl ProvisioningSettings {
    pub fn to_core_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retry: self.max_retry,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeteringSettings {
    pub grace_period_hours: i64,
}

impl Default for MeteringSettings {
    fn default() -> Self {
        Self {
            grace_period_hours: 2,
        }
    }
}

impl MeteringSettings {
    pub fn to_core_config(&self) -> MeteringConfig {
        MeteringConfig {
            grace_period_hours: self.grace_period_hours,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub provisioning_url: Option<String>,
    pub fulfillment_url: Option<String>,
    pub metering_url: Option<String>,
    /// Telemetry connector base URLs keyed by connector name.
    pub telemetry_connectors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            provisioning: ProvisioningSettings::default(),
            metering: MeteringSettings::default(),
            endpoints: EndpointSettings::default(),
            catalog: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.provision_poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.provision_poll_secs",
                reason: "must be greater than zero".into(),
            }
            .into());
        }
        if self.scheduler.metering_poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.metering_poll_secs",
                reason: "must be greater than zero".into(),
            }
            .into());
        }
        if self.metering.grace_period_hours < 0 {
            return Err(ConfigError::InvalidValue {
                field: "metering.grace_period_hours",
                reason: "must not be negative".into(),
            }
            .into());
        }

        for (field, url) in [
            ("endpoints.provisioning_url", &self.endpoints.provisioning_url),
            ("endpoints.fulfillment_url", &self.endpoints.fulfillment_url),
            ("endpoints.metering_url", &self.endpoints.metering_url),
        ] {
            if let Some(url) = url {
                if url.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: "must not be empty when set".into(),
                    }
                    .into());
                }
            }
        }
        for (name, url) in &self.endpoints.telemetry_connectors {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "endpoints.telemetry_connectors",
                    reason: format!("connector '{name}' has an empty URL"),
                }
                .into());
            }
        }

        Ok(())
    }

    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.logging.level));

        match self.logging.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.provision_poll_secs, 60);
        assert_eq!(config.metering.grace_period_hours, 2);
        assert_eq!(config.provisioning.max_retry, 3);
    }

    #[test]
    fn loads_a_full_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            catalog = "catalog.toml"

            [scheduler]
            provision_poll_secs = 30
            metering_poll_secs = 300

            [provisioning]
            max_retry = 5

            [metering]
            grace_period_hours = 3

            [endpoints]
            provisioning_url = "http://localhost:8081"
            fulfillment_url = "http://localhost:8082"
            metering_url = "http://localhost:8083"

            [endpoints.telemetry_connectors]
            app-insights = "http://localhost:8084"

            [logging]
            level = "debug"
            format = "json"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.scheduler.provision_poll_secs, 30);
        assert_eq!(config.provisioning.max_retry, 5);
        assert_eq!(config.metering.grace_period_hours, 3);
        assert_eq!(
            config.endpoints.telemetry_connectors.get("app-insights"),
            Some(&"http://localhost:8084".to_string())
        );
        assert_eq!(config.catalog.as_deref(), Some("catalog.toml"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = Config {
            scheduler: SchedulerSettings {
                provision_poll_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_endpoint_url_is_rejected() {
        let config = Config {
            endpoints: EndpointSettings {
                metering_url: Some("  ".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
