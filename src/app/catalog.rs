//! Catalog seed file loading.
//!
//! The scheduler binary is configuration-driven: offers, plans, templates,
//! parameter expressions, meters, dimensions and address pools are
//! declared in a TOML file and loaded into the in-memory catalog at
//! startup. Template entries point at ARM template JSON files resolved
//! relative to the catalog file.

use std::path::Path;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::adapter::{MemoryCatalogStore, MemoryIpPool};
use crate::domain::{CustomMeter, MeterName, Offer, OfferName, Plan, PlanName};
use crate::error::{ConfigError, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    offers: Vec<OfferEntry>,
    plans: Vec<PlanEntry>,
    templates: Vec<TemplateEntry>,
    parameters: Vec<ParameterEntry>,
    meters: Vec<MeterEntry>,
    dimensions: Vec<DimensionEntry>,
    ip_pools: Vec<IpPoolEntry>,
}

#[derive(Debug, Deserialize)]
struct OfferEntry {
    name: String,
    host_subscription: Uuid,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    offer: String,
    name: String,
    #[serde(default)]
    data_retention_days: i64,
    subscribe_template: Option<String>,
    unsubscribe_template: Option<String>,
    suspend_template: Option<String>,
    delete_data_template: Option<String>,
    subscribe_webhook: Option<String>,
    unsubscribe_webhook: Option<String>,
    suspend_webhook: Option<String>,
    delete_data_webhook: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateEntry {
    offer: String,
    name: String,
    /// Path to the ARM template JSON, relative to the catalog file.
    path: String,
}

#[derive(Debug, Deserialize)]
struct ParameterEntry {
    offer: String,
    name: String,
    expression: String,
}

#[derive(Debug, Deserialize)]
struct MeterEntry {
    offer: String,
    name: String,
    telemetry_connector: String,
    telemetry_query: String,
}

#[derive(Debug, Deserialize)]
struct DimensionEntry {
    offer: String,
    plan: String,
    meter: String,
}

#[derive(Debug, Deserialize)]
struct IpPoolEntry {
    offer: String,
    config_name: String,
    cidr: String,
    range_size: u64,
}

/// Load a catalog seed file into fresh in-memory stores.
pub fn load_catalog(path: &Path) -> Result<(MemoryCatalogStore, MemoryIpPool)> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
    let file: CatalogFile = toml::from_str(&content).map_err(ConfigError::Parse)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let catalog = MemoryCatalogStore::new();
    let ip_pool = MemoryIpPool::new();

    for offer in &file.offers {
        catalog.add_offer(Offer {
            name: OfferName::from(offer.name.as_str()),
            host_subscription: offer.host_subscription,
        });
    }

    for plan in file.plans {
        catalog.add_plan(Plan {
            offer: OfferName::from(plan.offer),
            name: PlanName::from(plan.name),
            data_retention_days: plan.data_retention_days,
            subscribe_template: plan.subscribe_template,
            unsubscribe_template: plan.unsubscribe_template,
            suspend_template: plan.suspend_template,
            delete_data_template: plan.delete_data_template,
            subscribe_webhook: plan.subscribe_webhook,
            unsubscribe_webhook: plan.unsubscribe_webhook,
            suspend_webhook: plan.suspend_webhook,
            delete_data_webhook: plan.delete_data_webhook,
        });
    }

    for template in &file.templates {
        let content =
            std::fs::read_to_string(base.join(&template.path)).map_err(ConfigError::ReadFile)?;
        catalog.add_template(
            OfferName::from(template.offer.as_str()),
            template.name.as_str(),
            content,
        );
    }

    for parameter in file.parameters {
        catalog.add_parameter(
            OfferName::from(parameter.offer),
            parameter.name,
            parameter.expression,
        );
    }

    for meter in file.meters {
        catalog.add_meter(CustomMeter {
            offer: OfferName::from(meter.offer),
            name: MeterName::from(meter.name),
            telemetry_connector: meter.telemetry_connector,
            telemetry_query: meter.telemetry_query,
        });
    }

    for dimension in file.dimensions {
        catalog.add_dimension(
            OfferName::from(dimension.offer),
            PlanName::from(dimension.plan),
            MeterName::from(dimension.meter),
        );
    }

    for pool in file.ip_pools {
        ip_pool.add_pool(
            OfferName::from(pool.offer),
            pool.config_name,
            pool.cidr,
            pool.range_size,
        );
    }

    info!(
        offers = file.offers.len(),
        templates = file.templates.len(),
        "Catalog loaded"
    );

    Ok((catalog, ip_pool))
}
