//! Service configuration, read once from the environment at startup.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::carrier::{CarrierConfig, ParcelContext};
use crate::fees::Package;
use crate::lifecycle::LifecycleConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Absent means orders are kept in memory.
    pub database_url: Option<String>,
    pub nats_url: Option<String>,
    pub carrier: CarrierConfig,
    pub lifecycle: LifecycleConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let package = Package {
            weight_kg: parse_or(&var, "PACKAGE_WEIGHT_KG", Decimal::ONE)?,
            length_cm: parse_or(&var, "PACKAGE_LENGTH_CM", Decimal::from(30))?,
            width_cm: parse_or(&var, "PACKAGE_WIDTH_CM", Decimal::from(20))?,
            height_cm: parse_or(&var, "PACKAGE_HEIGHT_CM", Decimal::from(10))?,
        };
        for (key, value) in [
            ("PACKAGE_WEIGHT_KG", package.weight_kg),
            ("PACKAGE_LENGTH_CM", package.length_cm),
            ("PACKAGE_WIDTH_CM", package.width_cm),
            ("PACKAGE_HEIGHT_CM", package.height_cm),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::Invalid { key, value: value.to_string() });
            }
        }

        let mut carrier = CarrierConfig::default();
        carrier.api_id = var("CARRIER_API_ID");
        carrier.api_token = var("CARRIER_API_TOKEN");
        if let Some(url) = var("CARRIER_BASE_URL") {
            carrier.base_url = url;
        }
        let timeout_secs: u64 = parse_or(&var, "CARRIER_TIMEOUT_SECS", carrier.timeout.as_secs())?;
        carrier.timeout = std::time::Duration::from_secs(timeout_secs);

        Ok(Self {
            port: parse_or(&var, "PORT", 8083)?,
            database_url: var("DATABASE_URL"),
            nats_url: var("NATS_URL"),
            carrier,
            lifecycle: LifecycleConfig {
                write_retries: parse_or(&var, "ORDER_WRITE_RETRIES", 3)?,
                origin_region_id: parse_or(&var, "CARRIER_ORIGIN_REGION_ID", 16)?,
                parcel: ParcelContext {
                    origin_region_name: var("CARRIER_ORIGIN_REGION").unwrap_or_else(|| "Alger".to_string()),
                    package,
                    do_insurance: parse_or(&var, "CARRIER_INSURANCE", false)?,
                },
            },
        })
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
