//! Configuration module for metering-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Engine tunables shared by ingestion, rating and invoicing.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Zero disables the in-process sweep; an external scheduler calls `POST /billing/sweep`.
    pub sweep_interval_secs: u64,
    pub external_call_timeout_ms: u64,
    pub dedup_time_created_window_days: i64,
    pub dedup_inserted_at_window_days: i64,
    pub default_net_terms_days: i64,
    pub usage_cache_ttl_secs: u64,
    pub invoice_webhook_url: Option<String>,
    pub tax_service_url: Option<String>,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
            external_call_timeout_ms: 5000,
            dedup_time_created_window_days: 45,
            dedup_inserted_at_window_days: 7,
            default_net_terms_days: 30,
            usage_cache_ttl_secs: 300,
            invoice_webhook_url: None,
            tax_service_url: None,
        }
    }
}

impl BillingSettings {
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_millis(self.external_call_timeout_ms)
    }

    pub fn usage_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.usage_cache_ttl_secs)
    }

    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval_secs: env_or("BILLING_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            external_call_timeout_ms: env_or(
                "EXTERNAL_CALL_TIMEOUT_MS",
                defaults.external_call_timeout_ms,
            ),
            dedup_time_created_window_days: env_or(
                "DEDUP_TIME_CREATED_WINDOW_DAYS",
                defaults.dedup_time_created_window_days,
            ),
            dedup_inserted_at_window_days: env_or(
                "DEDUP_INSERTED_AT_WINDOW_DAYS",
                defaults.dedup_inserted_at_window_days,
            ),
            default_net_terms_days: env_or("DEFAULT_NET_TERMS_DAYS", defaults.default_net_terms_days),
            usage_cache_ttl_secs: env_or("USAGE_CACHE_TTL_SECS", defaults.usage_cache_ttl_secs),
            invoice_webhook_url: env::var("INVOICE_WEBHOOK_URL").ok(),
            tax_service_url: env::var("TAX_SERVICE_URL").ok(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            billing: BillingSettings::from_env(),
        })
    }
}
