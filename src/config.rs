//! Configuration for the faxline gateway hook.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use faxline_delivery::{ClientConfig, DeliveryConfig, SuppressionPolicy};
use faxline_lifecycle::{CostConfig, LifecycleConfig, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::esl::EslConfig;

const CONFIG_FILE: &str = "faxline.toml";
const ENV_PREFIX: &str = "FAXLINE_";

/// Complete hook configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed `FAXLINE_` (highest priority)
/// 2. Configuration file (`faxline.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// `DATABASE_URL` is also honored without the prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    #[serde(default = "default_min_connections")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub database_connection_timeout: u64,

    // Lifecycle
    /// Retries granted to new outbound transmissions.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: i32,
    /// Base delay of the linear retry backoff in seconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_seconds: u64,

    // Cost
    /// Price per page before the destination multiplier.
    #[serde(default = "default_base_rate")]
    pub cost_base_rate: Decimal,
    /// Recipient prefix billed at the domestic multiplier.
    #[serde(default = "default_domestic_prefix")]
    pub cost_domestic_prefix: String,
    /// Multiplier for domestic recipients.
    #[serde(default = "default_domestic_multiplier")]
    pub cost_domestic_multiplier: Decimal,
    /// Recipient prefix billed at the secondary multiplier.
    #[serde(default = "default_secondary_prefix")]
    pub cost_secondary_prefix: String,
    /// Multiplier for secondary-region recipients.
    #[serde(default = "default_secondary_multiplier")]
    pub cost_secondary_multiplier: Decimal,
    /// Multiplier for every other recipient.
    #[serde(default = "default_other_multiplier")]
    pub cost_default_multiplier: Decimal,

    // Notifications
    /// Address receiving a notification for every published event.
    #[serde(default)]
    pub notification_address: Option<String>,
    /// Directory the notification spool writes into.
    #[serde(default = "default_spool_dir")]
    pub notification_spool_dir: PathBuf,

    // Delivery
    /// Number of concurrent delivery workers.
    #[serde(default = "default_worker_count")]
    pub delivery_worker_count: usize,
    /// Tasks buffered before producers wait.
    #[serde(default = "default_queue_capacity")]
    pub delivery_queue_capacity: usize,
    /// Webhook request timeout in seconds.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,
    /// Time allowed for draining queued deliveries on exit, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub delivery_shutdown_timeout_seconds: u64,

    // Suppression
    /// Consecutive failures before an endpoint is suppressed.
    #[serde(default = "default_suppression_threshold")]
    pub suppression_threshold: u32,
    /// First cooldown in seconds.
    #[serde(default = "default_suppression_base")]
    pub suppression_base_cooldown_seconds: u64,
    /// Cooldown ceiling in seconds.
    #[serde(default = "default_suppression_max")]
    pub suppression_max_cooldown_seconds: u64,

    // Gateway
    /// Event socket host of the telephony gateway.
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,
    /// Event socket port.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Event socket password.
    #[serde(default = "default_gateway_password")]
    pub gateway_password: String,
    /// Maximum open gateway connections.
    #[serde(default = "default_gateway_pool_size")]
    pub gateway_pool_size: usize,
    /// Seconds to wait for a free gateway connection.
    #[serde(default = "default_gateway_acquire_timeout")]
    pub gateway_acquire_timeout_seconds: u64,
    /// Request error correction mode on outbound calls.
    #[serde(default)]
    pub gateway_use_ecm: bool,
}

impl Config {
    /// Loads configuration from defaults, `faxline.toml` and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Lifecycle manager settings.
    pub fn to_lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            retry_limit: self.retry_limit,
            notification_address: self.notification_address.clone(),
            ..LifecycleConfig::default()
        }
    }

    /// Per-page pricing.
    pub fn to_cost_config(&self) -> CostConfig {
        CostConfig {
            base_rate: self.cost_base_rate,
            domestic_prefix: self.cost_domestic_prefix.clone(),
            domestic_multiplier: self.cost_domestic_multiplier,
            secondary_prefix: self.cost_secondary_prefix.clone(),
            secondary_multiplier: self.cost_secondary_multiplier,
            default_multiplier: self.cost_default_multiplier,
        }
    }

    /// Retry backoff.
    pub const fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.retry_base_delay_seconds))
    }

    /// Webhook HTTP client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Endpoint suppression thresholds.
    pub const fn to_suppression_policy(&self) -> SuppressionPolicy {
        SuppressionPolicy {
            threshold: self.suppression_threshold,
            base_cooldown: Duration::from_secs(self.suppression_base_cooldown_seconds),
            max_cooldown: Duration::from_secs(self.suppression_max_cooldown_seconds),
        }
    }

    /// Delivery worker pool settings.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.delivery_worker_count,
            queue_capacity: self.delivery_queue_capacity,
            shutdown_timeout: Duration::from_secs(self.delivery_shutdown_timeout_seconds),
            client: self.to_client_config(),
            suppression: self.to_suppression_policy(),
        }
    }

    /// Event socket connection settings.
    pub fn to_esl_config(&self) -> EslConfig {
        EslConfig {
            host: self.gateway_host.clone(),
            port: self.gateway_port,
            password: self.gateway_password.clone(),
            ..EslConfig::default()
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // A colon right after the scheme means no password.
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.retry_limit < 0 {
            anyhow::bail!("retry_limit cannot be negative");
        }

        if self.retry_base_delay_seconds == 0 {
            anyhow::bail!("retry_base_delay_seconds must be greater than 0");
        }

        if self.cost_base_rate <= Decimal::ZERO {
            anyhow::bail!("cost_base_rate must be positive");
        }

        for (name, multiplier) in [
            ("cost_domestic_multiplier", self.cost_domestic_multiplier),
            ("cost_secondary_multiplier", self.cost_secondary_multiplier),
            ("cost_default_multiplier", self.cost_default_multiplier),
        ] {
            if multiplier < Decimal::ONE {
                anyhow::bail!("{name} must be at least 1");
            }
        }

        if self.delivery_worker_count == 0 {
            anyhow::bail!("delivery_worker_count must be greater than 0");
        }

        if self.delivery_queue_capacity == 0 {
            anyhow::bail!("delivery_queue_capacity must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.suppression_threshold == 0 {
            anyhow::bail!("suppression_threshold must be greater than 0");
        }

        if self.suppression_base_cooldown_seconds > self.suppression_max_cooldown_seconds {
            anyhow::bail!("suppression base cooldown cannot exceed the max cooldown");
        }

        if self.gateway_pool_size == 0 {
            anyhow::bail!("gateway_pool_size must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            retry_limit: default_retry_limit(),
            retry_base_delay_seconds: default_retry_base_delay(),
            cost_base_rate: default_base_rate(),
            cost_domestic_prefix: default_domestic_prefix(),
            cost_domestic_multiplier: default_domestic_multiplier(),
            cost_secondary_prefix: default_secondary_prefix(),
            cost_secondary_multiplier: default_secondary_multiplier(),
            cost_default_multiplier: default_other_multiplier(),
            notification_address: None,
            notification_spool_dir: default_spool_dir(),
            delivery_worker_count: default_worker_count(),
            delivery_queue_capacity: default_queue_capacity(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_shutdown_timeout_seconds: default_shutdown_timeout(),
            suppression_threshold: default_suppression_threshold(),
            suppression_base_cooldown_seconds: default_suppression_base(),
            suppression_max_cooldown_seconds: default_suppression_max(),
            gateway_host: default_gateway_host(),
            gateway_port: default_gateway_port(),
            gateway_password: default_gateway_password(),
            gateway_pool_size: default_gateway_pool_size(),
            gateway_acquire_timeout_seconds: default_gateway_acquire_timeout(),
            gateway_use_ecm: false,
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/faxline".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_retry_limit() -> i32 {
    faxline_lifecycle::retry::DEFAULT_RETRY_LIMIT
}

fn default_retry_base_delay() -> u64 {
    faxline_lifecycle::retry::DEFAULT_BASE_DELAY.as_secs()
}

fn default_base_rate() -> Decimal {
    Decimal::new(10, 2)
}

fn default_domestic_prefix() -> String {
    "1".to_string()
}

fn default_domestic_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_secondary_prefix() -> String {
    "44".to_string()
}

fn default_secondary_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

fn default_other_multiplier() -> Decimal {
    Decimal::TWO
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("spool/notifications")
}

fn default_worker_count() -> usize {
    faxline_delivery::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    faxline_delivery::DEFAULT_QUEUE_CAPACITY
}

fn default_delivery_timeout() -> u64 {
    faxline_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_suppression_threshold() -> u32 {
    5
}

fn default_suppression_base() -> u64 {
    60
}

fn default_suppression_max() -> u64 {
    3600
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8021
}

fn default_gateway_password() -> String {
    "ClueCon".to_string()
}

fn default_gateway_pool_size() -> usize {
    4
}

fn default_gateway_acquire_timeout() -> u64 {
    5
}
