//! Typed, layered configuration for the micropayment engine.
//!
//! Loaded from a config file (TOML/YAML/JSON, whatever the `config` crate's
//! providers support) layered with environment overrides, mirroring the
//! teacher's split between `Config::load`, `Config::load_from_file`, and
//! `Config::load_from_env` — except sourced from a layered file+env provider
//! instead of env-only, since this crate has no single owning deployment the
//! way a bridge operator does.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use eyre::{eyre, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub batcher: BatcherConfigSection,
    pub channel: ChannelConfigSection,
    pub dispatcher: DispatcherConfigSection,
    pub composer: ComposerConfigSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatcherConfigSection {
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_min_batch_timeout_ms")]
    pub min_batch_timeout_ms: u64,
    #[serde(default = "default_max_batch_timeout_ms")]
    pub max_batch_timeout_ms: u64,
    #[serde(default = "default_high_load_events_per_sec")]
    pub high_load_events_per_sec: f64,
    #[serde(default = "default_low_load_events_per_sec")]
    pub low_load_events_per_sec: f64,
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: f64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_batches_in_memory")]
    pub max_batches_in_memory: usize,
    #[serde(default = "default_tuning_interval_ms")]
    pub tuning_interval_ms: u64,
    #[serde(default)]
    pub aggressive_tuning: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfigSection {
    #[serde(default = "default_standard_block_size")]
    pub standard_block_size: u64,
    #[serde(default = "default_standard_rate")]
    pub standard_rate: u64,
    #[serde(default)]
    pub min_payment_amount: u64,
    #[serde(default = "default_max_payment_amount")]
    pub max_payment_amount: u64,
    #[serde(default = "default_withdrawal_per_transaction")]
    pub withdrawal_per_transaction: u64,
    #[serde(default = "default_withdrawal_daily")]
    pub withdrawal_daily: u64,
    #[serde(default = "default_settlement_max_retries")]
    pub settlement_max_retries: u32,
    #[serde(default = "default_settlement_base_backoff_ms")]
    pub settlement_base_backoff_ms: u64,
}

#[derive(Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub credential: String,
    pub priority: u32,
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_endpoint_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Redacts the endpoint credential so it never lands in a log line.
impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .field("priority", &self.priority)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfigSection {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_endpoint_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_broadcasts")]
    pub max_concurrent_broadcasts: usize,
    #[serde(default = "default_dispatcher_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_reset_time_ms")]
    pub circuit_breaker_reset_time_ms: u64,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposerConfigSection {
    #[serde(default = "default_fee_rate_sat_per_byte")]
    pub fee_rate_sat_per_byte: f64,
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_min_batch_size() -> usize { 10 }
fn default_max_batch_size() -> usize { 500 }
fn default_min_batch_timeout_ms() -> u64 { 10 }
fn default_max_batch_timeout_ms() -> u64 { 5_000 }
fn default_high_load_events_per_sec() -> f64 { 1_000.0 }
fn default_low_load_events_per_sec() -> f64 { 50.0 }
fn default_target_latency_ms() -> f64 { 100.0 }
fn default_max_queue_size() -> usize { 1_000 }
fn default_max_batches_in_memory() -> usize { 100 }
fn default_tuning_interval_ms() -> u64 { 1_000 }
fn default_standard_block_size() -> u64 { 16_384 }
fn default_standard_rate() -> u64 { 100 }
fn default_max_payment_amount() -> u64 { 1_000_000 }
fn default_withdrawal_per_transaction() -> u64 { 10_000_000 }
fn default_withdrawal_daily() -> u64 { 100_000_000 }
fn default_settlement_max_retries() -> u32 { 3 }
fn default_settlement_base_backoff_ms() -> u64 { 500 }
fn default_endpoint_timeout_ms() -> u64 { 10_000 }
fn default_endpoint_max_retries() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_max_concurrent_broadcasts() -> usize { 16 }
fn default_dispatcher_batch_size() -> usize { 50 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_circuit_breaker_threshold() -> u32 { 5 }
fn default_circuit_breaker_reset_time_ms() -> u64 { 60_000 }
fn default_rate_limit_per_second() -> u32 { 100 }
fn default_fee_rate_sat_per_byte() -> f64 { 1.0 }
fn default_network() -> String { "bitcoin".to_string() }

impl Config {
    /// Load layered configuration: `config/default.{toml,yaml,json}` if
    /// present, then a `.env` file if present, then `ENGINE_`-prefixed
    /// environment overrides (double-underscore as the section separator,
    /// e.g. `ENGINE_BATCHER__MAX_BATCH_SIZE`).
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").ok();
        }

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw: config::Config = builder.build()?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| eyre!("failed to parse configuration: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.batcher.min_batch_size == 0 {
            return Err(eyre!("batcher.min_batch_size must be nonzero"));
        }
        if self.batcher.min_batch_size > self.batcher.max_batch_size {
            return Err(eyre!(
                "batcher.min_batch_size ({}) cannot exceed max_batch_size ({})",
                self.batcher.min_batch_size,
                self.batcher.max_batch_size
            ));
        }
        if self.batcher.min_batch_timeout_ms > self.batcher.max_batch_timeout_ms {
            return Err(eyre!("batcher.min_batch_timeout_ms cannot exceed max_batch_timeout_ms"));
        }
        if self.batcher.low_load_events_per_sec >= self.batcher.high_load_events_per_sec {
            return Err(eyre!("batcher.low_load_events_per_sec must be below high_load_events_per_sec"));
        }
        if self.batcher.max_batches_in_memory == 0 {
            return Err(eyre!("batcher.max_batches_in_memory must be nonzero"));
        }

        if self.channel.standard_block_size == 0 {
            return Err(eyre!("channel.standard_block_size must be nonzero"));
        }
        if self.channel.min_payment_amount > self.channel.max_payment_amount {
            return Err(eyre!("channel.min_payment_amount cannot exceed max_payment_amount"));
        }
        if self.channel.withdrawal_per_transaction > self.channel.withdrawal_daily {
            return Err(eyre!(
                "channel.withdrawal_per_transaction ({}) cannot exceed withdrawal_daily ({})",
                self.channel.withdrawal_per_transaction,
                self.channel.withdrawal_daily
            ));
        }

        if self.dispatcher.circuit_breaker_threshold == 0 {
            return Err(eyre!("dispatcher.circuit_breaker_threshold must be nonzero"));
        }
        if self.dispatcher.max_concurrent_broadcasts == 0 {
            return Err(eyre!("dispatcher.max_concurrent_broadcasts must be nonzero"));
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.dispatcher.endpoints {
            if !seen.insert(endpoint.name.clone()) {
                return Err(eyre!("duplicate dispatcher endpoint name: {}", endpoint.name));
            }
        }

        if !(0.0..=1_000.0).contains(&self.composer.fee_rate_sat_per_byte) {
            return Err(eyre!("composer.fee_rate_sat_per_byte out of sane range"));
        }

        Ok(())
    }
}

impl DispatcherConfigSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn circuit_breaker_reset_time(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_time_ms)
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
