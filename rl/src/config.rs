//! RateLimiter configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use ratestore::{MemoryStore, RateLimitStore};
use serde::{Deserialize, Serialize};

use crate::limiter::{RateLimit, RateLimiterConfig, StaticRateLimitConfig};
use crate::retry::RetryConfig;

/// Main configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Limiter settings
    pub limiter: LimiterSettings,

    /// Synthetic workload for `rl simulate`
    pub simulation: SimulationConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.simulation.validate()
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .ratelimiter.yml
        let local_config = PathBuf::from(".ratelimiter.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/ratelimiter/ratelimiter.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ratelimiter").join("ratelimiter.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Limiter settings as they appear in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LimiterSettings {
    /// Limiter identifier, also the store key
    pub id: String,

    /// Max concurrently executing requests
    pub max_concurrent: usize,

    /// Max queued requests (unbounded if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,

    /// Fixed-window limit (no limit if unset)
    #[serde(rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_limit: Option<StaticRateLimitConfig>,

    /// Retry policy; unset keys keep their defaults
    pub retry: RetryConfig,

    /// Evict expired store windows this often (passive expiry only if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            max_concurrent: 1,
            max_queue_size: None,
            static_limit: None,
            retry: RetryConfig::default(),
            sweep_interval_ms: None,
        }
    }
}

impl LimiterSettings {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            eyre::bail!("limiter.id must not be empty");
        }
        if self.max_concurrent == 0 {
            eyre::bail!("limiter.max-concurrent must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            eyre::bail!("limiter.retry.jitter must be between 0 and 1, got {}", self.retry.jitter);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            eyre::bail!(
                "limiter.retry.base-delay-ms ({}) exceeds max-delay-ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if let Some(limit) = &self.static_limit {
            if limit.max_requests == 0 || limit.interval_ms == 0 {
                eyre::bail!("limiter.static needs a non-zero max-requests and interval-ms");
            }
        }
        Ok(())
    }

    /// Merge file settings over the limiter defaults
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            id: self.id.clone(),
            limit: self.static_limit.clone().map(RateLimit::Static),
            max_queue_size: self.max_queue_size,
            retry: self.retry.clone(),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Build the in-memory store these settings describe
    ///
    /// Must be called from within a tokio runtime when a sweep interval is set.
    pub fn build_store(&self) -> Arc<dyn RateLimitStore> {
        match self.sweep_interval_ms {
            Some(ms) if ms > 0 => Arc::new(MemoryStore::with_sweep(Duration::from_millis(ms))),
            _ => Arc::new(MemoryStore::new()),
        }
    }
}

/// Synthetic workload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimulationConfig {
    /// Number of requests to schedule
    pub requests: usize,

    /// Simulated work duration in milliseconds
    pub work_ms: u64,

    /// Probability (0-1) that an attempt fails with a retryable status
    pub failure_rate: f64,

    /// Priorities are drawn from 0..=max-priority
    pub max_priority: i32,

    /// Per-request queue deadline in milliseconds (none if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            requests: 20,
            work_ms: 50,
            failure_rate: 0.1,
            max_priority: 2,
            deadline_ms: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            eyre::bail!("simulation.failure-rate must be between 0 and 1, got {}", self.failure_rate);
        }
        if self.max_priority < 0 {
            eyre::bail!("simulation.max-priority must not be negative");
        }
        Ok(())
    }
}
