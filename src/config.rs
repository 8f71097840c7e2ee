//! Configuration management for Gateward.
//!
//! All limiter parameters are supplied up front in a validated structure and
//! passed by reference into each component; no limiter consults any global
//! configuration source at check time. Invalid bounds fail fast at
//! construction, before any request is admitted.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{GatewardError, Result};

/// Main configuration for the admission-control core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewardConfig {
    /// Master switch; when false every check allows with full quota
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-client sliding window configuration
    #[serde(default)]
    pub per_client: PerClientConfig,

    /// Global token bucket configuration
    #[serde(default)]
    pub global: GlobalBucketConfig,

    /// Adaptive limiter configuration
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Idle-state eviction configuration
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Client identity extraction configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Operation categories routed through the adaptive limiter
    #[serde(default = "default_expensive_categories")]
    pub expensive_categories: HashSet<String>,
}

impl Default for GatewardConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            per_client: PerClientConfig::default(),
            global: GlobalBucketConfig::default(),
            adaptive: AdaptiveConfig::default(),
            eviction: EvictionConfig::default(),
            identity: IdentityConfig::default(),
            expensive_categories: default_expensive_categories(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_expensive_categories() -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert("inference".to_string());
    set
}

/// Per-client sliding window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerClientConfig {
    /// Requests allowed per client per window
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u64,

    /// Extra headroom added on top of `requests_per_minute`
    #[serde(default = "default_burst_size")]
    pub burst_size: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl PerClientConfig {
    /// The effective window quota: base rate plus burst headroom.
    pub fn effective_limit(&self) -> u64 {
        self.requests_per_minute + self.burst_size
    }

    /// The window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for PerClientConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_requests_per_minute() -> u64 {
    60
}

fn default_burst_size() -> u64 {
    10
}

fn default_window_secs() -> u64 {
    60
}

/// Global token bucket configuration.
///
/// Defaults are derived from the default per-client rate: capacity is ten
/// times the per-minute rate, refill is that rate spread over a minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalBucketConfig {
    /// Maximum number of tokens the bucket can hold
    #[serde(default = "default_global_capacity")]
    pub capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_global_refill_rate")]
    pub refill_rate: f64,
}

impl Default for GlobalBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_global_capacity(),
            refill_rate: default_global_refill_rate(),
        }
    }
}

fn default_global_capacity() -> f64 {
    600.0
}

fn default_global_refill_rate() -> f64 {
    1.0
}

/// Adaptive limiter configuration for expensive operation categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Starting per-window quota for each category
    #[serde(default = "default_adaptive_base_limit")]
    pub base_limit: u64,

    /// Floor for the dynamic limit
    #[serde(default = "default_adaptive_min_limit")]
    pub min_limit: u64,

    /// Ceiling for the dynamic limit
    #[serde(default = "default_adaptive_max_limit")]
    pub max_limit: u64,

    /// Admission window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Minimum seconds between limit adjustments
    #[serde(default = "default_adjustment_interval_secs")]
    pub adjustment_interval_secs: u64,

    /// Failure ratio above which the limit is reduced
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Failure ratio below which an interval counts as healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,

    /// Consecutive healthy intervals required before raising the limit
    #[serde(default = "default_recovery_intervals")]
    pub recovery_intervals: u32,

    /// Multiplier applied to the limit on degradation
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Fixed step added to the limit on recovery
    #[serde(default = "default_increase_step")]
    pub increase_step: u64,
}

impl AdaptiveConfig {
    /// The admission window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The adjustment interval as a duration.
    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_secs(self.adjustment_interval_secs)
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_limit: default_adaptive_base_limit(),
            min_limit: default_adaptive_min_limit(),
            max_limit: default_adaptive_max_limit(),
            window_secs: default_window_secs(),
            adjustment_interval_secs: default_adjustment_interval_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            recovery_intervals: default_recovery_intervals(),
            decrease_factor: default_decrease_factor(),
            increase_step: default_increase_step(),
        }
    }
}

fn default_adaptive_base_limit() -> u64 {
    10
}

fn default_adaptive_min_limit() -> u64 {
    5
}

fn default_adaptive_max_limit() -> u64 {
    20
}

fn default_adjustment_interval_secs() -> u64 {
    30
}

fn default_failure_threshold() -> f64 {
    0.1
}

fn default_recovery_threshold() -> f64 {
    0.02
}

fn default_recovery_intervals() -> u32 {
    2
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_increase_step() -> u64 {
    2
}

/// Idle-state eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Seconds of inactivity after which a client's state is removed
    #[serde(default = "default_eviction_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between background sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl EvictionConfig {
    /// The idle TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// The sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_eviction_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_eviction_ttl_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Client identity extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Honor forwarded-address headers when deriving client identity.
    ///
    /// These headers are client-spoofable; only enable this when the service
    /// sits behind a proxy layer that overwrites them.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_proxy_headers: false,
        }
    }
}

impl GatewardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all bounds, failing before any request is admitted.
    pub fn validate(&self) -> Result<()> {
        if self.per_client.requests_per_minute == 0 {
            return Err(GatewardError::Config(
                "per_client.requests_per_minute must be positive".into(),
            ));
        }
        if self.per_client.window_secs == 0 {
            return Err(GatewardError::Config(
                "per_client.window_secs must be positive".into(),
            ));
        }
        if self.global.capacity <= 0.0 || !self.global.capacity.is_finite() {
            return Err(GatewardError::Config(
                "global.capacity must be positive and finite".into(),
            ));
        }
        if self.global.refill_rate <= 0.0 || !self.global.refill_rate.is_finite() {
            return Err(GatewardError::Config(
                "global.refill_rate must be positive and finite".into(),
            ));
        }
        let a = &self.adaptive;
        if a.min_limit == 0 {
            return Err(GatewardError::Config(
                "adaptive.min_limit must be positive".into(),
            ));
        }
        if a.min_limit > a.max_limit {
            return Err(GatewardError::Config(format!(
                "adaptive.min_limit ({}) exceeds adaptive.max_limit ({})",
                a.min_limit, a.max_limit
            )));
        }
        if a.base_limit < a.min_limit || a.base_limit > a.max_limit {
            return Err(GatewardError::Config(format!(
                "adaptive.base_limit ({}) outside [{}, {}]",
                a.base_limit, a.min_limit, a.max_limit
            )));
        }
        if a.window_secs == 0 || a.adjustment_interval_secs == 0 {
            return Err(GatewardError::Config(
                "adaptive window and adjustment interval must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&a.failure_threshold) || a.failure_threshold == 0.0 {
            return Err(GatewardError::Config(
                "adaptive.failure_threshold must be in (0, 1]".into(),
            ));
        }
        if !(0.0..1.0).contains(&a.recovery_threshold) {
            return Err(GatewardError::Config(
                "adaptive.recovery_threshold must be in [0, 1)".into(),
            ));
        }
        if a.recovery_threshold >= a.failure_threshold {
            return Err(GatewardError::Config(
                "adaptive.recovery_threshold must be below adaptive.failure_threshold".into(),
            ));
        }
        if a.recovery_intervals == 0 {
            return Err(GatewardError::Config(
                "adaptive.recovery_intervals must be positive".into(),
            ));
        }
        if a.decrease_factor <= 0.0 || a.decrease_factor >= 1.0 {
            return Err(GatewardError::Config(
                "adaptive.decrease_factor must be in (0, 1)".into(),
            ));
        }
        if a.increase_step == 0 {
            return Err(GatewardError::Config(
                "adaptive.increase_step must be positive".into(),
            ));
        }
        if self.eviction.ttl_secs == 0 || self.eviction.sweep_interval_secs == 0 {
            return Err(GatewardError::Config(
                "eviction TTL and sweep interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
