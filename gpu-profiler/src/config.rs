//! Range profiling configuration
//!
//! Read once at startup from the environment and, optionally, a TOML file.

use crate::error::GpuError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// How kernel launches are grouped into PC-sampled ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    /// Range profiling disabled; every kernel stands alone
    None,
    /// Every kernel is sampled on its own
    Serial,
    /// Every Nth kernel launch opens a range
    Even,
    /// A range closes when the launch path repeats
    Trie,
    /// Ranges keyed by (call site, context) with adaptive sampling
    ContextSensitive,
}

impl RangeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeMode::None => "none",
            RangeMode::Serial => "serial",
            RangeMode::Even => "even",
            RangeMode::Trie => "trie",
            RangeMode::ContextSensitive => "context_sensitive",
        }
    }

    /// Whether this mode drives the PC-sampling machinery
    pub fn uses_pc_sampling(self) -> bool {
        !matches!(self, RangeMode::None)
    }
}

impl std::fmt::Display for RangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RangeMode {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(RangeMode::None),
            "serial" => Ok(RangeMode::Serial),
            "even" => Ok(RangeMode::Even),
            "trie" => Ok(RangeMode::Trie),
            "context_sensitive" => Ok(RangeMode::ContextSensitive),
            _ => Err(GpuError::UnknownRangeMode(s.to_string())),
        }
    }
}

/// What to do when a PC-sampling vendor call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorFailurePolicy {
    /// Log, count, and keep profiling without samples for that range
    #[default]
    LogAndContinue,
    /// Log and abort the process
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Range mode name; parsed by [`RangeConfig::resolve`]
    pub mode: String,

    /// EVEN: launches per range
    pub interval: u32,

    /// CONTEXT_SENSITIVE: target is one sampled launch per `sampling_period`
    pub sampling_period: u32,

    /// CONTEXT_SENSITIVE: adapt the probability to the observed ratio
    pub dynamic_period: bool,

    /// Physical trie depth that triggers compression
    pub trie_compress_threshold: usize,

    /// Lowest sampling probability a call site can decay to
    pub sampling_epsilon: f64,

    /// Steepness of the probability decay above target
    pub sampling_slope: f64,

    /// Seed for the sampling RNG (None = seeded from entropy)
    pub seed: Option<u64>,

    pub failure_policy: VendorFailurePolicy,

    /// Lead-slot spin waits longer than this are logged
    pub lead_wait_warn_ms: u64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            mode: std::env::var("STRIDE_GPU_RANGE_MODE").unwrap_or_else(|_| "none".to_string()),
            interval: std::env::var("STRIDE_GPU_RANGE_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            sampling_period: std::env::var("STRIDE_GPU_SAMPLING_PERIOD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            dynamic_period: std::env::var("STRIDE_GPU_DYNAMIC_PERIOD")
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            trie_compress_threshold: 100_000,
            sampling_epsilon: 0.01,
            sampling_slope: 1.0,
            seed: std::env::var("STRIDE_GPU_RANGE_SEED")
                .ok()
                .and_then(|s| s.parse().ok()),
            failure_policy: VendorFailurePolicy::default(),
            lead_wait_warn_ms: 250,
        }
    }
}

impl RangeConfig {
    /// A default configuration with the given mode
    pub fn with_mode(mode: RangeMode) -> Self {
        Self {
            mode: mode.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, GpuError> {
        toml::from_str(text).map_err(|e| GpuError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, GpuError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GpuError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, GpuError> {
        toml::to_string_pretty(self).map_err(|e| GpuError::Config(e.to_string()))
    }

    /// Validate numeric settings
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.interval == 0 {
            return Err(GpuError::Config("interval must be greater than 0".into()));
        }
        if self.sampling_period == 0 {
            return Err(GpuError::Config("sampling_period must be greater than 0".into()));
        }
        if !(self.sampling_epsilon > 0.0 && self.sampling_epsilon <= 1.0) {
            return Err(GpuError::Config(format!(
                "sampling_epsilon must be in (0, 1], got {}",
                self.sampling_epsilon
            )));
        }
        if self.trie_compress_threshold == 0 {
            return Err(GpuError::Config("trie_compress_threshold must be greater than 0".into()));
        }
        Ok(())
    }

    /// The mode to run with.
    ///
    /// Unknown names and backends without PC sampling fall back to
    /// [`RangeMode::None`] instead of failing.
    pub fn resolve(&self, pc_sampling_supported: bool) -> RangeMode {
        let mode = match self.mode.parse::<RangeMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("{}; range profiling disabled", e);
                return RangeMode::None;
            }
        };
        if mode.uses_pc_sampling() && !pc_sampling_supported {
            warn!(
                "range mode {} needs PC sampling, which the backend lacks; range profiling disabled",
                mode
            );
            return RangeMode::None;
        }
        mode
    }

    /// Target sampling frequency, `1 / sampling_period`
    pub fn target_ratio(&self) -> f64 {
        1.0 / f64::from(self.sampling_period.max(1))
    }
}
