//! Subcommand implementations

pub mod config;
pub mod simulate;

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use stride_gpu::RangeConfig;

/// Range settings shared by every command. Flags override the file, which
/// overrides the `STRIDE_GPU_*` environment.
#[derive(Args, Debug, Clone, Default)]
pub struct RangeArgs {
    /// TOML file with range settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Range mode: none, serial, even, trie, context_sensitive
    #[arg(short, long)]
    pub mode: Option<String>,

    /// EVEN: launches per range
    #[arg(long)]
    pub interval: Option<u32>,

    /// CONTEXT_SENSITIVE: sample one launch in this many
    #[arg(long)]
    pub sampling_period: Option<u32>,

    /// CONTEXT_SENSITIVE: adapt the sampling probability per call site
    #[arg(long)]
    pub dynamic_period: bool,

    /// Seed for the sampling policy
    #[arg(long)]
    pub seed: Option<u64>,
}

impl RangeArgs {
    pub fn load(&self) -> Result<RangeConfig> {
        let mut config = match &self.config {
            Some(path) => RangeConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RangeConfig::default(),
        };
        if let Some(mode) = &self.mode {
            config.mode = mode.clone();
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(period) = self.sampling_period {
            config.sampling_period = period;
        }
        if self.dynamic_period {
            config.dynamic_period = true;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate().context("Invalid range configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = RangeArgs {
            mode: Some("even".into()),
            interval: Some(7),
            seed: Some(3),
            ..RangeArgs::default()
        };
        let config = args.load().unwrap();
        assert_eq!(config.mode, "even");
        assert_eq!(config.interval, 7);
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = RangeArgs {
            interval: Some(0),
            ..RangeArgs::default()
        };
        assert!(args.load().is_err());
    }
}
