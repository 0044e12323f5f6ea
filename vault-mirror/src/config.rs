// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mirror configuration
//!
//! Loaded from YAML. `${VAR}` placeholders are replaced from the environment
//! before parsing, and every field falls back to a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vault_ledger::FetchConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Adapter tuning
    #[serde(default)]
    pub source: FetchConfig,
}

impl MirrorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config")?;
        config.engine.validate()?;
        Ok(config)
    }
}

/// Replace `${VAR}` with the value of `VAR`. Unset variables are left in
/// place.
fn substitute_env_vars(content: &str) -> Result<String> {
    use regex::Regex;

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").context("Invalid placeholder regex")?;
    let result = re.replace_all(content, |caps: &regex::Captures| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    "[Config] environment variable {} not set, keeping placeholder",
                    &caps[1]
                );
                caps[0].to_string()
            }
        }
    });
    Ok(result.into_owned())
}

/// Ingestion engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum blocks per backfill query
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,

    /// Gap-recovery sweep period while live
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Live events applied together at most
    #[serde(default = "default_live_batch_size")]
    pub live_batch_size: usize,

    /// How long a live batch stays open after its first event
    #[serde(default = "default_live_batch_window_ms")]
    pub live_batch_window_ms: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Blocks behind head that backfill stops at
    #[serde(default)]
    pub confirmation_depth: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_block_range: default_max_block_range(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            live_batch_size: default_live_batch_size(),
            live_batch_window_ms: default_live_batch_window_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            confirmation_depth: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_block_range > 0, "max_block_range must be positive");
        anyhow::ensure!(self.live_batch_size > 0, "live_batch_size must be positive");
        anyhow::ensure!(
            self.sweep_interval_seconds > 0,
            "sweep_interval_seconds must be positive"
        );
        anyhow::ensure!(
            self.initial_backoff_ms <= self.max_backoff_ms,
            "initial_backoff_ms must not exceed max_backoff_ms"
        );
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn live_batch_window(&self) -> Duration {
        Duration::from_millis(self.live_batch_window_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_live_batch_size() -> usize {
    100
}

fn default_live_batch_window_ms() -> u64 {
    200
}

fn default_initial_backoff_ms() -> u64 {
    400
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = MirrorConfig::from_yaml("{}").unwrap();
        assert_eq!(config, MirrorConfig::default());
        assert_eq!(config.engine.initial_backoff(), Duration::from_millis(400));
        assert_eq!(config.engine.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.engine.confirmation_depth, 0);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
engine:
  max_block_range: 250
  confirmation_depth: 6
  sweep_interval_seconds: 10
  live_batch_window_ms: 50
source:
  channel_size: 64
  poll_interval_ms: 500
"#;
        let config = MirrorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.max_block_range, 250);
        assert_eq!(config.engine.confirmation_depth, 6);
        assert_eq!(config.engine.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.engine.live_batch_window(), Duration::from_millis(50));
        assert_eq!(config.source.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.engine.live_batch_size, 100);
        assert_eq!(config.source.channel_size, 64);
        assert_eq!(config.source.max_block_range, 1000);
    }

    #[test]
    fn test_invalid_engine_config_rejected() {
        let err = MirrorConfig::from_yaml("engine:\n  max_block_range: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_block_range"));

        let yaml = "engine:\n  initial_backoff_ms: 5000\n  max_backoff_ms: 100\n";
        let err = MirrorConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("max_backoff_ms"));
    }

    #[test]
    #[serial]
    fn test_env_substitution_from_file() {
        std::env::set_var("VAULT_MIRROR_TEST_RANGE", "321");
        std::env::remove_var("VAULT_MIRROR_TEST_UNSET");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engine:\n  max_block_range: ${{VAULT_MIRROR_TEST_RANGE}}\n"
        )
        .unwrap();
        let config = MirrorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.max_block_range, 321);

        let kept = substitute_env_vars("url: ${VAULT_MIRROR_TEST_UNSET}").unwrap();
        assert_eq!(kept, "url: ${VAULT_MIRROR_TEST_UNSET}");

        std::env::remove_var("VAULT_MIRROR_TEST_RANGE");
    }

    #[test]
    fn test_missing_file() {
        assert!(MirrorConfig::from_file("/nonexistent/vault-mirror.yaml").is_err());
    }
}
