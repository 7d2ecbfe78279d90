//! Configuration file support for a weft peer.
//!
//! Loads optional `weft.toml` from the data directory. If no config file
//! exists, defaults are used.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::tangle::TangleParams;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub tangle: TangleConfig,
}

/// Tangle engine section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TangleConfig {
    /// Bias exponent of the tip-selection walk.
    pub walk_alpha: f64,
    /// Mining difficulty used when the caller does not pick one.
    pub mining_difficulty: u8,
    /// Where tangle snapshots and key files live.
    pub data_dir: String,
}

impl Default for TangleConfig {
    fn default() -> Self {
        TangleConfig {
            walk_alpha: constants::DEFAULT_WALK_ALPHA,
            mining_difficulty: constants::DEFAULT_DIFFICULTY,
            data_dir: "./weft-data".into(),
        }
    }
}

impl WeftConfig {
    /// Load configuration from `weft.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("weft.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// The walk/difficulty parameters fed into [`crate::tangle::Tangle`].
    pub fn tangle_params(&self) -> TangleParams {
        TangleParams {
            walk_alpha: self.tangle.walk_alpha,
            default_difficulty: self.tangle.mining_difficulty,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.tangle.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = WeftConfig::default();
        assert_eq!(config.tangle.walk_alpha, constants::DEFAULT_WALK_ALPHA);
        assert_eq!(config.tangle.mining_difficulty, constants::DEFAULT_DIFFICULTY);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[tangle]
walk_alpha = 2.5
mining_difficulty = 1
data_dir = "/tmp/weft"
"#;
        let config: WeftConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tangle.walk_alpha, 2.5);
        assert_eq!(config.tangle.mining_difficulty, 1);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/weft"));
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = WeftConfig::load(dir.path());
        assert_eq!(config.tangle.mining_difficulty, constants::DEFAULT_DIFFICULTY);
    }

    #[test]
    fn params_reflect_config() {
        let mut config = WeftConfig::default();
        config.tangle.walk_alpha = 7.0;
        let params = config.tangle_params();
        assert_eq!(params.walk_alpha, 7.0);
    }
}
