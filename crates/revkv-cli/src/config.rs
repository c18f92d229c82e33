//! Tool configuration

use revkv_core::BackendConfig;
use revkv_rowstore::DEFAULT_MAX_ROW_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "REVKV";

/// Configuration of a backend running over the in-memory medium
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Row ceiling enforced by the medium
    pub medium_max_row_size: usize,
    /// Backend settings
    pub backend: BackendConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            medium_max_row_size: DEFAULT_MAX_ROW_SIZE,
            backend: BackendConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load defaults, then an optional file, then `REVKV_*` variables
    ///
    /// Nested keys use a double underscore, e.g. `REVKV_BACKEND__MAX_ROW_SIZE`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&NodeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.backend.max_row_size, DEFAULT_MAX_ROW_SIZE);
        assert_eq!(config.medium_max_row_size, DEFAULT_MAX_ROW_SIZE);
    }

    #[test]
    fn test_load_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "medium_max_row_size = 8192\n\n[backend]\nmax_row_size = 4096\nlock_stripes = 8"
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.medium_max_row_size, 8192);
        assert_eq!(config.backend.max_row_size, 4096);
        assert_eq!(config.backend.lock_stripes, 8);
        // Untouched keys keep their defaults
        assert!(config.backend.verify_checksums);
    }
}
