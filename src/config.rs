use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::progress::DEFAULT_MAX_OUTPUT_BYTES;
use crate::watcher::DEFAULT_DEBOUNCE;

pub const CONFIG_FILE: &str = "ctxpack.toml";

/// Configuration loaded from `ctxpack.toml` at a project root.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Extra root-relative paths to leave out of the artifact.
    pub exclude: Vec<String>,
    /// Ceiling for the assembled artifact, in bytes.
    pub max_output_bytes: Option<usize>,
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet window for coalescing change notifications; 0 disables it.
    pub debounce_ms: Option<u64>,
}

impl ProjectConfig {
    /// Load `ctxpack.toml` from `root`.
    ///
    /// Returns the default configuration if the file does not exist or cannot be parsed.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE);

        if !config_path.exists() {
            debug!("no {CONFIG_FILE} in {}", root.display());
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!(
                        "failed to parse {}: {err}. Using defaults.",
                        config_path.display()
                    );
                    Self::default()
                }
            },
            Err(err) => {
                warn!(
                    "failed to read {}: {err}. Using defaults.",
                    config_path.display()
                );
                Self::default()
            }
        }
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES)
    }

    pub fn debounce(&self) -> Duration {
        self.watch
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEBOUNCE)
    }
}
