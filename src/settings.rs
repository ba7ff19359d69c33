use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::patterns::DEFAULT_CUSTOM_IGNORE_RULES;

pub const DEFAULT_CUSTOM_PROMPT_RULES: &str = "no additional rules";

const APP_DIR: &str = "ctxpack";
const SETTINGS_FILE: &str = "settings.json";

/// User-level settings persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub custom_ignore_rules: String,
    #[serde(default)]
    pub custom_prompt_rules: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            custom_ignore_rules: DEFAULT_CUSTOM_IGNORE_RULES.to_string(),
            custom_prompt_rules: DEFAULT_CUSTOM_PROMPT_RULES.to_string(),
        }
    }
}

impl Settings {
    /// Replace blank values with the embedded defaults.
    fn fill_defaults(&mut self) {
        if self.custom_ignore_rules.trim().is_empty() {
            debug!("custom ignore rules empty, using embedded defaults");
            self.custom_ignore_rules = DEFAULT_CUSTOM_IGNORE_RULES.to_string();
        }
        if self.custom_prompt_rules.trim().is_empty() {
            debug!("custom prompt rules empty, using default");
            self.custom_prompt_rules = DEFAULT_CUSTOM_PROMPT_RULES.to_string();
        }
    }
}

/// Settings bound to the file they are persisted in.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// Default location: `<config dir>/ctxpack/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Load from `config_dir` (or the platform default). Never fails on a
    /// missing or broken file: defaults are used, and a missing file is
    /// created so the user has something to edit.
    pub fn load(config_dir: Option<&Path>) -> Self {
        let path = match config_dir {
            Some(dir) => dir.join(SETTINGS_FILE),
            None => Self::default_path().unwrap_or_else(|| PathBuf::from(SETTINGS_FILE)),
        };
        Self::load_from(path)
    }

    pub fn load_from(path: PathBuf) -> Self {
        let settings = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(mut settings) => {
                    settings.fill_defaults();
                    settings
                }
                Err(err) => {
                    warn!(
                        "failed to parse settings {}: {err}. Using defaults.",
                        path.display()
                    );
                    Settings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("settings file not found, creating {}", path.display());
                let store = Self {
                    path,
                    settings: Settings::default(),
                };
                if let Err(err) = store.save() {
                    warn!("failed to save default settings: {err:#}");
                }
                return store;
            }
            Err(err) => {
                warn!(
                    "failed to read settings {}: {err}. Using defaults.",
                    path.display()
                );
                Settings::default()
            }
        };
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(&self.settings)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write settings to {}", self.path.display()))?;
        debug!("settings saved to {}", self.path.display());
        Ok(())
    }

    pub fn custom_ignore_rules(&self) -> &str {
        &self.settings.custom_ignore_rules
    }

    /// Store new rule text. The in-memory value changes even if saving fails.
    pub fn set_custom_ignore_rules(&mut self, rules: impl Into<String>) -> anyhow::Result<()> {
        self.settings.custom_ignore_rules = rules.into();
        self.save().context("failed to save custom ignore rules")
    }

    pub fn custom_prompt_rules(&self) -> &str {
        if self.settings.custom_prompt_rules.trim().is_empty() {
            DEFAULT_CUSTOM_PROMPT_RULES
        } else {
            &self.settings.custom_prompt_rules
        }
    }

    pub fn set_custom_prompt_rules(&mut self, rules: impl Into<String>) -> anyhow::Result<()> {
        self.settings.custom_prompt_rules = rules.into();
        self.save().context("failed to save custom prompt rules")
    }
}
