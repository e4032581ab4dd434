//! Configuration management for nebula
//!
//! Stores settings in ~/.config/nebula/config.json

use crate::diff::DiffOptions;
use crate::llm::models::{AgentModel, DEFAULT_MAX_OUTPUT_TOKENS};
use crate::llm::CompletionOptions;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const KEYRING_SERVICE: &str = "nebula";
const KEYRING_USERNAME: &str = "api_key";

/// Environment variables checked for an API key, in order.
const API_KEY_VARS: [&str; 2] = ["NEBULA_API_KEY", "OPENROUTER_API_KEY"];

/// A shell command run after mutations to validate the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ValidationCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command line for display.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Legacy plaintext key; prefer the environment or the system keychain
    pub api_key: Option<String>,
    /// Chat completions endpoint (OpenRouter when unset)
    pub base_url: Option<String>,
    pub planner_model: String,
    pub implementer_model: String,
    /// Model asked to repair malformed JSON
    pub repair_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub validation_commands: Vec<ValidationCommand>,
    pub validation_timeout_ms: u64,
    /// Let the diff applier splice hunks at their declared line numbers when
    /// no content matches
    pub allow_positional_hunks: bool,
    pub max_json_repair_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            planner_model: AgentModel::Planner.default_id().to_string(),
            implementer_model: AgentModel::Implementer.default_id().to_string(),
            repair_model: AgentModel::Repair.default_id().to_string(),
            temperature: 0.2,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            validation_commands: Vec::new(),
            validation_timeout_ms: 120_000,
            allow_positional_hunks: false,
            max_json_repair_attempts: 2,
        }
    }
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("NEBULA_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    if keyring_disabled() {
        return Ok(None);
    }
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nebula"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit path. Missing files give defaults; corrupt files
    /// are moved aside to `config.json.corrupt` and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted, a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path()
            .ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// Resolve the API key: environment, then system keychain, then the
    /// legacy config field.
    pub fn resolve_api_key(&self) -> Option<String> {
        for var in API_KEY_VARS {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }

        match read_keyring_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to read API key from system keychain, set NEBULA_API_KEY as a workaround");
            }
        }

        if let Some(key) = &self.api_key {
            warn!("using plaintext API key from config file, consider moving it to NEBULA_API_KEY");
            return Some(key.clone());
        }
        None
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            allow_positional_hunks: self.allow_positional_hunks,
        }
    }

    /// Completion options for `model` with this config's sampling settings.
    pub fn completion(&self, model: &str) -> CompletionOptions {
        CompletionOptions {
            model: model.to_string(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            json_mode: false,
        }
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/nebula/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        warn!(error = %e, "failed to set temp config file permissions");
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
