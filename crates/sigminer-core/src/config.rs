//! Configuration management for Sigminer
//!
//! A single JSON document holds the identity client/tenant ids, the LLM API
//! key, runtime settings and every saved preset. Reserved keys are upper
//! case; any other top-level key is a preset name:
//!
//! ```json
//! {
//!   "CLIENT_ID": "dab49510-...",
//!   "TENANT_ID": "common",
//!   "API_KEY": "sk-...",
//!   "SETTINGS": { "max_in_flight_requests": 8 },
//!   "leads": { "fields": [...], "file_path": "leads.csv", "model": "gpt-4o" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::models::LauncherConfig;
use crate::APP_NAME;

/// Top-level keys that are never presets
pub const RESERVED_KEYS: [&str; 4] = ["CLIENT_ID", "TENANT_ID", "API_KEY", "SETTINGS"];

/// Environment variable consulted when no API key is stored
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Main configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity provider application (client) id
    #[serde(rename = "CLIENT_ID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Identity provider tenant ("common" for personal accounts)
    #[serde(rename = "TENANT_ID", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// LLM API key
    #[serde(rename = "API_KEY", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Runtime settings
    #[serde(rename = "SETTINGS", default)]
    pub settings: Settings,

    /// Saved presets by name
    #[serde(flatten)]
    pub presets: BTreeMap<String, LauncherConfig>,

    /// Where this document was loaded from; mutations are written back here
    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Microsoft Graph API root
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,

    /// Identity platform host
    #[serde(default = "default_authority_host")]
    pub authority_host: String,

    /// OpenAI-compatible API root
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    /// Model used after the preset's model keeps failing
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,

    /// Retries per model before falling back
    #[serde(default = "default_llm_retries")]
    pub llm_retries: u32,

    /// Max extraction requests in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,

    /// Max emails processed at once
    #[serde(default = "default_max_concurrent_emails")]
    pub max_concurrent_emails: usize,

    /// Global rate limit (requests per second)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,

    /// Timeout for a single HTTP request (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Append-only run log, relative paths resolve against the working directory
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            graph_base_url: default_graph_base_url(),
            authority_host: default_authority_host(),
            llm_base_url: default_llm_base_url(),
            fallback_model: default_fallback_model(),
            llm_retries: default_llm_retries(),
            max_in_flight_requests: default_max_in_flight(),
            max_concurrent_emails: default_max_concurrent_emails(),
            rate_limit_per_second: default_rate_limit(),
            request_timeout_secs: default_request_timeout(),
            log_file: default_log_file(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_fallback_model() -> Option<String> {
    Some("gpt-4o-mini".to_string())
}

fn default_llm_retries() -> u32 {
    2
}

fn default_max_in_flight() -> usize {
    8
}

fn default_max_concurrent_emails() -> usize {
    16
}

fn default_rate_limit() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_log_file() -> PathBuf {
    PathBuf::from("process_log.txt")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Get the config directory (~/.config/sigminer, ~/Library/Application Support/sigminer on macOS)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Config {
    /// Default location of the configuration document
    pub fn default_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            if contents.trim().is_empty() {
                Config::default()
            } else {
                let config: Config = serde_json::from_str(&contents).map_err(|e| {
                    Error::Config(format!("failed to parse {:?}: {}", path, e))
                })?;
                info!("Loaded configuration from {:?}", path);
                config
            }
        } else {
            info!("No config file found at {:?}, using defaults", path);
            Config::default()
        };
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to where it was loaded from (or the default path)
    pub fn save(&self) -> Result<()> {
        let path = self.path.clone().unwrap_or_else(Self::default_path);
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Path this document is saved to
    pub fn path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(Self::default_path)
    }

    /// Token cache file next to the configuration document
    pub fn token_cache_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(config_dir)
            .join("token_cache.json")
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) -> Result<()> {
        self.client_id = Some(client_id.into());
        self.save()
    }

    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) -> Result<()> {
        self.tenant_id = Some(tenant_id.into());
        self.save()
    }

    pub fn set_api_key(&mut self, api_key: impl Into<String>) -> Result<()> {
        self.api_key = Some(api_key.into());
        self.save()
    }

    /// Stored API key, falling back to `OPENAI_API_KEY`
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()))
    }

    /// Save (or replace) a preset
    pub fn save_preset(&mut self, name: &str, preset: LauncherConfig) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || RESERVED_KEYS.contains(&name) {
            return Err(Error::InvalidConfig {
                field: "preset".to_string(),
                reason: format!("'{}' cannot be used as a preset name", name),
            });
        }
        self.presets.insert(name.to_string(), preset);
        self.save()
    }

    /// Look up a preset by name
    pub fn get_preset(&self, name: &str) -> Result<&LauncherConfig> {
        self.presets
            .get(name)
            .ok_or_else(|| Error::PresetNotFound(name.to_string()))
    }

    /// Names of every saved preset
    pub fn list_presets(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    /// Delete a preset
    pub fn delete_preset(&mut self, name: &str) -> Result<()> {
        if self.presets.remove(name).is_none() {
            return Err(Error::PresetNotFound(name.to_string()));
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldConfig;

    fn temp_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("config.json")).unwrap();
        (dir, config)
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.llm_retries, 2);
        assert_eq!(settings.fallback_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(settings.log_file, PathBuf::from("process_log.txt"));
        assert_eq!(settings.max_in_flight_requests, 8);
    }

    #[test]
    fn test_preset_lifecycle() {
        let (dir, mut config) = temp_config();
        let mut preset = LauncherConfig::new("leads.csv");
        preset.fields.push(FieldConfig::new("company", "Company name"));

        config.save_preset("leads", preset.clone()).unwrap();
        config.set_client_id("client-123").unwrap();

        let reloaded = Config::load_from(dir.path().join("config.json")).unwrap();
        assert_eq!(reloaded.list_presets(), vec!["leads"]);
        assert_eq!(reloaded.get_preset("leads").unwrap(), &preset);
        assert_eq!(reloaded.client_id.as_deref(), Some("client-123"));

        config.delete_preset("leads").unwrap();
        assert!(matches!(config.delete_preset("leads"), Err(Error::PresetNotFound(_))));
        assert!(matches!(config.get_preset("leads"), Err(Error::PresetNotFound(_))));
    }

    #[test]
    fn test_reserved_names_rejected() {
        let (_dir, mut config) = temp_config();
        let preset = LauncherConfig::new("x.csv");
        assert!(config.save_preset("API_KEY", preset.clone()).is_err());
        assert!(config.save_preset("  ", preset).is_err());
    }

    #[test]
    fn test_reads_flat_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "CLIENT_ID": "abc",
                "TENANT_ID": "common",
                "API_KEY": "sk-test",
                "prospects": {
                    "fields": [{"field_name": "job_title", "guideline": "", "can_be_overwritten": false}],
                    "excluded_hosts": [],
                    "include_mode": false,
                    "file_path": "prospects.csv",
                    "max_emails": 100,
                    "model": "gpt-4o"
                }
            }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.tenant_id.as_deref(), Some("common"));
        assert_eq!(config.api_key().as_deref(), Some("sk-test"));
        assert_eq!(config.list_presets(), vec!["prospects"]);
        assert_eq!(config.settings.rate_limit_per_second, 10);
        assert_eq!(config.token_cache_path(), dir.path().join("token_cache.json"));
    }

    #[test]
    fn test_reads_desktop_app_presets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "CLIENT_ID": "abc",
                "unbounded": {
                    "fields": [{"field_name": "company ", "guideline": "Legal name", "type": "text"}],
                    "excluded_hosts": ["gmail.com"],
                    "include_mode": false,
                    "file_path": "unbounded.csv",
                    "max_emails": "",
                    "model": "gpt-4o"
                },
                "capped": {
                    "fields": [{"field_name": "job_title", "guideline": ""}],
                    "max_emails": "100",
                    "model": "gpt-4o"
                }
            }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.list_presets(), vec!["capped", "unbounded"]);

        let unbounded = config.get_preset("unbounded").unwrap();
        assert_eq!(unbounded.max_emails, None);
        assert_eq!(unbounded.fields[0], FieldConfig::new("company", "Legal name"));
        assert!(unbounded.validate().is_ok());

        let capped = config.get_preset("capped").unwrap();
        assert_eq!(capped.email_limit(), Some(100));
        assert!(capped.file_path.as_os_str().is_empty());
        assert!(matches!(capped.validate(), Err(Error::InvalidConfig { .. })));
    }
}
