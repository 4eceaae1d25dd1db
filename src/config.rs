use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::argument_translator::ArgumentMapping;
use crate::error::ConfigError;
use crate::provider::ProviderConfig;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PdpConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for PdpConfig {
    fn default() -> Self {
        PdpConfig {
            url: "http://localhost:8082".to_string(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsentConfig {
    /// Without a URL, requests that need consent fail closed.
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub purpose: String,
    /// Where the consent portal sends the data owner afterwards.
    pub redirect_url: String,
    pub owner_type: String,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        ConsentConfig {
            url: None,
            timeout_ms: 5000,
            purpose: "data-exchange".to_string(),
            redirect_url: String::new(),
            owner_type: "citizen".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    pub url: Option<String>,
    pub enabled: bool,
    pub timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            url: None,
            enabled: true,
            timeout_ms: 10000,
        }
    }
}

impl AuditConfig {
    pub fn active_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|url| self.enabled && !url.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            path: PathBuf::from("schemas.db"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent_providers: usize,
    pub provider_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            max_concurrent_providers: 8,
            provider_timeout_ms: 10000,
            request_timeout_ms: 30000,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub pdp: PdpConfig,
    pub consent: ConsentConfig,
    pub audit: AuditConfig,
    pub store: StoreConfig,
    pub execution: ExecutionConfig,
    pub providers: Vec<ProviderConfig>,
    pub argument_mappings: Vec<ArgumentMapping>,
    /// SDL registered and activated at startup when nothing is active yet.
    pub bootstrap_schema: Option<PathBuf>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Reads `path`. A missing file is only an error when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Config::from_yaml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Config::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Applies environment overrides through `lookup`, normally
    /// `|key| std::env::var(key).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT `{}` is not a port number", port)))?;
        }
        if let Some(url) = lookup("PDP_URL") {
            self.pdp.url = url;
        }
        if let Some(url) = lookup("CONSENT_URL") {
            self.consent.url = Some(url);
        }
        if let Some(url) = lookup("AUDIT_SERVICE_URL") {
            self.audit.url = Some(url);
        }
        if let Some(flag) = lookup("ENABLE_AUDIT") {
            self.audit.enabled = parse_flag(&flag)
                .ok_or_else(|| ConfigError::Invalid(format!("ENABLE_AUDIT `{}` is not a boolean", flag)))?;
        }
        if let Some(path) = lookup("SCHEMA_DB_PATH") {
            self.store.backend = StoreBackend::Sqlite;
            self.store.path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pdp.url.trim().is_empty() {
            return Err(ConfigError::Invalid("pdp.url must be set".to_string()));
        }
        if self.execution.max_concurrent_providers == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_concurrent_providers must be at least 1".to_string(),
            ));
        }

        let mut keys = HashSet::new();
        for provider in &self.providers {
            if provider.key.trim().is_empty() || provider.url.trim().is_empty() {
                return Err(ConfigError::Invalid("every provider needs a key and a url".to_string()));
            }
            if !keys.insert(provider.key.as_str()) {
                return Err(ConfigError::Invalid(format!("provider `{}` is declared twice", provider.key)));
            }
        }
        for mapping in &self.argument_mappings {
            if mapping.source_path.trim().is_empty() || mapping.target_path.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "argument mapping for `{}` needs source_path and target_path",
                    mapping.provider_key
                )));
            }
        }
        Ok(())
    }

    pub fn pdp_timeout(&self) -> Duration {
        Duration::from_millis(self.pdp.timeout_ms)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_millis(self.consent.timeout_ms)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit.timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.provider_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.request_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Command line. Flags win over the environment, which wins over the file.
#[derive(Debug, Parser)]
#[command(name = "exchange-federator", version, about = "Federated GraphQL data-exchange gateway")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(long, value_enum)]
    pub store: Option<StoreBackend>,

    /// SQLite database file, implies `--store sqlite`.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    #[arg(long)]
    pub bootstrap_schema: Option<PathBuf>,
}

impl Cli {
    /// The config file must exist only when it was named explicitly.
    pub fn config_required(&self) -> bool {
        self.config != Path::new("config.yaml")
    }

    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(store) = self.store {
            config.store.backend = store;
        }
        if let Some(path) = &self.db_path {
            config.store.backend = StoreBackend::Sqlite;
            config.store.path = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(path) = &self.bootstrap_schema {
            config.bootstrap_schema = Some(path.clone());
        }
    }
}
