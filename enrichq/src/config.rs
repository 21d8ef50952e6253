//! Configuration management for enrichq
//!
//! All configuration is loaded from `./config/enrichq.toml` (or `--config`).
//! Defaults live in the config template only; the template is embedded in the
//! binary so `enrichq init` can write it out.

use serde::Deserialize;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::CoordinatorConfig;
use crate::credentials::PoolConfig;
use crate::dispatch::DispatchConfig;
use crate::lookup::{JsonPointerDecoder, IDENTIFIER_PLACEHOLDER};
use crate::rate_limit::AttemptDelay;
use crate::retry::RetryConfig;

/// Configuration file path relative to working directory
pub const CONFIG_PATH: &str = "./config/enrichq.toml";

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = include_str!("../config/enrichq.toml");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid URL in '{field}': {url}")]
    InvalidUrl { field: String, url: String },

    #[error("Configuration field '{field}' cannot be empty")]
    EmptyRequired { field: String },

    #[error("Configuration field '{field}' must be greater than zero")]
    Zero { field: String },

    #[error("Invalid range: {min_field} ({min}) is greater than {max_field} ({max})")]
    InvalidRange {
        min_field: String,
        min: u64,
        max_field: String,
        max: u64,
    },

    #[error("Invalid JSON pointer in '{field}': {pointer} (must be empty or start with '/')")]
    InvalidPointer { field: String, pointer: String },
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub http: HttpConfig,
    pub decoder: DecoderConfig,
    pub dispatch: DispatchSection,
    pub credentials: CredentialsSection,
    pub provisioner: ProvisionerConfig,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub database: PathBuf,
    pub credential_cache: PathBuf,
    pub accounts: PathBuf,
    pub result_sink: PathBuf,
    pub handoff: PathBuf,
    #[serde(default)]
    pub summary: String,
}

impl PathsConfig {
    /// Summary path, `None` when disabled
    pub fn summary_path(&self) -> Option<PathBuf> {
        let trimmed = self.summary.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub lookup_url: String,
    pub probe_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub name: String,
    pub url: String,
    pub location: String,
    #[serde(default)]
    pub extra: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    pub workers: usize,
    pub max_attempts: u32,
    pub attempt_delay_min_ms: u64,
    pub attempt_delay_max_ms: u64,
    pub channel_capacity: usize,
    pub status_interval_secs: u64,
    #[serde(default)]
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsSection {
    pub min_valid: usize,
    pub wave_multiplier: usize,
    pub wave_pause_secs: u64,
    pub probe_concurrency: usize,
    pub provision_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_rounds: u32,
    pub round_delay_secs: u64,
    pub min_credentials: usize,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub max_rounds: Option<u32>,
    pub min_credentials: Option<usize>,
}

impl AppConfig {
    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides, then re-validate
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(workers) = overrides.workers {
            self.dispatch.workers = workers;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.dispatch.max_attempts = max_attempts;
        }
        if let Some(max_rounds) = overrides.max_rounds {
            self.retry.max_rounds = max_rounds;
        }
        if let Some(min_credentials) = overrides.min_credentials {
            self.credentials.min_valid = min_credentials;
        }
        self.validate()
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, path) in [
            ("paths.database", &self.paths.database),
            ("paths.credential_cache", &self.paths.credential_cache),
            ("paths.accounts", &self.paths.accounts),
            ("paths.result_sink", &self.paths.result_sink),
            ("paths.handoff", &self.paths.handoff),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyRequired {
                    field: field.to_string(),
                });
            }
        }

        if self.http.user_agent.is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "http.user_agent".to_string(),
            });
        }
        if self.http.request_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "http.request_timeout_secs".to_string(),
            });
        }
        Self::validate_url("http.lookup_url", &self.http.lookup_url)?;
        Self::validate_url("http.probe_url", &self.http.probe_url)?;
        if !self.http.lookup_url.contains(IDENTIFIER_PLACEHOLDER) {
            return Err(ConfigError::InvalidUrl {
                field: format!("http.lookup_url (missing {})", IDENTIFIER_PLACEHOLDER),
                url: self.http.lookup_url.clone(),
            });
        }

        for (field, pointer) in [
            ("decoder.name", &self.decoder.name),
            ("decoder.url", &self.decoder.url),
            ("decoder.location", &self.decoder.location),
            ("decoder.extra", &self.decoder.extra),
        ] {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(ConfigError::InvalidPointer {
                    field: field.to_string(),
                    pointer: pointer.clone(),
                });
            }
        }

        for (field, value) in [
            ("dispatch.workers", self.dispatch.workers as u64),
            ("dispatch.max_attempts", self.dispatch.max_attempts as u64),
            ("dispatch.channel_capacity", self.dispatch.channel_capacity as u64),
            ("dispatch.status_interval_secs", self.dispatch.status_interval_secs),
            ("credentials.min_valid", self.credentials.min_valid as u64),
            ("credentials.wave_multiplier", self.credentials.wave_multiplier as u64),
            ("credentials.probe_concurrency", self.credentials.probe_concurrency as u64),
            ("credentials.provision_concurrency", self.credentials.provision_concurrency as u64),
            ("provisioner.timeout_secs", self.provisioner.timeout_secs),
            ("retry.min_credentials", self.retry.min_credentials as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero {
                    field: field.to_string(),
                });
            }
        }

        if self.dispatch.attempt_delay_min_ms > self.dispatch.attempt_delay_max_ms {
            return Err(ConfigError::InvalidRange {
                min_field: "dispatch.attempt_delay_min_ms".to_string(),
                min: self.dispatch.attempt_delay_min_ms,
                max_field: "dispatch.attempt_delay_max_ms".to_string(),
                max: self.dispatch.attempt_delay_max_ms,
            });
        }

        Ok(())
    }

    fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
        // parse with the placeholder filled in
        let candidate = value.replace(IDENTIFIER_PLACEHOLDER, "x");
        let parsed = url::Url::parse(&candidate).map_err(|_| ConfigError::InvalidUrl {
            field: field.to_string(),
            url: value.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::InvalidUrl {
                field: field.to_string(),
                url: value.to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs)
    }

    pub fn decoder(&self) -> JsonPointerDecoder {
        JsonPointerDecoder {
            name: self.decoder.name.clone(),
            url: self.decoder.url.clone(),
            location: self.decoder.location.clone(),
            extra: self.decoder.extra.clone(),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.dispatch.workers,
            max_attempts: self.dispatch.max_attempts,
            attempt_delay: AttemptDelay::new(
                Duration::from_millis(self.dispatch.attempt_delay_min_ms),
                Duration::from_millis(self.dispatch.attempt_delay_max_ms),
            ),
            channel_capacity: self.dispatch.channel_capacity,
            status_interval: Duration::from_secs(self.dispatch.status_interval_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            wave_multiplier: self.credentials.wave_multiplier,
            wave_pause: Duration::from_secs(self.credentials.wave_pause_secs),
            probe_concurrency: self.credentials.probe_concurrency,
            provision_concurrency: self.credentials.provision_concurrency,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            min_credentials: self.credentials.min_valid,
            retry: RetryConfig {
                max_rounds: self.retry.max_rounds,
                round_delay: Duration::from_secs(self.retry.round_delay_secs),
                min_credentials: self.retry.min_credentials,
            },
        }
    }

    /// Write the default configuration to `path`
    pub fn create_default_config_at(path: &Path) -> Result<PathBuf, ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;

        Ok(path.to_path_buf())
    }

    /// Check if stdin is a TTY (interactive terminal)
    pub fn is_interactive() -> bool {
        io::stdin().is_terminal()
    }

    /// Prompt user to create default config at `path` (only in interactive mode)
    pub fn prompt_create_config(path: &Path) -> Result<Option<PathBuf>, ConfigError> {
        if !Self::is_interactive() {
            return Ok(None);
        }

        print!("Configuration file not found. Create default config at {}? [Y/n] ", path.display());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input.is_empty() || input == "y" || input == "yes" {
            let path = Self::create_default_config_at(path)?;
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}
