//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./namdrunner.toml or ./.namdrunner/config.toml
//! 2. User config: ~/.namdrunner/config.toml
//! 3. System config: /etc/namdrunner/config.toml
//! 4. Built-in defaults

use crate::connection::errors::INVALID_CONFIG;
use crate::connection::{ConnectionError, RetryConfig};
use crate::env;
use crate::remote::{Credentials, OpenSshConfig};
use crate::session::SessionConfig;
use crate::workspace::paths;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Login node coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            connect_timeout_secs: 15,
            command_timeout_secs: 30,
        }
    }
}

impl ClusterConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.host, &self.username).with_port(self.port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Adapter settings with the socket kept under `app_dir`
    pub fn openssh_config(&self, app_dir: &Path) -> OpenSshConfig {
        OpenSshConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: self.command_timeout(),
            control_dir: app_dir.to_path_buf(),
            ..OpenSshConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Job directories untouched for longer are removed by `cleanup`
    pub cleanup_max_age_days: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            cleanup_max_age_days: 30,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub workspace: WorkspaceConfig,
}

impl AppConfig {
    /// Parse TOML; unknown sections or keys are a Configuration error
    pub fn from_toml_str(content: &str) -> Result<Self, ConnectionError> {
        toml::from_str(content).map_err(|e| {
            ConnectionError::from_template(&INVALID_CONFIG).with_detail(e.message())
        })
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse configuration file {:?}", path))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write configuration file {:?}", path))
    }

    /// Command-line overrides win over file values
    pub fn apply_overrides(
        &mut self,
        host: Option<&str>,
        username: Option<&str>,
        port: Option<u16>,
    ) {
        if let Some(host) = host {
            self.cluster.host = host.to_string();
        }
        if let Some(username) = username {
            self.cluster.username = username.to_string();
        }
        if let Some(port) = port {
            self.cluster.port = port;
        }
    }

    /// Checks required before any remote operation
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let cluster = &self.cluster;
        if cluster.host.trim().is_empty() {
            return Err(invalid("cluster.host is not set")
                .with_suggestion("Set cluster.host in the configuration or pass --host"));
        }
        if let Err(e) = url::Host::parse(cluster.host.trim()) {
            return Err(invalid(format!("cluster.host {:?} is not a valid host: {}", cluster.host, e)));
        }
        if cluster.port == 0 {
            return Err(invalid("cluster.port must not be 0"));
        }
        if cluster.username.trim().is_empty() {
            return Err(invalid("cluster.username is not set")
                .with_suggestion("Set cluster.username in the configuration or pass --user"));
        }
        if !paths::is_valid_username(&cluster.username) {
            return Err(invalid(format!(
                "cluster.username {:?} contains unsupported characters",
                cluster.username
            )));
        }
        if cluster.connect_timeout_secs == 0 || cluster.command_timeout_secs == 0 {
            return Err(invalid("cluster timeouts must be greater than zero"));
        }
        if self.session.validity_hours == 0 {
            return Err(invalid("session.validity_hours must be greater than zero"));
        }
        if self.session.refresh_interval_minutes == 0 {
            return Err(invalid("session.refresh_interval_minutes must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms exceeds retry.max_delay_ms"));
        }
        Ok(())
    }

    /// Persisted session location, honouring `session.session_file`
    pub fn session_file(&self) -> Option<PathBuf> {
        self.session
            .session_file
            .clone()
            .or_else(|| env::home_dir().map(|home| env::user_session_file_path(&home)))
    }
}

fn invalid(detail: impl AsRef<str>) -> ConnectionError {
    ConnectionError::from_template(&INVALID_CONFIG).with_detail(detail)
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> anyhow::Result<AppConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return AppConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(AppConfig::default())
    }

    /// Explicit file if given, otherwise discovery
    pub fn load(config_override: Option<&Path>) -> anyhow::Result<AppConfig> {
        match config_override {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                AppConfig::from_toml_file(path)
            }
            None => Self::discover_config(),
        }
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    pub fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = env::home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/namdrunner/config.toml"));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(
                PathBuf::from(program_data)
                    .join("namdrunner")
                    .join(env::CONFIG_FILE_NAME),
            );
        }

        candidates
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> anyhow::Result<PathBuf> {
        let home_dir = env::home_dir().context("Could not determine home directory")?;

        let config_dir = env::user_app_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {:?}", config_dir))?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            AppConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
