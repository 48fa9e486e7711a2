// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use lapin::uri::AMQPUri;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::errors::QueueError;

const CONFIG_FILE_NAME: &str = "amqp-queue.json";

/// Connection and topology settings for a [`QueueClient`](crate::QueueClient).
///
/// Every field has a default, so `{}` is a valid configuration file.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Verbose logging, including message body previews.
    #[serde(default)]
    pub debug: bool,
    /// Name of the direct exchange every queue of this client is bound to.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Prefix for generated consumer tags.
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_user() -> String { "guest".to_string() }
fn default_pass() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_exchange() -> String { "router".to_string() }
fn default_consumer_tag() -> String { "consumer".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            pass: default_pass(),
            vhost: default_vhost(),
            debug: false,
            exchange: default_exchange(),
            consumer_tag: default_consumer_tag(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &"***")
            .field("vhost", &self.vhost)
            .field("debug", &self.debug)
            .field("exchange", &self.exchange)
            .field("consumer_tag", &self.consumer_tag)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .finish()
    }
}

impl QueueConfig {
    /// Checks the settings once, before any connection attempt.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.host.trim().is_empty() {
            return Err(QueueError::ConfigError("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(QueueError::ConfigError("port must be non-zero".to_string()));
        }
        if self.vhost.is_empty() {
            return Err(QueueError::ConfigError("vhost cannot be empty".to_string()));
        }
        if self.exchange.is_empty() {
            return Err(QueueError::ConfigError("exchange cannot be empty".to_string()));
        }
        // amq.* names are reserved by the broker and cannot be declared or deleted
        if self.exchange.starts_with("amq.") {
            return Err(QueueError::ConfigError(format!(
                "exchange '{}' uses the reserved amq. prefix",
                self.exchange
            )));
        }
        if self.consumer_tag.is_empty() {
            return Err(QueueError::ConfigError("consumer_tag cannot be empty".to_string()));
        }
        if self.connection_timeout_ms == 0 {
            return Err(QueueError::ConfigError(
                "connection_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Builds the lapin URI; credentials and vhost are carried verbatim, so
    /// no percent-encoding is needed.
    pub fn to_amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.user.clone();
        uri.authority.userinfo.password = self.pass.clone();
        uri.vhost = self.vhost.clone();
        uri.query.heartbeat = Some(self.heartbeat_seconds);
        uri.query.connection_timeout = Some(self.connection_timeout_ms);
        uri
    }

    /// Broker address for log lines, without the password.
    pub fn display_addr(&self) -> String {
        format!("amqp://{}@{}:{}/{}", self.user, self.host, self.port, self.vhost)
    }

    /// Overrides fields from `AMQP_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("AMQP_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("AMQP_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("AMQP_PORT is not a valid port: {}", port))?;
        }
        if let Ok(user) = std::env::var("AMQP_USER") {
            self.user = user;
        }
        if let Ok(pass) = std::env::var("AMQP_PASS") {
            self.pass = pass;
        }
        if let Ok(vhost) = std::env::var("AMQP_VHOST") {
            self.vhost = vhost;
        }
        if let Ok(flag) = std::env::var("AMQP_DEBUG") {
            self.debug = parse_flag(&flag)
                .ok_or_else(|| anyhow!("AMQP_DEBUG is not a boolean: {}", flag))?;
        }
        if let Ok(exchange) = std::env::var("AMQP_EXCHANGE") {
            self.exchange = exchange;
        }
        Ok(())
    }

    /// Defaults plus environment, after reading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let mut config = QueueConfig::default();
        config.apply_env()?;
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

/// Reads a JSON config file, then applies environment overrides.
pub fn load_config_from(path: &Path) -> Result<QueueConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let mut config: QueueConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON")?;

    dotenv().ok();
    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

/// Loads the discovered config file, falling back to defaults plus
/// environment when none exists.
pub fn load_config() -> Result<QueueConfig> {
    match find_config_file() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            debug!("{}; using defaults and environment", e);
            let config = QueueConfig::from_env()?;
            config.validate()?;
            Ok(config)
        }
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&QueueConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
