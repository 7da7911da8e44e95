//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - HTTP server settings (listen address, shutdown grace)
//! - Broker connection parameters (retry, reconnect, keep-alive)
//! - Downstream command service endpoint
//! - Environment variable overrides (MQTTBRIDGE__* prefix)
//! - Command-line overrides applied last

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::codec::MAX_REMAINING_LENGTH;
use crate::topic::validate_topic_name;

/// Module identifier used when no other is configured
pub const DEFAULT_MODULE: &str = "mqttbroker";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Inbound HTTP server
    pub server: ServerConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Downstream command service
    pub downstream: DownstreamConfig,
    /// Bridge identity
    pub bridge: BridgeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Inbound HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub host: IpAddr,
    /// Listen port
    pub port: u16,
    /// Time in-flight requests get to finish on shutdown (e.g. "1s")
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Socket address the HTTP server binds
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address as `host:port` (port defaults to 1883)
    pub address: String,
    /// MQTT client identifier
    pub client_id: String,
    /// Username for authentication (optional)
    pub username: Option<String>,
    /// Password for authentication (optional)
    pub password: Option<String>,
    /// Keep-alive interval in seconds (0 disables pings)
    pub keep_alive: u16,
    /// Clean session flag
    pub clean_session: bool,
    /// Largest packet remaining length sent or accepted, in bytes
    pub max_packet_size: usize,
    /// Timeout for the TCP connect and the CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Keep retrying when the first connection attempt fails
    pub connect_retry: bool,
    /// Delay between initial connection attempts
    #[serde(with = "humantime_serde")]
    pub connect_retry_interval: Duration,
    /// Reconnect after an established connection is lost
    pub auto_reconnect: bool,
    /// Initial reconnect delay, doubled after each failed attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    /// Time allowed for a graceful disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,
    /// Topic carrying messages into the gowon system
    pub input_topic: String,
    /// Topic carrying messages out to the command service
    pub output_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: format!("gowon_{}", DEFAULT_MODULE),
            username: None,
            password: None,
            keep_alive: 30,
            clean_session: true,
            max_packet_size: MAX_REMAINING_LENGTH,
            connect_timeout: Duration::from_secs(30),
            connect_retry: true,
            connect_retry_interval: Duration::from_secs(5),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(600),
            disconnect_timeout: Duration::from_secs(1),
            input_topic: "/gowon/input".to_string(),
            output_topic: "/gowon/output".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Parse the address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), 1883)
    }
}

/// Downstream command service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Base URL of the command service, e.g. `http://gowon:8080`
    pub host: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Bridge identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Module identifier carried by replies and acknowledgements
    pub module: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module: DEFAULT_MODULE.to_string(),
        }
    }
}

/// Values from the command line, applied over every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub http_port: Option<u16>,
    pub broker: Option<String>,
    pub downstream_host: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    fn apply(
        &self,
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        if let Some(port) = self.http_port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(ref broker) = self.broker {
            builder = builder.set_override("broker.address", broker.as_str())?;
        }
        if let Some(ref host) = self.downstream_host {
            builder = builder.set_override("downstream.host", host.as_str())?;
        }
        if let Some(ref level) = self.log_level {
            builder = builder.set_override("log.level", level.as_str())?;
        }
        Ok(builder)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, environment variables
    /// and command-line overrides.
    ///
    /// Sources, lowest precedence first:
    /// 1. Built-in defaults
    /// 2. The TOML file, with `${VAR}` or `${VAR:-default}` substitution
    /// 3. `MQTTBRIDGE__` prefixed env vars with double underscores for nesting:
    ///    - `MQTTBRIDGE__SERVER__PORT=9090` overrides `server.port`
    ///    - `MQTTBRIDGE__BROKER__CLIENT_ID=bridge-2` overrides `broker.client_id`
    /// 4. `overrides`, usually taken from the command line
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.port", 8080)?
            .set_default("broker.address", "localhost:1883")?
            .set_default("bridge.module", DEFAULT_MODULE)?;

        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        builder = builder.add_source(
            Environment::with_prefix("MQTTBRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = overrides.apply(builder)?.build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        let address = self.broker.address.trim();
        if address.is_empty() {
            return Err(ConfigError::Validation(
                "broker.address cannot be empty".to_string(),
            ));
        }
        if let Some((host, port)) = address.rsplit_once(':') {
            if host.is_empty() || !matches!(port.parse::<u16>(), Ok(p) if p > 0) {
                return Err(ConfigError::Validation(format!(
                    "broker.address '{}' must be host or host:port",
                    address
                )));
            }
        }

        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id cannot be empty".to_string(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }

        let max_packet_size = self.broker.max_packet_size;
        if max_packet_size == 0 || max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "broker.max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }

        let durations = [
            ("broker.connect_timeout", self.broker.connect_timeout),
            ("broker.connect_retry_interval", self.broker.connect_retry_interval),
            ("broker.reconnect_interval", self.broker.reconnect_interval),
            ("broker.max_reconnect_interval", self.broker.max_reconnect_interval),
            ("broker.disconnect_timeout", self.broker.disconnect_timeout),
            ("downstream.timeout", self.downstream.timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{} must be non-zero", key)));
            }
        }
        if self.broker.max_reconnect_interval < self.broker.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must be at least broker.reconnect_interval"
                    .to_string(),
            ));
        }

        for (key, topic) in [
            ("broker.input_topic", &self.broker.input_topic),
            ("broker.output_topic", &self.broker.output_topic),
        ] {
            if let Err(e) = validate_topic_name(topic) {
                return Err(ConfigError::Validation(format!("{}: {}", key, e)));
            }
        }

        let host = self.downstream.host.trim();
        if host.is_empty() {
            return Err(ConfigError::Validation(
                "downstream.host is required (--gowon-host or GOWON_HOST)".to_string(),
            ));
        }
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "downstream.host '{}' must start with http:// or https://",
                host
            )));
        }

        if self.bridge.module.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.module cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
