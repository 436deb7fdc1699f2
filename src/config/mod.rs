//! Configuration
//!
//! TOML configuration for EdgeMQ:
//! - Server bind address and shutdown grace period
//! - Connection limits
//! - Keep alive parameters
//! - MQTT feature flags
//! - Authentication and ACL
//! - Threshold pipeline
//! - Environment variable overrides (EDGEMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
}

#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Error from the layered config builder
    Config(config::ConfigError),
    /// Settings are individually valid but inconsistent
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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Seconds to wait for connections to finish on shutdown
    pub shutdown_timeout: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            shutdown_timeout: 5,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections (0 = unbounded)
    pub max_connections: usize,
    /// Maximum incoming packet size in bytes
    pub max_packet_size: usize,
    /// Seconds a new connection has to send CONNECT
    pub connect_timeout: u64,
    /// Maximum levels in a topic name or filter (0 = unlimited)
    pub max_topic_levels: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_packet_size: 1024 * 1024,
            connect_timeout: 10,
            max_topic_levels: 128,
        }
    }
}

impl LimitsConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive used when a client asks for 0
    pub default_keep_alive: u16,
    /// Upper bound on the client's keep alive
    pub max_keep_alive: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 60,
            max_keep_alive: 65535,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS granted (0 or 1)
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    /// Whether the broker hosts the in-process inline client
    pub inline_client: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 1,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            inline_client: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    pub allow_anonymous: bool,
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext password
    #[serde(default)]
    pub password: Option<String>,
    /// Argon2 PHC string (`$argon2id$v=19$...`)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// ACL role name
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Permissions for users without a role, including anonymous clients
    pub default: AclPermissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

/// Threshold pipeline run on the inline client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub input_topic: String,
    pub output_topic: String,
    /// Readings strictly above this value are labelled "high"
    pub threshold: f64,
    pub subscription_id: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_topic: "temperature/send".to_string(),
            output_topic: "temperature/result".to_string(),
            threshold: 30.5,
            subscription_id: 1,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}`
    /// 2. Overrides with the `EDGEMQ__` prefix, double underscores for nesting:
    ///    - `EDGEMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `EDGEMQ__PIPELINE__THRESHOLD=25.0` overrides `pipeline.threshold`
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", defaults.log.level)?
            .set_default("server.bind", defaults.server.bind.to_string())?
            .set_default("server.shutdown_timeout", defaults.server.shutdown_timeout as i64)?
            .set_default("limits.max_connections", defaults.limits.max_connections as i64)?
            .set_default("limits.max_packet_size", defaults.limits.max_packet_size as i64)?
            .set_default("limits.connect_timeout", defaults.limits.connect_timeout as i64)?
            .set_default("limits.max_topic_levels", defaults.limits.max_topic_levels as i64)?
            .set_default("session.default_keep_alive", defaults.session.default_keep_alive as i64)?
            .set_default("session.max_keep_alive", defaults.session.max_keep_alive as i64)?
            .set_default("mqtt.max_qos", defaults.mqtt.max_qos as i64)?
            .set_default("mqtt.retain_available", defaults.mqtt.retain_available)?
            .set_default("mqtt.wildcard_subscriptions", defaults.mqtt.wildcard_subscriptions)?
            .set_default("mqtt.subscription_identifiers", defaults.mqtt.subscription_identifiers)?
            .set_default("mqtt.inline_client", defaults.mqtt.inline_client)?
            .set_default("auth.enabled", defaults.auth.enabled)?
            .set_default("auth.allow_anonymous", defaults.auth.allow_anonymous)?
            .set_default("acl.enabled", defaults.acl.enabled)?
            .set_default("pipeline.enabled", defaults.pipeline.enabled)?
            .set_default("pipeline.input_topic", defaults.pipeline.input_topic)?
            .set_default("pipeline.output_topic", defaults.pipeline.output_topic)?
            .set_default("pipeline.threshold", defaults.pipeline.threshold)?
            .set_default("pipeline.subscription_id", defaults.pipeline.subscription_id as i64)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EDGEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults and environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no environment overrides)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 1 {
            return Err(ConfigError::Validation(
                "max_qos must be 0 or 1".to_string(),
            ));
        }

        if self.session.max_keep_alive == 0 {
            return Err(ConfigError::Validation(
                "max_keep_alive must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.enabled {
            if !self.mqtt.inline_client {
                return Err(ConfigError::Validation(
                    "pipeline requires mqtt.inline_client".to_string(),
                ));
            }
            if crate::topic::validate_topic_filter(&self.pipeline.input_topic).is_err() {
                return Err(ConfigError::Validation(format!(
                    "pipeline input_topic '{}' is not a valid topic filter",
                    self.pipeline.input_topic
                )));
            }
            if crate::topic::validate_topic_name(&self.pipeline.output_topic).is_err() {
                return Err(ConfigError::Validation(format!(
                    "pipeline output_topic '{}' is not a valid topic name",
                    self.pipeline.output_topic
                )));
            }
            if crate::topic::matches(&self.pipeline.input_topic, &self.pipeline.output_topic) {
                return Err(ConfigError::Validation(format!(
                    "pipeline input_topic '{}' must not match its own output_topic",
                    self.pipeline.input_topic
                )));
            }
            if !self.pipeline.threshold.is_finite() {
                return Err(ConfigError::Validation(
                    "pipeline threshold must be finite".to_string(),
                ));
            }
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: std::collections::HashSet<_> =
                self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
