//! Configuration module
//!
//! Settings come from built-in defaults, an optional TOML file and the
//! process environment, in that order. Everything is validated once, before
//! anything connects.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::backoff::BackoffPolicy;
use crate::agent::identity::AgentIdentity;
use crate::agent::supervisor::SupervisorConfig;
use crate::connection::transport::{is_plaintext_url, TlsSettings, TransportManager};
use crate::error::ConfigError;

/// Main configuration structure for the HPA agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity presented to the control plane
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Control plane connection settings
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster id assigned at registration (required)
    #[serde(default)]
    pub cluster_id: Option<String>,

    /// Owning tenant (required)
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Agent token assigned at registration (required)
    #[serde(default)]
    pub agent_token: Option<String>,

    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    /// Cloud provider (aws, gcp, azure, ...)
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

/// Control plane connection configuration. Durations are written as
/// `500ms`, `30s`, `1m30s` or `1.5h`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// gRPC endpoint, `host:port` or a full URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: String,

    /// Unset waits for the auth result indefinitely
    #[serde(default)]
    pub handshake_timeout: Option<String>,

    #[serde(default = "default_backoff_floor")]
    pub backoff_floor: String,

    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling: String,

    /// Consecutive auth rejections before giving up (0 = never)
    #[serde(default)]
    pub max_auth_rejections: u32,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Client certificate; requires `key_file` and `ca_file`
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Overrides the name checked against the server certificate
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_agent_version() -> String {
    "1.0.0".to_string()
}

fn default_kubernetes_version() -> String {
    "1.25.0".to_string()
}

fn default_endpoint() -> String {
    "localhost:50051".to_string()
}

fn default_heartbeat_interval() -> String {
    "30s".to_string()
}

fn default_dial_timeout() -> String {
    "10s".to_string()
}

fn default_backoff_floor() -> String {
    "1s".to_string()
}

fn default_backoff_ceiling() -> String {
    "60s".to_string()
}

fn default_shutdown_grace() -> String {
    "5s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Name used when registering a cluster without an explicit name
pub fn default_cluster_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: None,
            tenant_id: None,
            agent_token: None,
            agent_version: default_agent_version(),
            kubernetes_version: default_kubernetes_version(),
            provider: None,
            region: None,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_interval: default_heartbeat_interval(),
            dial_timeout: default_dial_timeout(),
            handshake_timeout: None,
            backoff_floor: default_backoff_floor(),
            backoff_ceiling: default_backoff_ceiling(),
            max_auth_rejections: 0,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Defaults, then the optional file, then the process environment
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config
            .apply_env(|key| std::env::var(key).ok())
            .context("Invalid environment configuration")?;
        Ok(config)
    }

    /// Overlay settings from environment variables. Empty values count as
    /// unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CLUSTER_ID") {
            self.cluster.cluster_id = Some(v);
        }
        if let Some(v) = get("TENANT_ID") {
            self.cluster.tenant_id = Some(v);
        }
        if let Some(v) = get("AGENT_TOKEN") {
            self.cluster.agent_token = Some(v);
        }
        if let Some(v) = get("AGENT_VERSION") {
            self.cluster.agent_version = v;
        }
        if let Some(v) = get("KUBERNETES_VERSION") {
            self.cluster.kubernetes_version = v;
        }
        if let Some(v) = get("CLUSTER_PROVIDER") {
            self.cluster.provider = Some(v);
        }
        if let Some(v) = get("CLUSTER_REGION") {
            self.cluster.region = Some(v);
        }

        if let Some(v) = get("GRPC_ENDPOINT") {
            self.control_plane.endpoint = v;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL") {
            self.control_plane.heartbeat_interval = v;
        }
        if let Some(v) = get("DIAL_TIMEOUT") {
            self.control_plane.dial_timeout = v;
        }
        if let Some(v) = get("HANDSHAKE_TIMEOUT") {
            self.control_plane.handshake_timeout = Some(v);
        }
        if let Some(v) = get("BACKOFF_FLOOR") {
            self.control_plane.backoff_floor = v;
        }
        if let Some(v) = get("BACKOFF_CEILING") {
            self.control_plane.backoff_ceiling = v;
        }
        if let Some(v) = get("MAX_AUTH_REJECTIONS") {
            self.control_plane.max_auth_rejections =
                v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "MAX_AUTH_REJECTIONS",
                    value: v.clone(),
                })?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.control_plane.shutdown_grace = v;
        }

        if let Some(v) = get("TLS_ENABLED") {
            self.tls.enabled = parse_bool("TLS_ENABLED", &v)?;
        }
        if let Some(v) = get("TLS_CA_FILE") {
            self.tls.ca_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TLS_CERT_FILE") {
            self.tls.cert_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TLS_KEY_FILE") {
            self.tls.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TLS_SERVER_NAME") {
            self.tls.server_name = Some(v);
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v;
        }

        Ok(())
    }

    /// Check everything needed to run the agent
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;
        self.validate_connection()?;
        self.supervisor_config()?;
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT",
                value: self.logging.format.clone(),
            });
        }
        Ok(())
    }

    /// Check only what is needed to reach the control plane
    pub fn validate_connection(&self) -> Result<(), ConfigError> {
        if self.control_plane.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("GRPC_ENDPOINT"));
        }
        self.dial_timeout()?;
        let tls = self.tls_settings()?;
        if tls.is_enabled() && is_plaintext_url(&self.control_plane.endpoint) {
            return Err(ConfigError::Tls(format!(
                "GRPC_ENDPOINT {} uses http:// while TLS is enabled",
                self.control_plane.endpoint
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<AgentIdentity, ConfigError> {
        let cluster = &self.cluster;
        Ok(AgentIdentity {
            cluster_id: required(&cluster.cluster_id, "CLUSTER_ID")?,
            tenant_id: required(&cluster.tenant_id, "TENANT_ID")?,
            token: required(&cluster.agent_token, "AGENT_TOKEN")?,
            agent_version: cluster.agent_version.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            provider: cluster.provider.clone(),
            region: cluster.region.clone(),
        })
    }

    pub fn dial_timeout(&self) -> Result<Duration, ConfigError> {
        non_zero("DIAL_TIMEOUT", &self.control_plane.dial_timeout)
    }

    pub fn tls_settings(&self) -> Result<TlsSettings, ConfigError> {
        let tls = &self.tls;
        if !tls.enabled {
            return Ok(TlsSettings::Disabled);
        }
        let server_name = tls.server_name.clone();

        match (&tls.ca_file, &tls.cert_file, &tls.key_file) {
            (None, None, None) => Ok(TlsSettings::SystemRoots { server_name }),
            (Some(ca), None, None) => Ok(TlsSettings::ServerVerified {
                ca_file: ca.clone(),
                server_name,
            }),
            (Some(ca), Some(cert), Some(key)) => Ok(TlsSettings::Mutual {
                ca_file: ca.clone(),
                cert_file: cert.clone(),
                key_file: key.clone(),
                server_name,
            }),
            (None, Some(_), Some(_)) => Err(ConfigError::Tls(
                "TLS_CA_FILE is required for mutual TLS".to_string(),
            )),
            (_, Some(_), None) => Err(ConfigError::Tls(
                "TLS_CERT_FILE given without TLS_KEY_FILE".to_string(),
            )),
            (_, None, Some(_)) => Err(ConfigError::Tls(
                "TLS_KEY_FILE given without TLS_CERT_FILE".to_string(),
            )),
        }
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let cp = &self.control_plane;
        let floor = parse_setting("BACKOFF_FLOOR", &cp.backoff_floor)?;
        let ceiling = parse_setting("BACKOFF_CEILING", &cp.backoff_ceiling)?;
        if floor.is_zero() || floor > ceiling {
            return Err(ConfigError::Backoff { floor, ceiling });
        }

        let handshake_timeout = match &cp.handshake_timeout {
            Some(value) => Some(non_zero("HANDSHAKE_TIMEOUT", value)?),
            None => None,
        };

        Ok(SupervisorConfig {
            heartbeat_interval: non_zero("HEARTBEAT_INTERVAL", &cp.heartbeat_interval)?,
            backoff: BackoffPolicy::new(floor, ceiling),
            handshake_timeout,
            max_auth_rejections: cp.max_auth_rejections,
            shutdown_grace: parse_setting("SHUTDOWN_GRACE", &cp.shutdown_grace)?,
        })
    }

    /// Connector for the supervisor; token is sent as bearer metadata
    pub fn transport(&self) -> Result<TransportManager, ConfigError> {
        let token = self.cluster.agent_token.clone().unwrap_or_default();
        Ok(TransportManager::new(
            &self.control_plane.endpoint,
            self.tls_settings()?,
            self.dial_timeout()?,
            &token,
        ))
    }

    /// Copy safe to print: the token is replaced by its fingerprint
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Ok(identity) = self.identity() {
            config.cluster.agent_token = Some(format!("sha256:{}", identity.token_fingerprint()));
        } else if config.cluster.agent_token.is_some() {
            config.cluster.agent_token = Some("<redacted>".to_string());
        }
        config
    }
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}

fn parse_setting(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
    })
}

fn non_zero(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let duration = parse_setting(key, value)?;
    if duration.is_zero() {
        return Err(ConfigError::InvalidDuration {
            key,
            value: value.to_string(),
        });
    }
    Ok(duration)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Parse a duration such as `500ms`, `30s`, `1m30s`, `2h 15m` or `1.5s`.
/// A bare number means seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(s)
        .ok()
        .or_else(|| parse_fractional(s))
}

/// Terms with a decimal fraction (`1.5s`, `0.5h30m`), which humantime rejects
fn parse_fractional(s: &str) -> Option<Duration> {
    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !is_number(c))?;
        let unit_end = rest[num_end..]
            .find(is_number)
            .map_or(rest.len(), |i| num_end + i);
        let value: f64 = rest[..num_end].parse().ok()?;
        let scale = match &rest[num_end..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total).ok()
}
