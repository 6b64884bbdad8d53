//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::decision::BackendTarget;
use crate::proxy::handler::HandlerOptions;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Default backend for allowed requests.
    pub backend: BackendConfig,

    /// Request head limits.
    pub limits: LimitsConfig,

    /// API key policy.
    pub policy: PolicyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// Per-connection handler settings derived from this config.
    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            default_backend: self.backend.target(),
            max_header_bytes: self.limits.max_header_bytes,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Default backend target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,

    /// Backend connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl BackendConfig {
    pub fn target(&self) -> BackendTarget {
        BackendTarget::new(self.host.clone(), self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            connect_timeout_secs: 5,
        }
    }
}

/// Limits applied while the request head is buffered.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes buffered without a complete header block before a 431.
    pub max_header_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
        }
    }
}

/// API key policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Header carrying the key (matched case-insensitively).
    pub header: String,

    /// Query parameter carrying the key when the header is absent.
    pub query_param: String,

    /// Accepted keys.
    pub keys: Vec<String>,

    /// Forward requests that carry no key at all.
    pub allow_anonymous: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            header: "X-Api-Key".to_string(),
            query_param: "api_key".to_string(),
            keys: Vec::new(),
            allow_anonymous: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
