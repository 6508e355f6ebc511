//! Proxy configuration: the circle/backend topology and tuning knobs.
//!
//! Configuration is deserialized from a JSON document, zero/empty tuning
//! values are replaced with defaults by [`ProxyConfig::normalize()`], and
//! topology mistakes are rejected by [`ProxyConfig::validate()`] - fatally,
//! at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Errors found while validating a loaded configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No circles were configured.
    #[error("circles cannot be empty")]
    EmptyCircles,

    /// A circle has no backends.
    #[error("backends cannot be empty")]
    EmptyBackends,

    /// A backend is missing its name.
    #[error("backend name cannot be empty")]
    EmptyBackendName,

    /// Two backends (in any circle) share a name.
    #[error("backend name duplicated: {0}")]
    DuplicatedBackendName(String),

    /// A backend is missing its URL.
    #[error("backend url cannot be empty")]
    EmptyBackendUrl,

    /// A backend is missing its auth token.
    #[error("backend token cannot be empty")]
    EmptyBackendToken,

    /// A namespace alias does not split into exactly org and bucket.
    #[error("invalid dbrp mapping: {0:?}")]
    InvalidDbrpMapping(String),

    /// The front door was asked to serve TLS without a certificate or key.
    #[error("https cert and key cannot be empty when https is enabled")]
    EmptyHttpsCertOrKey,
}

/// One upstream node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name; also names its spool directory.
    pub name: String,
    /// Base URL, e.g. `http://influxdb-1:8086`.
    pub url: String,
    /// The upstream auth token.
    pub token: String,
    /// Accept writes but never serve queries.
    #[serde(default)]
    pub write_only: bool,
}

/// One replication group of backends sharing a hash ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleConfig {
    /// Display name of the circle.
    pub name: String,
    /// Ordered members; order determines ring token assignment.
    pub backends: Vec<BackendConfig>,
}

/// The legacy `db/rp -> org,bucket` namespace alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbrpConfig {
    /// Separator between org and bucket in mapping values.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Alias entries, keyed by `db` or `db/rp`.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

impl Default for DbrpConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            mapping: BTreeMap::new(),
        }
    }
}

fn default_separator() -> String {
    "/".to_owned()
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// The replication groups.
    pub circles: Vec<CircleConfig>,

    /// Legacy namespace aliasing for the v1 endpoints.
    #[serde(default)]
    pub dbrp: DbrpConfig,

    /// Front-door listen address, e.g. `:7076` or `127.0.0.1:7076`.
    #[serde(default)]
    pub listen_addr: String,

    /// Root directory for the per-backend spools.
    #[serde(default)]
    pub data_dir: String,

    /// Records buffered per (backend, org, bucket) before an immediate flush.
    #[serde(default)]
    pub flush_size: usize,

    /// Seconds a non-empty buffer may age before a flush of all buffers.
    #[serde(default)]
    pub flush_time: u64,

    /// Seconds between health probes of each backend.
    #[serde(default)]
    pub check_interval: u64,

    /// Seconds between spool-drain attempts.
    #[serde(default)]
    pub rewrite_interval: u64,

    /// Concurrent flush jobs per backend.
    #[serde(default)]
    pub conn_pool_size: usize,

    /// Seconds allowed per upstream write request.
    #[serde(default)]
    pub write_timeout: u64,

    /// Log each accepted write batch.
    #[serde(default)]
    pub write_tracing: bool,

    /// Log each dispatched query.
    #[serde(default)]
    pub query_tracing: bool,

    /// Shared token clients must present; empty disables front-door auth.
    #[serde(default)]
    pub token: String,

    /// Serve the front door over TLS.
    #[serde(default)]
    pub https_enabled: bool,

    /// Path to the PEM certificate chain presented by the listener.
    #[serde(default)]
    pub https_cert: String,

    /// Path to the PEM private key of the listener certificate.
    #[serde(default)]
    pub https_key: String,

    /// Skip TLS certificate verification towards https upstreams.
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl ProxyConfig {
    /// Replace unset (zero/empty) tuning values with their defaults.
    pub fn normalize(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = ":7076".to_owned();
        }
        if self.data_dir.is_empty() {
            self.data_dir = "data".to_owned();
        }
        if self.flush_size == 0 {
            self.flush_size = 10_000;
        }
        if self.flush_time == 0 {
            self.flush_time = 1;
        }
        if self.check_interval == 0 {
            self.check_interval = 1;
        }
        if self.rewrite_interval == 0 {
            self.rewrite_interval = 10;
        }
        if self.conn_pool_size == 0 {
            self.conn_pool_size = 20;
        }
        if self.write_timeout == 0 {
            self.write_timeout = 10;
        }
        if self.dbrp.separator.is_empty() {
            self.dbrp.separator = default_separator();
        }
    }

    /// Reject structurally broken topologies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circles.is_empty() {
            return Err(ConfigError::EmptyCircles);
        }

        let mut names = HashSet::new();
        for circle in &self.circles {
            if circle.backends.is_empty() {
                return Err(ConfigError::EmptyBackends);
            }
            for backend in &circle.backends {
                if backend.name.is_empty() {
                    return Err(ConfigError::EmptyBackendName);
                }
                if !names.insert(backend.name.as_str()) {
                    return Err(ConfigError::DuplicatedBackendName(backend.name.clone()));
                }
                if backend.url.is_empty() {
                    return Err(ConfigError::EmptyBackendUrl);
                }
                if backend.token.is_empty() {
                    return Err(ConfigError::EmptyBackendToken);
                }
            }
        }

        let sep = self.dbrp.separator.as_str();
        for (key, value) in &self.dbrp.mapping {
            let trimmed = value.trim_matches(|c: char| sep.contains(c));
            if key.trim().is_empty() || trimmed.matches(sep).count() != 1 {
                return Err(ConfigError::InvalidDbrpMapping(format!("{key} => {value}")));
            }
        }

        if self.https_enabled && (self.https_cert.is_empty() || self.https_key.is_empty()) {
            return Err(ConfigError::EmptyHttpsCertOrKey);
        }

        Ok(())
    }
}
