//! The top-level proxy façade: write fan-out and backend selection.

use crate::{
    backend::{Backend, InitError, LinePoint},
    circle::{Circle, CircleHealth},
    config::ProxyConfig,
    scan::{self, Precision},
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors building a [`Proxy`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The spool root could not be created.
    #[error("create data dir error: {0}")]
    DataDir(#[from] std::io::Error),

    /// A backend could not be constructed.
    #[error(transparent)]
    Backend(#[from] InitError),
}

/// The routing key of a write or key-routed query.
pub fn get_key(org: &str, bucket: &str, measurement: &str) -> String {
    format!("{org},{bucket},{measurement}")
}

/// Owns every circle; the single entry point for writes and queries.
#[derive(Debug)]
pub struct Proxy {
    pub(crate) circles: Vec<Circle>,
    dbrp: HashMap<String, (String, String)>,
}

impl Proxy {
    /// Build all circles and their backends from a validated configuration.
    pub async fn new(cfg: &ProxyConfig) -> Result<Self, BuildError> {
        tokio::fs::create_dir_all(&cfg.data_dir).await?;

        let mut circles = Vec::with_capacity(cfg.circles.len());
        for (id, circfg) in cfg.circles.iter().enumerate() {
            circles.push(Circle::new(circfg, cfg, id).await?);
        }

        let mut dbrp = HashMap::new();
        for (key, value) in &cfg.dbrp.mapping {
            let mut parts = value.split(cfg.dbrp.separator.as_str());
            if let (Some(org), Some(bucket)) = (parts.next(), parts.next()) {
                dbrp.insert(key.clone(), (org.to_owned(), bucket.to_owned()));
            }
        }

        Ok(Self { circles, dbrp })
    }

    /// The circles, in configuration order.
    pub fn circles(&self) -> &[Circle] {
        &self.circles
    }

    /// Resolve a legacy `db`/`rp` coordinate through the alias table.
    pub fn resolve_dbrp(&self, db: &str, rp: &str) -> Option<(String, String)> {
        let joined = format!("{db}/{rp}");
        self.dbrp.get(joined.trim_end_matches('/')).cloned()
    }

    /// The backend owning `key` in every circle, in circle order.
    pub fn get_backends(&self, key: &str) -> Vec<Arc<Backend>> {
        self.circles.iter().map(|c| c.get_backend(key)).collect()
    }

    /// Every backend of every circle.
    pub fn get_all_backends(&self) -> Vec<Arc<Backend>> {
        self.circles
            .iter()
            .flat_map(|c| c.backends().iter().map(Arc::clone))
            .collect()
    }

    /// Fan a line-protocol payload out to one backend per circle.
    ///
    /// Malformed lines are logged and dropped without aborting the batch;
    /// acceptance means at-least-once delivery (upstream or spool), not a
    /// synchronous upstream acknowledgement.
    pub async fn write(&self, body: &[u8], org: &str, bucket: &str, precision: Precision) {
        for line in body.split(|&b| b == b'\n') {
            let line = trim_space(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            self.write_row(line, org, bucket, precision).await;
        }
    }

    async fn write_row(&self, line: &[u8], org: &str, bucket: &str, precision: Precision) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("wall clock before the epoch")
            .as_nanos() as i64;
        let nano_line = scan::append_timestamp(line, precision, now);

        let meas_end = {
            let meas = match scan::scan_measurement(&nano_line) {
                Ok(meas) => meas,
                Err(error) => {
                    warn!(%error, org, bucket, "scan key error, dropping line");
                    return;
                }
            };
            meas.len()
        };
        if !scan::rapid_check(&nano_line[meas_end..]) {
            warn!(
                org,
                bucket,
                line = %String::from_utf8_lossy(line),
                "invalid format, dropping line"
            );
            return;
        }

        let measurement = String::from_utf8_lossy(&nano_line[..meas_end]).into_owned();
        let key = get_key(org, bucket, &measurement);

        let point = Arc::new(LinePoint {
            org: org.to_owned(),
            bucket: bucket.to_owned(),
            line: nano_line,
        });

        // A backend refusing the point (only possible mid-shutdown) must not
        // stop the other circles from receiving it.
        for circle in &self.circles {
            let backend = circle.get_backend(&key);
            if let Err(error) = backend.write_point(Arc::clone(&point)).await {
                warn!(
                    %error,
                    backend = %backend.name(),
                    org,
                    bucket,
                    "write point error"
                );
            }
        }
        debug!(org, bucket, %measurement, "routed point");
    }

    /// Per-circle health snapshots.
    pub async fn health(&self) -> Vec<CircleHealth> {
        let mut health = Vec::with_capacity(self.circles.len());
        for circle in &self.circles {
            health.push(circle.health().await);
        }
        health
    }

    /// Close every circle, cascading shutdown to every backend.
    pub async fn close(&self) {
        for circle in &self.circles {
            circle.close().await;
        }
    }
}

fn trim_space(mut line: &[u8]) -> &[u8] {
    while let [b' ' | b'\t' | b'\r', rest @ ..] = line {
        line = rest;
    }
    while let [rest @ .., b' ' | b'\t' | b'\r'] = line {
        line = rest;
    }
    line
}
