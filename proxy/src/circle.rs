//! A replication group of backends sharing one hash ring.

use crate::{
    backend::{Backend, BackendHealth, InitError},
    config::{CircleConfig, ProxyConfig},
};
use parking_lot::RwLock;
use serde::Serialize;
use sharder::HashRing;
use std::{collections::HashMap, sync::Arc};

/// A circle's health snapshot, serialized into the `/health` endpoint.
#[derive(Debug, Serialize)]
pub struct CircleHealth {
    /// Circle index within the proxy.
    pub id: usize,
    /// Circle name.
    pub name: String,
    /// True iff every member is active.
    pub active: bool,
    /// True iff any member is excluded from read dispatch.
    pub write_only: bool,
    /// Member snapshots.
    pub backends: Vec<BackendHealth>,
}

/// One replication group: every write lands on exactly one member, chosen by
/// consistent hashing on the routing key.
#[derive(Debug)]
pub struct Circle {
    id: usize,
    name: String,
    backends: Vec<Arc<Backend>>,
    ring: HashRing,
    token_to_backend: HashMap<String, usize>,

    /// Memoized key -> member lookups. Membership is fixed for the process
    /// lifetime, so entries are written once and never invalidated.
    cache: RwLock<HashMap<String, usize>>,
}

impl Circle {
    /// Build the circle's backends and populate its ring with one stable
    /// token (`"|<index>"`) per member.
    pub async fn new(cfg: &CircleConfig, pxcfg: &ProxyConfig, id: usize) -> Result<Self, InitError> {
        let mut backends = Vec::with_capacity(cfg.backends.len());
        let mut ring = HashRing::default();
        let mut token_to_backend = HashMap::with_capacity(cfg.backends.len());

        for (idx, bkcfg) in cfg.backends.iter().enumerate() {
            backends.push(Arc::new(Backend::new(bkcfg, pxcfg).await?));

            let token = format!("|{idx}");
            ring.add(token.clone());
            token_to_backend.insert(token, idx);
        }

        Ok(Self {
            id,
            name: cfg.name.clone(),
            backends,
            ring,
            token_to_backend,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Circle index within the proxy.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Circle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All members.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// The member owning `key`.
    pub fn get_backend(&self, key: &str) -> Arc<Backend> {
        if let Some(&idx) = self.cache.read().get(key) {
            return Arc::clone(&self.backends[idx]);
        }

        let token = self
            .ring
            .get(key)
            .expect("ring of a configured circle is never empty");
        let idx = self.token_to_backend[token];

        self.cache.write().insert(key.to_owned(), idx);
        Arc::clone(&self.backends[idx])
    }

    /// True iff every member is active.
    pub fn is_active(&self) -> bool {
        self.backends.iter().all(|b| b.state().is_active())
    }

    /// True iff any member is write-only or receiving a transfer.
    pub fn is_write_only(&self) -> bool {
        self.backends.iter().any(|b| b.state().is_write_only())
    }

    /// Flag every member as receiving (or done receiving) a transfer.
    pub fn set_transfer_in(&self, v: bool) {
        for backend in &self.backends {
            backend.state().set_transfer_in(v);
        }
    }

    /// Current health snapshot.
    pub async fn health(&self) -> CircleHealth {
        let mut backends = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            backends.push(backend.health().await);
        }

        CircleHealth {
            id: self.id,
            name: self.name.clone(),
            active: self.is_active(),
            write_only: self.is_write_only(),
            backends,
        }
    }

    /// Close every member.
    pub async fn close(&self) {
        for backend in &self.backends {
            backend.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn circle_config(n: usize) -> (CircleConfig, ProxyConfig) {
        let backends = (0..n)
            .map(|i| BackendConfig {
                name: format!("backend-{i}"),
                url: format!("http://127.0.0.1:{}", 2000 + i),
                token: "t".to_owned(),
                write_only: false,
            })
            .collect::<Vec<_>>();

        let circle = CircleConfig {
            name: "c0".to_owned(),
            backends: backends.clone(),
        };
        let mut pxcfg = ProxyConfig {
            circles: vec![circle.clone()],
            dbrp: Default::default(),
            listen_addr: String::new(),
            data_dir: String::new(),
            flush_size: 0,
            flush_time: 0,
            check_interval: 0,
            rewrite_interval: 0,
            conn_pool_size: 0,
            write_timeout: 0,
            write_tracing: false,
            query_tracing: false,
            token: String::new(),
            https_enabled: false,
            https_cert: String::new(),
            https_key: String::new(),
            tls_skip_verify: false,
        };
        pxcfg.normalize();
        (circle, pxcfg)
    }

    #[tokio::test]
    async fn routing_is_deterministic_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, mut pxcfg) = circle_config(3);
        pxcfg.data_dir = dir.path().to_str().unwrap().to_owned();

        let circle = Circle::new(&cfg, &pxcfg, 0).await.unwrap();

        let a = circle.get_backend("o,b,cpu");
        let b = circle.get_backend("o,b,cpu");
        assert_eq!(a.name(), b.name());
        assert_eq!(circle.cache.read().len(), 1);

        circle.close().await;
    }

    #[tokio::test]
    async fn active_requires_all_members() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, mut pxcfg) = circle_config(2);
        pxcfg.data_dir = dir.path().to_str().unwrap().to_owned();

        let circle = Circle::new(&cfg, &pxcfg, 0).await.unwrap();

        // Initial state is active until the first probe says otherwise.
        circle.backends()[0].state().set_active(true);
        circle.backends()[1].state().set_active(true);
        assert!(circle.is_active());

        circle.backends()[1].state().set_active(false);
        assert!(!circle.is_active());

        assert!(!circle.is_write_only());
        circle.set_transfer_in(true);
        assert!(circle.is_write_only());

        circle.close().await;
    }
}
