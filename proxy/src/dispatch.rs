//! Query dispatch: single replica with failover, and broadcast.

use crate::{backend::Backend, reducer::ReduceError, Proxy};
use backend_client::{Method, QueryError, QueryResponse};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::{future::Future, sync::Arc};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

/// Errors surfaced by the query dispatchers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No live replica could serve the query.
    #[error("backends unavailable")]
    BackendsUnavailable,

    /// A specific backend required by the query is down.
    #[error("backend {name}({url}) unavailable")]
    BackendUnavailable {
        /// The backend's name.
        name: String,
        /// The backend's URL.
        url: String,
    },

    /// Every candidate failed; this is the last failure.
    #[error(transparent)]
    Upstream(#[from] QueryError),

    /// Merging the broadcast responses failed.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

impl Proxy {
    /// Serve a key-routed query from one live replica.
    ///
    /// Circles are tried in random order; members that are down, draining
    /// their spool or write-only are skipped. A second sweep gives the
    /// skipped-but-reachable members (rewriting, write-only) a chance before
    /// giving up.
    pub async fn query_single<F, Fut>(&self, key: &str, f: F) -> Result<QueryResponse, DispatchError>
    where
        F: Fn(Arc<Backend>) -> Fut,
        Fut: Future<Output = Result<QueryResponse, QueryError>>,
    {
        let mut order: Vec<usize> = (0..self.circles.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut last_err: Option<QueryError> = None;

        for &i in &order {
            let backend = self.circles[i].get_backend(key);
            let state = backend.state();
            if !state.is_active() || state.is_rewriting() || state.is_write_only() {
                continue;
            }
            match f(backend).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e),
            }
        }

        for circle in &self.circles {
            let backend = circle.get_backend(key);
            let state = backend.state();
            if !state.is_active() || !(state.is_rewriting() || state.is_write_only()) {
                continue;
            }
            match f(backend).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => DispatchError::Upstream(e),
            None => DispatchError::BackendsUnavailable,
        })
    }

    /// Broadcast a v1 query to every backend and collect the successful
    /// bodies (gzip-decoded) for reduction.
    ///
    /// Inactive backends are skipped and counted; per-backend failures are
    /// logged by the client. As long as anything succeeded the merge can
    /// proceed - only zero successes is an error.
    pub async fn query_broadcast(
        &self,
        method: Method,
        query_string: &str,
    ) -> Result<Vec<Bytes>, DispatchError> {
        let backends = self.get_all_backends();
        let total = backends.len();

        let mut inactive = 0;
        let mut tasks = JoinSet::new();
        for backend in backends {
            if !backend.state().is_active() {
                inactive += 1;
                continue;
            }
            let method = method.clone();
            let query_string = query_string.to_owned();
            tasks.spawn(async move {
                backend
                    .client()
                    .query_v1(method, &query_string, true, true)
                    .await
            });
        }

        let mut bodies = Vec::new();
        let mut last_err: Option<QueryError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(resp)) => bodies.push(resp.body),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {}
            }
        }

        if inactive > 0 {
            warn!(inactive, total, "broadcast skipped inactive backends");
        }

        if bodies.is_empty() {
            return Err(match last_err {
                Some(e) => DispatchError::Upstream(e),
                None => DispatchError::BackendsUnavailable,
            });
        }
        Ok(bodies)
    }

    /// Run a destructive v1 statement (`DELETE` / `DROP MEASUREMENT`) on the
    /// key's backend in every circle.
    ///
    /// All owners must be reachable up front: a partial delete would
    /// silently diverge the replicas.
    pub async fn query_key_backends(
        &self,
        key: &str,
        method: Method,
        query_string: &str,
    ) -> Result<Vec<QueryResponse>, DispatchError> {
        let backends = self.get_backends(key);
        for backend in &backends {
            if !backend.state().is_active() {
                return Err(DispatchError::BackendUnavailable {
                    name: backend.name().to_owned(),
                    url: backend.url().to_owned(),
                });
            }
        }

        let mut tasks = JoinSet::new();
        for backend in backends {
            let method = method.clone();
            let query_string = query_string.to_owned();
            tasks.spawn(async move {
                backend
                    .client()
                    .query_v1(method, &query_string, false, true)
                    .await
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(resp)) => responses.push(resp),
                Ok(Err(e)) => return Err(DispatchError::Upstream(e)),
                Err(_) => {}
            }
        }

        if responses.is_empty() {
            return Err(DispatchError::BackendsUnavailable);
        }
        Ok(responses)
    }
}
