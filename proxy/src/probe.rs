//! The per-backend liveness prober.

use crate::state::BackendState;
use backend_client::Client;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Spawn the probe loop for one backend: ping every `interval`, store the
/// verdict into the backend's `active` flag, and stop once the backend is no
/// longer running.
pub(crate) fn spawn(
    client: Arc<Client>,
    state: Arc<BackendState>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while state.is_running() {
            let healthy = client.ping().await;

            // Only transitions are worth a log line; the probe itself runs
            // every few seconds forever.
            if healthy != state.is_active() {
                if healthy {
                    info!(url = %client.url(), "backend recovered");
                } else {
                    warn!(url = %client.url(), "backend is unavailable");
                }
            }
            state.set_active(healthy);

            tokio::time::sleep(interval).await;
        }
    })
}
