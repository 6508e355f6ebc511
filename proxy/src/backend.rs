//! One upstream node and its ingest machinery.
//!
//! A [`Backend`] composes the HTTP client, the durable spool, the health
//! prober and a single worker task that owns all write buffers. Points
//! arrive over a bounded channel; the worker coalesces them into
//! per-(org, bucket) buffers and flushes on size or age through a bounded
//! pool of jobs that compress and POST upstream - or append to the spool
//! when the upstream is down. A rewrite ticker starts the rewriter task,
//! which drains the spool back to the upstream once it recovers.

use crate::{
    config::{BackendConfig, ProxyConfig},
    probe,
    state::BackendState,
};
use backend_client::{Client, ConnectionOptions};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;
use percent_encoding::{percent_decode, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use std::{collections::HashMap, io::Write, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};

/// Depth of the per-backend ingest channel; senders beyond it block.
const WRITE_QUEUE_DEPTH: usize = 16;

/// One line-protocol record addressed to a namespace, shared across the
/// backends of every circle.
#[derive(Debug)]
pub struct LinePoint {
    /// Namespace level one (org / database).
    pub org: String,
    /// Namespace level two (bucket / retention policy).
    pub bucket: String,
    /// The record bytes, timestamp already normalized to nanoseconds.
    pub line: Vec<u8>,
}

/// Errors constructing a [`Backend`].
#[derive(Debug, Error)]
pub enum InitError {
    /// The HTTP client could not be built.
    #[error(transparent)]
    Client(#[from] backend_client::BuildError),

    /// The spool directory could not be opened.
    #[error("unable to open spool: {0}")]
    Spool(#[from] spool::Error),
}

/// The error returned by [`Backend::write_point()`] after shutdown began.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("closed pipe")]
pub struct ClosedPipe;

/// A backend's health snapshot, serialized into the `/health` endpoint.
#[derive(Debug, Serialize)]
pub struct BackendHealth {
    /// Backend name.
    pub name: String,
    /// Upstream URL.
    pub url: String,
    /// Last probe verdict.
    pub active: bool,
    /// Undrained records remain in the spool.
    pub backlog: bool,
    /// A rewriter is currently draining.
    pub rewriting: bool,
    /// Excluded from read dispatch.
    pub write_only: bool,
}

/// One upstream node: client + spool + prober + ingest worker.
#[derive(Debug)]
pub struct Backend {
    name: String,
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<Arc<LinePoint>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Construct the backend and start its worker and health-probe tasks.
    pub async fn new(cfg: &BackendConfig, pxcfg: &ProxyConfig) -> Result<Self, InitError> {
        let client = Arc::new(Client::new(
            &cfg.url,
            &cfg.token,
            ConnectionOptions {
                write_timeout: Duration::from_secs(pxcfg.write_timeout),
                tls_skip_verify: pxcfg.tls_skip_verify,
            },
        )?);
        let spool = spool::Spool::open(Path::new(&pxcfg.data_dir).join(&cfg.name)).await?;
        let state = Arc::new(BackendState::new(cfg.write_only));

        let shared = Arc::new(Shared {
            name: cfg.name.clone(),
            client: Arc::clone(&client),
            spool,
            state: Arc::clone(&state),
            jobs: Arc::new(Semaphore::new(pxcfg.conn_pool_size)),
            pool_size: pxcfg.conn_pool_size,
            rewrite_interval: Duration::from_secs(pxcfg.rewrite_interval),
        });

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let worker = tokio::spawn(
            Worker {
                rx,
                buffers: HashMap::new(),
                flush_size: pxcfg.flush_size,
                flush_time: Duration::from_secs(pxcfg.flush_time),
                flush_at: None,
                shared: Arc::clone(&shared),
            }
            .run(),
        );
        let probe = probe::spawn(client, state, Duration::from_secs(pxcfg.check_interval));

        Ok(Self {
            name: cfg.name.clone(),
            shared,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            probe: Mutex::new(Some(probe)),
        })
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upstream base URL.
    pub fn url(&self) -> &str {
        self.shared.client.url()
    }

    pub(crate) fn client(&self) -> &Arc<Client> {
        &self.shared.client
    }

    /// The backend's status flags.
    pub fn state(&self) -> &BackendState {
        &self.shared.state
    }

    /// Hand one point to the ingest worker.
    ///
    /// Blocks only when the ingest channel is full (backpressure), and fails
    /// once [`Backend::close()`] has begun.
    pub async fn write_point(&self, point: Arc<LinePoint>) -> Result<(), ClosedPipe> {
        if !self.shared.state.is_running() {
            return Err(ClosedPipe);
        }
        let tx = self.tx.lock().clone().ok_or(ClosedPipe)?;
        tx.send(point).await.map_err(|_| ClosedPipe)
    }

    /// Current health snapshot.
    pub async fn health(&self) -> BackendHealth {
        BackendHealth {
            name: self.name.clone(),
            url: self.url().to_owned(),
            active: self.shared.state.is_active(),
            backlog: self.shared.spool.is_data().await,
            rewriting: self.shared.state.is_rewriting(),
            write_only: self.shared.state.is_write_only(),
        }
    }

    /// Stop accepting points, drain the worker, wait for in-flight flush
    /// jobs and release the spool.
    pub async fn close(&self) {
        self.shared.state.set_running(false);

        // Closing the channel is what unblocks the worker's drain path.
        drop(self.tx.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }

        let probe = self.probe.lock().take();
        if let Some(probe) = probe {
            probe.abort();
        }
    }
}

/// State shared by the worker, its flush jobs and the rewriter.
#[derive(Debug)]
struct Shared {
    name: String,
    client: Arc<Client>,
    spool: spool::Spool,
    state: Arc<BackendState>,

    /// Flush-pool permits; one held per in-flight job.
    jobs: Arc<Semaphore>,
    pool_size: usize,

    rewrite_interval: Duration,
}

impl Shared {
    /// One flush job: compress, try the upstream, fall back to the spool.
    async fn flush_payload(&self, org: &str, bucket: &str, payload: Vec<u8>) {
        let compressed = match gzip(&payload) {
            Ok(c) => Bytes::from(c),
            Err(error) => {
                error!(%error, backend = %self.name, "compress buffer error");
                return;
            }
        };

        if self.state.is_active() {
            match self
                .client
                .write_compressed(org, bucket, compressed.clone())
                .await
            {
                Ok(()) => return,
                Err(error) if error.is_terminal() => {
                    warn!(%error, backend = %self.name, org, bucket, "upstream rejected batch, dropping");
                    return;
                }
                Err(error) => {
                    if error.is_transport() {
                        self.state.set_active(false);
                    }
                    warn!(
                        %error,
                        backend = %self.name,
                        org,
                        bucket,
                        bytes = compressed.len(),
                        "write failed, spooling batch"
                    );
                }
            }
        }

        if let Err(error) = self.spool.write(spool_record(org, bucket, &compressed)).await {
            error!(%error, backend = %self.name, org, bucket, "spool write failed, batch lost");
        }
    }

    /// Start the rewriter unless one is already running or there is nothing
    /// to drain.
    async fn maybe_rewrite(self: &Arc<Self>) {
        if self.state.is_rewriting() || !self.spool.is_data().await {
            return;
        }
        self.state.set_rewriting(true);

        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.rewrite_loop().await });
    }

    async fn rewrite_loop(&self) {
        debug!(backend = %self.name, "rewriter started");
        while self.state.is_running() && self.spool.is_data().await {
            if !self.state.is_active() {
                tokio::time::sleep(self.rewrite_interval).await;
                continue;
            }
            if self.rewrite_one().await.is_err() {
                tokio::time::sleep(self.rewrite_interval).await;
            }
        }
        self.state.set_rewriting(false);
        debug!(backend = %self.name, "rewriter finished");
    }

    /// Drain a single spool record. `Err` asks the loop to back off.
    async fn rewrite_one(&self) -> Result<(), ()> {
        let record = match self.spool.read().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(error) => {
                warn!(%error, backend = %self.name, "rewrite read error");
                self.spool.rollback_meta().await.ok();
                return Err(());
            }
        };

        let (org, bucket, payload) = match parse_spool_record(&record) {
            Some(parts) => parts,
            None => {
                // Undeliverable however often it is retried: drain it.
                warn!(backend = %self.name, "invalid spool record, dropping");
                return self.commit_drain().await;
            }
        };

        match self
            .client
            .write_compressed(&org, &bucket, Bytes::copy_from_slice(payload))
            .await
        {
            Ok(()) => self.commit_drain().await,
            Err(error) if error.is_terminal() => {
                warn!(%error, backend = %self.name, %org, %bucket, "upstream rejected spooled batch, dropping");
                self.commit_drain().await
            }
            Err(error) => {
                if error.is_transport() {
                    self.state.set_active(false);
                }
                warn!(%error, backend = %self.name, %org, %bucket, "rewrite failed, will retry");
                if let Err(error) = self.spool.rollback_meta().await {
                    error!(%error, backend = %self.name, "rollback meta error");
                }
                Err(())
            }
        }
    }

    async fn commit_drain(&self) -> Result<(), ()> {
        match self.spool.update_meta().await {
            Ok(()) => Ok(()),
            Err(error) => {
                error!(%error, backend = %self.name, "update meta error");
                Err(())
            }
        }
    }

    /// Block until every in-flight flush job has completed.
    async fn wait_jobs(&self) {
        // Every job holds one permit for its lifetime, so owning the full
        // allocation means the pool is idle.
        let _all = self
            .jobs
            .acquire_many(self.pool_size as u32)
            .await
            .expect("flush pool semaphore closed");
    }
}

/// A growable per-namespace buffer and its record counter.
#[derive(Debug, Default)]
struct CacheBuffer {
    buf: Vec<u8>,
    counter: usize,
}

/// The single task owning all of a backend's buffers.
struct Worker {
    rx: mpsc::Receiver<Arc<LinePoint>>,
    buffers: HashMap<String, HashMap<String, CacheBuffer>>,
    flush_size: usize,
    flush_time: Duration,
    flush_at: Option<Instant>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(mut self) {
        let mut rewrite_tick = interval_at(
            Instant::now() + self.shared.rewrite_interval,
            self.shared.rewrite_interval,
        );
        rewrite_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                point = self.rx.recv() => match point {
                    Some(point) => self.buffer_point(point).await,
                    None => break,
                },
                _ = sleep_until(self.flush_at.unwrap_or_else(Instant::now)), if self.flush_at.is_some() => {
                    self.flush_at = None;
                    self.flush_all().await;
                }
                _ = rewrite_tick.tick() => self.shared.maybe_rewrite().await,
            }
        }

        // Channel closed: flush what remains, wait out in-flight jobs, then
        // release the spool.
        self.flush_all().await;
        self.shared.wait_jobs().await;
        self.shared.spool.close().await;
    }

    /// Append one point to its namespace buffer, flushing that buffer when
    /// it reaches `flush_size` records, otherwise arming the one-shot flush
    /// timer.
    async fn buffer_point(&mut self, point: Arc<LinePoint>) {
        let full = {
            let cb = self
                .buffers
                .entry(point.org.clone())
                .or_default()
                .entry(point.bucket.clone())
                .or_default();

            cb.buf.extend_from_slice(&point.line);
            if !point.line.ends_with(b"\n") {
                cb.buf.push(b'\n');
            }
            cb.counter += 1;
            cb.counter >= self.flush_size
        };

        if full {
            self.flush_one(&point.org, &point.bucket).await;
        } else if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.flush_time);
        }
    }

    /// Steal and dispatch one buffer.
    async fn flush_one(&mut self, org: &str, bucket: &str) {
        let payload = match self.buffers.get_mut(org).and_then(|m| m.get_mut(bucket)) {
            Some(cb) => {
                cb.counter = 0;
                std::mem::take(&mut cb.buf)
            }
            None => return,
        };
        if payload.is_empty() {
            return;
        }
        self.submit(org.to_owned(), bucket.to_owned(), payload).await;
    }

    async fn flush_all(&mut self) {
        self.flush_at = None;

        let keys = self
            .buffers
            .iter()
            .flat_map(|(org, buckets)| {
                buckets
                    .iter()
                    .filter(|(_, cb)| cb.counter > 0)
                    .map(move |(bucket, _)| (org.clone(), bucket.clone()))
            })
            .collect::<Vec<_>>();

        for (org, bucket) in keys {
            self.flush_one(&org, &bucket).await;
        }
    }

    /// Submit a flush job to the pool. Blocks while the pool is saturated,
    /// which backpressures the ingest channel.
    async fn submit(&self, org: String, bucket: String, payload: Vec<u8>) {
        let permit = Arc::clone(&self.shared.jobs)
            .acquire_owned()
            .await
            .expect("flush pool semaphore closed");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _permit = permit;
            shared.flush_payload(&org, &bucket, payload).await;
        });
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload)?;
    enc.finish()
}

/// `escape(org) SP escape(bucket) SP compressed`. The namespaces may contain
/// arbitrary bytes, so they are query-escaped; the compressed stretch is the
/// only part that may still contain 0x20.
fn spool_record(org: &str, bucket: &str, compressed: &[u8]) -> Vec<u8> {
    let org = utf8_percent_encode(org, NON_ALPHANUMERIC).to_string();
    let bucket = utf8_percent_encode(bucket, NON_ALPHANUMERIC).to_string();

    let mut record = Vec::with_capacity(org.len() + bucket.len() + compressed.len() + 2);
    record.extend_from_slice(org.as_bytes());
    record.push(b' ');
    record.extend_from_slice(bucket.as_bytes());
    record.push(b' ');
    record.extend_from_slice(compressed);
    record
}

fn parse_spool_record(record: &[u8]) -> Option<(String, String, &[u8])> {
    let mut parts = record.splitn(3, |&b| b == b' ');
    let org = parts.next()?;
    let bucket = parts.next()?;
    let payload = parts.next()?;

    let org = percent_decode(org).decode_utf8().ok()?.into_owned();
    let bucket = percent_decode(bucket).decode_utf8().ok()?.into_owned();
    Some((org, bucket, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn spool_record_roundtrip() {
        let record = spool_record("my org", "bucket/one", b"gzip bytes with \x20 space");
        let (org, bucket, payload) = parse_spool_record(&record).unwrap();
        assert_eq!(org, "my org");
        assert_eq!(bucket, "bucket/one");
        assert_eq!(payload, b"gzip bytes with \x20 space");
    }

    #[test]
    fn spool_record_escapes_spaces() {
        let record = spool_record("a b", "c", b"");
        // Exactly two unescaped separators before the payload.
        assert_eq!(record.iter().filter(|&&b| b == b' ').count(), 2);
    }

    #[test]
    fn invalid_spool_record_is_rejected() {
        assert!(parse_spool_record(b"only-two parts").is_none());
        // Invalid percent-escape decodes to invalid utf8.
        assert!(parse_spool_record(b"%ff%fe ok payload").is_none());
    }

    #[test]
    fn gzip_roundtrip() {
        let compressed = gzip(b"cpu,host=a value=1 1\n").unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"cpu,host=a value=1 1\n");
    }

    fn test_config(url: &str, data_dir: &str) -> (BackendConfig, ProxyConfig) {
        let backend = BackendConfig {
            name: "b1".to_owned(),
            url: url.to_owned(),
            token: "tok".to_owned(),
            write_only: false,
        };
        let proxy = ProxyConfig {
            circles: vec![crate::config::CircleConfig {
                name: "c1".to_owned(),
                backends: vec![backend.clone()],
            }],
            dbrp: Default::default(),
            listen_addr: String::new(),
            data_dir: data_dir.to_owned(),
            flush_size: 1,
            flush_time: 1,
            check_interval: 1,
            rewrite_interval: 1,
            conn_pool_size: 2,
            write_timeout: 5,
            write_tracing: false,
            query_tracing: false,
            token: String::new(),
            https_enabled: false,
            https_cert: String::new(),
            https_key: String::new(),
            tls_skip_verify: false,
        };
        (backend, proxy)
    }

    fn point(org: &str, bucket: &str, line: &str) -> Arc<LinePoint> {
        Arc::new(LinePoint {
            org: org.to_owned(),
            bucket: bucket.to_owned(),
            line: line.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn write_point_after_close_is_closed_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, pxcfg) = test_config("http://127.0.0.1:1", dir.path().to_str().unwrap());

        let backend = Backend::new(&cfg, &pxcfg).await.unwrap();
        backend.close().await;

        let got = backend.write_point(point("o", "b", "cpu v=1 1")).await;
        assert_eq!(got, Err(ClosedPipe));
    }

    #[tokio::test]
    async fn size_triggered_flush_posts_compressed_batch() {
        let mut server = mockito::Server::new_async().await;
        let _ping = server
            .mock("GET", "/ping")
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("org".into(), "o".into()),
                mockito::Matcher::UrlEncoded("bucket".into(), "b".into()),
            ]))
            .match_header("content-encoding", "gzip")
            .with_status(204)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (cfg, pxcfg) = test_config(&server.url(), dir.path().to_str().unwrap());

        let backend = Backend::new(&cfg, &pxcfg).await.unwrap();
        backend
            .write_point(point("o", "b", "cpu,host=a value=1 1"))
            .await
            .unwrap();

        // flush_size is 1: the batch flushes without waiting for the timer.
        backend.close().await;
        write.assert_async().await;

        // Delivered upstream, so nothing was spooled.
        let spooled = std::fs::metadata(dir.path().join("b1").join("data"))
            .unwrap()
            .len();
        assert_eq!(spooled, 0);
    }

    #[tokio::test]
    async fn unavailable_backend_spools_every_batch() {
        let mut server = mockito::Server::new_async().await;
        // Probe fails: the backend is marked inactive and flush jobs skip
        // the upstream entirely.
        let _ping = server
            .mock("GET", "/ping")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(204)
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (cfg, pxcfg) = test_config(&server.url(), dir.path().to_str().unwrap());

        let backend = Backend::new(&cfg, &pxcfg).await.unwrap();

        // Let the first probe land before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;

        const N: usize = 5;
        for i in 0..N {
            backend
                .write_point(point("o", "b", &format!("cpu value={i} {i}")))
                .await
                .unwrap();
        }
        backend.close().await;
        write.assert_async().await;

        // Exactly N spool records (flush_size = 1).
        let mut spool = 0;
        let spool_path = dir.path().join("b1");
        let spool_handle = spool::Spool::open(&spool_path).await.unwrap();
        while spool_handle.read().await.unwrap().is_some() {
            spool_handle.update_meta().await.unwrap();
            spool += 1;
        }
        assert_eq!(spool, N);
    }

    #[tokio::test]
    async fn concurrent_writers_beyond_channel_capacity_all_land() {
        let mut server = mockito::Server::new_async().await;
        let _ping = server
            .mock("GET", "/ping")
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (cfg, mut pxcfg) = test_config(&server.url(), dir.path().to_str().unwrap());
        // Points pile up in the buffer and flush only on close.
        pxcfg.flush_size = 1_000;
        pxcfg.flush_time = 3_600;

        let backend = Arc::new(Backend::new(&cfg, &pxcfg).await.unwrap());

        // Far more concurrent senders than the channel holds; the excess
        // block on the channel until the worker drains them.
        let mut tasks = Vec::new();
        for i in 0..64 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                backend
                    .write_point(point("o", "b", &format!("cpu value={i} {i}")))
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        backend.close().await;
        write.assert_async().await;
    }

    #[tokio::test]
    async fn terminal_rejection_neither_spools_nor_retries() {
        let mut server = mockito::Server::new_async().await;
        let _ping = server
            .mock("GET", "/ping")
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/api/v2/write")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (cfg, pxcfg) = test_config(&server.url(), dir.path().to_str().unwrap());

        let backend = Backend::new(&cfg, &pxcfg).await.unwrap();
        backend
            .write_point(point("o", "b", "cpu value=broken 1"))
            .await
            .unwrap();
        backend.close().await;

        write.assert_async().await;
        let spooled = std::fs::metadata(dir.path().join("b1").join("data"))
            .unwrap()
            .len();
        assert_eq!(spooled, 0, "terminal rejections must not spool");
    }
}
