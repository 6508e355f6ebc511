#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # Spool
//!
//! A durable on-disk FIFO of variable-length records, one directory per
//! owner.
//!
//! Records are appended by a writer and drained in append order by a single
//! reader whose committed position persists across restarts. The typical
//! life-cycle is `read` -> deliver -> `update_meta` (commit) on success, or
//! `rollback_meta` to re-yield the record on the next attempt.
//!
//! # Concurrency
//!
//! A [`Spool`] is a cheap handle around a request channel. All file state is
//! owned by one blocking task, so appends and cursor operations are
//! serialized no matter how many handles exist.

use snafu::prelude::*;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

mod blocking;

pub use blocking::Error as FileError;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    /// An error raised by the underlying file engine.
    #[snafu(transparent)]
    File { source: blocking::Error },

    /// The spool task has shut down and can no longer accept requests.
    #[snafu(display("spool is closed"))]
    Closed,
}

/// A specialized `Result` for spool errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
enum Request {
    Append(oneshot::Sender<Result<()>>, Vec<u8>),
    Read(oneshot::Sender<Result<Option<Vec<u8>>>>),
    Commit(oneshot::Sender<Result<()>>),
    Rollback(oneshot::Sender<Result<()>>),
    HasData(oneshot::Sender<bool>),
    Close(oneshot::Sender<()>),
}

/// An async handle to a durable record spool rooted at one directory.
#[derive(Debug)]
pub struct Spool {
    tx: mpsc::Sender<Request>,
}

impl Spool {
    /// Open (creating if needed) the spool in `dir` and start its I/O task.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        let file = tokio::task::spawn_blocking(move || blocking::SpoolFile::open(dir))
            .await
            .expect("spool open task panicked")?;

        let (tx, rx) = mpsc::channel(10);
        tokio::task::spawn_blocking(move || task_main(rx, file));

        Ok(Self { tx })
    }

    /// Append one record, returning once it is durable.
    pub async fn write(&self, payload: Vec<u8>) -> Result<()> {
        self.one_command(|tx| Request::Append(tx, payload)).await?
    }

    /// Read the record at the read cursor, or [`None`] at end of log.
    ///
    /// The cursor advance is not durable until [`Spool::update_meta()`] is
    /// called; [`Spool::rollback_meta()`] un-consumes the record instead.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        self.one_command(Request::Read).await?
    }

    /// Persist the cursor advanced past the last read record.
    pub async fn update_meta(&self) -> Result<()> {
        self.one_command(Request::Commit).await?
    }

    /// Restore the cursor to the last committed position.
    pub async fn rollback_meta(&self) -> Result<()> {
        self.one_command(Request::Rollback).await?
    }

    /// Returns true while undrained records remain.
    pub async fn is_data(&self) -> bool {
        self.one_command(Request::HasData).await.unwrap_or(false)
    }

    /// Flush and close the spool files; subsequent requests fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        // A send failure means the task is already gone, which is fine.
        let _ = self.one_command(Request::Close).await;
    }

    async fn one_command<Req, Resp>(&self, req: Req) -> Result<Resp>
    where
        Req: FnOnce(oneshot::Sender<Resp>) -> Request,
    {
        let (req_tx, req_rx) = oneshot::channel();
        self.tx.send(req(req_tx)).await.ok().context(ClosedSnafu)?;
        req_rx.await.ok().context(ClosedSnafu)
    }
}

fn task_main(mut rx: mpsc::Receiver<Request>, mut file: blocking::SpoolFile) {
    while let Some(req) = rx.blocking_recv() {
        // Send failures mean the caller gave up waiting; the operation has
        // still been applied.
        match req {
            Request::Append(tx, payload) => {
                tx.send(file.append(&payload).map_err(Into::into)).ok();
            }
            Request::Read(tx) => {
                tx.send(file.read().map_err(Into::into)).ok();
            }
            Request::Commit(tx) => {
                tx.send(file.commit().map_err(Into::into)).ok();
            }
            Request::Rollback(tx) => {
                tx.send(file.rollback().map_err(Into::into)).ok();
            }
            Request::HasData(tx) => {
                tx.send(file.has_data()).ok();
            }
            Request::Close(tx) => {
                file.sync().ok();
                drop(file);
                tx.send(()).ok();
                return;
            }
        }
    }
}
