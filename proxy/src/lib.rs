#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # Proxy
//!
//! The core of a sharding and high-availability proxy in front of a fleet of
//! InfluxDB v2-compatible nodes.
//!
//! Writes are parsed as line protocol, routed by consistent hashing on
//! `(org, bucket, measurement)` to exactly one [`Backend`] per replication
//! group ([`Circle`]), buffered, compressed and shipped upstream - or spooled
//! to a per-backend durable backlog while the upstream is down, and drained
//! back once it recovers. Queries go to a single healthy replica, or are
//! broadcast to every backend and reduced for meta queries.
//!
//! [`Backend`]: crate::backend::Backend
//! [`Circle`]: crate::circle::Circle

pub mod backend;
pub mod circle;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod probe;
pub mod ql;
pub mod reducer;
pub mod scan;
pub mod state;

mod proxy;

pub use crate::proxy::{get_key, Proxy};
