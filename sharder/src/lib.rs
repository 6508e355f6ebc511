#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # Sharder
//!
//! A consistent-hash ring mapping opaque string keys to member tokens.
//!
//! Each token added to the ring contributes [`DEFAULT_VNODES`] virtual nodes,
//! smoothing the key distribution across members. Lookups hash the key,
//! binary-search the sorted ring and return the owning token, wrapping at the
//! end of the hash space.
//!
//! Ring membership is fixed once constructed - there is no rebalancing or
//! node removal. Callers that need a key -> member cache can layer a simple
//! memoization on top, as lookups are deterministic for a given membership.

use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// The number of virtual nodes each token contributes to the ring.
pub const DEFAULT_VNODES: usize = 256;

/// A consistent-hash ring of virtual nodes.
///
/// ```
/// use sharder::HashRing;
///
/// let mut ring = HashRing::default();
/// ring.add("|0");
/// ring.add("|1");
///
/// // Deterministic: the same key always resolves to the same token.
/// let token = ring.get("org,bucket,cpu").unwrap();
/// assert_eq!(ring.get("org,bucket,cpu"), Some(token));
/// ```
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes per token.
    vnodes: usize,

    /// Sorted (hash, token index) pairs forming the ring.
    ring: Vec<(u64, usize)>,

    /// Tokens by insertion order, indexed by the ring entries.
    tokens: Vec<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VNODES)
    }
}

impl HashRing {
    /// Construct an empty ring with `vnodes` virtual nodes per token.
    ///
    /// # Panics
    ///
    /// Panics if `vnodes` is 0.
    pub fn new(vnodes: usize) -> Self {
        assert!(vnodes > 0, "a ring must place at least one vnode per token");
        Self {
            vnodes,
            ring: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Insert `token` into the ring, placing its virtual nodes.
    pub fn add(&mut self, token: impl Into<String>) {
        let token = token.into();
        let idx = self.tokens.len();

        self.ring.reserve(self.vnodes);
        for vnode in 0..self.vnodes {
            self.ring.push((hash_vnode(&token, vnode), idx));
        }
        self.tokens.push(token);

        // Ties are broken by insertion order so membership iteration order
        // never affects placement.
        self.ring.sort_unstable();
    }

    /// Resolve `key` to the owning token, or [`None`] when the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }

        let h = hash_key(key.as_bytes());

        // First vnode clockwise of the key hash, wrapping past the end of the
        // hash space back to the first vnode.
        let at = self.ring.partition_point(|&(vh, _)| vh < h);
        let (_, idx) = self.ring[at % self.ring.len()];

        Some(&self.tokens[idx])
    }

    /// The number of tokens in the ring.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no tokens have been added.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn hash_key(key: &[u8]) -> u64 {
    // Fixed keys: placement must be stable across processes and restarts.
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(key);
    hasher.finish()
}

fn hash_vnode(token: &str, vnode: usize) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(token.as_bytes());
    hasher.write_usize(vnode);
    hasher.finish()
}
