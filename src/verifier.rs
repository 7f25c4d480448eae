//! Candidate verification
//!
//! Full-fingerprint comparison against the target. Stops at the first exact
//! match in the caller's iteration order. Keys the oracle rejects are skipped
//! and logged, never fatal to the batch.

use crate::error::OracleError;
use crate::oracle::{Fingerprint, FingerprintOracle};
use crate::pool::CancelToken;
use crate::range::{Key, SearchRange};
use crate::target::{Candidate, SearchTarget};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keys between cancellation checks during exhaustive scans
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Shared handle to the oracle and target, cheap to clone into tasks
pub struct Verifier<O: ?Sized> {
    oracle: Arc<O>,
    target: Arc<SearchTarget>,
    fingerprints: Arc<AtomicU64>,
}

impl<O: ?Sized> Clone for Verifier<O> {
    fn clone(&self) -> Self {
        Self {
            oracle: self.oracle.clone(),
            target: self.target.clone(),
            fingerprints: self.fingerprints.clone(),
        }
    }
}

impl<O: FingerprintOracle + ?Sized> Verifier<O> {
    pub fn new(oracle: Arc<O>, target: Arc<SearchTarget>) -> Self {
        Self {
            oracle,
            target,
            fingerprints: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn target(&self) -> &SearchTarget {
        &self.target
    }

    /// Total fingerprints computed through this verifier and its clones
    pub fn fingerprints_computed(&self) -> u64 {
        self.fingerprints.load(Ordering::Relaxed)
    }

    /// Fingerprint one key; oracle failures and outputs whose width differs
    /// from the target's are logged and yield `None`.
    pub fn fingerprint(&self, key: Key) -> Option<Fingerprint> {
        self.fingerprints.fetch_add(1, Ordering::Relaxed);
        let expected = self.target.fingerprint().width();
        let checked = self.oracle.fingerprint(key).and_then(|fp| {
            if fp.width() == expected {
                Ok(fp)
            } else {
                Err(OracleError::WidthMismatch {
                    key,
                    expected,
                    actual: fp.width(),
                })
            }
        });
        match checked {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(key = %key, error = %e, "skipping key the oracle rejected");
                None
            }
        }
    }

    /// Fingerprint a key and keep it as a candidate
    pub fn candidate(&self, key: Key) -> Option<Candidate> {
        self.fingerprint(key).map(|fingerprint| Candidate { key, fingerprint })
    }

    pub fn is_match(&self, key: Key) -> bool {
        self.fingerprint(key)
            .map_or(false, |fp| self.target.matches(&fp))
    }

    /// First key, in order, whose fingerprint equals the target.
    pub fn verify_keys<I>(&self, keys: I, cancel: &CancelToken) -> Option<Key>
    where
        I: IntoIterator<Item = Key>,
    {
        for key in keys {
            if cancel.is_cancelled() {
                return None;
            }
            if self.is_match(key) {
                debug!(key = %key, "exact match confirmed");
                return Some(key);
            }
        }
        None
    }

    /// Same as `verify_keys`, reusing fingerprints carried from sampling.
    pub fn verify_candidates(&self, candidates: &[Candidate], cancel: &CancelToken) -> Option<Key> {
        for candidate in candidates {
            if cancel.is_cancelled() {
                return None;
            }
            if self.target.matches(&candidate.fingerprint) {
                debug!(key = %candidate.key, "exact match confirmed from carried fingerprint");
                return Some(candidate.key);
            }
        }
        None
    }

    /// Exhaustive scan of every key in `range`, ascending.
    pub fn verify_range(&self, range: SearchRange, cancel: &CancelToken) -> Option<Key> {
        let mut key = range.lower();
        let mut since_check = 0u64;
        loop {
            if since_check == 0 && cancel.is_cancelled() {
                return None;
            }
            since_check = (since_check + 1) % CANCEL_CHECK_INTERVAL;
            if self.is_match(key) {
                debug!(key = %key, range = %range, "exact match in exhaustive scan");
                return Some(key);
            }
            if key == range.upper() {
                return None;
            }
            key += 1;
        }
    }

    /// Exhaustive scan split into `chunk`-sized pieces on the rayon pool.
    ///
    /// Returns the lowest matching key, identical to `verify_range`.
    pub fn verify_range_parallel(&self, range: SearchRange, chunk: u128, cancel: &CancelToken) -> Option<Key>
    where
        O: Send + Sync,
    {
        let chunks: Vec<SearchRange> = range.chunks(chunk).collect();
        if chunks.len() <= 1 {
            return self.verify_range(range, cancel);
        }
        chunks
            .into_par_iter()
            .find_map_first(|piece| self.verify_range(piece, cancel))
    }

    /// Parallel candidate verification; lowest index wins, matching the
    /// sequential result.
    pub fn verify_candidates_parallel(&self, candidates: &[Candidate], cancel: &CancelToken) -> Option<Key>
    where
        O: Send + Sync,
    {
        candidates.par_iter().find_map_first(|candidate| {
            if cancel.is_cancelled() {
                return None;
            }
            self.target.matches(&candidate.fingerprint).then_some(candidate.key)
        })
    }
}
