//! Search target and candidates

use crate::error::{Result, SearchError};
use crate::oracle::Fingerprint;
use crate::range::Key;

/// What the session is looking for. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTarget {
    fingerprint: Fingerprint,
    prefix_length: usize,
}

impl SearchTarget {
    /// `prefix_length` is counted in hex characters.
    pub fn new(fingerprint: &str, prefix_length: usize) -> Result<Self> {
        let parsed = Fingerprint::from_hex(fingerprint).ok_or_else(|| SearchError::InvalidTarget {
            fingerprint: fingerprint.to_string(),
            reason: "not a hex string".to_string(),
        })?;
        if prefix_length == 0 || prefix_length > parsed.width() {
            return Err(SearchError::InvalidTarget {
                fingerprint: fingerprint.to_string(),
                reason: format!(
                    "prefix length {} must be within 1..={}",
                    prefix_length,
                    parsed.width()
                ),
            });
        }
        Ok(Self {
            fingerprint: parsed,
            prefix_length,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn prefix_length(&self) -> usize {
        self.prefix_length
    }

    pub fn prefix(&self) -> &str {
        self.fingerprint.prefix(self.prefix_length)
    }

    /// Prefix match: necessary, never sufficient
    pub fn prefix_matches(&self, fingerprint: &Fingerprint) -> bool {
        fingerprint.as_str().starts_with(self.prefix())
    }

    /// Full byte-for-byte match
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        fingerprint == &self.fingerprint
    }
}

/// A key together with its computed fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: Key,
    pub fingerprint: Fingerprint,
}
