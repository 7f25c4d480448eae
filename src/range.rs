//! Key ranges
//!
//! A `SearchRange` is an inclusive `[lower, upper]` span of the key domain.
//! Splitting takes the midpoint out as a directly tested key and returns the
//! two (possibly empty) halves on either side of it.

use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain element
pub type Key = u128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchRange {
    lower: Key,
    upper: Key,
}

/// Result of bisecting a range around its midpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub left: Option<SearchRange>,
    pub mid: Key,
    pub right: Option<SearchRange>,
}

// A constructed range always holds at least one key
#[allow(clippy::len_without_is_empty)]
impl SearchRange {
    pub fn new(lower: Key, upper: Key) -> Result<Self> {
        if lower > upper {
            return Err(SearchError::InvertedRange { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> Key {
        self.lower
    }

    pub fn upper(&self) -> Key {
        self.upper
    }

    /// Number of keys in the range, saturating at `u128::MAX` for the full domain.
    pub fn len(&self) -> u128 {
        (self.upper - self.lower).saturating_add(1)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.lower <= key && key <= self.upper
    }

    /// Floor of `(lower + upper) / 2` without overflow
    pub fn midpoint(&self) -> Key {
        self.lower + (self.upper - self.lower) / 2
    }

    pub fn split(&self) -> Split {
        let mid = self.midpoint();
        let left = (mid > self.lower).then(|| SearchRange {
            lower: self.lower,
            upper: mid - 1,
        });
        let right = (mid < self.upper).then(|| SearchRange {
            lower: mid + 1,
            upper: self.upper,
        });
        Split { left, mid, right }
    }

    /// `[key - radius, key + radius]` clipped to this range
    pub fn window_around(&self, key: Key, radius: u128) -> Option<SearchRange> {
        let lower = key.saturating_sub(radius).max(self.lower);
        let upper = key.saturating_add(radius).min(self.upper);
        (lower <= upper).then_some(SearchRange { lower, upper })
    }

    /// First `count` keys starting at `from`, clipped to this range
    pub fn window_from(&self, from: Key, count: u128) -> Option<SearchRange> {
        if count == 0 || from > self.upper {
            return None;
        }
        let lower = from.max(self.lower);
        let upper = lower.saturating_add(count - 1).min(self.upper);
        Some(SearchRange { lower, upper })
    }

    /// Consecutive sub-ranges of at most `chunk` keys
    pub fn chunks(&self, chunk: u128) -> impl Iterator<Item = SearchRange> + '_ {
        let chunk = chunk.max(1);
        let mut next = Some(self.lower);
        std::iter::from_fn(move || {
            let lower = next?;
            let upper = lower.saturating_add(chunk - 1).min(self.upper);
            next = (upper < self.upper).then(|| upper + 1);
            Some(SearchRange { lower, upper })
        })
    }
}

impl fmt::Display for SearchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_range_rejected() {
        assert!(matches!(
            SearchRange::new(5, 4),
            Err(SearchError::InvertedRange { lower: 5, upper: 4 })
        ));
    }

    #[test]
    fn test_split_small_ranges() {
        let split = SearchRange::new(0, 7).unwrap().split();
        assert_eq!(split.mid, 3);
        assert_eq!(split.left, Some(SearchRange::new(0, 2).unwrap()));
        assert_eq!(split.right, Some(SearchRange::new(4, 7).unwrap()));

        let split = SearchRange::new(4, 5).unwrap().split();
        assert_eq!(split.mid, 4);
        assert_eq!(split.left, None);
        assert_eq!(split.right, SearchRange::new(5, 5).ok());

        let split = SearchRange::new(0, 0).unwrap().split();
        assert_eq!((split.left, split.mid, split.right), (None, 0, None));
    }

    #[test]
    fn test_split_at_domain_edges() {
        let full = SearchRange::new(0, u128::MAX).unwrap();
        assert_eq!(full.len(), u128::MAX);
        let split = full.split();
        assert_eq!(split.mid, u128::MAX / 2);
        assert_eq!(split.right.unwrap().upper(), u128::MAX);

        let top = SearchRange::new(u128::MAX, u128::MAX).unwrap().split();
        assert_eq!(top.right, None);
    }

    #[test]
    fn test_chunks_cover_range() {
        let range = SearchRange::new(10, 34).unwrap();
        let chunks: Vec<_> = range.chunks(10).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], SearchRange::new(10, 19).unwrap());
        assert_eq!(chunks[2], SearchRange::new(30, 34).unwrap());
    }

    #[test]
    fn test_windows_are_clipped() {
        let range = SearchRange::new(100, 200).unwrap();
        assert_eq!(range.window_around(105, 10), SearchRange::new(100, 115).ok());
        assert_eq!(range.window_from(190, 50), SearchRange::new(190, 200).ok());
        assert_eq!(range.window_from(201, 50), None);
    }
}
