//! Prefix prefilter
//!
//! Cheap membership gate over fingerprint prefixes. A positive answer only
//! means "worth spending exhaustive work here"; it is never a final answer.
//! Inserted prefixes are never reported absent.
//!
//! Two backings:
//! - Bloom filter (false-positive rate > 0), double hashing with two keyed
//!   SipHash-1-3 instances.
//! - Exact `FxHashSet` (false-positive rate == 0), more memory, no false hits.

use crate::error::{Result, SearchError};
use crate::oracle::FingerprintOracle;
use crate::range::SearchRange;
use crate::target::SearchTarget;
use rand::Rng;
use rustc_hash::FxHashSet;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::RwLock;
use tracing::{debug, warn};

const SIP_KEYS_A: (u64, u64) = (0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908);
const SIP_KEYS_B: (u64, u64) = (0x5152_5354_5556_5758, 0xa1a2_a3a4_a5a6_a7a8);

/// Fixed-size bloom filter over byte strings
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let num_bits = Self::optimal_num_bits(expected_items, false_positive_rate).max(64);
        let num_hashes = Self::optimal_num_hashes(expected_items, num_bits);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
        }
    }

    /// m = -n ln p / (ln 2)^2
    fn optimal_num_bits(n: usize, p: f64) -> usize {
        let m = -(n as f64 * p.ln()) / (2.0_f64.ln().powi(2));
        m.ceil() as usize
    }

    /// k = (m / n) ln 2
    fn optimal_num_hashes(n: usize, m: usize) -> usize {
        let k = (m as f64 / n as f64) * 2.0_f64.ln();
        (k.round() as usize).max(1)
    }

    fn base_hashes(item: &[u8]) -> (u64, u64) {
        let mut a = SipHasher13::new_with_keys(SIP_KEYS_A.0, SIP_KEYS_A.1);
        a.write(item);
        let mut b = SipHasher13::new_with_keys(SIP_KEYS_B.0, SIP_KEYS_B.1);
        b.write(item);
        // Odd step so the hash sequence never collapses onto one bit
        (a.finish(), b.finish() | 1)
    }

    fn bit_indices(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = Self::base_hashes(item);
        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as usize)
    }

    pub fn insert(&mut self, item: &[u8]) {
        let indices: Vec<usize> = self.bit_indices(item).collect();
        for bit in indices {
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_indices(item)
            .all(|bit| self.bits[bit / 64] & (1u64 << (bit % 64)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }
}

#[derive(Debug)]
enum Membership {
    Bloom(BloomFilter),
    Exact(FxHashSet<String>),
}

/// Concurrent prefix gate shared by all workers of a session
#[derive(Debug)]
pub struct Prefilter {
    membership: RwLock<Membership>,
    prefix_len: usize,
    false_positive_rate: f64,
}

impl Prefilter {
    /// Approximate set when `false_positive_rate > 0`, exact set when it is 0.
    pub fn build(size: usize, false_positive_rate: f64, prefix_len: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&false_positive_rate) {
            return Err(SearchError::InvalidConfig(format!(
                "false positive rate {} outside [0, 1)",
                false_positive_rate
            )));
        }
        if prefix_len == 0 {
            return Err(SearchError::InvalidConfig("prefilter prefix length must be > 0".into()));
        }
        let membership = if false_positive_rate == 0.0 {
            Membership::Exact(FxHashSet::with_capacity_and_hasher(size, Default::default()))
        } else {
            Membership::Bloom(BloomFilter::new(size, false_positive_rate))
        };
        Ok(Self {
            membership: RwLock::new(membership),
            prefix_len,
            false_positive_rate,
        })
    }

    /// Build and seed with the target prefix plus the prefixes of
    /// `seed_samples` random keys drawn from `domain`.
    #[allow(clippy::too_many_arguments)]
    pub fn seeded<O, R>(
        size: usize,
        false_positive_rate: f64,
        prefix_len: usize,
        target: &SearchTarget,
        oracle: &O,
        domain: &SearchRange,
        seed_samples: usize,
        rng: &mut R,
    ) -> Result<Self>
    where
        O: FingerprintOracle + ?Sized,
        R: Rng + ?Sized,
    {
        let filter = Self::build(size, false_positive_rate, prefix_len)?;
        filter.insert(target.fingerprint().prefix(prefix_len));
        let mut skipped = 0usize;
        for _ in 0..seed_samples {
            let key = rng.gen_range(domain.lower()..=domain.upper());
            match oracle.fingerprint(key) {
                Ok(fp) => filter.insert(fp.prefix(prefix_len)),
                Err(e) => {
                    skipped += 1;
                    debug!(key = %key, error = %e, "skipping seed key");
                }
            }
        }
        debug!(
            seeded = seed_samples - skipped,
            skipped,
            exact = filter.is_exact(),
            "prefilter seeded"
        );
        Ok(filter)
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    pub fn is_exact(&self) -> bool {
        self.false_positive_rate == 0.0
    }

    fn normalize<'a>(&self, prefix: &'a str) -> &'a str {
        prefix.get(..self.prefix_len).unwrap_or(prefix)
    }

    pub fn insert(&self, prefix: &str) {
        let prefix = self.normalize(prefix);
        let mut guard = match self.membership.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("prefilter lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        };
        match &mut *guard {
            Membership::Bloom(bloom) => bloom.insert(prefix.as_bytes()),
            Membership::Exact(set) => {
                set.insert(prefix.to_string());
            }
        }
    }

    pub fn contains(&self, prefix: &str) -> bool {
        let prefix = self.normalize(prefix);
        let guard = self
            .membership
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*guard {
            Membership::Bloom(bloom) => bloom.contains(prefix.as_bytes()),
            Membership::Exact(set) => set.contains(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Fingerprint, FnOracle};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_no_false_negatives() {
        for rate in [0.0, 0.01, 0.2] {
            let filter = Prefilter::build(500, rate, 6).unwrap();
            let inserted: Vec<String> = (0..500).map(|i| format!("{:06x}", i * 7919)).collect();
            for p in &inserted {
                filter.insert(p);
            }
            assert!(inserted.iter().all(|p| filter.contains(p)), "rate {}", rate);
        }
    }

    #[test]
    fn test_exact_set_has_no_false_positives() {
        let filter = Prefilter::build(100, 0.0, 4).unwrap();
        filter.insert("7394");
        assert!(filter.is_exact());
        assert!(filter.contains("7394"));
        assert!(filter.contains("739437bb"));
        assert!(!filter.contains("7395"));
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(Prefilter::build(10, 1.0, 4).is_err());
        assert!(Prefilter::build(10, -0.1, 4).is_err());
        assert!(Prefilter::build(10, 0.1, 0).is_err());
    }

    #[test]
    fn test_seeded_always_holds_target_prefix() {
        let oracle = FnOracle::new(|key: u128| Ok(Fingerprint::from_bytes(&(key as u32).to_be_bytes())));
        let target = SearchTarget::new("deadbeef", 8).unwrap();
        let domain = SearchRange::new(0, 1000).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let filter = Prefilter::seeded(50, 0.0, 4, &target, &oracle, &domain, 50, &mut rng).unwrap();
        assert!(filter.contains("dead"));
        // Every seeded key in [0, 1000] has a "0000" prefix
        assert!(filter.contains("0000"));
    }

    #[test]
    fn test_concurrent_insert_and_contains() {
        for rate in [0.0, 0.01] {
            let filter = Prefilter::build(4_000, rate, 6).unwrap();
            std::thread::scope(|scope| {
                for worker in 0..4u32 {
                    let filter = &filter;
                    scope.spawn(move || {
                        for i in 0..1_000u32 {
                            let prefix = format!("{:06x}", worker * 1_000_000 + i);
                            filter.insert(&prefix);
                            // A reader never misses its own write
                            assert!(filter.contains(&prefix));
                        }
                    });
                }
            });
            for worker in 0..4u32 {
                assert!((0..1_000u32).all(|i| filter.contains(&format!("{:06x}", worker * 1_000_000 + i))));
            }
        }
    }

    #[test]
    fn test_bloom_sizing() {
        let bloom = BloomFilter::new(1000, 0.01);
        // ~9.6 bits per element, ~7 hashes
        assert!(bloom.num_bits() >= 9500 && bloom.num_bits() <= 9700);
        assert_eq!(bloom.num_hashes(), 7);
    }
}
