//! Adaptive sampling
//!
//! Draws uniform random keys from a range in rounds of geometrically growing
//! size (`initial`, `initial * growth`, ...) until some key's fingerprint
//! carries the target prefix or the next round would exceed `max`. Sampling
//! is with replacement; duplicates only cost an extra fingerprint.

use crate::error::{Result, SearchError};
use crate::oracle::FingerprintOracle;
use crate::pool::CancelToken;
use crate::range::SearchRange;
use crate::target::Candidate;
use crate::verifier::Verifier;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Round sizing for the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub initial: u64,
    pub growth: u64,
    pub max: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            initial: 1_000,
            growth: 2,
            max: 100_000,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.initial == 0 {
            return Err(SearchError::InvalidConfig("sampling.initial must be > 0".into()));
        }
        if self.growth < 2 {
            return Err(SearchError::InvalidConfig(format!(
                "sampling.growth must be >= 2, got {}",
                self.growth
            )));
        }
        Ok(())
    }

    /// Round sizes this policy will issue, in order
    pub fn schedule(&self) -> impl Iterator<Item = u64> {
        let (growth, max) = (self.growth.max(2), self.max);
        std::iter::successors(Some(self.initial), move |n| n.checked_mul(growth))
            .take_while(move |n| *n <= max)
    }
}

/// Outcome of one finished sampling round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    pub round: u32,
    pub size: u64,
    pub prefix_hits: usize,
}

/// Result of sampling one range
#[derive(Debug, Clone, Default)]
pub struct SampleReport {
    /// Prefix-matching candidates from the final round (empty when none)
    pub promising: Vec<Candidate>,
    pub rounds: u32,
    pub samples_drawn: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct AdaptiveSampler {
    policy: SamplingPolicy,
}

impl AdaptiveSampler {
    pub fn new(policy: SamplingPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Sample `range` for keys whose fingerprint carries the target prefix.
    ///
    /// `on_round` runs after every completed round, including the last one.
    pub fn sample<O, R, F>(
        &self,
        range: SearchRange,
        verifier: &Verifier<O>,
        rng: &mut R,
        cancel: &CancelToken,
        mut on_round: F,
    ) -> SampleReport
    where
        O: FingerprintOracle + ?Sized,
        R: Rng + ?Sized,
        F: FnMut(&RoundSummary),
    {
        let mut report = SampleReport::default();
        for size in self.policy.schedule() {
            let mut promising = Vec::new();
            for _ in 0..size {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return report;
                }
                let key = rng.gen_range(range.lower()..=range.upper());
                if let Some(candidate) = verifier.candidate(key) {
                    if verifier.target().prefix_matches(&candidate.fingerprint) {
                        promising.push(candidate);
                    }
                }
            }

            report.rounds += 1;
            report.samples_drawn += size;
            let summary = RoundSummary {
                round: report.rounds,
                size,
                prefix_hits: promising.len(),
            };
            debug!(range = %range, round = summary.round, size, hits = summary.prefix_hits, "sampling round");
            on_round(&summary);

            if !promising.is_empty() {
                report.promising = promising;
                return report;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Fingerprint, FnOracle};
    use crate::range::Key;
    use crate::target::SearchTarget;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn verifier(target: &str, prefix: usize) -> Verifier<dyn FingerprintOracle> {
        let oracle: Arc<dyn FingerprintOracle> = Arc::new(FnOracle::new(|key: Key| {
            Ok(Fingerprint::from_hex(&format!("{:04x}", key % 65_536)).unwrap())
        }));
        Verifier::new(oracle, Arc::new(SearchTarget::new(target, prefix).unwrap()))
    }

    #[test]
    fn test_schedule_is_geometric_and_bounded() {
        let policy = SamplingPolicy {
            initial: 10,
            growth: 2,
            max: 100,
        };
        assert_eq!(policy.schedule().collect::<Vec<_>>(), vec![10, 20, 40, 80]);

        let tiny = SamplingPolicy {
            initial: 200,
            growth: 2,
            max: 100,
        };
        assert_eq!(tiny.schedule().count(), 0);
    }

    #[test]
    fn test_growth_below_two_rejected() {
        let policy = SamplingPolicy {
            initial: 10,
            growth: 1,
            max: 100,
        };
        assert!(AdaptiveSampler::new(policy).is_err());
    }

    #[test]
    fn test_empty_range_exhausts_schedule() {
        // Prefix "ff" never occurs below 0xff00
        let verifier = verifier("ffff", 2);
        let sampler = AdaptiveSampler::new(SamplingPolicy {
            initial: 10,
            growth: 2,
            max: 100,
        })
        .unwrap();
        let mut sizes = Vec::new();
        let report = sampler.sample(
            SearchRange::new(0, 0xfe00).unwrap(),
            &verifier,
            &mut StdRng::seed_from_u64(1),
            &CancelToken::new(),
            |round| sizes.push(round.size),
        );
        assert!(report.promising.is_empty());
        assert_eq!(report.rounds, 4);
        assert_eq!(report.samples_drawn, 150);
        assert_eq!(sizes, vec![10, 20, 40, 80]);
    }

    #[test]
    fn test_stops_growing_on_first_hit() {
        // Every key in [0x1200, 0x12ff] carries prefix "12"
        let verifier = verifier("12ab", 2);
        let sampler = AdaptiveSampler::new(SamplingPolicy {
            initial: 10,
            growth: 2,
            max: 1_000,
        })
        .unwrap();
        let report = sampler.sample(
            SearchRange::new(0x1200, 0x12ff).unwrap(),
            &verifier,
            &mut StdRng::seed_from_u64(2),
            &CancelToken::new(),
            |_| {},
        );
        assert_eq!(report.rounds, 1);
        assert_eq!(report.samples_drawn, 10);
        assert_eq!(report.promising.len(), 10);
    }

    #[test]
    fn test_cancelled_before_start() {
        let verifier = verifier("12ab", 2);
        let sampler = AdaptiveSampler::new(SamplingPolicy::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = sampler.sample(
            SearchRange::new(0, 10).unwrap(),
            &verifier,
            &mut StdRng::seed_from_u64(3),
            &cancel,
            |_| {},
        );
        assert!(report.cancelled);
        assert_eq!(report.samples_drawn, 0);
    }
}
