//! Search configuration
//!
//! One immutable value per session. Every field has a default so a JSON file
//! only needs to name what it changes.

use crate::error::{Result, SearchError};
use crate::partition::TreeShape;
use crate::range::{Key, SearchRange};
use crate::sampler::SamplingPolicy;
use crate::target::SearchTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How each window is searched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Gate, sample and verify partition leaves; exhaustive only where the
    /// prefilter opens on a small enough leaf
    #[default]
    Triage,
    /// Visit every key of every window in partition pre-order
    Exhaustive,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "triage" => Ok(SearchMode::Triage),
            "exhaustive" => Ok(SearchMode::Exhaustive),
            other => Err(format!("unknown search mode '{}' (expected triage or exhaustive)", other)),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Triage => f.write_str("triage"),
            SearchMode::Exhaustive => f.write_str("exhaustive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefilterConfig {
    /// Expected number of inserted prefixes
    pub size: usize,
    /// 0 selects the exact set
    pub false_positive_rate: f64,
    /// Hex characters per stored prefix
    pub prefix_len: usize,
    /// Random domain keys fingerprinted to seed the filter
    pub seed_samples: usize,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            size: 500,
            false_positive_rate: 0.05,
            prefix_len: 4,
            seed_samples: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Program name looked up on `PATH`, or a path
    pub program: String,
    /// Text the tool prints on success
    pub marker: String,
    pub threads: usize,
    pub extra_args: Vec<String>,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            program: "keyhunt".to_string(),
            marker: "FOUND".to_string(),
            threads: num_cpus::get(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub lower: Key,
    pub upper: Key,
    /// Full target fingerprint, hex
    pub target: String,
    /// Hex characters that make a candidate "promising"
    pub prefix_length: usize,
    /// Keys per window; one window is one round of the session
    pub window_size: u128,
    /// Resident levels below each materialized partition root
    pub max_depth: u32,
    /// Partition ranges with at most this many keys are scanned in place
    /// instead of being split or offloaded
    pub min_offload_len: u128,
    /// Keys per rayon chunk when a range is scanned in parallel
    pub scan_chunk: u128,
    pub mode: SearchMode,
    pub sampling: SamplingPolicy,
    pub prefilter: PrefilterConfig,
    /// Random keys per leaf checked against the prefilter
    pub gate_checks: usize,
    /// Largest leaf verified key by key once the gate opens
    pub exhaustive_limit: u128,
    /// Half-width of the window verified around each promising key
    pub refine_radius: u128,
    /// Hex positions a promising key must share with the target to be
    /// journaled
    pub journal_min_shared: usize,
    pub workers: usize,
    /// RNG seed; `None` draws one from the OS
    pub seed: Option<u64>,
    /// Checkpoint, node blobs and journal live here
    pub state_dir: PathBuf,
    pub delegate: Option<DelegateConfig>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lower: 1 << 66,
            upper: (1 << 67) - 1,
            target: "739437bb3dd6d1983e66629c5f08c70e52769371".to_string(),
            prefix_length: 6,
            window_size: 1_234_567_890,
            max_depth: 4,
            min_offload_len: 1 << 16,
            scan_chunk: 1 << 14,
            mode: SearchMode::Triage,
            sampling: SamplingPolicy::default(),
            prefilter: PrefilterConfig::default(),
            gate_checks: 1,
            exhaustive_limit: 1 << 20,
            refine_radius: 1_000,
            journal_min_shared: 12,
            workers: num_cpus::get(),
            seed: None,
            state_dir: default_state_dir(),
            delegate: None,
        }
    }
}

/// `<local data dir>/rangehunt`, or `./rangehunt-state` without one
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("rangehunt"))
        .unwrap_or_else(|| PathBuf::from("rangehunt-state"))
}

impl SearchConfig {
    /// Load a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SearchError::storage(path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            SearchError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    pub fn domain(&self) -> Result<SearchRange> {
        SearchRange::new(self.lower, self.upper)
    }

    pub fn target(&self) -> Result<SearchTarget> {
        SearchTarget::new(&self.target, self.prefix_length)
    }

    pub fn validate(&self) -> Result<()> {
        self.domain()?;
        let target = self.target()?;
        self.sampling.validate()?;

        if self.window_size == 0 {
            return Err(SearchError::InvalidConfig("window_size must be > 0".into()));
        }
        if self.max_depth == 0 {
            return Err(SearchError::InvalidConfig("max_depth must be >= 1".into()));
        }
        if self.scan_chunk == 0 {
            return Err(SearchError::InvalidConfig("scan_chunk must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(SearchError::InvalidConfig("workers must be > 0".into()));
        }
        let prefilter = &self.prefilter;
        if !(0.0..1.0).contains(&prefilter.false_positive_rate) {
            return Err(SearchError::InvalidConfig(format!(
                "prefilter.false_positive_rate {} outside [0, 1)",
                prefilter.false_positive_rate
            )));
        }
        if prefilter.prefix_len == 0 || prefilter.prefix_len > target.fingerprint().width() {
            return Err(SearchError::InvalidConfig(format!(
                "prefilter.prefix_len must be within 1..={}",
                target.fingerprint().width()
            )));
        }
        if let Some(delegate) = &self.delegate {
            if delegate.program.is_empty() || delegate.marker.is_empty() {
                return Err(SearchError::InvalidConfig(
                    "delegate.program and delegate.marker must be set".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn tree_shape(&self) -> TreeShape {
        TreeShape::new(self.max_depth, self.min_offload_len)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.state_dir.join("nodes")
    }

    pub fn promising_path(&self) -> PathBuf {
        self.state_dir.join("promising.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SearchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.domain().unwrap().len(), 1 << 66);
        assert_eq!(config.target().unwrap().prefix(), "739437");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(
            &path,
            r#"{ "lower": 1, "upper": 5000, "mode": "exhaustive", "sampling": { "initial": 10 } }"#,
        )
        .unwrap();
        let config = SearchConfig::from_json_file(&path).unwrap();
        assert_eq!(config.domain().unwrap(), SearchRange::new(1, 5000).unwrap());
        assert_eq!(config.mode, SearchMode::Exhaustive);
        assert_eq!(config.sampling.initial, 10);
        assert_eq!(config.sampling.growth, 2);
        assert_eq!(config.prefix_length, 6);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let inverted = SearchConfig {
            lower: 10,
            upper: 1,
            ..SearchConfig::default()
        };
        assert!(matches!(inverted.validate(), Err(SearchError::InvertedRange { .. })));

        let long_prefix = SearchConfig {
            prefix_length: 41,
            ..SearchConfig::default()
        };
        assert!(matches!(long_prefix.validate(), Err(SearchError::InvalidTarget { .. })));

        let no_workers = SearchConfig {
            workers: 0,
            ..SearchConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let mut bad_rate = SearchConfig::default();
        bad_rate.prefilter.false_positive_rate = 1.5;
        assert!(bad_rate.validate().is_err());

        let no_chunk = SearchConfig {
            scan_chunk: 0,
            ..SearchConfig::default()
        };
        assert!(no_chunk.validate().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Exhaustive".parse::<SearchMode>().unwrap(), SearchMode::Exhaustive);
        assert_eq!(SearchMode::Triage.to_string(), "triage");
        assert!("fast".parse::<SearchMode>().is_err());
    }
}
