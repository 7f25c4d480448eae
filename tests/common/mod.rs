//! Shared fixtures for integration tests

#![allow(dead_code)]

use rangehunt::{Fingerprint, FingerprintOracle, FnOracle, Key, SearchConfig, SearchMode};
use std::path::Path;
use std::sync::Arc;

/// Fingerprint is `key mod 16` as two hex digits
pub fn mod16_oracle() -> Arc<dyn FingerprintOracle> {
    Arc::new(FnOracle::new(|key: Key| {
        Ok(Fingerprint::from_hex(&format!("{:02x}", key % 16)).unwrap())
    }))
}

/// Fingerprint is `tag` followed by the low 24 bits of the key
pub fn tagged_oracle(tag: &'static str) -> Arc<dyn FingerprintOracle> {
    Arc::new(FnOracle::new(move |key: Key| {
        Ok(Fingerprint::from_hex(&format!("{}{:06x}", tag, key & 0xff_ffff)).unwrap())
    }))
}

/// Fingerprint is the low 16 bits of the key as four hex digits
pub fn low16_oracle() -> Arc<dyn FingerprintOracle> {
    Arc::new(FnOracle::new(|key: Key| {
        Ok(Fingerprint::from_hex(&format!("{:04x}", key & 0xffff)).unwrap())
    }))
}

/// Small, deterministic configuration rooted in `state_dir`
pub fn small_config(state_dir: &Path, lower: Key, upper: Key, target: &str, prefix_length: usize) -> SearchConfig {
    let mut config = SearchConfig {
        lower,
        upper,
        target: target.to_string(),
        prefix_length,
        window_size: upper.saturating_sub(lower).saturating_add(1),
        max_depth: 2,
        min_offload_len: 0,
        scan_chunk: 64,
        journal_min_shared: 0,
        mode: SearchMode::Exhaustive,
        gate_checks: 1,
        exhaustive_limit: 4096,
        refine_radius: 8,
        workers: 2,
        seed: Some(42),
        state_dir: state_dir.to_path_buf(),
        delegate: None,
        ..SearchConfig::default()
    };
    config.sampling.initial = 4;
    config.sampling.growth = 2;
    config.sampling.max = 8;
    config.prefilter.size = 16;
    config.prefilter.false_positive_rate = 0.0;
    config.prefilter.prefix_len = 2;
    config.prefilter.seed_samples = 0;
    config
}
