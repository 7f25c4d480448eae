//! Search session
//!
//! Owns every component for one run and drives the search one window at a
//! time. A window is partition-built; its split-node keys, scan leaves and
//! offloaded leaves become pool tasks. Progress is saved after every
//! sampling round and every finished window.
//!
//! Exhaustive mode searches each leaf key by key, merging so the leftmost
//! (pre-order) match wins, and is the only mode that can prove absence.
//! Triage mode hands each leaf to a cheap pipeline (prefilter gate, adaptive
//! sampling, candidate verification, refinement) and only spends key-by-key
//! work where the prefilter opens on a small enough leaf. Leaves it passes
//! over are recorded in the checkpoint as deferred; a later exhaustive-mode
//! session over the same state searches them.

use crate::checkpoint::{Checkpoint, CheckpointStore, Durability, Progress, PromisingEntry, PromisingLog};
use crate::config::{SearchConfig, SearchMode};
use crate::delegate::{DelegateOutcome, ExternalDelegate};
use crate::error::{Result, SearchError};
use crate::oracle::FingerprintOracle;
use crate::partition::{Coverage, NodeStore, PartitionTree, StorageKey};
use crate::pool::{CancelToken, Merge, WorkerPool};
use crate::prefilter::Prefilter;
use crate::range::{Key, SearchRange};
use crate::sampler::AdaptiveSampler;
use crate::target::Candidate;
use crate::verifier::Verifier;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

type Task = Box<dyn FnOnce(&CancelToken) -> Option<Key> + Send>;

/// Leaves of the current window that triage did not search in full
type SkipLog = Arc<Mutex<Vec<SearchRange>>>;

/// Result of one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Found(Key),
    /// Round finished without a match; more remain
    Continue,
    /// Every key of the domain was searched without a match
    Exhausted,
    /// Every window was triaged, but `deferred` leaves were never searched
    /// in full. Says nothing about absence.
    Inconclusive { deferred: usize },
    /// The session was cancelled mid-round; the round will be redone
    Cancelled,
}

/// Terminal state of `SearchSession::run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Key),
    Exhausted,
    /// Triage finished with leaves left unsearched
    Inconclusive { deferred: usize },
    /// Stopped by a round limit or cancellation; resumable
    InProgress,
}

/// What one round covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Window(SearchRange),
    /// A leaf an earlier triage pass left behind
    Deferred(SearchRange),
}

impl Work {
    fn range(&self) -> SearchRange {
        match self {
            Work::Window(range) | Work::Deferred(range) => *range,
        }
    }
}

/// How far triage got on one leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafVerdict {
    Found(Key),
    /// Every key was covered, by a scan or by the delegate
    Searched,
    Skipped,
}

fn lock(skipped: &SkipLog) -> MutexGuard<'_, Vec<SearchRange>> {
    skipped.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by every task of a session
struct Shared<O: ?Sized> {
    config: Arc<SearchConfig>,
    verifier: Verifier<O>,
    prefilter: Prefilter,
    sampler: AdaptiveSampler,
    store: Arc<NodeStore>,
    progress: Progress,
    journal: PromisingLog,
    delegate: Option<ExternalDelegate>,
    seed: u64,
}

pub struct SearchSession<O: ?Sized> {
    shared: Arc<Shared<O>>,
    domain: SearchRange,
    pool: WorkerPool,
    cancel: CancelToken,
    resumed: bool,
}

impl<O> SearchSession<O>
where
    O: FingerprintOracle + ?Sized + 'static,
{
    /// Validate `config`, resume or start progress, sweep stale node blobs
    /// and seed the prefilter.
    pub fn open(config: SearchConfig, oracle: Arc<O>) -> Result<Self> {
        config.validate()?;
        let domain = config.domain()?;
        let target = Arc::new(config.target()?);
        std::fs::create_dir_all(&config.state_dir)
            .map_err(|e| SearchError::storage(&config.state_dir, e))?;

        let checkpoints = CheckpointStore::new(config.checkpoint_path());
        let (checkpoint, resumed) = checkpoints.resume_or(domain, &target);
        let progress = Progress::new(checkpoints, checkpoint);

        // Rounds are always rebuilt from the checkpoint, so no blob survives a restart
        let store = Arc::new(NodeStore::open(config.nodes_dir())?);
        let swept = store.sweep(&HashSet::new())?;
        if swept > 0 {
            info!(swept, "removed node blobs left by an earlier run");
        }

        let seed = config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let prefilter = Prefilter::seeded(
            config.prefilter.size,
            config.prefilter.false_positive_rate,
            config.prefilter.prefix_len,
            &target,
            oracle.as_ref(),
            &domain,
            config.prefilter.seed_samples,
            &mut rng,
        )?;
        let sampler = AdaptiveSampler::new(config.sampling)?;

        let delegate = match &config.delegate {
            Some(delegate) => match ExternalDelegate::resolve(delegate) {
                Ok(resolved) => {
                    info!(program = %resolved.program().display(), "external delegate enabled");
                    Some(resolved)
                }
                Err(e) => {
                    warn!(error = %e, "external delegate disabled");
                    None
                }
            },
            None => None,
        };

        info!(
            domain = %domain,
            mode = %config.mode,
            workers = config.workers,
            prefilter_fp_rate = prefilter.false_positive_rate(),
            resumed,
            seed,
            "search session opened"
        );

        let pool = WorkerPool::new(config.workers);
        let journal = PromisingLog::new(config.promising_path());
        Ok(Self {
            shared: Arc::new(Shared {
                verifier: Verifier::new(oracle, target),
                config: Arc::new(config),
                prefilter,
                sampler,
                store,
                progress,
                journal,
                delegate,
                seed,
            }),
            domain,
            pool,
            cancel: CancelToken::new(),
            resumed,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.shared.config
    }

    pub fn domain(&self) -> SearchRange {
        self.domain
    }

    /// Whether progress was picked up from an earlier checkpoint
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn progress(&self) -> Checkpoint {
        self.shared.progress.snapshot()
    }

    pub fn prefilter(&self) -> &Prefilter {
        &self.shared.prefilter
    }

    pub fn fingerprints_computed(&self) -> u64 {
        self.shared.verifier.fingerprints_computed()
    }

    /// Handle that stops the session from another task
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Search the next window, or the next deferred leaf once every window
    /// has been passed over in exhaustive mode.
    pub async fn run_round(&self) -> RoundOutcome {
        let shared = &self.shared;
        let before = shared.progress.snapshot();
        if let Some(key) = before.found {
            if shared.verifier.is_match(key) {
                return RoundOutcome::Found(key);
            }
            warn!(key = %key, "saved match does not verify against the target, discarding it");
            shared.progress.record(|cp| cp.found = None);
        }

        let mode = shared.config.mode;
        let next_window = before
            .cursor
            .and_then(|cursor| self.domain.window_from(cursor, shared.config.window_size));
        let work = match (next_window, before.deferred.first()) {
            (Some(window), _) => Work::Window(window),
            (None, None) => return RoundOutcome::Exhausted,
            (None, Some(leaf)) if mode == SearchMode::Exhaustive => Work::Deferred(*leaf),
            (None, Some(_)) => {
                return RoundOutcome::Inconclusive {
                    deferred: before.deferred.len(),
                }
            }
        };
        let range = work.range();

        info!(range = %range, mode = %mode, deferred = matches!(work, Work::Deferred(_)), "searching");
        let fingerprints_before = shared.verifier.fingerprints_computed();
        let skipped = SkipLog::default();
        let (tasks, merge) = match mode {
            SearchMode::Exhaustive => (self.exhaustive_tasks(range), Merge::Leftmost),
            // A full fingerprint match is the answer wherever it turns up
            SearchMode::Triage => (self.triage_tasks(range, &skipped), Merge::FirstFound),
        };
        let found = self.pool.dispatch(tasks, &self.cancel, merge).await;

        let sampled = shared.progress.snapshot().samples_drawn - before.samples_drawn;
        let verified = (shared.verifier.fingerprints_computed() - fingerprints_before).saturating_sub(sampled);

        if let Some(key) = found {
            shared.progress.record(|cp| {
                cp.keys_verified += verified;
                cp.found = Some(key);
            });
            info!(key = %key, hex = %format_args!("{:#x}", key), range = %range, "match found");
            return RoundOutcome::Found(key);
        }

        if self.cancel.is_cancelled() {
            shared.progress.record(|cp| cp.keys_verified += verified);
            info!(range = %range, "round interrupted, it will be searched again");
            return RoundOutcome::Cancelled;
        }

        let mut skipped = std::mem::take(&mut *lock(&skipped));
        skipped.sort();
        let durability = shared.progress.record(|cp| {
            cp.keys_verified += verified;
            match work {
                Work::Window(window) => cp.complete_window(window, &skipped),
                Work::Deferred(leaf) => cp.complete_deferred(leaf),
            }
        });
        if durability == Durability::Memory {
            warn!(range = %range, "round progress is held in memory only");
        }

        let after = shared.progress.snapshot();
        debug!(
            range = %range,
            verified,
            sampled,
            skipped = skipped.len(),
            offloads = shared.store.offloads(),
            windows = after.windows_completed,
            "round finished"
        );
        if after.is_exhausted() {
            info!(domain = %self.domain, "domain exhausted without a match");
            RoundOutcome::Exhausted
        } else if after.cursor.is_none() && mode == SearchMode::Triage {
            info!(
                deferred = after.deferred.len(),
                "triage pass finished; deferred leaves need an exhaustive pass"
            );
            RoundOutcome::Inconclusive {
                deferred: after.deferred.len(),
            }
        } else {
            RoundOutcome::Continue
        }
    }

    /// Run rounds until a match, a terminal outcome, cancellation or
    /// `max_rounds`.
    pub async fn run(&self, max_rounds: Option<u64>) -> SearchOutcome {
        let mut rounds = 0u64;
        loop {
            if self.cancel.is_cancelled() || max_rounds.map_or(false, |max| rounds >= max) {
                return SearchOutcome::InProgress;
            }
            match self.run_round().await {
                RoundOutcome::Found(key) => return SearchOutcome::Found(key),
                RoundOutcome::Exhausted => return SearchOutcome::Exhausted,
                RoundOutcome::Inconclusive { deferred } => return SearchOutcome::Inconclusive { deferred },
                RoundOutcome::Cancelled => return SearchOutcome::InProgress,
                RoundOutcome::Continue => rounds += 1,
            }
        }
    }

    fn exhaustive_tasks(&self, range: SearchRange) -> Vec<Task> {
        let shape = self.shared.config.tree_shape();
        let chunk = self.shared.config.scan_chunk;
        let tree = PartitionTree::build(range, shape, self.shared.store.clone());
        tree.coverage()
            .into_iter()
            .map(|piece| -> Task {
                let shared = self.shared.clone();
                match piece {
                    Coverage::Key(key) => Box::new(move |token: &CancelToken| shared.verifier.verify_keys([key], token)),
                    Coverage::Scan(leaf) => Box::new(move |token: &CancelToken| {
                        shared.verifier.verify_range_parallel(leaf, chunk, token)
                    }),
                    Coverage::Offloaded(node) => Box::new(move |token: &CancelToken| {
                        let mut subtree = PartitionTree::open(node, shape, shared.store.clone());
                        let found = subtree.search(&shared.verifier, token);
                        subtree.collect_garbage();
                        found
                    }),
                }
            })
            .collect()
    }

    fn triage_tasks(&self, range: SearchRange, skipped: &SkipLog) -> Vec<Task> {
        let tree = PartitionTree::build(range, self.shared.config.tree_shape(), self.shared.store.clone());
        tree.coverage()
            .into_iter()
            .map(|piece| -> Task {
                let shared = self.shared.clone();
                let skipped = skipped.clone();
                match piece {
                    Coverage::Key(key) => Box::new(move |token: &CancelToken| shared.verifier.verify_keys([key], token)),
                    Coverage::Scan(leaf) => Box::new(move |token: &CancelToken| shared.triage(leaf, &skipped, token)),
                    Coverage::Offloaded(node) => {
                        Box::new(move |token: &CancelToken| shared.triage_offloaded(node, &skipped, token))
                    }
                }
            })
            .collect()
    }
}

impl<O> Shared<O>
where
    O: FingerprintOracle + ?Sized,
{
    fn leaf_rng(&self, leaf: SearchRange) -> StdRng {
        let lower = leaf.lower();
        let mix = (lower as u64) ^ ((lower >> 64) as u64).rotate_left(29);
        StdRng::seed_from_u64(self.seed ^ mix)
    }

    fn triage_offloaded(&self, node: StorageKey, skipped: &SkipLog, cancel: &CancelToken) -> Option<Key> {
        let leaf = self.store.load(&node).range;
        let found = self.triage(leaf, skipped, cancel);
        if !cancel.is_cancelled() {
            self.store.delete(&node);
        }
        found
    }

    fn triage(&self, leaf: SearchRange, skipped: &SkipLog, cancel: &CancelToken) -> Option<Key> {
        match self.triage_leaf(leaf, cancel) {
            LeafVerdict::Found(key) => Some(key),
            LeafVerdict::Searched => None,
            LeafVerdict::Skipped => {
                lock(skipped).push(leaf);
                None
            }
        }
    }

    /// Gate, sample, verify and refine one leaf.
    fn triage_leaf(&self, leaf: SearchRange, cancel: &CancelToken) -> LeafVerdict {
        let mut rng = self.leaf_rng(leaf);
        let target = self.verifier.target();
        let prefix_len = self.prefilter.prefix_len();
        let chunk = self.config.scan_chunk;

        let mut gate_open = false;
        for _ in 0..self.config.gate_checks {
            if cancel.is_cancelled() {
                return LeafVerdict::Skipped;
            }
            let key = rng.gen_range(leaf.lower()..=leaf.upper());
            let Some(checked) = self.verifier.candidate(key) else { continue };
            if target.matches(&checked.fingerprint) {
                return LeafVerdict::Found(key);
            }
            gate_open |= self.prefilter.contains(checked.fingerprint.prefix(prefix_len));
        }

        let report = self.sampler.sample(leaf, &self.verifier, &mut rng, cancel, |round| {
            self.progress.record(|cp| {
                cp.samples_drawn += round.size;
                cp.sample_rounds += 1;
            });
        });
        if report.cancelled {
            return LeafVerdict::Skipped;
        }

        if !report.promising.is_empty() {
            gate_open |= report
                .promising
                .iter()
                .any(|c| self.prefilter.contains(c.fingerprint.prefix(prefix_len)));
            self.note_promising(leaf, &report.promising);

            if let Some(key) = self.verifier.verify_candidates_parallel(&report.promising, cancel) {
                return LeafVerdict::Found(key);
            }
            for candidate in &report.promising {
                let Some(window) = leaf.window_around(candidate.key, self.config.refine_radius) else { continue };
                if let Some(key) = self.verifier.verify_range_parallel(window, chunk, cancel) {
                    debug!(key = %key, around = %candidate.key, "match found while refining");
                    return LeafVerdict::Found(key);
                }
            }
        }

        if cancel.is_cancelled() {
            return LeafVerdict::Skipped;
        }
        if !gate_open {
            debug!(leaf = %leaf, "prefilter gate closed, deferring leaf");
            return LeafVerdict::Skipped;
        }
        if leaf.len() <= self.config.exhaustive_limit {
            debug!(leaf = %leaf, "gate open, verifying leaf exhaustively");
            return match self.verifier.verify_range_parallel(leaf, chunk, cancel) {
                Some(key) => LeafVerdict::Found(key),
                None if cancel.is_cancelled() => LeafVerdict::Skipped,
                None => LeafVerdict::Searched,
            };
        }
        self.delegate_leaf(leaf)
    }

    /// Journal close candidates and feed every promising prefix to the filter.
    fn note_promising(&self, leaf: SearchRange, promising: &[Candidate]) {
        let target = self.verifier.target().fingerprint();
        let now = Utc::now();
        let entries: Vec<PromisingEntry> = promising
            .iter()
            .map(|c| PromisingEntry {
                key: c.key,
                fingerprint: c.fingerprint.clone(),
                shared_positions: c.fingerprint.shared_positions(target),
                found_at: now,
            })
            .filter(|entry| entry.shared_positions >= self.config.journal_min_shared)
            .collect();
        for candidate in promising {
            self.prefilter.insert(candidate.fingerprint.as_str());
        }
        self.journal.append(&entries);
        let best = promising
            .iter()
            .map(|c| c.fingerprint.shared_positions(target))
            .max()
            .unwrap_or(0);
        info!(
            leaf = %leaf,
            promising = promising.len(),
            journaled = entries.len(),
            best_shared = best,
            "promising keys found"
        );
    }

    fn delegate_leaf(&self, leaf: SearchRange) -> LeafVerdict {
        let Some(delegate) = self.delegate.as_ref() else {
            debug!(leaf = %leaf, "leaf too large to scan and no delegate, deferring it");
            return LeafVerdict::Skipped;
        };
        match delegate.run(self.verifier.target(), leaf) {
            DelegateOutcome::Found(key) if leaf.contains(key) && self.verifier.is_match(key) => LeafVerdict::Found(key),
            DelegateOutcome::Found(key) => {
                warn!(key = %key, leaf = %leaf, "delegate key is outside the leaf or does not verify, deferring leaf");
                LeafVerdict::Skipped
            }
            DelegateOutcome::NotFound => LeafVerdict::Searched,
            DelegateOutcome::Failed(reason) => {
                warn!(leaf = %leaf, %reason, "delegate failed, deferring leaf");
                LeafVerdict::Skipped
            }
        }
    }
}
