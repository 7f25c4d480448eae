//! Worker pool
//!
//! Runs independent search tasks (sampling a leaf, verifying a candidate set,
//! searching an offloaded subtree) on tokio's blocking pool, bounded by a
//! semaphore. Every task receives its own `CancelToken`, a child of the
//! session token, and is expected to poll it between fingerprint
//! computations. Cancellation is advisory: a task past its last check runs to
//! completion and its result is discarded.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Shared cooperative cancellation flag.
///
/// A child token observes every ancestor; cancelling a child leaves its
/// parent untouched.
#[derive(Debug, Clone)]
pub struct CancelToken {
    lineage: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            lineage: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    pub fn child(&self) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(Arc::new(AtomicBool::new(false)));
        Self { lineage }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.lineage.last() {
            own.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lineage.iter().any(|flag| flag.load(Ordering::Acquire))
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How concurrent results are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// First result to arrive wins; everything else is cancelled at once.
    FirstFound,
    /// Lowest task index wins, matching sequential left-to-right order.
    /// Tasks to the left of a hit keep running until they resolve.
    Leftmost,
}

/// Bounded-concurrency task runner
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task at most once and return the winning result, if any.
    ///
    /// Queued tasks whose token is cancelled before they get a permit never
    /// run. Panicking tasks are logged and count as "no result".
    pub async fn dispatch<T, F>(&self, tasks: Vec<F>, cancel: &CancelToken, merge: Merge) -> Option<T>
    where
        F: FnOnce(&CancelToken) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        if tasks.is_empty() {
            return None;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let tokens: Vec<CancelToken> = tasks.iter().map(|_| cancel.child()).collect();
        let mut outstanding: BTreeSet<usize> = (0..tasks.len()).collect();
        let mut set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let token = tokens[index].clone();
            set.spawn(async move {
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                if token.is_cancelled() {
                    return (index, None);
                }
                let handle = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    task(&token)
                });
                match handle.await {
                    Ok(result) => (index, result),
                    Err(e) => {
                        error!(task = index, error = %e, "search task panicked");
                        (index, None)
                    }
                }
            });
        }

        let mut best: Option<(usize, T)> = None;
        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "search task wrapper failed");
                    continue;
                }
            };
            outstanding.remove(&index);

            if let Some(value) = result {
                let better = best.as_ref().map_or(true, |(current, _)| index < *current);
                if better {
                    match merge {
                        Merge::FirstFound => tokens.iter().for_each(CancelToken::cancel),
                        Merge::Leftmost => tokens[index + 1..].iter().for_each(CancelToken::cancel),
                    }
                    best = Some((index, value));
                }
                if merge == Merge::FirstFound {
                    break;
                }
            }

            if let Some((winner, _)) = &best {
                if outstanding.range(..*winner).next().is_none() {
                    break;
                }
            }
        }

        if best.is_some() {
            tokens.iter().for_each(CancelToken::cancel);
            debug!(abandoned = outstanding.len(), "dispatch resolved with a match");
        }
        // Dropping the set detaches in-flight blocking work; results are discarded.
        drop(set);
        best.map(|(_, value)| value)
    }
}
