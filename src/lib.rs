//! rangehunt - resumable search of a huge key range for a target fingerprint
//!
//! The domain is walked one window at a time. Each window is bisected into a
//! partition tree whose deep levels live on disk, and its leaves are either
//! searched exhaustively or triaged by a prefix prefilter and an adaptive
//! sampler before any key-by-key work. Work runs on a bounded worker pool
//! with cooperative cancellation, and progress is checkpointed after every
//! round so a restarted process resumes where it stopped.
//!
//! A prefix match is only ever a signal. A key is reported as found when its
//! full fingerprint equals the target.

pub mod checkpoint;
pub mod config;
pub mod delegate;
pub mod error;
pub mod oracle;
pub mod partition;
pub mod pool;
pub mod prefilter;
pub mod range;
pub mod sampler;
pub mod session;
pub mod target;
pub mod verifier;

pub use checkpoint::{Checkpoint, CheckpointStore, Durability, Progress, PromisingEntry, PromisingLog};
pub use config::{DelegateConfig, PrefilterConfig, SearchConfig, SearchMode};
pub use delegate::{parse_delegate_output, DelegateOutcome, ExternalDelegate};
pub use error::{OracleError, Result, SearchError};
pub use oracle::{Fingerprint, FingerprintOracle, FnOracle, Hash160Oracle};
pub use partition::{Coverage, NodeRef, NodeStore, PartitionTree, StorageKey, TreeShape};
pub use pool::{CancelToken, Merge, WorkerPool};
pub use prefilter::{BloomFilter, Prefilter};
pub use range::{Key, SearchRange};
pub use sampler::{AdaptiveSampler, SamplingPolicy};
pub use session::{RoundOutcome, SearchOutcome, SearchSession};
pub use target::{Candidate, SearchTarget};
pub use verifier::Verifier;
