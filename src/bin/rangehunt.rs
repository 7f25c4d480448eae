//! rangehunt CLI tool
//!
//! Command-line interface for running and inspecting searches

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rangehunt::{
    CheckpointStore, DelegateConfig, DelegateOutcome, ExternalDelegate, FingerprintOracle,
    Hash160Oracle, Key, SearchConfig, SearchMode, SearchOutcome, SearchRange, SearchSession,
    SearchTarget,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rangehunt")]
#[command(about = "Resumable search of a key range for a target hash160")]
struct Cli {
    /// Increase log output (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the configured domain, resuming from the last checkpoint
    Search {
        #[command(flatten)]
        settings: Settings,
        /// Stop after this many windows (the search stays resumable)
        #[arg(long)]
        max_rounds: Option<u64>,
    },
    /// Print the saved checkpoint
    Status {
        #[command(flatten)]
        settings: Settings,
    },
    /// Print the hash160 fingerprint of a key
    Fingerprint {
        /// Key, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_key)]
        key: Key,
    },
    /// Run the external scanner over one range
    Delegate {
        #[arg(long, value_parser = parse_key)]
        lower: Key,
        #[arg(long, value_parser = parse_key)]
        upper: Key,
        /// Target hash160, hex
        #[arg(long, env = "RANGEHUNT_TARGET")]
        target: String,
        #[arg(long, default_value = "keyhunt", env = "RANGEHUNT_DELEGATE")]
        program: String,
        #[arg(long)]
        threads: Option<usize>,
    },
}

/// Flags layered over the JSON config file and the defaults
#[derive(Args)]
struct Settings {
    /// JSON config file
    #[arg(short, long, env = "RANGEHUNT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, value_parser = parse_key)]
    lower: Option<Key>,
    #[arg(long, value_parser = parse_key)]
    upper: Option<Key>,
    /// Target hash160, hex
    #[arg(long, env = "RANGEHUNT_TARGET")]
    target: Option<String>,
    /// Hex characters a promising key must share with the target
    #[arg(long)]
    prefix_length: Option<usize>,
    /// triage or exhaustive
    #[arg(long)]
    mode: Option<SearchMode>,
    #[arg(long, value_parser = parse_key)]
    window_size: Option<u128>,
    #[arg(long)]
    max_depth: Option<u32>,
    /// Leaves at most this long are scanned directly instead of offloaded
    #[arg(long, value_parser = parse_key)]
    min_offload_len: Option<u128>,
    /// Keys per parallel scan chunk
    #[arg(long, value_parser = parse_key)]
    scan_chunk: Option<u128>,
    #[arg(long, env = "RANGEHUNT_WORKERS")]
    workers: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Checkpoint, node blobs and journal directory
    #[arg(long, env = "RANGEHUNT_STATE_DIR")]
    state_dir: Option<PathBuf>,
    /// External scanner for large gated leaves
    #[arg(long, env = "RANGEHUNT_DELEGATE")]
    delegate: Option<String>,
}

impl Settings {
    fn resolve(self) -> Result<SearchConfig> {
        let mut config = match &self.config {
            Some(path) => SearchConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => SearchConfig::default(),
        };
        if let Some(lower) = self.lower {
            config.lower = lower;
        }
        if let Some(upper) = self.upper {
            config.upper = upper;
        }
        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(prefix_length) = self.prefix_length {
            config.prefix_length = prefix_length;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(window_size) = self.window_size {
            config.window_size = window_size;
        }
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(min_offload_len) = self.min_offload_len {
            config.min_offload_len = min_offload_len;
        }
        if let Some(scan_chunk) = self.scan_chunk {
            config.scan_chunk = scan_chunk;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(state_dir) = self.state_dir {
            config.state_dir = state_dir;
        }
        if let Some(program) = self.delegate {
            let mut delegate = config.delegate.take().unwrap_or_default();
            delegate.program = program;
            config.delegate = Some(delegate);
        }
        config.validate().context("Invalid search configuration")?;
        Ok(config)
    }
}

fn parse_key(s: &str) -> Result<Key, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Key::from_str_radix(hex, 16),
        None => s.parse::<Key>(),
    };
    parsed.map_err(|e| format!("invalid key '{}': {}", s, e))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Search {
            settings,
            max_rounds,
        } => {
            let config = settings.resolve()?;
            let session = SearchSession::open(config, Arc::new(Hash160Oracle::new()))
                .context("Failed to open search session")?;

            let cancel = session.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted, finishing the current tasks...");
                    cancel.cancel();
                }
            });

            println!("Searching {} ({} mode)", session.domain(), session.config().mode);
            let outcome = session.run(max_rounds).await;
            let progress = session.progress();

            match outcome {
                SearchOutcome::Found(key) => {
                    println!("✅ Match found: {} ({:#x})", key, key);
                }
                SearchOutcome::Exhausted => {
                    println!("Domain exhausted, no key matches the target");
                }
                SearchOutcome::Inconclusive { deferred } => {
                    println!(
                        "Triage pass finished without a match; {} leaves were not searched in full \
                         (rerun with --mode exhaustive to search them)",
                        deferred
                    );
                }
                SearchOutcome::InProgress => {
                    let next = progress
                        .cursor
                        .map_or_else(|| "-".to_string(), |c| format!("{:#x}", c));
                    println!("Search paused; next window starts at {}", next);
                }
            }
            println!(
                "windows: {}  samples: {} ({} rounds)  verified: {}",
                progress.windows_completed,
                progress.samples_drawn,
                progress.sample_rounds,
                progress.keys_verified
            );
        }
        Commands::Status { settings } => {
            let config = settings.resolve()?;
            let store = CheckpointStore::new(config.checkpoint_path());
            match store.load() {
                Some(checkpoint) => {
                    println!("Checkpoint: {}", store.path().display());
                    let domain = checkpoint.domain().context("Checkpoint holds an invalid domain")?;
                    println!("  domain:    {}", domain);
                    println!("  target:    {} (prefix {})", checkpoint.target, checkpoint.prefix_length);
                    match checkpoint.cursor {
                        Some(cursor) => {
                            println!("  cursor:    {:#x}", cursor);
                            if let Some(remaining) = checkpoint.remaining() {
                                println!("  remaining: {} keys", remaining.len());
                            }
                        }
                        None => println!("  cursor:    all windows passed"),
                    }
                    if !checkpoint.deferred.is_empty() {
                        println!("  deferred:  {} leaves awaiting an exhaustive pass", checkpoint.deferred.len());
                    }
                    println!("  windows:   {}", checkpoint.windows_completed);
                    println!("  samples:   {} in {} rounds", checkpoint.samples_drawn, checkpoint.sample_rounds);
                    println!("  verified:  {}", checkpoint.keys_verified);
                    if let Some(key) = checkpoint.found {
                        println!("  found:     {} ({:#x})", key, key);
                    }
                    println!("  saved at:  {}", checkpoint.saved_at);
                }
                None => println!("No checkpoint at {}", store.path().display()),
            }
        }
        Commands::Fingerprint { key } => {
            let fingerprint = Hash160Oracle::new()
                .fingerprint(key)
                .with_context(|| format!("Cannot fingerprint key {}", key))?;
            println!("{}", fingerprint);
        }
        Commands::Delegate {
            lower,
            upper,
            target,
            program,
            threads,
        } => {
            let range = SearchRange::new(lower, upper)?;
            let target = SearchTarget::new(&target, 1)?;
            let defaults = DelegateConfig::default();
            let config = DelegateConfig {
                program,
                threads: threads.unwrap_or(defaults.threads),
                ..defaults
            };
            let delegate = ExternalDelegate::resolve(&config)?;
            match delegate.run(&target, range) {
                DelegateOutcome::Found(key) => {
                    let verified = Hash160Oracle::new()
                        .fingerprint(key)
                        .map(|fp| target.matches(&fp))
                        .unwrap_or(false);
                    if verified {
                        println!("✅ Match found: {} ({:#x})", key, key);
                    } else {
                        println!("Delegate reported {:#x} but it does not match the target", key);
                    }
                }
                DelegateOutcome::NotFound => println!("No match in {}", range),
                DelegateOutcome::Failed(reason) => anyhow::bail!("Delegate failed: {}", reason),
            }
        }
    }

    Ok(())
}
