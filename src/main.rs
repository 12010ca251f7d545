//! cachectl
//!
//! Operator tool for persistent cache directories.
//!
//! ```text
//! cachectl inspect <cache-dir>                       lock state and holder
//! cachectl cleanup <cache-dir> --retention-days N    LRU cleanup now
//! cachectl sweep   <cache-dir>                       mark-and-sweep now
//! cachectl prune   <parent-dir> --prefix P --current N [--in-use N ...]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use persistent_cache::cleanup::{
    CacheVersion, CleanableStore, CleanupAction, CleanupProgressMonitor, CleanupReport, CleanupReporter,
    FileAccessTimeJournal, IndexedFileAccessTimeJournal, LeastRecentlyUsedCacheCleanup,
    ModificationTimeFileAccessTimeJournal, SystemClock, TracingCleanupReporter, UnusedVersionsCacheCleanup,
};
use persistent_cache::lock::{lock_file_for, LockFileAccess, LockStateProtocol};
use persistent_cache::{CacheSettings, FileLockManager, FineGrainedCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Inspect and clean persistent cache directories
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (YAML)
    #[arg(long, global = true, env = "PERSISTENT_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the lock state and current holder of a cache directory
    Inspect {
        cache_dir: PathBuf,
    },
    /// Delete entries not accessed within the retention period
    Cleanup {
        cache_dir: PathBuf,
        /// Defaults to `lru_retention_days` from the settings
        #[arg(long)]
        retention_days: Option<u64>,
        /// Depth of the entries below the cache directory
        #[arg(long, default_value = "1")]
        depth: usize,
        /// Access-time journal (JSON); entry modification times otherwise
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Run one mark-and-sweep pass over a fine-grained cache
    Sweep {
        cache_dir: PathBuf,
        /// Access-time journal, `<cache-dir>/.internal/journal.json` by default
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Delete cache directories of unused older versions
    Prune {
        parent_dir: PathBuf,
        /// Directory name prefix, e.g. `modules-`
        #[arg(long)]
        prefix: String,
        /// Current version
        #[arg(long)]
        current: String,
        /// Versions still used by other installations
        #[arg(long, num_args = 1..)]
        in_use: Vec<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let settings = load_settings(args.config.as_deref())?;
    match args.command {
        Command::Inspect { cache_dir } => inspect(&cache_dir, &settings),
        Command::Cleanup {
            cache_dir,
            retention_days,
            depth,
            journal,
        } => {
            let journal: Arc<dyn FileAccessTimeJournal> = match journal {
                Some(path) => Arc::new(IndexedFileAccessTimeJournal::open(&path, Arc::new(SystemClock))?),
                None => Arc::new(ModificationTimeFileAccessTimeJournal),
            };
            let retention_days = retention_days.unwrap_or(settings.lru_retention_days);
            let action = LeastRecentlyUsedCacheCleanup::new(
                depth,
                journal,
                Duration::from_secs(retention_days * 24 * 60 * 60),
                Arc::new(SystemClock),
            );
            run_action(&CleanableStore::new("cache", &cache_dir), &action)
        }
        Command::Sweep { cache_dir, journal } => {
            let journal_file = journal.unwrap_or_else(|| cache_dir.join(".internal").join("journal.json"));
            let journal = Arc::new(IndexedFileAccessTimeJournal::open(&journal_file, Arc::new(SystemClock))?);
            let cache = FineGrainedCache::open(
                "fine-grained cache",
                &cache_dir,
                FileLockManager::standalone(&settings),
                journal,
                settings,
            )?;
            let action = cache.cleanup_action();
            run_action(&cache.store(), &action)
        }
        Command::Prune {
            parent_dir,
            prefix,
            current,
            in_use,
        } => {
            let current: CacheVersion = current.parse()?;
            let in_use = in_use
                .iter()
                .map(|v| v.parse::<CacheVersion>())
                .collect::<persistent_cache::Result<Vec<_>>>()?;
            let action = UnusedVersionsCacheCleanup::new(&prefix, current).in_use(in_use);
            run_action(&CleanableStore::new("caches", &parent_dir), &action)
        }
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<CacheSettings> {
    let settings = match path {
        Some(path) => CacheSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => CacheSettings::default().with_env_overrides()?,
    };
    Ok(settings)
}

fn inspect(cache_dir: &Path, settings: &CacheSettings) -> anyhow::Result<()> {
    let lock_file = lock_file_for(cache_dir);
    let protocol = if settings.use_cross_version_lock_protocol {
        LockStateProtocol::Version1
    } else {
        LockStateProtocol::Default
    };
    let Some((state, holder)) = LockFileAccess::inspect(&lock_file, protocol)? else {
        println!("Lock file: {} (missing, not locked)", lock_file.display());
        return Ok(());
    };

    println!("Lock file: {}", lock_file.display());
    match state {
        Some(state) => {
            println!("  Dirty:     {}", state.is_dirty());
            match state.sequence() {
                Some(sequence) => println!("  Sequence:  {}", sequence),
                None => println!("  Sequence:  n/a"),
            }
        }
        None => println!("  State:     held exclusively by another process"),
    }
    if holder.is_unknown() {
        println!("  Holder:    none");
    } else {
        println!("  Holder:    pid {} ({})", holder.pid, holder.operation);
        println!("  Ping port: {}", holder.port);
    }
    Ok(())
}

fn run_action(store: &CleanableStore, action: &dyn CleanupAction) -> anyhow::Result<()> {
    if !store.base_dir().is_dir() {
        bail!("{} is not a directory", store.base_dir().display());
    }
    let started = Instant::now();
    let monitor = CleanupProgressMonitor::new();
    action.clean(store, &monitor)?;
    TracingCleanupReporter.report(&CleanupReport {
        store: store.base_dir().display().to_string(),
        deleted: monitor.deleted(),
        skipped: monitor.skipped(),
        previous_cleanup: None,
        duration: started.elapsed(),
    });
    info!("Deleted {} entries, kept {}", monitor.deleted(), monitor.skipped());
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
