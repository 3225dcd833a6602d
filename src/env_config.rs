//! Environment configuration shared by the binaries.
//!
//! Consolidates `RUST_LOG`, `RAYON_NUM_THREADS` and the solver overrides
//! `EFFECTIVE_HORIZON_SEQUENTIAL` / `EFFECTIVE_HORIZON_SHARDS`.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::types::SolverConfig;

/// Install the `tracing` subscriber. Filter from `RUST_LOG`, default `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Read `RAYON_NUM_THREADS` (fallback `OMP_NUM_THREADS`, default: available
/// parallelism) and build the rayon global pool. Returns the thread count.
///
/// Tolerates an already-initialized pool.
pub fn init_rayon_threads() -> usize {
    let num_threads = std::env::var("RAYON_NUM_THREADS")
        .or_else(|_| std::env::var("OMP_NUM_THREADS"))
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
    {
        warn!("Rayon pool already initialized: {e}");
    }
    let active = rayon::current_num_threads();
    info!("Rayon threads: {}", active);
    active
}

impl SolverConfig {
    /// Defaults adjusted by `EFFECTIVE_HORIZON_SEQUENTIAL=1` and
    /// `EFFECTIVE_HORIZON_SHARDS=<n>`.
    pub fn from_env() -> Self {
        let sequential = std::env::var("EFFECTIVE_HORIZON_SEQUENTIAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mut config = if sequential {
            SolverConfig::sequential()
        } else {
            SolverConfig::default()
        };
        if let Some(shards) = std::env::var("EFFECTIVE_HORIZON_SHARDS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            config.num_shards = shards;
        }
        config
    }
}
