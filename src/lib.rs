//! # Effective Horizon — lookahead analysis of deterministic finite-horizon MDPs
//!
//! Computes three value functions for every reachable (timestep, state) of a
//! deterministic MDP using **backward induction**, then searches for the
//! smallest lookahead depth k at which acting greedily on a k-step backed-up
//! surface is guaranteed optimal, and derives an effective-horizon bound
//! from per-state variance estimates.
//!
//! ## Algorithm overview
//!
//! | Phase | Rust module | Description |
//! |-------|-------------|-------------|
//! | 1 | [`reachability`] | Forward pass from the initial state: reachable set per timestep |
//! | 2 | [`value_iteration`] | Backward induction from t=H down to t=1: exploration / optimal / worst Q-values and values |
//! | 3 | [`min_k`] | Alternate greedy verification sweeps with Bellman backups until greedy is optimal |
//! | 4 | [`effective_horizon`] | Phase 3 plus gap/variance bookkeeping and the sample bound m_k per passing k |
//!
//! All phases sweep one timestep at a time with rayon; the end of each
//! parallel sweep is the barrier before the next timestep.
//!
//! ## Storage
//!
//! Every per-(timestep, state) quantity lives in a
//! [`sparse_array::SparseTimestepStateArray`], which only allocates cells for
//! keys that are written. Cells are kept in a [`sharded_map::ShardedMap`]:
//! one `parking_lot::Mutex` per shard, so workers writing different states
//! rarely contend.
//!
//! ## State numbering
//!
//! States are 1-based; state 0 marks "no next state" (raw transition `-1`) and
//! is never swept. See [`constants`].

pub mod constants;
pub mod effective_horizon;
pub mod env_config;
pub mod error;
pub mod min_k;
pub mod progress;
pub mod reachability;
pub mod sharded_map;
pub mod simulation;
pub mod sparse_array;
pub mod storage;
pub mod sweep;
pub mod types;
pub mod value_iteration;

pub use error::{ComputeError, Result};
pub use types::{
    EffectiveHorizonRecord, EffectiveHorizonResult, ExplorationPolicy, Mdp, ReachableStates,
    SolverConfig, ValueIterationResult,
};
