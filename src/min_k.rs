//! Phase 3: smallest lookahead depth k whose greedy policy is optimal.
//!
//! `current_qs` holds the depth-k lookahead surface. At k = 1 it is either
//! the raw rewards or the exploration Q-values; each Bellman backup deepens it
//! by one step:
//!
//! ```text
//! Q_{k+1}(t, s, a) = r(s, a) + max_a' Q_k(t+1, s', a')
//! ```
//!
//! Each round first runs a verification sweep forward from the initial state,
//! following every action tied for the greedy maximum. If a visited state
//! has a greedy action whose horizon-H optimal Q-value lags the optimal
//! value by more than the reward precision, depth k fails and one backup
//! is applied.
//!
//! At k = horizon the surface equals the optimal Q-surface, so the search
//! always terminates.
//!
//! ## Backup order
//!
//! Backups run timestep 1 upwards and update `current_qs` in place. The sweep
//! at t reads only t+1, which this backup has not touched yet, so every read
//! sees depth-k values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info};

use crate::constants::*;
use crate::error::{ComputeError, Result};
use crate::progress::{NoProgress, Phase, ProgressObserver};
use crate::sparse_array::SparseTimestepStateArray;
use crate::sweep::{for_each_state, row_max};
use crate::types::{Mdp, SolverConfig, ValueIterationResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct MinKOptions {
    /// Seed depth 1 with immediate rewards instead of exploration Q-values.
    pub start_with_rewards: bool,
}

/// Depth-1 lookahead surface over every reachable (timestep, state).
pub fn initial_lookahead_qs(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    start_with_rewards: bool,
    config: &SolverConfig,
) -> Result<SparseTimestepStateArray<f64>> {
    if !start_with_rewards {
        return Ok(vi.exploration_qs.deep_clone());
    }
    let qs = SparseTimestepStateArray::new(
        &[vi.horizon, mdp.num_states(), mdp.num_actions()],
        f64::NAN,
        config.num_shards,
    )?;
    for timestep in 1..=vi.horizon {
        for_each_state(vi.reachable.states_at(timestep), config.parallel, |state| {
            qs.write_cell(timestep, state, mdp.rewards_row(state))
        })?;
    }
    Ok(qs)
}

/// Forward sweep along greedy actions of `current_qs`, starting from the
/// initial state.
///
/// `check_state(timestep, state, q_row, max_q)` decides whether a visited
/// state is acceptable. The first rejection sets a shared flag: workers that
/// have not started their state yet skip it, and no later timestep is swept.
/// Successors of every action tied for the maximum are marked visited.
pub(crate) fn verification_sweep<F>(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    current_qs: &SparseTimestepStateArray<f64>,
    config: &SolverConfig,
    k: usize,
    observer: &dyn ProgressObserver,
    check_state: F,
) -> Result<bool>
where
    F: Fn(usize, usize, &[f64], f64) -> Result<bool> + Sync + Send,
{
    let horizon = vi.horizon;
    let phase = Phase::Verification { k };
    let visited =
        SparseTimestepStateArray::new(&[horizon, mdp.num_states()], false, config.num_shards)?;
    visited.set(1, INITIAL_STATE, true)?;
    let passes = AtomicBool::new(true);

    observer.on_phase_start(phase, horizon);
    for timestep in 1..=horizon {
        let states = vi.reachable.states_at(timestep);
        for_each_state(states, config.parallel, |state| {
            if !passes.load(Ordering::Relaxed) || !visited.get(timestep, state)? {
                return Ok(());
            }
            let q = current_qs.cell(timestep, state)?;
            let max_q = row_max(&q);
            if !max_q.is_finite() {
                return Err(ComputeError::NumericInconsistency {
                    quantity: "lookahead Q-value",
                    timestep,
                    state,
                });
            }
            if !check_state(timestep, state, &q, max_q)? {
                passes.store(false, Ordering::Relaxed);
                return Ok(());
            }
            if timestep < horizon {
                for (a, &next) in mdp.next_states_row(state).iter().enumerate() {
                    if q[a] >= max_q && !is_terminal(next) {
                        visited.set(timestep + 1, next, true)?;
                    }
                }
            }
            Ok(())
        })?;
        observer.on_timestep(phase, timestep, states.len());
        if !passes.load(Ordering::Relaxed) {
            debug!(k, timestep, "verification failed");
            break;
        }
    }
    observer.on_phase_end(phase);
    Ok(passes.load(Ordering::Relaxed))
}

/// True if no greedy action of `current_qs`, on any state the greedy policy
/// can visit, is sub-optimal under the horizon-H optimal Q-values.
pub fn greedy_policy_is_optimal(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    current_qs: &SparseTimestepStateArray<f64>,
    config: &SolverConfig,
) -> Result<bool> {
    verify_depth(mdp, vi, current_qs, config, 0, &NoProgress)
}

fn verify_depth(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    current_qs: &SparseTimestepStateArray<f64>,
    config: &SolverConfig,
    k: usize,
    observer: &dyn ProgressObserver,
) -> Result<bool> {
    let precision = config.reward_precision;
    verification_sweep(mdp, vi, current_qs, config, k, observer, |t, s, q, max_q| {
        let optimal_value = vi.optimal_values.get(t, s)?;
        vi.optimal_qs.with_cell(t, s, |opt_q| {
            q.iter()
                .zip(opt_q)
                .all(|(&qa, &oa)| qa < max_q || oa >= optimal_value - precision)
        })
    })
}

/// `r(s, a) + max_a' current_qs(t+1, s', a')` for every action of `state`.
pub(crate) fn lookahead_row(
    mdp: &Mdp,
    current_qs: &SparseTimestepStateArray<f64>,
    timestep: usize,
    state: usize,
) -> Result<Vec<f64>> {
    let mut row = mdp.rewards_row(state).to_vec();
    for (a, &next) in mdp.next_states_row(state).iter().enumerate() {
        if is_terminal(next) {
            continue;
        }
        row[a] += current_qs.with_cell(timestep + 1, next, row_max)?;
    }
    if row.iter().any(|q| !q.is_finite()) {
        return Err(ComputeError::NumericInconsistency {
            quantity: "backed-up Q-value",
            timestep,
            state,
        });
    }
    Ok(row)
}

/// One Bellman backup of every reachable (timestep, state) below the horizon.
pub fn bellman_backup(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    current_qs: &SparseTimestepStateArray<f64>,
    config: &SolverConfig,
    k: usize,
    observer: &dyn ProgressObserver,
) -> Result<()> {
    let phase = Phase::Backup { k };
    observer.on_phase_start(phase, vi.horizon);
    for timestep in 1..vi.horizon {
        let states = vi.reachable.states_at(timestep);
        for_each_state(states, config.parallel, |state| {
            let row = lookahead_row(mdp, current_qs, timestep, state)?;
            current_qs.write_cell(timestep, state, &row)
        })?;
        observer.on_timestep(phase, timestep, states.len());
    }
    observer.on_phase_end(phase);
    Ok(())
}

/// Smallest k ≥ 1 for which the greedy policy over the depth-k lookahead
/// surface never picks a sub-optimal action.
pub fn compute_min_k(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    options: MinKOptions,
    config: &SolverConfig,
    observer: &dyn ProgressObserver,
) -> Result<usize> {
    let start = Instant::now();
    let current_qs = initial_lookahead_qs(mdp, vi, options.start_with_rewards, config)?;

    let mut k = 1;
    loop {
        let passed = verify_depth(mdp, vi, &current_qs, config, k, observer)?;
        observer.on_iteration(k, passed);
        if passed {
            info!(
                "Minimum k = {} (horizon {}) in {:.2}s",
                k,
                vi.horizon,
                start.elapsed().as_secs_f64()
            );
            return Ok(k);
        }
        if k >= vi.horizon {
            // The full-depth surface is the optimal one and cannot fail.
            return Err(ComputeError::NumericInconsistency {
                quantity: "full-depth lookahead surface",
                timestep: 1,
                state: INITIAL_STATE,
            });
        }
        bellman_backup(mdp, vi, &current_qs, config, k, observer)?;
        k += 1;
    }
}
