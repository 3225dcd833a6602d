//! Phase 4: effective-horizon bound.
//!
//! Runs the minimum-k search on the exploration surface and, at every depth
//! k that passes verification, turns per-state gaps and variance bounds into
//! a sample-count requirement:
//!
//! ```text
//! m_k = ceil(16 · var / gap² · ln(2 · H · A^k)),  m_k ≥ 1
//! H_k = k + log_A(m_k)
//! ```
//!
//! where the maximum of `m_k` is taken over every state the greedy policy
//! visits. The effective horizon is the minimum H_k. Since H_k ≥ k, the
//! search stops as soon as k + 1 reaches the best estimate (or k reaches
//! the horizon).
//!
//! - **gap** at a visited state: best lookahead Q among optimal actions minus
//!   best lookahead Q among sub-optimal ones (`+∞` when every action is optimal).
//! - **variance bound** per action, at depth 1:
//!   `(Q_expl − Q_worst) · (Q_opt − Q_worst)`; each backup replaces it with
//!   the largest bound among next-state actions still in play. A state's
//!   variance is the largest bound over its actions.
//!
//! `A^k` overflows `u64` quickly, so the log term and `m_k` use `BigUint`.

use std::f64::consts::LN_2;
use std::time::Instant;

use num_bigint::BigUint;
use num_traits::{FromPrimitive, One, ToPrimitive};
use tracing::{debug, info};

use crate::constants::*;
use crate::error::{ComputeError, Result};
use crate::min_k::{lookahead_row, verification_sweep};
use crate::progress::{Phase, ProgressObserver};
use crate::sparse_array::SparseTimestepStateArray;
use crate::sweep::{for_each_state, row_max};
use crate::types::{
    EffectiveHorizonRecord, EffectiveHorizonResult, Mdp, SolverConfig, ValueIterationResult,
};

/// Natural log of an arbitrarily large integer.
pub fn ln_biguint(n: &BigUint) -> f64 {
    let shift = n.bits().saturating_sub(64);
    let top = (n >> shift).to_f64().unwrap_or(f64::MAX);
    top.ln() + shift as f64 * LN_2
}

/// `ln(2 · horizon · num_actions^k)`.
pub fn union_bound_log(horizon: usize, num_actions: usize, k: usize) -> f64 {
    let count = BigUint::from(2 * horizon) * BigUint::from(num_actions).pow(k as u32);
    ln_biguint(&count)
}

/// Samples needed to separate a gap of `gap` under variance `variance`.
///
/// Returns `None` if the requirement does not fit in a float.
pub fn sample_bound(variance: f64, gap: f64, log_term: f64) -> Option<BigUint> {
    if gap.is_infinite() || variance <= 0.0 {
        return Some(BigUint::one());
    }
    let m = (16.0 * variance / (gap * gap) * log_term).ceil();
    if !m.is_finite() {
        return None;
    }
    Some(BigUint::from_f64(m)?.max(BigUint::one()))
}

/// `k + log_A(m_k)`, with `m_k = 1` contributing nothing.
pub fn horizon_estimate(k: usize, m: &BigUint, num_actions: usize) -> f64 {
    if m.is_one() || num_actions < 2 {
        return k as f64;
    }
    k as f64 + ln_biguint(m) / (num_actions as f64).ln()
}

/// Depth-1 variance bounds over every reachable (timestep, state, action).
fn initial_variance_bounds(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    config: &SolverConfig,
) -> Result<SparseTimestepStateArray<f64>> {
    let vars = SparseTimestepStateArray::new(
        &[vi.horizon, mdp.num_states(), mdp.num_actions()],
        f64::NAN,
        config.num_shards,
    )?;
    for timestep in 1..=vi.horizon {
        for_each_state(vi.reachable.states_at(timestep), config.parallel, |state| {
            let expl = vi.exploration_qs.cell(timestep, state)?;
            let opt = vi.optimal_qs.cell(timestep, state)?;
            let worst = vi.worst_qs.cell(timestep, state)?;
            let row: Vec<f64> = (0..expl.len())
                .map(|a| (expl[a] - worst[a]).max(0.0) * (opt[a] - worst[a]).max(0.0))
                .collect();
            vars.write_cell(timestep, state, &row)
        })?;
    }
    Ok(vars)
}

/// Bellman backup of the lookahead surface together with its variance bounds.
fn backup_with_variance(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    current_qs: &SparseTimestepStateArray<f64>,
    action_vars: &SparseTimestepStateArray<f64>,
    config: &SolverConfig,
    k: usize,
    observer: &dyn ProgressObserver,
) -> Result<()> {
    let phase = Phase::Backup { k };
    let precision = config.reward_precision;
    observer.on_phase_start(phase, vi.horizon);
    for timestep in 1..vi.horizon {
        let states = vi.reachable.states_at(timestep);
        for_each_state(states, config.parallel, |state| {
            let q_row = lookahead_row(mdp, current_qs, timestep, state)?;
            let mut var_row = vec![0.0; mdp.num_actions()];
            for (a, &next) in mdp.next_states_row(state).iter().enumerate() {
                if is_terminal(next) {
                    continue;
                }
                let next_max = current_qs.with_cell(timestep + 1, next, row_max)?;
                let next_opt = vi.optimal_qs.cell(timestep + 1, next)?;
                var_row[a] = action_vars.with_cell(timestep + 1, next, |next_vars| {
                    next_vars
                        .iter()
                        .zip(&next_opt)
                        .filter(|&(_, &opt)| opt >= next_max - precision)
                        .fold(0.0f64, |acc, (&v, _)| acc.max(v))
                })?;
            }
            current_qs.write_cell(timestep, state, &q_row)?;
            action_vars.write_cell(timestep, state, &var_row)
        })?;
        observer.on_timestep(phase, timestep, states.len());
    }
    observer.on_phase_end(phase);
    Ok(())
}

/// Largest sample requirement over the states recorded in `gaps`.
///
/// Ties go to the earliest (timestep, state). Runs after the sweep has joined.
fn hardest_state(
    gaps: &SparseTimestepStateArray<f64>,
    state_vars: &SparseTimestepStateArray<f64>,
    log_term: f64,
) -> Result<(BigUint, f64, f64)> {
    let mut entries: Vec<(usize, usize, f64)> = Vec::with_capacity(gaps.materialized_len());
    gaps.for_each_materialized(|t, s, cell| entries.push((t, s, cell[0])));
    entries.sort_by_key(|&(t, s, _)| (t, s));

    let mut best: Option<(BigUint, f64, f64)> = None;
    for (timestep, state, gap) in entries {
        let variance = state_vars.get(timestep, state)?;
        let m = sample_bound(variance, gap, log_term).ok_or(ComputeError::NumericInconsistency {
            quantity: "sample bound",
            timestep,
            state,
        })?;
        if best.as_ref().map_or(true, |(b, _, _)| m > *b) {
            best = Some((m, variance, gap));
        }
    }
    best.ok_or(ComputeError::EmptyReduction)
}

/// Effective-horizon bound on the exploration surface of `vi`.
pub fn compute_effective_horizon(
    mdp: &Mdp,
    vi: &ValueIterationResult,
    config: &SolverConfig,
    observer: &dyn ProgressObserver,
) -> Result<EffectiveHorizonResult> {
    let start = Instant::now();
    let horizon = vi.horizon;
    let num_states = mdp.num_states();
    let num_actions = mdp.num_actions();
    let precision = config.reward_precision;

    let current_qs = vi.exploration_qs.deep_clone();
    let action_vars = initial_variance_bounds(mdp, vi, config)?;

    let mut records = Vec::new();
    let mut best = f64::INFINITY;
    let mut k = 1;
    loop {
        let gaps = SparseTimestepStateArray::new(&[horizon, num_states], f64::NAN, config.num_shards)?;
        let state_vars =
            SparseTimestepStateArray::new(&[horizon, num_states], f64::NAN, config.num_shards)?;

        let passed = verification_sweep(mdp, vi, &current_qs, config, k, observer, |t, s, q, _| {
            let optimal_value = vi.optimal_values.get(t, s)?;
            let (best_optimal, best_suboptimal) = vi.optimal_qs.with_cell(t, s, |opt_q| {
                q.iter().zip(opt_q).fold(
                    (f64::NEG_INFINITY, f64::NEG_INFINITY),
                    |(bo, bs), (&qa, &oa)| {
                        if oa >= optimal_value - precision {
                            (bo.max(qa), bs)
                        } else {
                            (bo, bs.max(qa))
                        }
                    },
                )
            })?;
            let gap = best_optimal - best_suboptimal;
            if gap.is_nan() || gap <= 0.0 {
                return Ok(false);
            }
            let variance = action_vars.with_cell(t, s, row_max)?.max(0.0);
            gaps.set(t, s, gap)?;
            state_vars.set(t, s, variance)?;
            Ok(true)
        })?;
        observer.on_iteration(k, passed);

        if passed {
            let log_term = union_bound_log(horizon, num_actions, k);
            let (sample_bound, variance, gap) = hardest_state(&gaps, &state_vars, log_term)?;
            let estimate = horizon_estimate(k, &sample_bound, num_actions);
            best = best.min(estimate);
            debug!("k={k} passed: m_k={sample_bound} var={variance:.4} gap={gap:.4} H_k={estimate:.3}");
            records.push(EffectiveHorizonRecord {
                k,
                sample_bound,
                variance,
                gap,
                horizon_estimate: estimate,
            });
        }

        // H_{k+1} >= k + 1, so a deeper surface cannot beat `best` once k + 1 reaches it.
        if k >= horizon || (k + 1) as f64 >= best {
            break;
        }
        backup_with_variance(mdp, vi, &current_qs, &action_vars, config, k, observer)?;
        k += 1;
    }

    info!(
        "Effective horizon {:.3} after {} depths ({} passed) in {:.2}s",
        best,
        k,
        records.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(EffectiveHorizonResult {
        records,
        effective_horizon: best,
    })
}
