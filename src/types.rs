//! Core data structures: the MDP instance, exploration policy, solver
//! configuration and the results handed back by each phase.
//!
//! The [`Mdp`] is built once and shared immutably across rayon workers for the
//! whole run. Result types own their sparse arrays; callers read them by
//! `(timestep, state[, action])`.

use num_bigint::BigUint;
use serde::{Serialize, Serializer};

use crate::constants::*;
use crate::error::{ComputeError, Result};
use crate::sharded_map::default_num_shards;
use crate::sparse_array::SparseTimestepStateArray;

/// Deterministic MDP with one reward per (state, action).
///
/// Flat row-major layout: entry `(state - 1) * num_actions + action`.
/// `next_states` already holds state numbers (1-based, 0 = terminal).
#[derive(Debug, Clone)]
pub struct Mdp {
    num_states: usize,
    num_actions: usize,
    next_states: Vec<usize>,
    rewards: Vec<f64>,
}

impl Mdp {
    /// Build from raw matrices: `transitions[s][a]` is a 0-based target or `-1`,
    /// `rewards[s][a]` the immediate reward. Both must share one rectangular shape.
    pub fn new(transitions: Vec<Vec<i64>>, rewards: Vec<Vec<f64>>) -> Result<Self> {
        let num_states = transitions.len();
        if num_states == 0 {
            return Err(ComputeError::InvalidMdp("no states".into()));
        }
        let num_actions = transitions[0].len();
        if num_actions == 0 {
            return Err(ComputeError::InvalidMdp("no actions".into()));
        }
        if rewards.len() != num_states {
            return Err(ComputeError::InvalidMdp(format!(
                "{} transition rows but {} reward rows",
                num_states,
                rewards.len()
            )));
        }

        let mut next_states = Vec::with_capacity(num_states * num_actions);
        let mut flat_rewards = Vec::with_capacity(num_states * num_actions);
        for (s, (t_row, r_row)) in transitions.iter().zip(&rewards).enumerate() {
            if t_row.len() != num_actions || r_row.len() != num_actions {
                return Err(ComputeError::InvalidMdp(format!(
                    "row {s} has {} transitions and {} rewards, expected {num_actions}",
                    t_row.len(),
                    r_row.len()
                )));
            }
            for (a, (&raw, &r)) in t_row.iter().zip(r_row).enumerate() {
                if raw < RAW_NO_TRANSITION || raw >= num_states as i64 {
                    return Err(ComputeError::InvalidMdp(format!(
                        "transition ({s}, {a}) = {raw} outside [-1, {}]",
                        num_states - 1
                    )));
                }
                if !r.is_finite() {
                    return Err(ComputeError::InvalidMdp(format!(
                        "reward ({s}, {a}) is not finite"
                    )));
                }
                next_states.push(state_from_raw(raw));
                flat_rewards.push(r);
            }
        }

        Ok(Self {
            num_states,
            num_actions,
            next_states,
            rewards: flat_rewards,
        })
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    /// Successor of `state` (1-based) under `action`; [`TERMINAL_STATE`] if undefined.
    #[inline(always)]
    pub fn next_state(&self, state: usize, action: usize) -> usize {
        debug_assert!(state >= 1 && state <= self.num_states, "state {state}");
        self.next_states[(state - 1) * self.num_actions + action]
    }

    #[inline(always)]
    pub fn reward(&self, state: usize, action: usize) -> f64 {
        debug_assert!(state >= 1 && state <= self.num_states, "state {state}");
        self.rewards[(state - 1) * self.num_actions + action]
    }

    /// All successors of `state`, indexed by action.
    #[inline(always)]
    pub fn next_states_row(&self, state: usize) -> &[usize] {
        let base = (state - 1) * self.num_actions;
        &self.next_states[base..base + self.num_actions]
    }

    /// All immediate rewards of `state`, indexed by action.
    #[inline(always)]
    pub fn rewards_row(&self, state: usize) -> &[f64] {
        let base = (state - 1) * self.num_actions;
        &self.rewards[base..base + self.num_actions]
    }
}

/// Per-(timestep, state, action) action distribution of the exploration policy.
///
/// A table with a single timestep is stationary and applies at every timestep.
#[derive(Debug, Clone)]
pub struct ExplorationPolicy {
    timesteps: usize,
    num_states: usize,
    num_actions: usize,
    probs: Vec<f64>,
}

impl ExplorationPolicy {
    /// `probabilities[t][s][a]` with `t` 0-based (timestep `t + 1`) and `s`
    /// 0-based (state `s + 1`). Each `[t][s]` row must sum to 1.
    pub fn new(probabilities: Vec<Vec<Vec<f64>>>) -> Result<Self> {
        let timesteps = probabilities.len();
        let num_states = probabilities.first().map_or(0, |p| p.len());
        let num_actions = probabilities
            .first()
            .and_then(|p| p.first())
            .map_or(0, |row| row.len());
        if timesteps == 0 || num_states == 0 || num_actions == 0 {
            return Err(ComputeError::InvalidMdp("empty exploration policy".into()));
        }

        let mut probs = Vec::with_capacity(timesteps * num_states * num_actions);
        for (t, per_state) in probabilities.iter().enumerate() {
            if per_state.len() != num_states {
                return Err(ComputeError::InvalidMdp(format!(
                    "policy timestep {t} has {} states, expected {num_states}",
                    per_state.len()
                )));
            }
            for (s, row) in per_state.iter().enumerate() {
                if row.len() != num_actions {
                    return Err(ComputeError::InvalidMdp(format!(
                        "policy row ({t}, {s}) has {} actions, expected {num_actions}",
                        row.len()
                    )));
                }
                if row.iter().any(|&p| !p.is_finite() || p < 0.0) {
                    return Err(ComputeError::InvalidMdp(format!(
                        "policy row ({t}, {s}) has a negative or non-finite probability"
                    )));
                }
                let sum: f64 = row.iter().sum();
                if (sum - 1.0).abs() > POLICY_SUM_TOLERANCE {
                    return Err(ComputeError::InvalidMdp(format!(
                        "policy row ({t}, {s}) sums to {sum}"
                    )));
                }
                probs.extend_from_slice(row);
            }
        }

        Ok(Self {
            timesteps,
            num_states,
            num_actions,
            probs,
        })
    }

    /// Check the table covers `mdp` for every timestep up to `horizon`.
    pub fn check_compatible(&self, mdp: &Mdp, horizon: usize) -> Result<()> {
        if self.num_states != mdp.num_states() || self.num_actions != mdp.num_actions() {
            return Err(ComputeError::ShapeMismatch(format!(
                "policy is {}x{}, MDP is {}x{}",
                self.num_states,
                self.num_actions,
                mdp.num_states(),
                mdp.num_actions()
            )));
        }
        if self.timesteps != 1 && self.timesteps != horizon {
            return Err(ComputeError::ShapeMismatch(format!(
                "policy covers {} timesteps, horizon is {horizon}",
                self.timesteps
            )));
        }
        Ok(())
    }

    /// Action distribution at (timestep, state), both 1-based.
    #[inline(always)]
    pub fn row(&self, timestep: usize, state: usize) -> &[f64] {
        let t = if self.timesteps == 1 { 0 } else { timestep - 1 };
        let base = (t * self.num_states + (state - 1)) * self.num_actions;
        &self.probs[base..base + self.num_actions]
    }

    #[inline(always)]
    pub fn probability(&self, timestep: usize, state: usize, action: usize) -> f64 {
        self.row(timestep, state)[action]
    }
}

/// Knobs shared by every phase.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Fan sweeps out over the rayon pool.
    pub parallel: bool,
    /// Shards per sparse array. Sequential runs use one.
    pub num_shards: usize,
    /// Tolerance for calling an action sub-optimal.
    pub reward_precision: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            num_shards: default_num_shards(),
            reward_precision: REWARD_PRECISION,
        }
    }
}

impl SolverConfig {
    /// Single shard, no fan-out.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            num_shards: 1,
            reward_precision: REWARD_PRECISION,
        }
    }
}

/// States reachable at each timestep from [`INITIAL_STATE`].
///
/// Every list is sorted and never contains [`TERMINAL_STATE`].
#[derive(Debug, Clone)]
pub struct ReachableStates {
    pub(crate) by_timestep: Vec<Vec<usize>>,
}

impl ReachableStates {
    /// Every state at every timestep, for sweeping the full state space
    /// instead of the part reachable from [`INITIAL_STATE`].
    pub fn all(num_states: usize, horizon: usize) -> Self {
        Self {
            by_timestep: vec![(1..=num_states).collect(); horizon],
        }
    }

    pub fn horizon(&self) -> usize {
        self.by_timestep.len()
    }

    /// Fail unless there is at least one timestep and every listed state is
    /// a state of `mdp`.
    pub fn check_compatible(&self, mdp: &Mdp) -> Result<()> {
        if self.by_timestep.is_empty() {
            return Err(ComputeError::ShapeMismatch(
                "reachable sets cover no timesteps".into(),
            ));
        }
        for (i, states) in self.by_timestep.iter().enumerate() {
            if let Some(&bad) = states
                .iter()
                .find(|&&s| s == TERMINAL_STATE || s > mdp.num_states())
            {
                return Err(ComputeError::OutOfBounds {
                    index: vec![i + 1, bad],
                    shape: vec![self.by_timestep.len(), mdp.num_states()],
                });
            }
        }
        Ok(())
    }

    /// Reachable states at `timestep` (1-based).
    pub fn states_at(&self, timestep: usize) -> &[usize] {
        &self.by_timestep[timestep - 1]
    }

    pub fn contains(&self, timestep: usize, state: usize) -> bool {
        self.by_timestep
            .get(timestep.wrapping_sub(1))
            .is_some_and(|states| states.binary_search(&state).is_ok())
    }

    /// Number of reachable (timestep, state) pairs.
    pub fn total(&self) -> usize {
        self.by_timestep.iter().map(Vec::len).sum()
    }
}

/// The three backward-induction surfaces plus the reachable sets they cover.
///
/// Q arrays are shaped `[horizon, num_states, num_actions]`, value arrays
/// `[horizon, num_states]`. Only reachable keys are materialized.
#[derive(Debug)]
pub struct ValueIterationResult {
    pub horizon: usize,
    pub exploration_qs: SparseTimestepStateArray<f64>,
    pub exploration_values: SparseTimestepStateArray<f64>,
    pub optimal_qs: SparseTimestepStateArray<f64>,
    pub optimal_values: SparseTimestepStateArray<f64>,
    pub worst_qs: SparseTimestepStateArray<f64>,
    pub worst_values: SparseTimestepStateArray<f64>,
    pub reachable: ReachableStates,
}

/// Returns from the initial state under each surface.
#[derive(Debug, Clone, Serialize)]
pub struct ValueSummary {
    pub optimal_return: f64,
    pub exploration_return: f64,
    pub worst_return: f64,
    pub reachable_pairs: usize,
}

impl ValueIterationResult {
    pub fn summary(&self) -> Result<ValueSummary> {
        Ok(ValueSummary {
            optimal_return: self.optimal_values.get(1, INITIAL_STATE)?,
            exploration_return: self.exploration_values.get(1, INITIAL_STATE)?,
            worst_return: self.worst_values.get(1, INITIAL_STATE)?,
            reachable_pairs: self.reachable.total(),
        })
    }
}

fn serialize_biguint<S: Serializer>(value: &BigUint, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_str_radix(10))
}

/// One lookahead depth that passed verification.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveHorizonRecord {
    pub k: usize,
    /// Sample count m_k required at the hardest visited state.
    #[serde(serialize_with = "serialize_biguint")]
    pub sample_bound: BigUint,
    /// Variance bound at that state.
    pub variance: f64,
    /// Gap between optimal and sub-optimal lookahead values at that state.
    pub gap: f64,
    /// H_k = k + log_A(m_k).
    pub horizon_estimate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveHorizonResult {
    pub records: Vec<EffectiveHorizonRecord>,
    /// Minimum H_k over all records.
    pub effective_horizon: f64,
}

impl EffectiveHorizonResult {
    /// Running minimum of H_k, one entry per record.
    pub fn running_minimum(&self) -> Vec<f64> {
        let mut best = f64::INFINITY;
        self.records
            .iter()
            .map(|r| {
                best = best.min(r.horizon_estimate);
                best
            })
            .collect()
    }
}
