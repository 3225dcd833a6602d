//! Phase 2: backward induction over the reachable (timestep, state) DAG.
//!
//! Processes timesteps from `horizon` down to 1. At the last timestep every
//! Q-value is the immediate reward; earlier timesteps add the successor's
//! value at timestep+1 under the matching surface:
//!
//! | Surface     | Q(t, s, a)                 | V(t, s)                          |
//! |-------------|----------------------------|----------------------------------|
//! | exploration | r(s, a) + V_expl(t+1, s')  | policy-weighted (or uniform) sum |
//! | optimal     | r(s, a) + V_opt(t+1, s')   | max over actions                 |
//! | worst       | r(s, a) + V_worst(t+1, s') | min over actions                 |
//!
//! A transition into the terminal state contributes no future value.
//!
//! Each timestep is one rayon sweep over its reachable states. A state reads
//! only timestep+1 values, which the previous sweep finished, and writes only
//! its own keys, so states of the same timestep never interact.

use std::time::Instant;

use tracing::info;

use crate::constants::*;
use crate::error::{ComputeError, Result};
use crate::progress::{Phase, ProgressObserver};
use crate::reachability::compute_reachable_states;
use crate::sparse_array::SparseTimestepStateArray;
use crate::sweep::{for_each_state, row_max};
use crate::types::{ExplorationPolicy, Mdp, ReachableStates, SolverConfig, ValueIterationResult};

/// Reachability followed by backward induction.
///
/// Without a policy the exploration surface averages uniformly over actions.
pub fn value_iteration(
    mdp: &Mdp,
    horizon: usize,
    policy: Option<&ExplorationPolicy>,
    config: &SolverConfig,
    observer: &dyn ProgressObserver,
) -> Result<ValueIterationResult> {
    let reachable = compute_reachable_states(mdp, horizon, observer)?;
    value_iteration_with_reachable(mdp, reachable, policy, config, observer)
}

/// Backward induction over precomputed reachable sets.
pub fn value_iteration_with_reachable(
    mdp: &Mdp,
    reachable: ReachableStates,
    policy: Option<&ExplorationPolicy>,
    config: &SolverConfig,
    observer: &dyn ProgressObserver,
) -> Result<ValueIterationResult> {
    reachable.check_compatible(mdp)?;
    let horizon = reachable.horizon();
    if let Some(p) = policy {
        p.check_compatible(mdp, horizon)?;
    }

    let num_states = mdp.num_states();
    let num_actions = mdp.num_actions();
    let q_shape = [horizon, num_states, num_actions];
    let v_shape = [horizon, num_states];
    let shards = config.num_shards;

    let result = ValueIterationResult {
        horizon,
        exploration_qs: SparseTimestepStateArray::new(&q_shape, f64::NAN, shards)?,
        exploration_values: SparseTimestepStateArray::new(&v_shape, f64::NAN, shards)?,
        optimal_qs: SparseTimestepStateArray::new(&q_shape, f64::NAN, shards)?,
        optimal_values: SparseTimestepStateArray::new(&v_shape, f64::NAN, shards)?,
        worst_qs: SparseTimestepStateArray::new(&q_shape, f64::NAN, shards)?,
        worst_values: SparseTimestepStateArray::new(&v_shape, f64::NAN, shards)?,
        reachable,
    };

    let total_start = Instant::now();
    observer.on_phase_start(Phase::ValueIteration, horizon);

    for timestep in (1..=horizon).rev() {
        let states = result.reachable.states_at(timestep);
        for_each_state(states, config.parallel, |state| {
            backup_state(mdp, policy, &result, timestep, state)
        })?;
        observer.on_timestep(Phase::ValueIteration, timestep, states.len());
    }

    observer.on_phase_end(Phase::ValueIteration);
    info!(
        "Value iteration: {} reachable pairs, horizon {} in {:.2}s",
        result.reachable.total(),
        horizon,
        total_start.elapsed().as_secs_f64()
    );
    Ok(result)
}

/// Compute all three Q rows and values for one (timestep, state).
fn backup_state(
    mdp: &Mdp,
    policy: Option<&ExplorationPolicy>,
    vi: &ValueIterationResult,
    timestep: usize,
    state: usize,
) -> Result<()> {
    let num_actions = mdp.num_actions();
    let rewards = mdp.rewards_row(state);
    let next_states = mdp.next_states_row(state);

    let mut expl_q = rewards.to_vec();
    let mut opt_q = rewards.to_vec();
    let mut worst_q = rewards.to_vec();

    if timestep < vi.horizon {
        for a in 0..num_actions {
            let next = next_states[a];
            if is_terminal(next) {
                continue;
            }
            expl_q[a] += vi.exploration_values.get(timestep + 1, next)?;
            opt_q[a] += vi.optimal_values.get(timestep + 1, next)?;
            worst_q[a] += vi.worst_values.get(timestep + 1, next)?;
        }
    }

    let optimal_value = row_max(&opt_q);
    let worst_value = worst_q.iter().copied().fold(f64::INFINITY, f64::min);
    let raw_exploration = match policy {
        Some(p) => p
            .row(timestep, state)
            .iter()
            .zip(&expl_q)
            .map(|(prob, q)| prob * q)
            .sum::<f64>(),
        None => expl_q.iter().sum::<f64>() / num_actions as f64,
    };

    let check = |quantity: &'static str, v: f64| {
        if v.is_finite() {
            Ok(())
        } else {
            Err(ComputeError::NumericInconsistency {
                quantity,
                timestep,
                state,
            })
        }
    };
    check("optimal value", optimal_value)?;
    check("worst value", worst_value)?;
    check("exploration value", raw_exploration)?;
    // Rounding can push the weighted sum just outside the [worst, optimal] band.
    let exploration_value = raw_exploration.max(worst_value).min(optimal_value);

    vi.exploration_qs.write_cell(timestep, state, &expl_q)?;
    vi.optimal_qs.write_cell(timestep, state, &opt_q)?;
    vi.worst_qs.write_cell(timestep, state, &worst_q)?;
    vi.exploration_values.set(timestep, state, exploration_value)?;
    vi.optimal_values.set(timestep, state, optimal_value)?;
    vi.worst_values.set(timestep, state, worst_value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    fn run(mdp: &Mdp, horizon: usize, policy: Option<&ExplorationPolicy>) -> ValueIterationResult {
        value_iteration(mdp, horizon, policy, &SolverConfig::default(), &NoProgress).unwrap()
    }

    #[test]
    fn test_two_state_chain_into_absorbing() {
        let mdp = Mdp::new(vec![vec![1], vec![1]], vec![vec![1.0], vec![0.0]]).unwrap();
        let vi = run(&mdp, 2, None);
        // Only state 1 is reachable at t=1, only state 2 at t=2.
        assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 1.0);
        assert_eq!(vi.optimal_values.get(2, 2).unwrap(), 0.0);
        assert!(vi.optimal_values.get(2, 1).unwrap().is_nan());
    }

    #[test]
    fn test_three_surfaces() {
        // State 1: action 0 -> state 2 (r=1), action 1 -> state 3 (r=0).
        // State 2: rewards 0 / 2. State 3: rewards 4 / -1.
        let mdp = Mdp::new(
            vec![vec![1, 2], vec![-1, -1], vec![-1, -1]],
            vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![4.0, -1.0]],
        )
        .unwrap();
        let vi = run(&mdp, 2, None);

        assert_eq!(vi.optimal_qs.cell(1, 1).unwrap(), vec![3.0, 4.0]);
        assert_eq!(vi.worst_qs.cell(1, 1).unwrap(), vec![1.0, -1.0]);
        assert_eq!(vi.exploration_qs.cell(1, 1).unwrap(), vec![2.0, 1.5]);
        assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 4.0);
        assert_eq!(vi.worst_values.get(1, 1).unwrap(), -1.0);
        assert_eq!(vi.exploration_values.get(1, 1).unwrap(), 1.75);
    }

    #[test]
    fn test_policy_weighted_exploration() {
        let mdp = Mdp::new(vec![vec![-1, -1]], vec![vec![2.0, 6.0]]).unwrap();
        let policy = ExplorationPolicy::new(vec![vec![vec![0.75, 0.25]]]).unwrap();
        let vi = run(&mdp, 1, Some(&policy));
        assert_eq!(vi.exploration_values.get(1, 1).unwrap(), 3.0);
    }

    #[test]
    fn test_policy_shape_checked() {
        let mdp = Mdp::new(vec![vec![-1, -1]], vec![vec![2.0, 6.0]]).unwrap();
        let policy = ExplorationPolicy::new(vec![vec![vec![1.0]]]).unwrap();
        let err = value_iteration(&mdp, 1, Some(&policy), &SolverConfig::default(), &NoProgress);
        assert!(matches!(err, Err(ComputeError::ShapeMismatch(_))));
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let mdp = Mdp::new(
            vec![vec![1, 2], vec![2, 0], vec![0, 1]],
            vec![vec![0.3, 1.0], vec![0.5, -0.2], vec![0.0, 0.7]],
        )
        .unwrap();
        let par = run(&mdp, 6, None);
        let seq = value_iteration(&mdp, 6, None, &SolverConfig::sequential(), &NoProgress).unwrap();
        for t in 1..=6 {
            for &s in par.reachable.states_at(t) {
                assert_eq!(
                    par.exploration_values.get(t, s).unwrap(),
                    seq.exploration_values.get(t, s).unwrap()
                );
                assert_eq!(par.optimal_values.get(t, s).unwrap(), seq.optimal_values.get(t, s).unwrap());
            }
        }
    }

    #[test]
    fn test_missing_successor_is_fatal() {
        // Reachable sets that omit state 2 at t=2 leave its value unwritten.
        let mdp = Mdp::new(vec![vec![1], vec![1]], vec![vec![1.0], vec![1.0]]).unwrap();
        let reachable = ReachableStates {
            by_timestep: vec![vec![1], vec![]],
        };
        let err = value_iteration_with_reachable(
            &mdp,
            reachable,
            None,
            &SolverConfig::default(),
            &NoProgress,
        );
        assert!(matches!(
            err,
            Err(ComputeError::NumericInconsistency { timestep: 1, state: 1, .. })
        ));
    }

    #[test]
    fn test_reachable_sets_checked_against_mdp() {
        let mdp = Mdp::new(vec![vec![0], vec![1]], vec![vec![1.0], vec![0.0]]).unwrap();
        let config = SolverConfig::sequential();

        let too_many_states =
            value_iteration_with_reachable(&mdp, ReachableStates::all(3, 2), None, &config, &NoProgress);
        assert!(matches!(
            too_many_states,
            Err(ComputeError::OutOfBounds { ref index, .. }) if index == &vec![1, 3]
        ));

        let no_timesteps =
            value_iteration_with_reachable(&mdp, ReachableStates::all(2, 0), None, &config, &NoProgress);
        assert!(matches!(no_timesteps, Err(ComputeError::ShapeMismatch(_))));

        let with_terminal = ReachableStates {
            by_timestep: vec![vec![0, 1]],
        };
        let err = value_iteration_with_reachable(&mdp, with_terminal, None, &config, &NoProgress);
        assert!(matches!(err, Err(ComputeError::OutOfBounds { .. })));
    }

    #[test]
    fn test_full_state_sweep() {
        // Both states loop on themselves; sweep all of them, not just reachable ones.
        let mdp = Mdp::new(vec![vec![0], vec![1]], vec![vec![1.0], vec![0.0]]).unwrap();
        let vi = value_iteration_with_reachable(
            &mdp,
            ReachableStates::all(2, 2),
            None,
            &SolverConfig::default(),
            &NoProgress,
        )
        .unwrap();
        assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 2.0);
        assert_eq!(vi.optimal_values.get(2, 1).unwrap(), 1.0);
        assert_eq!(vi.optimal_values.get(1, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_only_reachable_pairs_materialized() {
        let mdp = Mdp::new(vec![vec![1], vec![2], vec![-1]], vec![vec![1.0]; 3]).unwrap();
        let vi = run(&mdp, 4, None);
        assert_eq!(vi.optimal_values.materialized_len(), 3);
        assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 3.0);
        assert_eq!(vi.summary().unwrap().reachable_pairs, 3);
    }
}
