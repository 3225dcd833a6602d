//! End-to-end scenarios: small hand-checked MDPs run through every phase.

use effective_horizon::constants::*;
use effective_horizon::effective_horizon::compute_effective_horizon;
use effective_horizon::min_k::{compute_min_k, MinKOptions};
use effective_horizon::progress::{NoProgress, Phase, ProgressObserver};
use effective_horizon::reachability::compute_reachable_states;
use effective_horizon::simulation::simulate_exploration_returns;
use effective_horizon::storage::{parse_mdp, parse_policy};
use effective_horizon::value_iteration::{value_iteration, value_iteration_with_reachable};
use effective_horizon::{ComputeError, ExplorationPolicy, Mdp, ReachableStates, SolverConfig};

use std::sync::atomic::{AtomicUsize, Ordering};

fn config() -> SolverConfig {
    SolverConfig::default()
}

#[test]
fn test_self_loops_swept_densely() {
    // Every state loops on itself: V(1,s1)=2, V(2,s1)=1, V(1,s2)=0.
    let mdp = Mdp::new(vec![vec![0], vec![1]], vec![vec![1.0], vec![0.0]]).unwrap();
    let vi = value_iteration_with_reachable(&mdp, ReachableStates::all(2, 2), None, &config(), &NoProgress)
        .unwrap();
    assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 2.0);
    assert_eq!(vi.optimal_values.get(2, 1).unwrap(), 1.0);
    assert_eq!(vi.optimal_values.get(1, 2).unwrap(), 0.0);
    assert_eq!(vi.exploration_values.get(1, 1).unwrap(), 2.0);
    assert_eq!(vi.worst_values.get(1, 1).unwrap(), 2.0);

    let k = compute_min_k(&mdp, &vi, MinKOptions::default(), &config(), &NoProgress).unwrap();
    assert_eq!(k, 1);
}

#[test]
fn test_one_action_chain_into_absorbing_state() {
    let mdp = Mdp::new(vec![vec![1], vec![1]], vec![vec![1.0], vec![0.0]]).unwrap();
    let vi = value_iteration(&mdp, 2, None, &config(), &NoProgress).unwrap();
    assert_eq!(vi.reachable.states_at(1), &[1]);
    assert_eq!(vi.reachable.states_at(2), &[2]);
    assert_eq!(vi.summary().unwrap().optimal_return, 1.0);
    assert_eq!(
        compute_min_k(&mdp, &vi, MinKOptions::default(), &config(), &NoProgress).unwrap(),
        1
    );
}

#[test]
fn test_chain_ending_in_no_next_state() {
    // 1 -> 2 -> 3 -> (none); the only reward is on the 2 -> 3 transition.
    let mdp = Mdp::new(vec![vec![1], vec![2], vec![-1]], vec![vec![0.0], vec![1.0], vec![0.0]]).unwrap();
    let horizon = 5;
    let reachable = compute_reachable_states(&mdp, horizon, &NoProgress).unwrap();
    for t in 1..=horizon {
        assert!(!reachable.contains(t, TERMINAL_STATE));
    }
    assert!(reachable.states_at(4).is_empty());

    let vi = value_iteration(&mdp, horizon, None, &config(), &NoProgress).unwrap();
    assert_eq!(vi.optimal_values.get(1, 1).unwrap(), 1.0);
    assert_eq!(vi.optimal_values.get(3, 3).unwrap(), 0.0);

    for start_with_rewards in [false, true] {
        let k = compute_min_k(&mdp, &vi, MinKOptions { start_with_rewards }, &config(), &NoProgress)
            .unwrap();
        assert!(k >= 1 && k <= horizon);
    }
}

#[test]
fn test_quit_or_continue_needs_two_steps() {
    // Action 0 advances along the chain, action 1 quits with nothing.
    // The reward for advancing only shows up one step later.
    let mdp = Mdp::new(
        vec![vec![1, -1], vec![2, -1], vec![-1, -1]],
        vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 0.0]],
    )
    .unwrap();
    let vi = value_iteration(&mdp, 3, None, &config(), &NoProgress).unwrap();
    let k = compute_min_k(
        &mdp,
        &vi,
        MinKOptions { start_with_rewards: true },
        &config(),
        &NoProgress,
    )
    .unwrap();
    assert_eq!(k, 2);
}

#[test]
fn test_effective_horizon_bounded_by_horizon_and_min_k() {
    let mdp = Mdp::new(
        vec![vec![1, 2], vec![3, 3], vec![3, 0], vec![-1, 3]],
        vec![vec![0.0, 0.5], vec![1.0, 0.0], vec![0.0, 0.5], vec![0.0, 0.25]],
    )
    .unwrap();
    let horizon = 4;
    let vi = value_iteration(&mdp, horizon, None, &config(), &NoProgress).unwrap();
    let k = compute_min_k(&mdp, &vi, MinKOptions::default(), &config(), &NoProgress).unwrap();
    let result = compute_effective_horizon(&mdp, &vi, &config(), &NoProgress).unwrap();

    assert_eq!(result.records[0].k, k);
    assert!(result.effective_horizon >= k as f64);
    assert!(result.records.iter().all(|r| r.k <= horizon));
    let json = serde_json::to_value(&result).unwrap();
    assert!(json["records"][0]["sample_bound"].is_string());
}

#[test]
fn test_effective_horizon_under_explicit_policy() {
    // State 1 picks state 2 (rewards 1 / 0) or state 3 (all 0). The policy
    // favours the rewarding action at state 2, so V_expl(2, s2) = 0.75.
    let mdp = Mdp::new(
        vec![vec![1, 2], vec![-1, -1], vec![-1, -1]],
        vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 0.0]],
    )
    .unwrap();
    let policy = ExplorationPolicy::new(vec![vec![
        vec![0.5, 0.5],
        vec![0.75, 0.25],
        vec![0.5, 0.5],
    ]])
    .unwrap();
    let vi = value_iteration(&mdp, 2, Some(&policy), &config(), &NoProgress).unwrap();
    assert_eq!(vi.exploration_qs.cell(1, 1).unwrap(), vec![0.75, 0.0]);

    let result = compute_effective_horizon(&mdp, &vi, &config(), &NoProgress).unwrap();
    let first = &result.records[0];
    assert_eq!(first.k, 1);
    // (Q_expl - Q_worst) * (Q_opt - Q_worst) = 0.75 * 1 for the rewarding branch.
    assert_eq!(first.variance, 0.75);
    assert_eq!(first.gap, 0.75);
    // ceil(16 * 0.75 / 0.75^2 * ln 8) = ceil(44.36)
    assert_eq!(first.sample_bound.to_string(), "45");
}

#[test]
fn test_rollout_mean_matches_exploration_value() {
    let mdp = Mdp::new(
        vec![vec![1, 2], vec![0, 2], vec![-1, 1]],
        vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 0.5]],
    )
    .unwrap();
    let horizon = 4;
    let vi = value_iteration(&mdp, horizon, None, &config(), &NoProgress).unwrap();
    let expected = vi.summary().unwrap().exploration_return;

    let rollouts = simulate_exploration_returns(&mdp, horizon, None, 40_000, 7).unwrap();
    assert_eq!(rollouts.episodes, 40_000);
    assert!(
        (rollouts.mean - expected).abs() < 0.1,
        "mean {} vs exploration value {}",
        rollouts.mean,
        expected
    );
    assert!(rollouts.min >= vi.summary().unwrap().worst_return - 1e-9);
    assert!(rollouts.max <= vi.summary().unwrap().optimal_return + 1e-9);
}

#[test]
fn test_rollouts_deterministic_for_seed() {
    let mdp = Mdp::new(vec![vec![0, -1]], vec![vec![1.0, 5.0]]).unwrap();
    let a = simulate_exploration_returns(&mdp, 6, None, 500, 3).unwrap();
    let b = simulate_exploration_returns(&mdp, 6, None, 500, 3).unwrap();
    assert_eq!(a.mean, b.mean);
    assert_eq!(a.std_dev, b.std_dev);
}

#[test]
fn test_json_inputs_with_policy() {
    let mdp = parse_mdp(r#"{"transitions": [[-1, -1]], "rewards": [[2.0, 6.0]]}"#).unwrap();
    let policy = parse_policy(r#"{"probabilities": [[[0.25, 0.75]]]}"#).unwrap();
    let vi = value_iteration(&mdp, 1, Some(&policy), &config(), &NoProgress).unwrap();
    assert_eq!(vi.summary().unwrap().exploration_return, 5.0);

    let bad = parse_mdp(r#"{"transitions": [[3]], "rewards": [[0.0]]}"#);
    assert!(matches!(bad, Err(ComputeError::InvalidMdp(_))));
}

#[derive(Default)]
struct CountingObserver {
    timesteps: AtomicUsize,
    iterations: AtomicUsize,
}

impl ProgressObserver for CountingObserver {
    fn on_timestep(&self, phase: Phase, _timestep: usize, _states: usize) {
        if matches!(phase, Phase::ValueIteration) {
            self.timesteps.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_iteration(&self, _k: usize, _passed: bool) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_observer_sees_every_timestep_and_depth() {
    let mdp = Mdp::new(
        vec![vec![1, -1], vec![2, -1], vec![-1, -1]],
        vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 0.0]],
    )
    .unwrap();
    let observer = CountingObserver::default();
    let vi = value_iteration(&mdp, 3, None, &config(), &observer).unwrap();
    assert_eq!(observer.timesteps.load(Ordering::Relaxed), 3);

    let k = compute_min_k(
        &mdp,
        &vi,
        MinKOptions { start_with_rewards: true },
        &config(),
        &observer,
    )
    .unwrap();
    assert_eq!(observer.iterations.load(Ordering::Relaxed), k);
}
