//! Phase 1: forward reachability from the initial state.
//!
//! Timestep 1 holds only [`INITIAL_STATE`]. Timestep t+1 holds every state
//! some action leads to from a state reachable at t. Transitions into
//! [`TERMINAL_STATE`] end the episode and add nothing.
//!
//! Every later sweep iterates only over these sets, so (timestep, state) pairs
//! outside them are never materialized in any sparse array.

use std::time::Instant;

use tracing::info;

use crate::constants::*;
use crate::error::{ComputeError, Result};
use crate::progress::{Phase, ProgressObserver};
use crate::types::{Mdp, ReachableStates};

/// Compute the reachable-state set of every timestep `1..=horizon`.
///
/// Sequential: each timestep depends on the previous one and the work is
/// small next to value iteration.
pub fn compute_reachable_states(
    mdp: &Mdp,
    horizon: usize,
    observer: &dyn ProgressObserver,
) -> Result<ReachableStates> {
    if horizon == 0 {
        return Err(ComputeError::InvalidMdp("horizon must be positive".into()));
    }
    let start = Instant::now();
    observer.on_phase_start(Phase::Reachability, horizon);

    let num_states = mdp.num_states();
    let mut by_timestep: Vec<Vec<usize>> = Vec::with_capacity(horizon);
    let mut current = vec![INITIAL_STATE];

    for timestep in 1..=horizon {
        observer.on_timestep(Phase::Reachability, timestep, current.len());
        if timestep == horizon {
            by_timestep.push(current);
            break;
        }

        let mut seen = vec![false; num_states + 1];
        for &state in &current {
            for &next in mdp.next_states_row(state) {
                if !is_terminal(next) {
                    seen[next] = true;
                }
            }
        }
        let next_set: Vec<usize> = (1..=num_states).filter(|&s| seen[s]).collect();
        by_timestep.push(std::mem::replace(&mut current, next_set));
    }

    let reachable = ReachableStates { by_timestep };
    observer.on_phase_end(Phase::Reachability);
    info!(
        "Reachable (timestep, state) pairs: {} of {} ({:.2} ms)",
        reachable.total(),
        horizon * num_states,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    #[test]
    fn test_chain_with_sentinel() {
        // 1 -> 2 -> 3 -> (none)
        let mdp = Mdp::new(vec![vec![1], vec![2], vec![-1]], vec![vec![0.0]; 3]).unwrap();
        let reach = compute_reachable_states(&mdp, 5, &NoProgress).unwrap();
        assert_eq!(reach.horizon(), 5);
        assert_eq!(reach.states_at(1), &[1]);
        assert_eq!(reach.states_at(2), &[2]);
        assert_eq!(reach.states_at(3), &[3]);
        assert!(reach.states_at(4).is_empty());
        assert!(reach.states_at(5).is_empty());
        assert_eq!(reach.total(), 3);
    }

    #[test]
    fn test_branching_union() {
        let mdp = Mdp::new(
            vec![vec![1, 2], vec![0, 0], vec![3, 3], vec![3, 3]],
            vec![vec![0.0; 2]; 4],
        )
        .unwrap();
        let reach = compute_reachable_states(&mdp, 3, &NoProgress).unwrap();
        assert_eq!(reach.states_at(1), &[1]);
        assert_eq!(reach.states_at(2), &[2, 3]);
        assert_eq!(reach.states_at(3), &[1, 4]);
        assert!(reach.contains(3, 4));
        assert!(!reach.contains(3, 2));
        assert!(!reach.contains(0, 1));
        assert!(!reach.contains(4, 1));
    }

    #[test]
    fn test_zero_horizon_rejected() {
        let mdp = Mdp::new(vec![vec![0]], vec![vec![1.0]]).unwrap();
        assert!(compute_reachable_states(&mdp, 0, &NoProgress).is_err());
    }
}
