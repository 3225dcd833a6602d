//! Per-timestep fan-out over a list of states.
//!
//! Every sweep in the crate processes one timestep at a time: all states of
//! the timestep run independently, and [`for_each_state`] returns only after
//! the last one finished. That return is the barrier between timesteps.

use rayon::prelude::*;

use crate::error::Result;

/// Largest entry of a Q row. Every backup and check uses this same fold so
/// that equal inputs give bit-identical maxima.
#[inline]
pub fn row_max(row: &[f64]) -> f64 {
    row.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Run `f` for every state, in parallel when `parallel` is set.
///
/// The first error stops the sweep and is returned; states already running
/// on other workers are allowed to finish.
pub fn for_each_state<F>(states: &[usize], parallel: bool, f: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Sync + Send,
{
    if parallel {
        states.par_iter().try_for_each(|&s| f(s))
    } else {
        states.iter().try_for_each(|&s| f(s))
    }
}
