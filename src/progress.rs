//! Progress hooks for long sweeps.
//!
//! The solvers call a [`ProgressObserver`] at phase boundaries, once per
//! completed timestep and once per lookahead depth. They never depend on what
//! the observer does with it. [`LogProgress`] is the stock implementation and
//! reports through `tracing`, throttled to one line every half second.

use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Which sweep is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reachability,
    ValueIteration,
    /// Greedy check of the depth-`k` lookahead surface.
    Verification { k: usize },
    /// Bellman backup from depth `k` to `k + 1`.
    Backup { k: usize },
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Reachability => write!(f, "reachability"),
            Phase::ValueIteration => write!(f, "value iteration"),
            Phase::Verification { k } => write!(f, "verification (k={k})"),
            Phase::Backup { k } => write!(f, "backup (k={k})"),
        }
    }
}

pub trait ProgressObserver: Sync {
    fn on_phase_start(&self, _phase: Phase, _horizon: usize) {}
    /// `timestep` has been fully processed; `states` were swept in it.
    fn on_timestep(&self, _phase: Phase, _timestep: usize, _states: usize) {}
    /// A lookahead depth finished its verification sweep.
    fn on_iteration(&self, _k: usize, _passed: bool) {}
    fn on_phase_end(&self, _phase: Phase) {}
}

/// Discards every event.
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

struct LogState {
    phase_start: Instant,
    last_report: Instant,
    states_done: usize,
}

/// Reports progress through `tracing`.
pub struct LogProgress {
    state: Mutex<LogState>,
    min_interval_secs: f64,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl LogProgress {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(LogState {
                phase_start: now,
                last_report: now,
                states_done: 0,
            }),
            min_interval_secs: 0.5,
        }
    }
}

impl ProgressObserver for LogProgress {
    fn on_phase_start(&self, phase: Phase, horizon: usize) {
        let mut st = self.state.lock();
        let now = Instant::now();
        st.phase_start = now;
        st.last_report = now;
        st.states_done = 0;
        debug!(%phase, horizon, "phase started");
    }

    fn on_timestep(&self, phase: Phase, timestep: usize, states: usize) {
        let mut st = self.state.lock();
        st.states_done += states;
        let now = Instant::now();
        if now.duration_since(st.last_report).as_secs_f64() < self.min_interval_secs {
            return;
        }
        st.last_report = now;
        let elapsed = now.duration_since(st.phase_start).as_secs_f64();
        info!(
            "{phase}: timestep {timestep} | {} states | {:.1}s | {:.0} states/s",
            st.states_done,
            elapsed,
            st.states_done as f64 / elapsed.max(1e-9)
        );
    }

    fn on_iteration(&self, k: usize, passed: bool) {
        info!(k, passed, "lookahead depth checked");
    }

    fn on_phase_end(&self, phase: Phase) {
        let st = self.state.lock();
        let elapsed = st.phase_start.elapsed().as_secs_f64();
        debug!(
            "{phase} finished: {} states in {:.2}s",
            st.states_done, elapsed
        );
    }
}
