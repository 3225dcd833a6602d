//! Numeric constants and state-numbering conventions.
//!
//! States are numbered from 1 so that index 0 can stand for "no next state":
//! - raw transition target `r` (0-based) maps to state `r + 1`
//! - raw transition target `-1` maps to [`TERMINAL_STATE`]
//! - the process always starts in [`INITIAL_STATE`] at timestep 1
//!
//! Timesteps run `1..=horizon`. Actions are 0-based.

/// Tolerance used when comparing returns against the optimal value.
///
/// An action whose horizon-H optimal Q-value lags the optimal state value by
/// more than this is treated as sub-optimal.
pub const REWARD_PRECISION: f64 = 1e-4;

/// The state every episode starts in.
pub const INITIAL_STATE: usize = 1;

/// Marker for an undefined transition. Carries no value and is never expanded.
pub const TERMINAL_STATE: usize = 0;

/// Raw transition value meaning "no valid next state".
pub const RAW_NO_TRANSITION: i64 = -1;

/// Shards allocated per worker thread by the default sharded map.
pub const SHARDS_PER_THREAD: usize = 2;

/// Tolerance for exploration-policy rows summing to 1.
pub const POLICY_SUM_TOLERANCE: f64 = 1e-6;

/// Map a raw 0-based transition target to a state number.
///
/// `-1` becomes [`TERMINAL_STATE`]; everything else is shifted up by one.
#[inline(always)]
pub fn state_from_raw(raw: i64) -> usize {
    if raw == RAW_NO_TRANSITION {
        TERMINAL_STATE
    } else {
        raw as usize + 1
    }
}

#[inline(always)]
pub fn is_terminal(state: usize) -> bool {
    state == TERMINAL_STATE
}
