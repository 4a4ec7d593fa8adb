//! Run-phase logic: when a worker is in steady state and when it is done.
//!
//! The engine runs one worker type for all run-control disciplines; the
//! pacer owns the phase arithmetic. Time-paced runs judge phases by the
//! master clock, cycle-paced runs by the worker's cycle index (ramp-up,
//! steady-state, and ramp-down are then cycle counts rather than
//! seconds).

use drover_types::{RunControl, RunInfo};

/// Phase schedule for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacer {
    /// Wall-clock phases in master ms.
    Time {
        steady_start: i64,
        steady_end: i64,
        run_end: i64,
    },
    /// Cycle-count phases.
    Cycles {
        steady_start: u64,
        steady_end: u64,
        total: u64,
    },
}

impl Pacer {
    /// Build the pacer a `RunInfo` prescribes.
    #[must_use]
    pub fn from_run_info(info: &RunInfo) -> Self {
        match info.driver_config.run_control {
            RunControl::Time => Self::Time {
                steady_start: info.steady_start_ms(),
                steady_end: info.steady_end_ms(),
                run_end: info.run_end_ms(),
            },
            RunControl::Cycles => {
                let steady_start = info.ramp_up;
                let steady_end = info.ramp_up + info.steady_state;
                Self::Cycles {
                    steady_start,
                    steady_end,
                    total: info.driver_config.cycles,
                }
            }
        }
    }

    /// Whether the worker's loop should terminate.
    #[must_use]
    pub fn is_done(&self, now_ms: i64, cycle_count: u64) -> bool {
        match *self {
            Self::Time { run_end, .. } => now_ms >= run_end,
            Self::Cycles { total, .. } => cycle_count >= total,
        }
    }

    /// Whether an operation spanning `[start, end]` (master ms) at cycle
    /// index `cycle` counts toward steady-state metrics.
    #[must_use]
    pub fn is_steady_span(&self, start_ms: i64, end_ms: i64, cycle: u64) -> bool {
        match *self {
            Self::Time {
                steady_start,
                steady_end,
                ..
            } => start_ms >= steady_start && end_ms < steady_end,
            Self::Cycles {
                steady_start,
                steady_end,
                ..
            } => cycle >= steady_start && cycle < steady_end,
        }
    }

    /// Steady window start, if time-paced.
    #[must_use]
    pub fn steady_start_ms(&self) -> Option<i64> {
        match *self {
            Self::Time { steady_start, .. } => Some(steady_start),
            Self::Cycles { .. } => None,
        }
    }

    /// Steady window end, if time-paced.
    #[must_use]
    pub fn steady_end_ms(&self) -> Option<i64> {
        match *self {
            Self::Time { steady_end, .. } => Some(steady_end),
            Self::Cycles { .. } => None,
        }
    }
}
