//! Per-worker state exposed to driver code during an operation.

use std::sync::Arc;

use rand::rngs::StdRng;

use crate::timer::Timer;

/// Invocation timestamps in master-adjusted ms; `-1` means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    /// When the critical section began.
    pub invoke_ms: i64,
    /// When the response was fully received.
    pub respond_ms: i64,
    /// Time spent paused inside the critical section.
    pub pause_ms: i64,
}

impl TimingInfo {
    pub const UNSET: Self = Self {
        invoke_ms: -1,
        respond_ms: -1,
        pause_ms: -1,
    };
}

/// How the current worker judges steady state.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SteadyJudge {
    /// Wall-clock window in master ms, end exclusive.
    Time { steady_start: i64, steady_end: i64 },
    /// Cycle-controlled runs: the worker flips this per cycle.
    Cycles { in_steady: bool },
}

/// The per-thread object handed to [`Driver`](crate::driver_api::Driver)
/// code. One lives inside each worker; driver code borrows it for the
/// duration of an operation.
pub struct DriverContext {
    timer: Arc<Timer>,
    timing: TimingInfo,
    judge: SteadyJudge,
    rng: StdRng,
    driver_name: String,
    thread_id: usize,
    op_index: usize,
    op_name: String,
}

impl DriverContext {
    pub(crate) fn new(
        timer: Arc<Timer>,
        rng: StdRng,
        driver_name: String,
        thread_id: usize,
    ) -> Self {
        Self {
            timer,
            timing: TimingInfo::UNSET,
            judge: SteadyJudge::Time {
                steady_start: i64::MAX,
                steady_end: i64::MAX,
            },
            rng,
            driver_name,
            thread_id,
            op_index: 0,
            op_name: String::new(),
        }
    }

    /// Stamp the clock into the timing record.
    ///
    /// The first call within an operation records the invoke time; the
    /// second records the respond time; any further call replaces the
    /// respond time, so a retrying transport keeps the final attempt.
    pub fn record_time(&mut self) {
        let now = self.timer.now_ms();
        if self.timing.invoke_ms == -1 {
            self.timing.invoke_ms = now;
        } else {
            self.timing.respond_ms = now;
        }
    }

    /// Whether the operation in flight began in steady state.
    #[must_use]
    pub fn is_steady_state(&self) -> bool {
        match self.judge {
            SteadyJudge::Time {
                steady_start,
                steady_end,
            } => {
                let t = if self.timing.invoke_ms != -1 {
                    self.timing.invoke_ms
                } else {
                    self.timer.now_ms()
                };
                t >= steady_start && t < steady_end
            }
            SteadyJudge::Cycles { in_steady } => in_steady,
        }
    }

    /// Whether the span `[start, end]` lies entirely in steady state.
    #[must_use]
    pub fn is_steady_state_span(&self, start_ms: i64, end_ms: i64) -> bool {
        match self.judge {
            SteadyJudge::Time {
                steady_start,
                steady_end,
            } => start_ms >= steady_start && end_ms < steady_end,
            SteadyJudge::Cycles { in_steady } => in_steady,
        }
    }

    /// Master-adjusted current time in ms.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.timer.now_ms()
    }

    /// Index of the operation in flight.
    #[must_use]
    pub fn operation_id(&self) -> usize {
        self.op_index
    }

    /// Name of the operation in flight.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.op_name
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    #[must_use]
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// The worker's deterministic RNG, shared with the mix selector.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// The timing record of the operation in flight.
    #[must_use]
    pub fn timing(&self) -> TimingInfo {
        self.timing
    }

    pub(crate) fn reset_timing(&mut self) {
        self.timing = TimingInfo::UNSET;
    }

    pub(crate) fn set_operation(&mut self, index: usize, name: &str) {
        self.op_index = index;
        self.op_name.clear();
        self.op_name.push_str(name);
    }

    pub(crate) fn set_judge(&mut self, judge: SteadyJudge) {
        self.judge = judge;
    }
}
