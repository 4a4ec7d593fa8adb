//! Thread coordination primitives for the worker pool.
//!
//! The original design leaned on thread interrupts; here every blocking
//! wait is condvar-backed and woken by an explicit [`StopSignal`], so a
//! stop request reaches a sleeping worker without platform interrupt
//! semantics. Waits report *why* they woke and the worker classifies:
//! stopped ⇒ graceful exit, not stopped ⇒ fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::timer::Timer;

/// Why a blocking wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition the caller waited for arrived.
    Completed,
    /// The stop signal fired first.
    Stopped,
}

/// One-shot stop flag that wakes every registered sleeper.
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Raise the signal and wake all sleepers. Idempotent.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep until `timer` reaches `deadline_ms` or the signal fires.
    pub fn sleep_until(&self, timer: &Timer, deadline_ms: i64) -> WaitOutcome {
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return WaitOutcome::Stopped;
            }
            let remaining = deadline_ms - timer.now_ms();
            if remaining <= 0 {
                return WaitOutcome::Completed;
            }
            self.cond
                .wait_for(&mut stopped, Duration::from_millis(remaining as u64));
        }
    }

    /// Sleep for a relative duration in ms.
    pub fn sleep(&self, timer: &Timer, ms: i64) -> WaitOutcome {
        self.sleep_until(timer, timer.now_ms() + ms.max(0))
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Count-down latch for the start / pre-run / post-run barriers.
pub struct Latch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement; releases all waiters when the count reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero or the stop signal fires.
    ///
    /// The wait polls on a short timeout so a stop raised after this
    /// thread went to sleep is still observed promptly.
    pub fn wait(&self, stop: &StopSignal) -> WaitOutcome {
        let mut count = self.count.lock();
        loop {
            if *count == 0 {
                return WaitOutcome::Completed;
            }
            if stop.is_stopped() {
                return WaitOutcome::Stopped;
            }
            self.cond.wait_for(&mut count, Duration::from_millis(100));
        }
    }

    /// Block until the count reaches zero, ignoring the stop signal.
    /// Used by the completion barrier, which must drain even while the
    /// run is being torn down.
    pub fn wait_uninterruptible(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// A boolean the worker pool consults before retrying post-run hooks.
///
/// Bounded retry: a hook interrupted by run teardown is redone, unless
/// the whole process is on its way out.
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}
