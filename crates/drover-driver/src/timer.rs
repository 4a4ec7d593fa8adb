//! Master-adjusted monotonic millisecond clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use drover_error::Result;
use tracing::debug;

/// Monotonic clock whose readings are offset to the master's timeline.
///
/// Readings are `Instant`-based, so wall-clock steps on the agent host
/// cannot move a run's timeline. The offset is estimated once per agent
/// lifetime; drift within a single run is assumed bounded.
pub struct Timer {
    origin: Instant,
    offset_ms: AtomicI64,
}

impl Timer {
    /// A timer with no master offset (the master's own clock).
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Current time in master-adjusted ms.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        let elapsed = self.origin.elapsed().as_millis() as i64;
        elapsed + self.offset_ms.load(Ordering::Relaxed)
    }

    /// The current offset to the master clock.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Overwrite the offset (tests, in-process deployments).
    pub fn set_offset_ms(&self, offset: i64) {
        self.offset_ms.store(offset, Ordering::Relaxed);
    }

    /// Estimate the offset against the master clock.
    ///
    /// Takes `samples` round trips and keeps the one with the smallest
    /// RTT; the master's reading plus half that RTT is taken as the
    /// master time at the local sample point.
    pub fn sync_with<F>(&self, mut sample_master_ms: F, samples: usize) -> Result<()>
    where
        F: FnMut() -> Result<i64>,
    {
        let mut best_rtt = i64::MAX;
        let mut best_offset = 0i64;
        for _ in 0..samples.max(1) {
            let local_before = self.origin.elapsed().as_millis() as i64;
            let master_ms = sample_master_ms()?;
            let local_after = self.origin.elapsed().as_millis() as i64;
            let rtt = local_after - local_before;
            if rtt < best_rtt {
                best_rtt = rtt;
                best_offset = master_ms + rtt / 2 - local_after;
            }
        }
        self.offset_ms.store(best_offset, Ordering::Relaxed);
        debug!(offset_ms = best_offset, rtt_ms = best_rtt, "clock synced to master");
        Ok(())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
