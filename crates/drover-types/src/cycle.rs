//! Cycle descriptors: the delay drawn between successive operations.
//!
//! A cycle pairs a pacing discipline with a delay distribution. Cycle
//! time paces from operation *start* to next start; think time paces from
//! operation *end* to next start.

use drover_error::{DroverError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Pacing discipline for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleType {
    /// Delay measured from the previous operation's start.
    CycleTime,
    /// Delay measured from the previous operation's end.
    ThinkTime,
}

impl CycleType {
    /// Human-readable name for logging.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::CycleTime => "cycle_time",
            Self::ThinkTime => "think_time",
        }
    }
}

/// Delay distribution, drawn once per operation advance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Delay {
    /// Constant delay in ms.
    Fixed { ms: u64 },
    /// Uniform over `[lo, hi]` ms.
    Uniform { lo: u64, hi: u64 },
    /// Negative-exponential with the given mean, truncated at `max` ms.
    NegExp { mean: u64, max: u64 },
}

/// A cycle: pacing discipline plus delay distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSpec {
    pub cycle_type: CycleType,
    pub delay: Delay,
}

impl CycleSpec {
    /// A zero-delay cycle-time cycle, the default initial delay.
    pub const IMMEDIATE: Self = Self {
        cycle_type: CycleType::CycleTime,
        delay: Delay::Fixed { ms: 0 },
    };

    /// Draw the next delay in ms.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        match self.delay {
            Delay::Fixed { ms } => ms,
            Delay::Uniform { lo, hi } => {
                if lo >= hi {
                    lo
                } else {
                    rng.gen_range(lo..=hi)
                }
            }
            Delay::NegExp { mean, max } => {
                if mean == 0 {
                    return 0;
                }
                // Inverse-transform sampling, truncated so the tail cannot
                // stall a thread indefinitely.
                let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                let raw = -(mean as f64) * u.ln();
                (raw as u64).min(max)
            }
        }
    }

    /// Reject distributions that cannot produce a sane delay.
    pub fn validate(&self) -> Result<()> {
        match self.delay {
            Delay::Uniform { lo, hi } if lo > hi => Err(DroverError::config(format!(
                "uniform delay has lo {lo} > hi {hi}"
            ))),
            Delay::NegExp { mean, max } if max < mean => Err(DroverError::config(format!(
                "negexp delay has max {max} < mean {mean}"
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn fixed_draw_is_constant() {
        let mut rng = StdRng::seed_from_u64(7);
        let cycle = CycleSpec {
            cycle_type: CycleType::CycleTime,
            delay: Delay::Fixed { ms: 100 },
        };
        for _ in 0..10 {
            assert_eq!(cycle.draw(&mut rng), 100);
        }
    }

    #[test]
    fn uniform_draw_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let cycle = CycleSpec {
            cycle_type: CycleType::ThinkTime,
            delay: Delay::Uniform { lo: 50, hi: 150 },
        };
        for _ in 0..1000 {
            let d = cycle.draw(&mut rng);
            assert!((50..=150).contains(&d), "draw {d} out of range");
        }
    }

    #[test]
    fn negexp_truncates_at_max() {
        let mut rng = StdRng::seed_from_u64(7);
        let cycle = CycleSpec {
            cycle_type: CycleType::ThinkTime,
            delay: Delay::NegExp { mean: 100, max: 500 },
        };
        let draws: Vec<u64> = (0..10_000).map(|_| cycle.draw(&mut rng)).collect();
        assert!(draws.iter().all(|&d| d <= 500));
        // The sample mean should land near the distribution mean; the
        // truncation pulls it slightly below 100.
        let mean = draws.iter().sum::<u64>() as f64 / draws.len() as f64;
        assert!((60.0..=110.0).contains(&mean), "sample mean {mean}");
    }

    #[test]
    fn negexp_zero_mean_is_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        let cycle = CycleSpec {
            cycle_type: CycleType::CycleTime,
            delay: Delay::NegExp { mean: 0, max: 100 },
        };
        assert_eq!(cycle.draw(&mut rng), 0);
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let bad = CycleSpec {
            cycle_type: CycleType::CycleTime,
            delay: Delay::Uniform { lo: 10, hi: 5 },
        };
        assert!(bad.validate().is_err());

        let bad = CycleSpec {
            cycle_type: CycleType::CycleTime,
            delay: Delay::NegExp { mean: 100, max: 50 },
        };
        assert!(bad.validate().is_err());

        assert!(CycleSpec::IMMEDIATE.validate().is_ok());
    }
}
