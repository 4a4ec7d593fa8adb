//! Operation mixes and their stateful selectors.
//!
//! A mix is either a flat row vector (each draw independent of the
//! previous operation) or a Markov transition matrix (the row indexed by
//! the previous operation governs the next draw). Selection itself is a
//! plain weighted draw over the active row.

use drover_error::{DroverError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Probability specification over the operation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MixSpec {
    /// Independent draw from one row vector; the previous operation is
    /// ignored.
    Flat(Vec<f64>),
    /// Markov transition matrix; row `prev` governs the next draw.
    Matrix(Vec<Vec<f64>>),
}

impl MixSpec {
    /// Number of operations this mix spans.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(row) => row.len(),
            Self::Matrix(rows) => rows.len(),
        }
    }

    /// Whether the mix spans no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject mixes that cannot drive a selector: empty rows, non-square
    /// matrices, negative weights, or all-zero rows.
    pub fn validate(&self) -> Result<()> {
        let check_row = |row: &[f64], what: &str| -> Result<()> {
            if row.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(DroverError::config(format!("{what} has a negative weight")));
            }
            if row.iter().sum::<f64>() <= 0.0 {
                return Err(DroverError::config(format!("{what} has zero total weight")));
            }
            Ok(())
        };
        match self {
            Self::Flat(row) => {
                if row.is_empty() {
                    return Err(DroverError::config("flat mix is empty"));
                }
                check_row(row, "flat mix row")
            }
            Self::Matrix(rows) => {
                if rows.is_empty() {
                    return Err(DroverError::config("mix matrix is empty"));
                }
                let n = rows.len();
                for (i, row) in rows.iter().enumerate() {
                    if row.len() != n {
                        return Err(DroverError::config(format!(
                            "mix matrix is not square: row {i} has {} entries, expected {n}",
                            row.len()
                        )));
                    }
                    check_row(row, &format!("mix matrix row {i}"))?;
                }
                Ok(())
            }
        }
    }
}

/// Stateful sampler over a [`MixSpec`].
///
/// Owns no clock; the worker drives it. The first draw of a matrix mix
/// uses row 0, matching a run that notionally starts at operation 0.
#[derive(Debug, Clone)]
pub struct MixSelector {
    spec: MixSpec,
    previous: usize,
}

impl MixSelector {
    /// Build a selector, validating the spec.
    pub fn new(spec: MixSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self { spec, previous: 0 })
    }

    /// The operation index last selected.
    #[must_use]
    pub fn previous(&self) -> usize {
        self.previous
    }

    /// Select the next operation index.
    pub fn select<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let row: &[f64] = match &self.spec {
            MixSpec::Flat(row) => row,
            MixSpec::Matrix(rows) => &rows[self.previous],
        };
        let total: f64 = row.iter().sum();
        let mut target = rng.gen_range(0.0..total);
        let mut choice = row.len() - 1;
        for (i, w) in row.iter().enumerate() {
            if target < *w {
                choice = i;
                break;
            }
            target -= w;
        }
        self.previous = choice;
        choice
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn validation_rejects_bad_specs() {
        assert!(MixSpec::Flat(vec![]).validate().is_err());
        assert!(MixSpec::Flat(vec![0.0, 0.0]).validate().is_err());
        assert!(MixSpec::Flat(vec![0.5, -0.1]).validate().is_err());
        assert!(MixSpec::Matrix(vec![vec![1.0, 0.0]]).validate().is_err());
        assert!(MixSpec::Flat(vec![0.7, 0.3]).validate().is_ok());
        assert!(
            MixSpec::Matrix(vec![vec![0.5, 0.5], vec![1.0, 0.0]])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn flat_mix_converges_to_row_distribution() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut sel = MixSelector::new(MixSpec::Flat(vec![0.6, 0.3, 0.1])).unwrap();
        let mut counts = [0u32; 3];
        let n = 100_000;
        for _ in 0..n {
            counts[sel.select(&mut rng)] += 1;
        }
        let frac = |c: u32| c as f64 / n as f64;
        assert!((frac(counts[0]) - 0.6).abs() < 0.02, "{counts:?}");
        assert!((frac(counts[1]) - 0.3).abs() < 0.02, "{counts:?}");
        assert!((frac(counts[2]) - 0.1).abs() < 0.02, "{counts:?}");
    }

    #[test]
    fn matrix_mix_obeys_transition_rows() {
        // From op 0 always go to op 1, from op 1 always go to op 0: the
        // selection sequence must strictly alternate.
        let mut rng = StdRng::seed_from_u64(42);
        let mut sel = MixSelector::new(MixSpec::Matrix(vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ]))
        .unwrap();
        let first = sel.select(&mut rng);
        let mut prev = first;
        for _ in 0..100 {
            let next = sel.select(&mut rng);
            assert_ne!(next, prev);
            prev = next;
        }
    }

    #[test]
    fn matrix_mix_converges_to_stationary_distribution() {
        // Doubly-stochastic 2x2 matrix: stationary distribution is
        // uniform regardless of the rows' asymmetry.
        let mut rng = StdRng::seed_from_u64(7);
        let mut sel = MixSelector::new(MixSpec::Matrix(vec![
            vec![0.3, 0.7],
            vec![0.7, 0.3],
        ]))
        .unwrap();
        let mut counts = [0u32; 2];
        let n = 100_000;
        for _ in 0..n {
            counts[sel.select(&mut rng)] += 1;
        }
        let f0 = counts[0] as f64 / n as f64;
        assert!((f0 - 0.5).abs() < 0.02, "{counts:?}");
    }

    #[test]
    fn selector_tracks_previous() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut sel = MixSelector::new(MixSpec::Flat(vec![1.0])).unwrap();
        assert_eq!(sel.select(&mut rng), 0);
        assert_eq!(sel.previous(), 0);
    }

    #[test]
    fn unnormalized_weights_are_proportional() {
        // Weights 3:1 behave like 0.75:0.25 without prior normalization.
        let mut rng = StdRng::seed_from_u64(11);
        let mut sel = MixSelector::new(MixSpec::Flat(vec![3.0, 1.0])).unwrap();
        let n = 50_000;
        let ones = (0..n).filter(|_| sel.select(&mut rng) == 1).count();
        let frac = ones as f64 / n as f64;
        assert!((frac - 0.25).abs() < 0.02, "{frac}");
    }
}
