//! Snapshot-data containers and validation.
//!
//! This module is the entry point for user-provided regression data. The
//! matrices arrive already lifted: feature/dictionary construction happens
//! upstream, and everything downstream of here may assume the shapes have
//! been checked once.

use ndarray::Array2;
use thiserror::Error;

/// Errors raised while validating snapshot matrices.
#[derive(Error, Debug)]
pub enum DataError {
    #[error(
        "`x` has {x_rows} rows but `y` has {y_rows}; snapshot matrices must pair row-for-row"
    )]
    RowCountMismatch { x_rows: usize, y_rows: usize },

    #[error("at least 2 snapshot pairs are required to form regression covariances, got {0}")]
    TooFewSamples(usize),

    #[error("snapshot matrices must have at least one column")]
    EmptyFeatures,
}

/// Validated snapshot data.
///
/// `x` holds lifted states (q x p) and `y` the one-step-ahead targets
/// (q x p_theta), one sample per row.
#[derive(Debug, Clone)]
pub struct DataMatrices {
    x: Array2<f64>,
    y: Array2<f64>,
}

impl DataMatrices {
    pub fn new(x: Array2<f64>, y: Array2<f64>) -> Result<Self, DataError> {
        if x.nrows() != y.nrows() {
            return Err(DataError::RowCountMismatch {
                x_rows: x.nrows(),
                y_rows: y.nrows(),
            });
        }
        if x.nrows() < 2 {
            return Err(DataError::TooFewSamples(x.nrows()));
        }
        if x.ncols() == 0 || y.ncols() == 0 {
            return Err(DataError::EmptyFeatures);
        }
        Ok(Self { x, y })
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    /// Number of snapshot pairs q.
    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    /// Lifted state dimension p.
    pub fn lifted_dim(&self) -> usize {
        self.x.ncols()
    }

    /// Target dimension p_theta.
    pub fn output_dim(&self) -> usize {
        self.y.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn accepts_paired_snapshots() {
        let x = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let y = arr2(&[[2.0], [6.0], [10.0]]);
        let data = DataMatrices::new(x, y).expect("valid data must be accepted");
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.lifted_dim(), 2);
        assert_eq!(data.output_dim(), 1);
    }

    #[test]
    fn rejects_row_count_mismatch() {
        let x = Array2::zeros((4, 2));
        let y = Array2::zeros((3, 2));
        let err = DataMatrices::new(x, y).unwrap_err();
        assert!(matches!(
            err,
            DataError::RowCountMismatch {
                x_rows: 4,
                y_rows: 3
            }
        ));
    }

    #[test]
    fn rejects_single_sample() {
        let x = Array2::zeros((1, 2));
        let y = Array2::zeros((1, 2));
        assert!(matches!(
            DataMatrices::new(x, y).unwrap_err(),
            DataError::TooFewSamples(1)
        ));
    }
}
