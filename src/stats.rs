//! Regression sufficient statistics.
//!
//! Every SDP this crate builds depends on the snapshot data only through the
//! covariances computed here, so they are computed once per (data, alpha)
//! pair and memoized by content.

use crate::cache::{ContentHasher, ContentKey, Memo};
use crate::data::DataMatrices;
use ndarray::Array2;

/// Cached covariances of the regression problem.
///
/// With `Psi = x^T` (p x q), `Theta = y^T` (p_theta x q) and q samples:
/// `g = Theta Psi^T / q`, `h = (Psi Psi^T + alpha I) / q`,
/// `c = tr(Theta Theta^T) / q`. The per-sample squared loss expands to
/// `c - 2 tr(U g^T) + tr(U h U^T)`, which is the identity the base
/// relaxation in [`crate::problem`] is built on.
#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    /// Cross covariance, p_theta x p.
    pub g: Array2<f64>,
    /// Regularized state covariance, p x p. SPD whenever alpha > 0 or the
    /// lifted snapshots have full column rank.
    pub h: Array2<f64>,
    /// Target energy, the constant term of the expanded loss.
    pub c: f64,
}

impl SufficientStatistics {
    /// Computes the covariances directly. `alpha` is the Tikhonov weight
    /// folded into `h`; pass 0.0 when the regularizer is carried as an
    /// explicit term instead.
    pub fn compute(data: &DataMatrices, alpha: f64) -> Self {
        let q = data.n_samples() as f64;
        let g = data.y().t().dot(data.x()) / q;
        let mut h = data.x().t().dot(data.x()) / q;
        if alpha != 0.0 {
            for i in 0..h.nrows() {
                h[[i, i]] += alpha / q;
            }
        }
        let c = data.y().iter().map(|v| v * v).sum::<f64>() / q;
        Self { g, h, c }
    }

    pub fn content_key(data: &DataMatrices, alpha: f64) -> ContentKey {
        let mut hasher = ContentHasher::new();
        hasher.matrix(data.x());
        hasher.matrix(data.y());
        hasher.scalar(alpha);
        hasher.finish()
    }

    pub fn compute_cached(cache: &impl Memo<Self>, data: &DataMatrices, alpha: f64) -> Self {
        cache.get_or_compute(Self::content_key(data, alpha), || {
            Self::compute(data, alpha)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryMemo;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn toy_data() -> DataMatrices {
        // x is 3x2 (q = 3 samples), y = 2 * x.
        let x = arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
        let y = &x * 2.0;
        DataMatrices::new(x, y).unwrap()
    }

    #[test]
    fn covariances_match_hand_computation() {
        let data = toy_data();
        let stats = SufficientStatistics::compute(&data, 0.0);
        // Psi Psi^T = x^T x = [[14, 32], [32, 77]].
        let expected_h = arr2(&[[14.0, 32.0], [32.0, 77.0]]) / 3.0;
        let expected_g = &expected_h * 2.0;
        for i in 0..2 {
            for j in 0..2 {
                assert!((stats.h[[i, j]] - expected_h[[i, j]]).abs() < 1e-12);
                assert!((stats.g[[i, j]] - expected_g[[i, j]]).abs() < 1e-12);
            }
        }
        // c = 4 * (1 + 4 + 9 + 16 + 25 + 36) / 3.
        assert_abs_diff_eq!(stats.c, 4.0 * 91.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn alpha_shifts_the_diagonal_only() {
        let data = toy_data();
        let plain = SufficientStatistics::compute(&data, 0.0);
        let ridged = SufficientStatistics::compute(&data, 0.3);
        for i in 0..2 {
            for j in 0..2 {
                let shift = if i == j { 0.3 / 3.0 } else { 0.0 };
                assert!((ridged.h[[i, j]] - plain.h[[i, j]] - shift).abs() < 1e-15);
            }
        }
        assert_eq!(plain.c, ridged.c);
    }

    #[test]
    fn cached_computation_is_bit_identical() {
        let cache: InMemoryMemo<SufficientStatistics> = InMemoryMemo::new();
        let data = toy_data();
        let first = SufficientStatistics::compute_cached(&cache, &data, 0.1);
        let second = SufficientStatistics::compute_cached(&cache, &data, 0.1);
        assert_eq!(cache.len(), 1);
        for (a, b) in first.h.iter().zip(second.h.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        for (a, b) in first.g.iter().zip(second.g.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(first.c.to_bits(), second.c.to_bits());
    }

    #[test]
    fn mutating_a_copy_leaves_the_cache_untouched() {
        let cache: InMemoryMemo<SufficientStatistics> = InMemoryMemo::new();
        let data = toy_data();
        let mut copy = SufficientStatistics::compute_cached(&cache, &data, 0.0);
        copy.h[[0, 0]] = -1.0;
        let fresh = SufficientStatistics::compute_cached(&cache, &data, 0.0);
        assert!(fresh.h[[0, 0]] > 0.0, "cached value must be unaffected");
    }
}
