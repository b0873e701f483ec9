//! Factorization strategies for the Schur-complement loss bound.
//!
//! The base relaxation needs the constraint `Z >= U h U^T` expressed as a
//! linear matrix inequality. Each method here rewrites that quadratic bound
//! as a PSD block that is affine in (U, Z): either with the inverse of `h`
//! in the corner, or with a factor F satisfying `F F^T = h` so that
//! `[[Z, U F], [F^T U^T, I]] >= 0` is the Schur-complement equivalent. All
//! methods describe the same feasible region; they differ in cost and in
//! tolerance to rank deficiency.

use crate::cache::{ContentHasher, ContentKey, Memo};
use ndarray::Array2;
use ndarray_linalg::{Cholesky, Eigh, Inverse, UPLO};
use thiserror::Error;

/// Relative eigenvalue threshold below which `h` is treated as rank deficient.
const RANK_RTOL: f64 = 1e-10;

/// Errors raised while certifying and factorizing `h`.
#[derive(Error, Debug)]
pub enum FactorizationError {
    #[error(
        "covariance matrix is not positive semidefinite: eigenvalue {value:.3e} is below -{tol:.3e}"
    )]
    NotPositiveSemidefinite { value: f64, tol: f64 },

    #[error(
        "covariance matrix is rank deficient (rank {rank} of {dim}) and the `{kind}` method requires full rank; use `pinv`"
    )]
    SingularMatrix {
        rank: usize,
        dim: usize,
        kind: FactorizationKind,
    },

    #[error("dense linear algebra failed while factorizing the covariance: {0}")]
    Lapack(#[from] ndarray_linalg::error::LinalgError),
}

/// The closed set of supported factorization methods.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum FactorizationKind {
    /// Direct inverse in the corner block.
    Inv,
    /// Rank-truncated eigenfactor; the only method tolerating singular `h`.
    Pinv,
    /// Eigenfactor `F = V sqrt(Lambda)`.
    Eig,
    /// `h = L D L^T`, `F = L sqrt(D)`.
    Ldl,
    /// Cholesky factor; cheapest for well-conditioned `h`.
    Chol,
    /// Principal square root `F = h^{1/2}`.
    Sqrt,
}

impl FactorizationKind {
    pub const ALL: [FactorizationKind; 6] = [
        FactorizationKind::Inv,
        FactorizationKind::Pinv,
        FactorizationKind::Eig,
        FactorizationKind::Ldl,
        FactorizationKind::Chol,
        FactorizationKind::Sqrt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FactorizationKind::Inv => "inv",
            FactorizationKind::Pinv => "pinv",
            FactorizationKind::Eig => "eig",
            FactorizationKind::Ldl => "ldl",
            FactorizationKind::Chol => "chol",
            FactorizationKind::Sqrt => "sqrt",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl std::fmt::Display for FactorizationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The concrete payload the problem builder consumes.
#[derive(Debug, Clone)]
pub enum FactorForm {
    /// `h^{-1}`, placed in the corner: `[[Z, U], [U^T, h^{-1}]] >= 0`.
    InverseCorner(Array2<f64>),
    /// A p x r factor with `F F^T = h`: `[[Z, U F], [F^T U^T, I_r]] >= 0`.
    Factor(Array2<f64>),
}

/// A certified factorization of the regularized state covariance.
#[derive(Debug, Clone)]
pub struct Factorization {
    kind: FactorizationKind,
    form: FactorForm,
}

impl Factorization {
    pub fn kind(&self) -> FactorizationKind {
        self.kind
    }

    pub fn form(&self) -> &FactorForm {
        &self.form
    }

    /// Width of the identity block in the Schur LMI (r for `Pinv`, p else).
    pub fn factor_width(&self) -> usize {
        match &self.form {
            FactorForm::InverseCorner(h_inv) => h_inv.nrows(),
            FactorForm::Factor(f) => f.ncols(),
        }
    }

    /// Certifies `h` (PSD, and full rank unless the method tolerates less)
    /// and computes the requested form.
    pub fn compute(kind: FactorizationKind, h: &Array2<f64>) -> Result<Self, FactorizationError> {
        let dim = h.nrows();
        let (vals, vecs) = h.eigh(UPLO::Lower)?;
        let scale = vals.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let tol = scale.max(f64::EPSILON) * RANK_RTOL;
        if let Some(worst) = vals.iter().copied().find(|v| *v < -tol) {
            return Err(FactorizationError::NotPositiveSemidefinite { value: worst, tol });
        }
        let rank = vals.iter().filter(|v| **v > tol).count();
        if rank < dim && kind != FactorizationKind::Pinv {
            return Err(FactorizationError::SingularMatrix { rank, dim, kind });
        }

        let form = match kind {
            FactorizationKind::Inv => FactorForm::InverseCorner(h.inv()?),
            FactorizationKind::Pinv => {
                let mut f = Array2::zeros((dim, rank));
                let mut col = 0;
                for (j, lam) in vals.iter().copied().enumerate() {
                    if lam > tol {
                        let scaled = vecs.column(j).mapv(|v| v * lam.sqrt());
                        f.column_mut(col).assign(&scaled);
                        col += 1;
                    }
                }
                FactorForm::Factor(f)
            }
            FactorizationKind::Eig => FactorForm::Factor(scaled_eigvecs(&vals, &vecs)),
            FactorizationKind::Ldl => {
                let (l, d) = ldl_unblocked(h);
                let mut f = l;
                for (j, dj) in d.iter().enumerate() {
                    let root = dj.max(0.0).sqrt();
                    f.column_mut(j).mapv_inplace(|v| v * root);
                }
                FactorForm::Factor(f)
            }
            FactorizationKind::Chol => FactorForm::Factor(h.cholesky(UPLO::Lower)?),
            FactorizationKind::Sqrt => {
                let vs = scaled_eigvecs(&vals, &vecs);
                FactorForm::Factor(vs.dot(&vecs.t()))
            }
        };
        Ok(Self { kind, form })
    }

    pub fn content_key(kind: FactorizationKind, h: &Array2<f64>) -> ContentKey {
        let mut hasher = ContentHasher::new();
        hasher.matrix(h);
        hasher.tag(kind as u64);
        hasher.finish()
    }

    pub fn compute_cached(
        cache: &impl Memo<Self>,
        kind: FactorizationKind,
        h: &Array2<f64>,
    ) -> Result<Self, FactorizationError> {
        cache.get_or_try_compute(Self::content_key(kind, h), || Self::compute(kind, h))
    }
}

/// `V sqrt(Lambda)`: column j of `vecs` scaled by `sqrt(vals[j])`.
fn scaled_eigvecs(vals: &ndarray::Array1<f64>, vecs: &Array2<f64>) -> Array2<f64> {
    let mut f = vecs.clone();
    for (j, lam) in vals.iter().copied().enumerate() {
        let root = lam.max(0.0).sqrt();
        f.column_mut(j).mapv_inplace(|v| v * root);
    }
    f
}

/// Unblocked LDL^T without pivoting. The SPD precheck above guarantees the
/// pivots stay positive.
fn ldl_unblocked(h: &Array2<f64>) -> (Array2<f64>, Vec<f64>) {
    let n = h.nrows();
    let mut l = Array2::eye(n);
    let mut d = vec![0.0; n];
    for j in 0..n {
        let mut dj = h[[j, j]];
        for k in 0..j {
            dj -= l[[j, k]] * l[[j, k]] * d[k];
        }
        d[j] = dj;
        for i in (j + 1)..n {
            let mut v = h[[i, j]];
            for k in 0..j {
                v -= l[[i, k]] * l[[j, k]] * d[k];
            }
            l[[i, j]] = v / dj;
        }
    }
    (l, d)
}
