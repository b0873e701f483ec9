//! Bilinear operator constraints and their convex half-problems.
//!
//! Each family couples the operator's state block `A = U[:, :p_theta]` (and
//! input block `B = U[:, p_theta:]` where applicable) to a Lyapunov-type
//! certificate `P` through a matrix inequality that is linear in each group
//! separately but not jointly. The alternation driver therefore asks every
//! family for two things: decorate the operator problem with the constraint
//! row for a fixed certificate, and build the certificate recovery problem
//! for a fixed operator.

use crate::backend::{BackendError, Solution, SolverBackend, SolverOptions, SolverStatus};
use crate::estimator::EstimationError;
use crate::factorization::FactorizationError;
use crate::problem::{MatExpr, OptimizationProblem, ProblemError};
use crate::stats::SufficientStatistics;
use ndarray::{s, Array2};
use ndarray_linalg::{c64, Eig, Inverse};

/// Shrink factor applied when the hot start pulls eigenvalues back inside
/// the spectral bound, so the auxiliary feasibility problem has slack.
const EIG_RESCALE_MARGIN: f64 = 0.999;

/// A property certificate recovered by SolveB: a Lyapunov-type matrix, plus
/// the attained gain bound for the H-infinity family.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Certificate {
    pub matrix: Array2<f64>,
    pub gain: Option<f64>,
}

impl Certificate {
    pub fn identity(dim: usize) -> Self {
        Self {
            matrix: Array2::eye(dim),
            gain: None,
        }
    }
}

/// One bilinear constraint family, seen through the two convex lenses the
/// alternation needs.
pub trait AlternatingConstraint {
    fn name(&self) -> &'static str;

    /// Side length of the certificate matrix.
    fn certificate_dim(&self) -> usize;

    /// Seeds the alternation. The default is the identity certificate; a
    /// family may override this with a cheaper-to-refine starting point.
    fn initial_certificate(
        &self,
        stats: &SufficientStatistics,
        backend: &dyn SolverBackend,
        options: &SolverOptions,
        eps: f64,
    ) -> Result<Certificate, EstimationError> {
        let _ = (stats, backend, options, eps);
        Ok(Certificate::identity(self.certificate_dim()))
    }

    /// Adds the constraint row (certificate fixed) to an operator problem.
    fn apply_to_operator_problem(
        &self,
        problem: &mut OptimizationProblem,
        certificate: &Certificate,
    ) -> Result<(), ProblemError>;

    /// Builds the certificate recovery problem (operator fixed).
    fn certificate_problem(
        &self,
        u: &Array2<f64>,
        eps: f64,
    ) -> Result<OptimizationProblem, ProblemError>;

    /// Reads the certificate back out of a SolveB solution.
    fn extract_certificate(&self, solution: &Solution) -> Result<Certificate, EstimationError>;
}

fn symmetrized(m: &Array2<f64>) -> Array2<f64> {
    (m + &m.t()) * 0.5
}

fn certificate_matrix(solution: &Solution) -> Result<Array2<f64>, EstimationError> {
    solution
        .value("P")
        .map(symmetrized)
        .ok_or_else(|| BackendError::MissingVariable("P".to_string()).into())
}

/// Checks that `U` exists and has at least `p_theta` columns, returning its
/// variable id and full width.
fn operator_with_state_block(
    problem: &OptimizationProblem,
    p_theta: usize,
) -> Result<(usize, usize), ProblemError> {
    let u = problem
        .variable("U")
        .ok_or_else(|| ProblemError::UnknownVariable("U".to_string()))?;
    let info = problem.var_info(u);
    if info.rows() != p_theta || info.cols() < p_theta {
        return Err(ProblemError::VariableShape {
            name: "U".to_string(),
            rows: info.rows(),
            cols: info.cols(),
            expected_rows: p_theta,
            expected_cols: p_theta,
        });
    }
    Ok((u, info.cols()))
}

// ---------------------------------------------------------------------------
// Spectral radius
// ---------------------------------------------------------------------------

/// Bounds the spectral radius of the state block: there must exist `P > 0`
/// with `[[rho P, A^T P], [P A, rho P]] >= 0`, which by Schur complement is
/// `A^T P A <= rho^2 P` and hence `rho(A) <= rho`.
#[derive(Debug, Clone)]
pub struct SpectralRadius {
    radius: f64,
    p_theta: usize,
    hot_start: bool,
}

impl SpectralRadius {
    pub fn new(radius: f64, p_theta: usize, hot_start: bool) -> Self {
        Self {
            radius,
            p_theta,
            hot_start,
        }
    }

    fn lyapunov_block_fixed_certificate(
        &self,
        a: &MatExpr,
        p_mat: &Array2<f64>,
    ) -> Result<MatExpr, ProblemError> {
        let atp = a.t().postmul(p_mat)?;
        let pa = a.premul(p_mat)?;
        let rho_p = MatExpr::from_constant(&(p_mat * self.radius));
        MatExpr::block(vec![vec![rho_p.clone(), atp], vec![pa, rho_p]])
    }
}

impl AlternatingConstraint for SpectralRadius {
    fn name(&self) -> &'static str {
        "spectral-radius"
    }

    fn certificate_dim(&self) -> usize {
        self.p_theta
    }

    fn initial_certificate(
        &self,
        stats: &SufficientStatistics,
        backend: &dyn SolverBackend,
        options: &SolverOptions,
        eps: f64,
    ) -> Result<Certificate, EstimationError> {
        if !self.hot_start {
            return Ok(Certificate::identity(self.p_theta));
        }
        // Unconstrained least squares, eigenvalues pulled back inside the
        // bound, then a feasibility solve for a matching certificate.
        let h_inv = stats.h.inv().map_err(FactorizationError::from)?;
        let u_ls = stats.g.dot(&h_inv);
        let a = u_ls.slice(s![.., ..self.p_theta]).to_owned();
        let (eigvals, eigvecs) = a.eig().map_err(FactorizationError::from)?;
        let worst = eigvals.iter().map(|l| l.norm()).fold(0.0, f64::max);
        let mut u_seed = u_ls;
        if worst > self.radius {
            let target = self.radius * EIG_RESCALE_MARGIN;
            let rescaled = eigvals.mapv(|l| {
                let mag = l.norm();
                if mag > target {
                    l * (target / mag)
                } else {
                    l
                }
            });
            let v_inv = eigvecs.inv().map_err(FactorizationError::from)?;
            let lambda: Array2<c64> = Array2::from_diag(&rescaled);
            let a_rescaled = eigvecs.dot(&lambda).dot(&v_inv).mapv(|z| z.re);
            u_seed.slice_mut(s![.., ..self.p_theta]).assign(&a_rescaled);
        }
        let problem = self.certificate_problem(&u_seed, eps)?;
        let solution = backend.solve(&problem, options)?;
        if solution.status != SolverStatus::Optimal {
            log::warn!(
                "hot-start feasibility solve came back {:?}; seeding with the identity instead",
                solution.status
            );
            return Ok(Certificate::identity(self.p_theta));
        }
        self.extract_certificate(&solution)
    }

    fn apply_to_operator_problem(
        &self,
        problem: &mut OptimizationProblem,
        certificate: &Certificate,
    ) -> Result<(), ProblemError> {
        let (u, _) = operator_with_state_block(problem, self.p_theta)?;
        let p_mat = &certificate.matrix;
        if p_mat.nrows() != self.p_theta || p_mat.ncols() != self.p_theta {
            return Err(ProblemError::ShapeMismatch(
                p_mat.nrows(),
                p_mat.ncols(),
                self.p_theta,
                self.p_theta,
            ));
        }
        let a = problem.var_expr(u).columns(0..self.p_theta);
        let block = self.lyapunov_block_fixed_certificate(&a, p_mat)?;
        problem.add_psd_constraint(block)
    }

    fn certificate_problem(
        &self,
        u: &Array2<f64>,
        eps: f64,
    ) -> Result<OptimizationProblem, ProblemError> {
        let a = u.slice(s![.., ..self.p_theta]).to_owned();
        let mut problem = OptimizationProblem::new();
        let p_var = problem.add_symmetric_variable("P", self.p_theta)?;
        let p_expr = problem.var_expr(p_var);
        problem.add_psd_constraint(p_expr.sub_scaled_identity(eps)?)?;
        let atp = p_expr.premul(&a.t().to_owned())?;
        let pa = p_expr.postmul(&a)?;
        let rho_p = p_expr.scale(self.radius);
        let block = MatExpr::block(vec![vec![rho_p.clone(), atp], vec![pa, rho_p]])?;
        problem.add_psd_constraint(block)?;
        Ok(problem)
    }

    fn extract_certificate(&self, solution: &Solution) -> Result<Certificate, EstimationError> {
        Ok(Certificate {
            matrix: certificate_matrix(solution)?,
            gain: None,
        })
    }
}

// ---------------------------------------------------------------------------
// H-infinity gain
// ---------------------------------------------------------------------------

/// Bounds the induced gain of the fitted system `(A, B, C, D)` by `gamma`
/// via the discrete bounded-real lemma
/// `[[P, A P, B, 0], [P A^T, P, 0, P C^T], [B^T, 0, gamma I, D^T],
/// [0, C P, D, gamma I]] >= 0` with `P > 0`. `C` and `D` are constant
/// weights; the operator step charges `gamma_weight * gamma` and the
/// certificate step minimizes `gamma` outright.
#[derive(Debug, Clone)]
pub struct HinfGain {
    p_theta: usize,
    n_inputs: usize,
    gamma_weight: f64,
    c: Array2<f64>,
    d: Array2<f64>,
}

impl HinfGain {
    pub fn new(
        p_theta: usize,
        n_inputs: usize,
        gamma_weight: f64,
        c: Option<Array2<f64>>,
        d: Option<Array2<f64>>,
    ) -> Result<Self, EstimationError> {
        let c = c.unwrap_or_else(|| Array2::eye(p_theta));
        if c.ncols() != p_theta {
            return Err(EstimationError::DimensionMismatch(format!(
                "gain weight C must have {p_theta} columns, got {}",
                c.ncols()
            )));
        }
        let outputs = c.nrows();
        let d = d.unwrap_or_else(|| Array2::zeros((outputs, n_inputs)));
        if d.nrows() != outputs || d.ncols() != n_inputs {
            return Err(EstimationError::DimensionMismatch(format!(
                "gain weight D must be {outputs}x{n_inputs}, got {}x{}",
                d.nrows(),
                d.ncols()
            )));
        }
        Ok(Self {
            p_theta,
            n_inputs,
            gamma_weight,
            c,
            d,
        })
    }

    fn outputs(&self) -> usize {
        self.c.nrows()
    }
}

impl AlternatingConstraint for HinfGain {
    fn name(&self) -> &'static str {
        "hinf-gain"
    }

    fn certificate_dim(&self) -> usize {
        self.p_theta
    }

    fn apply_to_operator_problem(
        &self,
        problem: &mut OptimizationProblem,
        certificate: &Certificate,
    ) -> Result<(), ProblemError> {
        let (u, width) = operator_with_state_block(problem, self.p_theta)?;
        if width != self.p_theta + self.n_inputs {
            return Err(ProblemError::VariableShape {
                name: "U".to_string(),
                rows: self.p_theta,
                cols: width,
                expected_rows: self.p_theta,
                expected_cols: self.p_theta + self.n_inputs,
            });
        }
        let p_mat = &certificate.matrix;
        if p_mat.nrows() != self.p_theta || p_mat.ncols() != self.p_theta {
            return Err(ProblemError::ShapeMismatch(
                p_mat.nrows(),
                p_mat.ncols(),
                self.p_theta,
                self.p_theta,
            ));
        }
        let gamma = problem.add_variable("gamma", 1, 1)?;
        let gamma_scalar = problem.scalar_index_of(gamma);

        let u_expr = problem.var_expr(u);
        let a = u_expr.columns(0..self.p_theta);
        let b = u_expr.columns(self.p_theta..width);
        let m = self.n_inputs;
        let l = self.outputs();

        let ap = a.postmul(p_mat)?;
        let pat = ap.t();
        let pct = MatExpr::from_constant(&p_mat.dot(&self.c.t()));
        let cp = MatExpr::from_constant(&self.c.dot(p_mat));
        let block = MatExpr::block(vec![
            vec![
                MatExpr::from_constant(p_mat),
                ap,
                b.clone(),
                MatExpr::zeros(self.p_theta, l),
            ],
            vec![
                pat,
                MatExpr::from_constant(p_mat),
                MatExpr::zeros(self.p_theta, m),
                pct,
            ],
            vec![
                b.t(),
                MatExpr::zeros(m, self.p_theta),
                MatExpr::scalar_identity(gamma_scalar, m),
                MatExpr::from_constant(&self.d.t().to_owned()),
            ],
            vec![
                MatExpr::zeros(l, self.p_theta),
                cp,
                MatExpr::from_constant(&self.d),
                MatExpr::scalar_identity(gamma_scalar, l),
            ],
        ])?;
        problem.add_psd_constraint(block)?;
        problem.add_objective_linear(gamma_scalar, self.gamma_weight)
    }

    fn certificate_problem(
        &self,
        u: &Array2<f64>,
        eps: f64,
    ) -> Result<OptimizationProblem, ProblemError> {
        let a = u.slice(s![.., ..self.p_theta]).to_owned();
        let b = u.slice(s![.., self.p_theta..]).to_owned();
        let m = self.n_inputs;
        let l = self.outputs();

        let mut problem = OptimizationProblem::new();
        let p_var = problem.add_symmetric_variable("P", self.p_theta)?;
        let gamma = problem.add_variable("gamma", 1, 1)?;
        let gamma_scalar = problem.scalar_index_of(gamma);
        let p_expr = problem.var_expr(p_var);
        problem.add_psd_constraint(p_expr.sub_scaled_identity(eps)?)?;

        let ap = p_expr.premul(&a)?;
        let pat = p_expr.postmul(&a.t().to_owned())?;
        let pct = p_expr.postmul(&self.c.t().to_owned())?;
        let cp = p_expr.premul(&self.c)?;
        let block = MatExpr::block(vec![
            vec![
                p_expr.clone(),
                ap,
                MatExpr::from_constant(&b),
                MatExpr::zeros(self.p_theta, l),
            ],
            vec![
                pat,
                p_expr.clone(),
                MatExpr::zeros(self.p_theta, m),
                pct,
            ],
            vec![
                MatExpr::from_constant(&b.t().to_owned()),
                MatExpr::zeros(m, self.p_theta),
                MatExpr::scalar_identity(gamma_scalar, m),
                MatExpr::from_constant(&self.d.t().to_owned()),
            ],
            vec![
                MatExpr::zeros(l, self.p_theta),
                cp,
                MatExpr::from_constant(&self.d),
                MatExpr::scalar_identity(gamma_scalar, l),
            ],
        ])?;
        problem.add_psd_constraint(block)?;
        problem.add_objective_linear(gamma_scalar, 1.0)?;
        Ok(problem)
    }

    fn extract_certificate(&self, solution: &Solution) -> Result<Certificate, EstimationError> {
        let matrix = certificate_matrix(solution)?;
        let gain = solution
            .scalar("gamma")
            .ok_or_else(|| BackendError::MissingVariable("gamma".to_string()))?;
        Ok(Certificate {
            matrix,
            gain: Some(gain),
        })
    }
}

// ---------------------------------------------------------------------------
// Dissipativity
// ---------------------------------------------------------------------------

/// Enforces dissipativity with respect to a user-supplied supply rate
/// `Xi = [[Q, S], [S^T, R]]` over (output, input) pairs, for the fitted
/// system with output `y = theta` (C = I, D = 0). The dissipation
/// inequality `A^T P A - P - Q <= ...` is quadratic in `A`, so it is carried
/// in its Schur form
/// `[[P + Q, S, A^T P], [S^T, R, B^T P], [P A, P B, P]] >= 0`,
/// which is affine in (A, B) for fixed `P` and affine in `P` for fixed
/// (A, B).
#[derive(Debug, Clone)]
pub struct Dissipativity {
    p_theta: usize,
    n_inputs: usize,
    q: Array2<f64>,
    s_cross: Array2<f64>,
    r: Array2<f64>,
}

impl Dissipativity {
    pub fn new(
        p_theta: usize,
        n_inputs: usize,
        xi: &Array2<f64>,
    ) -> Result<Self, EstimationError> {
        let n = p_theta + n_inputs;
        if xi.nrows() != n || xi.ncols() != n {
            return Err(EstimationError::DimensionMismatch(format!(
                "supply-rate matrix must be {n}x{n} (p_theta + n_inputs), got {}x{}",
                xi.nrows(),
                xi.ncols()
            )));
        }
        let scale = xi.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let asym = xi
            .iter()
            .zip(xi.t().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        if asym > 1e-9 * scale.max(1.0) {
            return Err(EstimationError::DimensionMismatch(
                "supply-rate matrix must be symmetric".to_string(),
            ));
        }
        Ok(Self {
            p_theta,
            n_inputs,
            q: xi.slice(s![..p_theta, ..p_theta]).to_owned(),
            s_cross: xi.slice(s![..p_theta, p_theta..]).to_owned(),
            r: xi.slice(s![p_theta.., p_theta..]).to_owned(),
        })
    }
}

impl AlternatingConstraint for Dissipativity {
    fn name(&self) -> &'static str {
        "dissipativity"
    }

    fn certificate_dim(&self) -> usize {
        self.p_theta
    }

    fn apply_to_operator_problem(
        &self,
        problem: &mut OptimizationProblem,
        certificate: &Certificate,
    ) -> Result<(), ProblemError> {
        let (u, width) = operator_with_state_block(problem, self.p_theta)?;
        if width != self.p_theta + self.n_inputs {
            return Err(ProblemError::VariableShape {
                name: "U".to_string(),
                rows: self.p_theta,
                cols: width,
                expected_rows: self.p_theta,
                expected_cols: self.p_theta + self.n_inputs,
            });
        }
        let p_mat = &certificate.matrix;
        if p_mat.nrows() != self.p_theta || p_mat.ncols() != self.p_theta {
            return Err(ProblemError::ShapeMismatch(
                p_mat.nrows(),
                p_mat.ncols(),
                self.p_theta,
                self.p_theta,
            ));
        }
        let u_expr = problem.var_expr(u);
        let a = u_expr.columns(0..self.p_theta);
        let b = u_expr.columns(self.p_theta..width);
        let atp = a.t().postmul(p_mat)?;
        let btp = b.t().postmul(p_mat)?;
        let pa = a.premul(p_mat)?;
        let pb = b.premul(p_mat)?;
        let block = MatExpr::block(vec![
            vec![
                MatExpr::from_constant(&(p_mat + &self.q)),
                MatExpr::from_constant(&self.s_cross),
                atp,
            ],
            vec![
                MatExpr::from_constant(&self.s_cross.t().to_owned()),
                MatExpr::from_constant(&self.r),
                btp,
            ],
            vec![pa, pb, MatExpr::from_constant(p_mat)],
        ])?;
        problem.add_psd_constraint(block)
    }

    fn certificate_problem(
        &self,
        u: &Array2<f64>,
        eps: f64,
    ) -> Result<OptimizationProblem, ProblemError> {
        let a = u.slice(s![.., ..self.p_theta]).to_owned();
        let b = u.slice(s![.., self.p_theta..]).to_owned();
        let mut problem = OptimizationProblem::new();
        let p_var = problem.add_symmetric_variable("P", self.p_theta)?;
        let p_expr = problem.var_expr(p_var);
        problem.add_psd_constraint(p_expr.sub_scaled_identity(eps)?)?;
        let atp = p_expr.premul(&a.t().to_owned())?;
        let btp = p_expr.premul(&b.t().to_owned())?;
        let pa = p_expr.postmul(&a)?;
        let pb = p_expr.postmul(&b)?;
        let block = MatExpr::block(vec![
            vec![
                p_expr.add_constant(&self.q)?,
                MatExpr::from_constant(&self.s_cross),
                atp,
            ],
            vec![
                MatExpr::from_constant(&self.s_cross.t().to_owned()),
                MatExpr::from_constant(&self.r),
                btp,
            ],
            vec![pa, pb, p_expr],
        ])?;
        problem.add_psd_constraint(block)?;
        Ok(problem)
    }

    fn extract_certificate(&self, solution: &Solution) -> Result<Certificate, EstimationError> {
        Ok(Certificate {
            matrix: certificate_matrix(solution)?,
            gain: None,
        })
    }
}
