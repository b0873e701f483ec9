//! Composable convex regularization terms.
//!
//! Each term mutates an in-progress base problem through the same small
//! surface: look up `U`, add its own variables and LMIs, and contribute to
//! the objective. Terms are independent of each other and of the constraint
//! families; the estimator decides which (if any) to apply.

use crate::problem::{AffExpr, MatExpr, OptimizationProblem, ProblemError};

/// Stable extension interface for objective-side regularizers.
pub trait RegularizationTerm {
    fn name(&self) -> &'static str;

    fn apply(&self, problem: &mut OptimizationProblem) -> Result<(), ProblemError>;
}

/// Looks up `U` and returns (id, p_theta, p).
fn operator_variable(problem: &OptimizationProblem) -> Result<(usize, usize, usize), ProblemError> {
    let u = problem
        .variable("U")
        .ok_or_else(|| ProblemError::UnknownVariable("U".to_string()))?;
    let info = problem.var_info(u);
    Ok((u, info.rows(), info.cols()))
}

/// Adds the shared spectral-norm LMI `[[gamma I_p, U^T], [U, gamma I_ptheta]] >= 0`
/// and returns the scalar index of the fresh `gamma` variable.
fn add_gamma_norm_block(
    problem: &mut OptimizationProblem,
    u: usize,
    p_theta: usize,
    p: usize,
) -> Result<usize, ProblemError> {
    let gamma = problem.add_variable("gamma", 1, 1)?;
    let gamma_scalar = problem.scalar_index_of(gamma);
    let u_expr = problem.var_expr(u);
    let block = MatExpr::block(vec![
        vec![MatExpr::scalar_identity(gamma_scalar, p), u_expr.t()],
        vec![u_expr, MatExpr::scalar_identity(gamma_scalar, p_theta)],
    ])?;
    problem.add_psd_constraint(block)?;
    Ok(gamma_scalar)
}

/// Tikhonov regularization in its explicit LMI form: bounds the operator
/// norm by a fresh scalar `gamma` and charges `(alpha / q) gamma^2`.
#[derive(Debug, Clone)]
pub struct Tikhonov {
    pub alpha: f64,
    pub n_samples: usize,
}

impl RegularizationTerm for Tikhonov {
    fn name(&self) -> &'static str {
        "tikhonov"
    }

    fn apply(&self, problem: &mut OptimizationProblem) -> Result<(), ProblemError> {
        let (u, p_theta, p) = operator_variable(problem)?;
        let gamma_scalar = add_gamma_norm_block(problem, u, p_theta, p)?;
        problem.add_objective_quadratic(gamma_scalar, self.alpha / self.n_samples as f64)
    }
}

/// Spectral-norm (2-norm) regularization: same LMI as [`Tikhonov`], linear
/// charge `(alpha ratio / q) gamma`.
#[derive(Debug, Clone)]
pub struct TwoNorm {
    pub alpha: f64,
    pub ratio: f64,
    pub n_samples: usize,
}

impl RegularizationTerm for TwoNorm {
    fn name(&self) -> &'static str {
        "twonorm"
    }

    fn apply(&self, problem: &mut OptimizationProblem) -> Result<(), ProblemError> {
        let (u, p_theta, p) = operator_variable(problem)?;
        let gamma_scalar = add_gamma_norm_block(problem, u, p_theta, p)?;
        problem.add_objective_linear(gamma_scalar, self.alpha * self.ratio / self.n_samples as f64)
    }
}

/// Nuclear-norm regularization via the standard semidefinite epigraph:
/// symmetric W1, W2 with `tr(W1) + tr(W2) <= 2 gamma` and
/// `[[W1, U], [U^T, W2]] >= 0`; linear charge `(alpha ratio / q) gamma`.
#[derive(Debug, Clone)]
pub struct NuclearNorm {
    pub alpha: f64,
    pub ratio: f64,
    pub n_samples: usize,
}

impl RegularizationTerm for NuclearNorm {
    fn name(&self) -> &'static str {
        "nuclear"
    }

    fn apply(&self, problem: &mut OptimizationProblem) -> Result<(), ProblemError> {
        let (u, p_theta, p) = operator_variable(problem)?;
        let w1 = problem.add_symmetric_variable("W1", p_theta)?;
        let w2 = problem.add_symmetric_variable("W2", p)?;
        let gamma = problem.add_variable("gamma", 1, 1)?;
        let gamma_scalar = problem.scalar_index_of(gamma);

        // 2 gamma - tr(W1) - tr(W2) >= 0 as a 1x1 block.
        let mut budget = AffExpr::default();
        budget.terms.push((gamma_scalar, 2.0));
        for i in 0..p_theta {
            budget
                .terms
                .push((problem.var_info(w1).scalar_index(i, i), -1.0));
        }
        for i in 0..p {
            budget
                .terms
                .push((problem.var_info(w2).scalar_index(i, i), -1.0));
        }
        problem.add_psd_constraint(MatExpr::scalar(budget))?;

        let u_expr = problem.var_expr(u);
        let block = MatExpr::block(vec![
            vec![problem.var_expr(w1), u_expr.clone()],
            vec![u_expr.t(), problem.var_expr(w2)],
        ])?;
        problem.add_psd_constraint(block)?;

        problem.add_objective_linear(gamma_scalar, self.alpha * self.ratio / self.n_samples as f64)
    }
}
