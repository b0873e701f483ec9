//! The solver seam.
//!
//! A backend solves one SDP instance and reports a status plus the valued
//! variables. The crate treats the backend as an injected capability: the
//! estimator and the alternation driver only ever talk to the trait. The
//! shipped reference implementation lives in [`crate::admm`].

use crate::problem::OptimizationProblem;
use ndarray::Array2;
use std::collections::HashMap;
use thiserror::Error;

/// Terminal status of one solve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum SolverStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Unknown,
    Error,
}

/// Backend-facing knobs, enumerated once for all backends. A backend honors
/// the subset it understands: `integrality_tol` only matters to MIP-capable
/// solvers, `dualize` to backends that can solve the dual instead, and
/// `solver` is a free-form selection hint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SolverOptions {
    pub primal_feasibility_tol: f64,
    pub dual_feasibility_tol: f64,
    pub optimality_tol: f64,
    pub integrality_tol: f64,
    pub dualize: bool,
    pub solver: Option<String>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            primal_feasibility_tol: 1e-8,
            dual_feasibility_tol: 1e-8,
            optimality_tol: 1e-8,
            integrality_tol: 1e-6,
            dualize: false,
            solver: None,
        }
    }
}

/// Valued variables of one solve, keyed by variable name. Scalars come back
/// as 1x1 matrices.
#[derive(Debug, Clone)]
pub struct Solution {
    pub status: SolverStatus,
    pub values: HashMap<String, Array2<f64>>,
}

impl Solution {
    pub fn value(&self, name: &str) -> Option<&Array2<f64>> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(|m| {
            if m.len() == 1 {
                Some(m[[0, 0]])
            } else {
                None
            }
        })
    }
}

/// Hard failures inside a backend. A solve that merely fails to reach
/// optimality is not an error; it reports through [`SolverStatus`] instead.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("dense linear algebra failed inside the solver backend: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("the solution is missing a value for variable `{0}`")]
    MissingVariable(String),
}

/// Solves one SDP instance.
pub trait SolverBackend {
    fn solve(
        &self,
        problem: &OptimizationProblem,
        options: &SolverOptions,
    ) -> Result<Solution, BackendError>;
}
