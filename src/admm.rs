//! Reference SDP backend: conic operator splitting (ADMM) over PSD cones.
//!
//! The problems this crate builds are small and dense, which keeps the
//! classic splitting effective: an x-update that solves one cached
//! regularized normal system, a z-update that projects each constraint block
//! onto the PSD cone by eigenvalue clipping, and a scaled dual ascent, with
//! over-relaxation and residual-balanced penalty adaptation. Termination
//! follows the usual primal/dual residual test.
//!
//! The backend reports `Optimal` only when both residuals meet the requested
//! tolerances, `Unknown` on iteration exhaustion, and `Error` on numerical
//! breakdown. It has no infeasibility certificates, so it never claims
//! `Infeasible` or `Unbounded` for constrained problems.

use crate::backend::{BackendError, Solution, SolverBackend, SolverOptions, SolverStatus};
use crate::problem::OptimizationProblem;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, FactorizeInto, Solve, UPLO};
use std::collections::HashMap;

/// How often residual balancing may adjust the penalty parameter.
const RHO_ADAPT_INTERVAL: usize = 100;
/// Residual imbalance factor that triggers an adjustment.
const RHO_ADAPT_RATIO: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct AdmmBackend {
    pub max_iterations: usize,
    pub initial_rho: f64,
    pub over_relaxation: f64,
    pub adaptive_rho: bool,
}

impl Default for AdmmBackend {
    fn default() -> Self {
        Self {
            max_iterations: 200_000,
            initial_rho: 1.0,
            over_relaxation: 1.6,
            adaptive_rho: true,
        }
    }
}

/// One PSD constraint in dense affine form: `constant + sum x_k coeffs[k]`.
struct ConeBlock {
    constant: Array2<f64>,
    coeffs: Vec<(usize, Array2<f64>)>,
}

fn frobenius_inner(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn frobenius_norm_sq(a: &Array2<f64>) -> f64 {
    a.iter().map(|v| v * v).sum()
}

/// Projects a symmetric matrix onto the PSD cone by clipping negative
/// eigenvalues.
fn project_psd(w: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
    let sym = (w + &w.t()) * 0.5;
    let (vals, vecs) = sym.eigh(UPLO::Lower)?;
    if vals.iter().all(|v| *v >= 0.0) {
        return Ok(sym);
    }
    let mut scaled = vecs.clone();
    for (j, lam) in vals.iter().copied().enumerate() {
        let clipped = lam.max(0.0);
        scaled.column_mut(j).mapv_inplace(|v| v * clipped);
    }
    Ok(scaled.dot(&vecs.t()))
}

/// Extracts the dense affine form of every constraint.
fn collect_blocks(problem: &OptimizationProblem) -> Vec<ConeBlock> {
    problem
        .constraints()
        .iter()
        .map(|constraint| {
            let expr = constraint.expr();
            let dim = expr.nrows();
            let mut constant = Array2::zeros((dim, dim));
            let mut coeffs: HashMap<usize, Array2<f64>> = HashMap::new();
            for i in 0..dim {
                for j in 0..dim {
                    let entry = expr.entry(i, j);
                    constant[[i, j]] = entry.constant;
                    for &(k, w) in &entry.terms {
                        coeffs
                            .entry(k)
                            .or_insert_with(|| Array2::zeros((dim, dim)))[[i, j]] += w;
                    }
                }
            }
            let mut coeffs: Vec<(usize, Array2<f64>)> = coeffs.into_iter().collect();
            coeffs.sort_by_key(|(k, _)| *k);
            ConeBlock { constant, coeffs }
        })
        .collect()
}

/// The x-update normal matrix `2 diag(quad) + rho * gram + ridge`.
fn assemble_normal_matrix(gram: &Array2<f64>, quad: &[f64], rho: f64) -> Array2<f64> {
    let n = quad.len();
    let mut normal = gram * rho;
    let mut max_diag = 0.0_f64;
    for k in 0..n {
        normal[[k, k]] += 2.0 * quad[k];
        max_diag = max_diag.max(normal[[k, k]].abs());
    }
    // Tiny ridge so feasibility problems with a rank-deficient Gram matrix
    // still factorize; orders of magnitude below the solve tolerances.
    let ridge = 1e-12 * (1.0 + max_diag);
    for k in 0..n {
        normal[[k, k]] += ridge;
    }
    normal
}

fn extract_values(
    problem: &OptimizationProblem,
    x: &Array1<f64>,
) -> HashMap<String, Array2<f64>> {
    let mut values = HashMap::new();
    for var in problem.variables() {
        let mut m = Array2::zeros((var.rows(), var.cols()));
        for i in 0..var.rows() {
            for j in 0..var.cols() {
                m[[i, j]] = x[var.scalar_index(i, j)];
            }
        }
        values.insert(var.name().to_string(), m);
    }
    values
}

impl SolverBackend for AdmmBackend {
    fn solve(
        &self,
        problem: &OptimizationProblem,
        options: &SolverOptions,
    ) -> Result<Solution, BackendError> {
        let n = problem.scalar_count();
        let objective = problem.objective();
        let mut lin = vec![0.0; n];
        for &(k, w) in &objective.linear {
            lin[k] += w;
        }
        let mut quad = vec![0.0; n];
        for &(k, w) in &objective.quadratic {
            quad[k] += w;
        }

        let blocks = collect_blocks(problem);
        if blocks.is_empty() {
            // Unconstrained separable quadratic; kept for completeness.
            let mut x = Array1::zeros(n);
            let mut status = SolverStatus::Optimal;
            for k in 0..n {
                if quad[k] > 0.0 {
                    x[k] = -lin[k] / (2.0 * quad[k]);
                } else if lin[k] != 0.0 {
                    status = SolverStatus::Unbounded;
                }
            }
            return Ok(Solution {
                status,
                values: extract_values(problem, &x),
            });
        }

        // Gram matrix of the stacked affine maps: gram[k, l] = sum_j <C_jk, C_jl>.
        let mut gram = Array2::<f64>::zeros((n, n));
        for block in &blocks {
            for (a, (ka, ca)) in block.coeffs.iter().enumerate() {
                for (kb, cb) in &block.coeffs[a..] {
                    let dot = frobenius_inner(ca, cb);
                    gram[[*ka, *kb]] += dot;
                    if ka != kb {
                        gram[[*kb, *ka]] += dot;
                    }
                }
            }
        }

        let alpha = self.over_relaxation;
        let mut rho = self.initial_rho;
        let mut factor = assemble_normal_matrix(&gram, &quad, rho).factorize_into()?;

        let mut x = Array1::<f64>::zeros(n);
        let mut z: Vec<Array2<f64>> = blocks
            .iter()
            .map(|b| Array2::zeros(b.constant.raw_dim()))
            .collect();
        let mut dual: Vec<Array2<f64>> = z.clone();

        for iteration in 0..self.max_iterations {
            // x-update: argmin of objective + (rho/2) sum ||A_j x + b_j - z_j + u_j||^2.
            let mut rhs = Array1::from_iter(lin.iter().map(|v| -v));
            for (bi, block) in blocks.iter().enumerate() {
                let target = &z[bi] - &dual[bi] - &block.constant;
                for (k, ck) in &block.coeffs {
                    rhs[*k] += rho * frobenius_inner(ck, &target);
                }
            }
            x = factor.solve(&rhs)?;

            // z-update with over-relaxation, dual ascent, residual bookkeeping.
            let mut primal_sq = 0.0;
            let mut image_sq = 0.0;
            let mut z_sq = 0.0;
            let mut dual_res = Array1::<f64>::zeros(n);
            let mut dual_gap = Array1::<f64>::zeros(n);
            for (bi, block) in blocks.iter().enumerate() {
                let mut image = block.constant.clone();
                for (k, ck) in &block.coeffs {
                    image.scaled_add(x[*k], ck);
                }
                let relaxed = &image * alpha + &z[bi] * (1.0 - alpha);
                let w = &relaxed + &dual[bi];
                let z_new = project_psd(&w)?;
                dual[bi] = &dual[bi] + &relaxed - &z_new;

                let residual = &image - &z_new;
                primal_sq += frobenius_norm_sq(&residual);
                image_sq += frobenius_norm_sq(&image);
                z_sq += frobenius_norm_sq(&z_new);
                let z_diff = &z_new - &z[bi];
                for (k, ck) in &block.coeffs {
                    dual_res[*k] += rho * frobenius_inner(ck, &z_diff);
                    dual_gap[*k] += rho * frobenius_inner(ck, &dual[bi]);
                }
                z[bi] = z_new;
            }

            let primal_norm = primal_sq.sqrt();
            let dual_norm = dual_res.iter().map(|v| v * v).sum::<f64>().sqrt();
            let scale_pri = image_sq.sqrt().max(z_sq.sqrt());
            let scale_dual = dual_gap.iter().map(|v| v * v).sum::<f64>().sqrt();
            let eps_pri = options.primal_feasibility_tol + options.optimality_tol * scale_pri;
            let eps_dual = options.dual_feasibility_tol + options.optimality_tol * scale_dual;

            if !primal_norm.is_finite() || !dual_norm.is_finite() {
                log::warn!("splitting iteration {iteration} produced non-finite residuals");
                return Ok(Solution {
                    status: SolverStatus::Error,
                    values: extract_values(problem, &x),
                });
            }

            if primal_norm <= eps_pri && dual_norm <= eps_dual {
                log::debug!(
                    "splitting converged after {} iterations (primal {:.3e}, dual {:.3e})",
                    iteration + 1,
                    primal_norm,
                    dual_norm
                );
                return Ok(Solution {
                    status: SolverStatus::Optimal,
                    values: extract_values(problem, &x),
                });
            }

            if self.adaptive_rho
                && iteration % RHO_ADAPT_INTERVAL == RHO_ADAPT_INTERVAL - 1
            {
                if primal_norm > RHO_ADAPT_RATIO * dual_norm && rho < 1e6 {
                    rho *= 2.0;
                    for u in &mut dual {
                        u.mapv_inplace(|v| v * 0.5);
                    }
                    factor = assemble_normal_matrix(&gram, &quad, rho).factorize_into()?;
                } else if dual_norm > RHO_ADAPT_RATIO * primal_norm && rho > 1e-6 {
                    rho *= 0.5;
                    for u in &mut dual {
                        u.mapv_inplace(|v| v * 2.0);
                    }
                    factor = assemble_normal_matrix(&gram, &quad, rho).factorize_into()?;
                }
            }
        }

        log::warn!(
            "splitting exhausted {} iterations without meeting tolerances",
            self.max_iterations
        );
        Ok(Solution {
            status: SolverStatus::Unknown,
            values: extract_values(problem, &x),
        })
    }
}
