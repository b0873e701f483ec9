//! Two-block alternation for bilinear operator constraints.
//!
//! The constrained regressors couple the operator `U` to a certificate
//! (Lyapunov-type matrix, possibly with a gain bound) through a bilinear
//! matrix inequality. Neither block is convex jointly, but each is convex
//! with the other fixed, so the driver here alternates: SolveA fixes the
//! certificate and solves for the operator, SolveB fixes the operator and
//! recovers a certificate, until successive operators stop moving. This is a
//! documented local heuristic; the stopping rule certifies iterate
//! stationarity, not global optimality.

use crate::backend::{SolverBackend, SolverOptions, SolverStatus};
use crate::constraints::{AlternatingConstraint, Certificate};
use crate::estimator::EstimationError;
use crate::problem::OptimizationProblem;
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token.
///
/// Settable from any thread; the alternation polls it only at safe points
/// (immediately before each inner solve), so raising it never corrupts an
/// in-flight fit, it only stops further iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a fit stopped. Carried on every fitted model so a fit that did not
/// converge is never silent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    /// Successive operator iterates moved less than the tolerance.
    Converged,
    /// The iteration budget ran out first.
    MaxIterationsReached,
    /// A subproblem came back non-optimal; the last valid estimate was kept.
    Stalled { status: SolverStatus },
    /// The cancellation token was raised between solves.
    UserStopped,
}

/// Final state of one alternation run.
#[derive(Debug, Clone)]
pub struct AlternationOutcome {
    /// Operator estimate, in the problem's orientation (p_theta x p).
    pub u: Array2<f64>,
    pub certificate: Certificate,
    /// Completed operator solves.
    pub iterations: usize,
    /// Frobenius distance between the last two operator iterates.
    pub last_diff: Option<f64>,
    pub stop_reason: StopReason,
}

/// Drives the SolveA/SolveB loop against an injected backend.
pub struct AlternatingSolver<'a> {
    backend: &'a dyn SolverBackend,
    options: &'a SolverOptions,
    max_iter: usize,
    tol: f64,
    eps: f64,
    cancel: Option<&'a CancelToken>,
}

impl<'a> AlternatingSolver<'a> {
    pub fn new(
        backend: &'a dyn SolverBackend,
        options: &'a SolverOptions,
        max_iter: usize,
        tol: f64,
        eps: f64,
        cancel: Option<&'a CancelToken>,
    ) -> Self {
        Self {
            backend,
            options,
            max_iter,
            tol,
            eps,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Runs the alternation. `build_operator_problem` must assemble a fresh
    /// SolveA instance for the given certificate (base problem, convex
    /// terms, and the now-convex constraint row).
    pub fn run<F>(
        &self,
        constraint: &dyn AlternatingConstraint,
        build_operator_problem: F,
        initial: Certificate,
    ) -> Result<AlternationOutcome, EstimationError>
    where
        F: Fn(&Certificate) -> Result<OptimizationProblem, EstimationError>,
    {
        if self.max_iter == 0 {
            return Err(EstimationError::InvalidParameter(
                "max_iter must be at least 1 for an alternating fit".to_string(),
            ));
        }

        let mut certificate = initial;
        let mut u_prev: Option<Array2<f64>> = None;
        let mut last_diff: Option<f64> = None;

        for round in 1..=self.max_iter {
            if self.cancelled() {
                return match u_prev {
                    Some(u) => Ok(AlternationOutcome {
                        u,
                        certificate,
                        iterations: round - 1,
                        last_diff,
                        stop_reason: StopReason::UserStopped,
                    }),
                    None => Err(EstimationError::Cancelled),
                };
            }

            // SolveA: certificate fixed, operator free.
            let mut problem_a = build_operator_problem(&certificate)?;
            let solution_a = self.backend.solve(&problem_a, self.options)?;
            problem_a.mark_solved();
            if solution_a.status != SolverStatus::Optimal {
                log::warn!(
                    "{} operator step came back {:?} in round {round}; keeping the previous estimate",
                    constraint.name(),
                    solution_a.status
                );
                return match u_prev {
                    Some(u) => Ok(AlternationOutcome {
                        u,
                        certificate,
                        iterations: round - 1,
                        last_diff,
                        stop_reason: StopReason::Stalled {
                            status: solution_a.status,
                        },
                    }),
                    None => Err(EstimationError::SolverFailure {
                        status: solution_a.status,
                    }),
                };
            }
            let u_round = solution_a
                .value("U")
                .cloned()
                .ok_or_else(|| crate::backend::BackendError::MissingVariable("U".to_string()))?;

            if self.cancelled() {
                return Ok(AlternationOutcome {
                    u: u_round,
                    certificate,
                    iterations: round,
                    last_diff,
                    stop_reason: StopReason::UserStopped,
                });
            }

            // SolveB: operator fixed, certificate free.
            let mut problem_b = constraint.certificate_problem(&u_round, self.eps)?;
            let solution_b = self.backend.solve(&problem_b, self.options)?;
            problem_b.mark_solved();
            if solution_b.status != SolverStatus::Optimal {
                log::warn!(
                    "{} certificate step came back {:?} in round {round}; keeping the round's estimate",
                    constraint.name(),
                    solution_b.status
                );
                return Ok(AlternationOutcome {
                    u: u_round,
                    certificate,
                    iterations: round,
                    last_diff,
                    stop_reason: StopReason::Stalled {
                        status: solution_b.status,
                    },
                });
            }
            certificate = constraint.extract_certificate(&solution_b)?;

            // Convergence on the operator block. The first round compares
            // against the zero matrix, so a genuinely zero operator
            // converges immediately rather than spinning.
            let diff = match &u_prev {
                Some(prev) => frobenius_diff(&u_round, prev),
                None => u_round.iter().map(|v| v * v).sum::<f64>().sqrt(),
            };
            last_diff = Some(diff);
            log::debug!(
                "{} round {round}: operator moved {diff:.3e} (tolerance {:.3e})",
                constraint.name(),
                self.tol
            );
            if diff < self.tol {
                log::info!(
                    "{} alternation converged after {round} rounds",
                    constraint.name()
                );
                return Ok(AlternationOutcome {
                    u: u_round,
                    certificate,
                    iterations: round,
                    last_diff,
                    stop_reason: StopReason::Converged,
                });
            }
            u_prev = Some(u_round);
        }

        log::info!(
            "{} alternation hit the iteration budget of {}",
            constraint.name(),
            self.max_iter
        );
        let u = u_prev.expect("max_iter >= 1 guarantees at least one completed round");
        Ok(AlternationOutcome {
            u,
            certificate,
            iterations: self.max_iter,
            last_diff,
            stop_reason: StopReason::MaxIterationsReached,
        })
    }
}

fn frobenius_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
