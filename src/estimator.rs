//! The model layer: configuration, validation, fit, and predict.
//!
//! `Estimator` owns the solver backend and the memoization caches, validates
//! every hyperparameter eagerly at the top of `fit`, and returns a
//! `FittedOperator` carrying the estimate together with its iteration
//! diagnostics and (for constrained fits) the property certificate. Soft
//! solver outcomes inside an alternating fit are recorded as stop reasons
//! rather than raised; hard parameter and dimension errors are always
//! raised.

use crate::admm::AdmmBackend;
use crate::alternation::{AlternatingSolver, CancelToken, StopReason};
use crate::backend::{BackendError, SolverBackend, SolverOptions, SolverStatus};
use crate::cache::InMemoryMemo;
use crate::constraints::{
    AlternatingConstraint, Certificate, Dissipativity, HinfGain, SpectralRadius,
};
use crate::data::{DataError, DataMatrices};
use crate::factorization::{Factorization, FactorizationError, FactorizationKind};
use crate::problem::{build_base, OptimizationProblem, ProblemError};
use crate::regularizers::{NuclearNorm, RegularizationTerm, Tikhonov, TwoNorm};
use crate::stats::SufficientStatistics;
use ndarray::Array2;
use thiserror::Error;

/// A comprehensive error type for the whole fitting pipeline.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Factorization(#[from] FactorizationError),

    #[error("problem construction failed: {0}")]
    Problem(#[from] ProblemError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("solver returned status {status:?}; a single-shot fit cannot recover from this")]
    SolverFailure { status: SolverStatus },

    #[error("fit was cancelled before any operator estimate was produced")]
    Cancelled,
}

/// Which convex regularizer an unconstrained fit carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegMethod {
    /// Explicit gamma^2 LMI term.
    Tikhonov,
    /// Spectral-norm term; mixes with a Tikhonov fold through `ratio`.
    TwoNorm,
    /// Nuclear-norm term; mixes with a Tikhonov fold through `ratio`.
    Nuclear,
}

/// Optional certificate-coupled constraint on the fitted operator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum OperatorConstraint {
    /// `rho(A) <= radius` for the state block.
    SpectralRadius { radius: f64, hot_start: bool },
    /// Bounded-real-lemma gain bound; optional constant output weights.
    HinfGain {
        c: Option<Array2<f64>>,
        d: Option<Array2<f64>>,
    },
    /// Supply-rate dissipativity; the matrix arrives through `FitOptions`.
    Dissipativity,
}

/// Hyperparameters of one estimator. Serializable so downstream tooling can
/// persist a fit configuration next to its artifacts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EstimatorConfig {
    /// Regularization strength; 0 disables regularization.
    pub alpha: f64,
    /// Share of `alpha` spent on the named term (the rest is folded into the
    /// covariance as Tikhonov). Must stay in (0, 1].
    pub ratio: f64,
    pub reg_method: RegMethod,
    pub factorization: FactorizationKind,
    /// Strict-definiteness slack on `Z` and on certificate floors.
    pub eps: f64,
    pub constraint: Option<OperatorConstraint>,
    /// Alternation budget; ignored by single-shot fits.
    pub max_iter: usize,
    /// Frobenius tolerance on successive operator iterates.
    pub iter_tol: f64,
    pub solver_options: SolverOptions,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            ratio: 1.0,
            reg_method: RegMethod::Tikhonov,
            factorization: FactorizationKind::Eig,
            eps: 1e-9,
            constraint: None,
            max_iter: 100,
            iter_tol: 1e-6,
            solver_options: SolverOptions::default(),
        }
    }
}

/// Maps a user-facing method name onto the closed factorization enum.
pub fn parse_factorization_name(name: &str) -> Result<FactorizationKind, EstimationError> {
    FactorizationKind::from_name(name).ok_or_else(|| {
        EstimationError::InvalidParameter(format!(
            "unknown factorization method `{name}`; expected one of inv, pinv, eig, ldl, chol, sqrt"
        ))
    })
}

/// Per-fit payloads that are data rather than configuration.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Supply-rate matrix for the dissipativity constraint.
    pub supply_rate: Option<Array2<f64>>,
    /// Warm-start certificate seeding the alternation.
    pub warm_start_certificate: Option<Array2<f64>>,
    /// Cooperative cancellation token.
    pub cancel: Option<CancelToken>,
}

/// A fitted operator estimate with its diagnostics.
#[derive(Debug, Clone)]
pub struct FittedOperator {
    /// `U^T`, shaped p x p_theta so that `predict` is a plain right-product.
    pub coef: Array2<f64>,
    /// Completed alternation rounds; 0 for single-shot fits.
    pub iterations: usize,
    /// Frobenius distance between the last two operator iterates.
    pub last_diff: Option<f64>,
    pub stop_reason: StopReason,
    /// Property certificate from the final certificate solve, when the fit
    /// was constrained.
    pub certificate: Option<Certificate>,
}

impl FittedOperator {
    /// One-step-ahead prediction: `y_hat = x . coef`.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>, EstimationError> {
        if x.ncols() != self.coef.nrows() {
            return Err(EstimationError::DimensionMismatch(format!(
                "prediction input has {} columns but the operator was fitted on {} lifted features",
                x.ncols(),
                self.coef.nrows()
            )));
        }
        Ok(x.dot(&self.coef))
    }
}

/// Assembles one operator-step problem: base relaxation, convex terms, and
/// (for alternating fits) the constraint row for the current certificate.
fn assemble_operator_problem(
    stats: &SufficientStatistics,
    factorization: &Factorization,
    eps: f64,
    terms: &[Box<dyn RegularizationTerm>],
    constraint: Option<(&dyn AlternatingConstraint, &Certificate)>,
) -> Result<OptimizationProblem, EstimationError> {
    let mut problem = build_base(stats, factorization, eps)?;
    for term in terms {
        term.apply(&mut problem)?;
    }
    if let Some((constraint, certificate)) = constraint {
        constraint.apply_to_operator_problem(&mut problem, certificate)?;
    }
    Ok(problem)
}

/// LMI-constrained least-squares estimator for lifted linear operators.
pub struct Estimator {
    config: EstimatorConfig,
    backend: Box<dyn SolverBackend>,
    stats_cache: InMemoryMemo<SufficientStatistics>,
    factorization_cache: InMemoryMemo<Factorization>,
}

impl Estimator {
    /// Builds an estimator with the reference splitting backend.
    pub fn new(config: EstimatorConfig) -> Self {
        Self::with_backend(config, Box::new(AdmmBackend::default()))
    }

    /// Builds an estimator around an injected backend.
    pub fn with_backend(config: EstimatorConfig, backend: Box<dyn SolverBackend>) -> Self {
        Self {
            config,
            backend,
            stats_cache: InMemoryMemo::new(),
            factorization_cache: InMemoryMemo::new(),
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    fn validate_config(&self) -> Result<(), EstimationError> {
        let c = &self.config;
        if !(c.alpha >= 0.0) {
            return Err(EstimationError::InvalidParameter(format!(
                "alpha must be nonnegative, got {}",
                c.alpha
            )));
        }
        if !(c.ratio > 0.0 && c.ratio <= 1.0) {
            return Err(EstimationError::InvalidParameter(format!(
                "ratio must lie in (0, 1], got {}; use the unregularized variant instead of ratio = 0",
                c.ratio
            )));
        }
        if !(c.eps >= 0.0) {
            return Err(EstimationError::InvalidParameter(format!(
                "eps must be nonnegative, got {}",
                c.eps
            )));
        }
        if !(c.iter_tol > 0.0) {
            return Err(EstimationError::InvalidParameter(format!(
                "iter_tol must be positive, got {}",
                c.iter_tol
            )));
        }
        if matches!(c.reg_method, RegMethod::TwoNorm | RegMethod::Nuclear) && !(c.alpha > 0.0) {
            return Err(EstimationError::InvalidParameter(
                "mixing-ratio regularizers require alpha > 0".to_string(),
            ));
        }
        if let Some(constraint) = &c.constraint {
            if c.max_iter == 0 {
                return Err(EstimationError::InvalidParameter(
                    "max_iter must be at least 1 for an alternating fit".to_string(),
                ));
            }
            match constraint {
                OperatorConstraint::SpectralRadius { radius, .. } => {
                    if !(*radius > 0.0) {
                        return Err(EstimationError::InvalidParameter(format!(
                            "spectral radius bound must be positive, got {radius}"
                        )));
                    }
                }
                OperatorConstraint::HinfGain { .. } => {
                    if !(c.alpha > 0.0) {
                        return Err(EstimationError::InvalidParameter(
                            "the H-infinity gain regularizer requires alpha > 0".to_string(),
                        ));
                    }
                }
                OperatorConstraint::Dissipativity => {}
            }
        }
        Ok(())
    }

    /// Fits the operator estimate. `options` carries per-fit payloads: the
    /// supply-rate matrix, an optional warm-start certificate, and an
    /// optional cancellation token.
    pub fn fit(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        options: &FitOptions,
    ) -> Result<FittedOperator, EstimationError> {
        self.validate_config()?;
        let data = DataMatrices::new(x.clone(), y.clone())?;
        let q = data.n_samples();
        let p = data.lifted_dim();
        let p_theta = data.output_dim();
        log::info!(
            "fitting operator estimate: q={q} samples, p={p} lifted features, p_theta={p_theta} outputs"
        );

        let config = &self.config;
        // Split alpha between the covariance fold and the explicit term.
        let (alpha_fold, terms): (f64, Vec<Box<dyn RegularizationTerm>>) =
            match (&config.constraint, config.reg_method) {
                (Some(OperatorConstraint::HinfGain { .. }), _) => {
                    // The gain bound is itself the mixing regularizer.
                    (config.alpha * (1.0 - config.ratio), Vec::new())
                }
                (Some(_), _) => (config.alpha, Vec::new()),
                (None, RegMethod::Tikhonov) => {
                    if config.alpha > 0.0 {
                        (
                            0.0,
                            vec![Box::new(Tikhonov {
                                alpha: config.alpha,
                                n_samples: q,
                            })],
                        )
                    } else {
                        (0.0, Vec::new())
                    }
                }
                (None, RegMethod::TwoNorm) => (
                    config.alpha * (1.0 - config.ratio),
                    vec![Box::new(TwoNorm {
                        alpha: config.alpha,
                        ratio: config.ratio,
                        n_samples: q,
                    })],
                ),
                (None, RegMethod::Nuclear) => (
                    config.alpha * (1.0 - config.ratio),
                    vec![Box::new(NuclearNorm {
                        alpha: config.alpha,
                        ratio: config.ratio,
                        n_samples: q,
                    })],
                ),
            };

        let stats = SufficientStatistics::compute_cached(&self.stats_cache, &data, alpha_fold);
        let factorization = Factorization::compute_cached(
            &self.factorization_cache,
            config.factorization,
            &stats.h,
        )?;

        let Some(constraint_config) = &config.constraint else {
            // Single-shot convex fit: any non-optimal status is a hard error.
            let mut problem =
                assemble_operator_problem(&stats, &factorization, config.eps, &terms, None)?;
            let solution = self.backend.solve(&problem, &config.solver_options)?;
            problem.mark_solved();
            if solution.status != SolverStatus::Optimal {
                return Err(EstimationError::SolverFailure {
                    status: solution.status,
                });
            }
            let u = solution
                .value("U")
                .cloned()
                .ok_or_else(|| BackendError::MissingVariable("U".to_string()))?;
            log::info!("single-shot fit finished with status {:?}", solution.status);
            return Ok(FittedOperator {
                coef: u.t().to_owned(),
                iterations: 0,
                last_diff: None,
                stop_reason: StopReason::Converged,
                certificate: None,
            });
        };

        if p < p_theta {
            return Err(EstimationError::DimensionMismatch(format!(
                "constrained fits need the lifted state to contain the output block: p={p} < p_theta={p_theta}"
            )));
        }

        let constraint: Box<dyn AlternatingConstraint> = match constraint_config {
            OperatorConstraint::SpectralRadius { radius, hot_start } => {
                Box::new(SpectralRadius::new(*radius, p_theta, *hot_start))
            }
            OperatorConstraint::HinfGain { c, d } => Box::new(HinfGain::new(
                p_theta,
                p - p_theta,
                config.alpha * config.ratio / q as f64,
                c.clone(),
                d.clone(),
            )?),
            OperatorConstraint::Dissipativity => {
                let xi = options.supply_rate.as_ref().ok_or_else(|| {
                    EstimationError::InvalidParameter(
                        "the dissipativity constraint requires a supply-rate matrix in FitOptions"
                            .to_string(),
                    )
                })?;
                Box::new(Dissipativity::new(p_theta, p - p_theta, xi)?)
            }
        };

        let initial = match &options.warm_start_certificate {
            Some(seed) => {
                if seed.nrows() != p_theta || seed.ncols() != p_theta {
                    return Err(EstimationError::DimensionMismatch(format!(
                        "warm-start certificate must be {p_theta}x{p_theta}, got {}x{}",
                        seed.nrows(),
                        seed.ncols()
                    )));
                }
                Certificate {
                    matrix: seed.clone(),
                    gain: None,
                }
            }
            None => constraint.initial_certificate(
                &stats,
                self.backend.as_ref(),
                &config.solver_options,
                config.eps,
            )?,
        };

        let driver = AlternatingSolver::new(
            self.backend.as_ref(),
            &config.solver_options,
            config.max_iter,
            config.iter_tol,
            config.eps,
            options.cancel.as_ref(),
        );
        let outcome = driver.run(
            constraint.as_ref(),
            |cert| {
                assemble_operator_problem(
                    &stats,
                    &factorization,
                    config.eps,
                    &terms,
                    Some((constraint.as_ref(), cert)),
                )
            },
            initial,
        )?;
        log::info!(
            "{} fit stopped after {} rounds: {:?}",
            constraint.name(),
            outcome.iterations,
            outcome.stop_reason
        );

        Ok(FittedOperator {
            coef: outcome.u.t().to_owned(),
            iterations: outcome.iterations,
            last_diff: outcome.last_diff,
            stop_reason: outcome.stop_reason,
            certificate: Some(outcome.certificate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn snapshots() -> (Array2<f64>, Array2<f64>) {
        let x = arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
        let y = &x * 2.0;
        (x, y)
    }

    #[test]
    fn rejection_table() {
        let (x, y) = snapshots();
        let fit = |config: EstimatorConfig| Estimator::new(config).fit(&x, &y, &FitOptions::default());

        let negative_alpha = EstimatorConfig {
            alpha: -1.0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            fit(negative_alpha).unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));

        let zero_ratio = EstimatorConfig {
            alpha: 1.0,
            ratio: 0.0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            fit(zero_ratio).unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));

        let negative_eps = EstimatorConfig {
            eps: -1.0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            fit(negative_eps).unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));

        let zero_radius = EstimatorConfig {
            constraint: Some(OperatorConstraint::SpectralRadius {
                radius: 0.0,
                hot_start: false,
            }),
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            fit(zero_radius).unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));

        let zero_max_iter = EstimatorConfig {
            constraint: Some(OperatorConstraint::SpectralRadius {
                radius: 0.9,
                hot_start: false,
            }),
            max_iter: 0,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            fit(zero_max_iter).unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));
    }

    #[test]
    fn unknown_factorization_name_is_invalid() {
        assert!(parse_factorization_name("chol").is_ok());
        assert!(matches!(
            parse_factorization_name("blah").unwrap_err(),
            EstimationError::InvalidParameter(_)
        ));
    }

    #[test]
    fn mismatched_rows_are_a_dimension_error() {
        let x = Array2::zeros((4, 2));
        let y = Array2::zeros((3, 2));
        let err = Estimator::new(EstimatorConfig::default())
            .fit(&x, &y, &FitOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Data(DataError::RowCountMismatch { .. })
        ));
    }

    #[test]
    fn dissipativity_without_supply_rate_is_invalid() {
        let (x, y) = snapshots();
        let config = EstimatorConfig {
            constraint: Some(OperatorConstraint::Dissipativity),
            ..EstimatorConfig::default()
        };
        let err = Estimator::new(config)
            .fit(&x, &y, &FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, EstimationError::InvalidParameter(_)));
    }

    #[test]
    fn wrong_shaped_supply_rate_is_a_dimension_error() {
        let (x, y) = snapshots();
        let config = EstimatorConfig {
            constraint: Some(OperatorConstraint::Dissipativity),
            ..EstimatorConfig::default()
        };
        let options = FitOptions {
            supply_rate: Some(Array2::eye(5)),
            ..FitOptions::default()
        };
        let err = Estimator::new(config).fit(&x, &y, &options).unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch(_)));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = EstimatorConfig {
            alpha: 0.25,
            factorization: FactorizationKind::Ldl,
            ..EstimatorConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EstimatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.factorization, config.factorization);
        assert_eq!(back.alpha, config.alpha);
        assert_eq!(back.max_iter, config.max_iter);
    }

    #[test]
    fn predict_checks_feature_count() {
        let fitted = FittedOperator {
            coef: Array2::eye(2),
            iterations: 0,
            last_diff: None,
            stop_reason: StopReason::Converged,
            certificate: None,
        };
        assert!(fitted.predict(&Array2::zeros((5, 3))).is_err());
        assert!(fitted.predict(&Array2::zeros((5, 2))).is_ok());
    }
}
