//! End-to-end fits against the reference splitting backend.

use koopcert::alternation::StopReason;
use koopcert::backend::SolverOptions;
use koopcert::estimator::{
    Estimator, EstimatorConfig, FitOptions, OperatorConstraint, RegMethod,
};
use koopcert::factorization::FactorizationKind;
use ndarray::{arr2, s, Array2};
use ndarray_linalg::Eig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tight_solver_options() -> SolverOptions {
    SolverOptions {
        primal_feasibility_tol: 1e-10,
        dual_feasibility_tol: 1e-10,
        optimality_tol: 1e-10,
        ..SolverOptions::default()
    }
}

/// Backend with a raised iteration budget for the tight-tolerance tests.
fn patient_backend() -> Box<koopcert::admm::AdmmBackend> {
    Box::new(koopcert::admm::AdmmBackend {
        max_iterations: 500_000,
        ..koopcert::admm::AdmmBackend::default()
    })
}

/// Noiseless snapshots of y = x A^T with iid Gaussian lifted states.
fn linear_snapshots(a: &Array2<f64>, q: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let p = a.ncols();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((q, p), |_| normal.sample(&mut rng));
    let y = x.dot(&a.t());
    (x, y)
}

fn spectral_radius_of(m: &Array2<f64>) -> f64 {
    let (eigvals, _) = m.eig().expect("eigendecomposition of the state block");
    eigvals.iter().map(|l| l.norm()).fold(0.0, f64::max)
}

fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[test]
fn concrete_scenario_recovers_the_doubling_map() {
    init_logging();
    // x is 3x2, y doubles every feature; the exact operator is 2 I.
    let x = arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    let y = &x * 2.0;
    let config = EstimatorConfig {
        solver_options: tight_solver_options(),
        ..EstimatorConfig::default()
    };
    let fitted = Estimator::with_backend(config, patient_backend())
        .fit(&x, &y, &FitOptions::default())
        .expect("unregularized fit on exact data");
    assert_eq!(fitted.stop_reason, StopReason::Converged);
    assert_eq!(fitted.iterations, 0, "single-shot fits do not iterate");

    let expected = Array2::eye(2) * 2.0;
    let err = max_abs_diff(&fitted.coef, &expected);
    println!("doubling-map coefficient error: {err:.3e}");
    assert!(err < 1e-6, "coef must recover 2 I, worst entry off by {err}");

    let predicted = fitted.predict(&x).unwrap();
    assert!(max_abs_diff(&predicted, &y) < 1e-5);
}

#[test]
fn factorization_methods_agree_on_the_same_data() {
    init_logging();
    let a = arr2(&[[0.8, 0.1, 0.0], [0.0, 0.6, 0.2], [0.1, 0.0, 0.7]]);
    let (x, y) = linear_snapshots(&a, 30, 7);

    let mut estimates = Vec::new();
    for kind in FactorizationKind::ALL {
        let config = EstimatorConfig {
            factorization: kind,
            solver_options: tight_solver_options(),
            ..EstimatorConfig::default()
        };
        let fitted = Estimator::with_backend(config, patient_backend())
            .fit(&x, &y, &FitOptions::default())
            .unwrap_or_else(|e| panic!("{kind} fit failed: {e}"));
        estimates.push((kind, fitted.coef));
    }
    for (kind_a, coef_a) in &estimates {
        for (kind_b, coef_b) in &estimates {
            let gap = max_abs_diff(coef_a, coef_b);
            assert!(
                gap < 1e-6,
                "{kind_a} and {kind_b} disagree by {gap:.3e}; the Schur blocks must describe the same feasible region"
            );
        }
    }
    // And they all sit on the true operator for noiseless data.
    let truth = a.t().to_owned();
    for (kind, coef) in &estimates {
        let err = max_abs_diff(coef, &truth);
        assert!(err < 1e-4, "{kind} missed the true operator by {err:.3e}");
    }
}

#[test]
fn unregularized_fit_recovers_the_true_operator() {
    init_logging();
    let a = arr2(&[[0.9, 0.2, -0.1], [0.05, 0.7, 0.0], [0.0, -0.2, 0.5]]);
    // q = 25 >= 5 p.
    let (x, y) = linear_snapshots(&a, 25, 21);
    let fitted = Estimator::new(EstimatorConfig::default())
        .fit(&x, &y, &FitOptions::default())
        .expect("noiseless recovery fit");
    let err = max_abs_diff(&fitted.coef, &a.t().to_owned());
    println!("noiseless recovery error: {err:.3e}");
    assert!(err < 1e-4);
}

#[test]
fn tikhonov_regularization_shrinks_the_estimate() {
    init_logging();
    let x = arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    let y = &x * 2.0;
    let norm = |m: &Array2<f64>| m.iter().map(|v| v * v).sum::<f64>().sqrt();

    let plain = Estimator::new(EstimatorConfig::default())
        .fit(&x, &y, &FitOptions::default())
        .unwrap();
    let ridged = Estimator::new(EstimatorConfig {
        alpha: 50.0,
        ..EstimatorConfig::default()
    })
    .fit(&x, &y, &FitOptions::default())
    .unwrap();

    let n_plain = norm(&plain.coef);
    let n_ridged = norm(&ridged.coef);
    println!("norms: unregularized {n_plain:.4}, tikhonov {n_ridged:.4}");
    assert!(
        n_ridged < n_plain - 1e-3,
        "a heavy Tikhonov penalty must shrink the operator"
    );
}

#[test]
fn mixing_regularizers_fit_and_shrink() {
    init_logging();
    let x = arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0], [0.5, -1.0]]);
    let y = &x * 2.0;
    let norm = |m: &Array2<f64>| m.iter().map(|v| v * v).sum::<f64>().sqrt();
    let plain = Estimator::new(EstimatorConfig::default())
        .fit(&x, &y, &FitOptions::default())
        .unwrap();

    for reg_method in [RegMethod::TwoNorm, RegMethod::Nuclear] {
        let fitted = Estimator::new(EstimatorConfig {
            alpha: 20.0,
            ratio: 0.5,
            reg_method,
            ..EstimatorConfig::default()
        })
        .fit(&x, &y, &FitOptions::default())
        .unwrap_or_else(|e| panic!("{reg_method:?} fit failed: {e}"));
        assert!(fitted.coef.iter().all(|v| v.is_finite()));
        assert!(
            norm(&fitted.coef) < norm(&plain.coef),
            "{reg_method:?} must shrink the operator"
        );
    }
}

#[test]
fn spectral_radius_constraint_stabilizes_an_unstable_fit() {
    init_logging();
    let a_true = arr2(&[[1.05, 0.0], [0.1, 0.7]]);
    let (x, y) = linear_snapshots(&a_true, 40, 3);
    let radius = 0.95;

    // The unconstrained estimate reproduces the unstable dynamics.
    let plain = Estimator::new(EstimatorConfig::default())
        .fit(&x, &y, &FitOptions::default())
        .unwrap();
    let rho_plain = spectral_radius_of(&plain.coef.t().to_owned());
    assert!(
        rho_plain > radius,
        "fixture must be unstable, got rho = {rho_plain}"
    );

    let config = EstimatorConfig {
        constraint: Some(OperatorConstraint::SpectralRadius {
            radius,
            hot_start: false,
        }),
        max_iter: 15,
        iter_tol: 1e-6,
        ..EstimatorConfig::default()
    };
    let fitted = Estimator::new(config)
        .fit(&x, &y, &FitOptions::default())
        .expect("stabilized fit");
    assert!(fitted.iterations <= 15);
    assert!(fitted.certificate.is_some());

    let u = fitted.coef.t().to_owned();
    let rho_fitted = spectral_radius_of(&u.slice(s![.., ..2]).to_owned());
    println!(
        "stabilized rho = {rho_fitted:.6} after {} rounds ({:?})",
        fitted.iterations, fitted.stop_reason
    );
    assert!(
        rho_fitted <= radius + 1e-4,
        "dominant eigenvalue {rho_fitted} must respect the bound {radius}"
    );
}

#[test]
fn hot_start_also_respects_the_bound() {
    init_logging();
    let a_true = arr2(&[[1.05, 0.0], [0.1, 0.7]]);
    let (x, y) = linear_snapshots(&a_true, 40, 3);
    let radius = 0.95;
    let config = EstimatorConfig {
        constraint: Some(OperatorConstraint::SpectralRadius {
            radius,
            hot_start: true,
        }),
        max_iter: 15,
        iter_tol: 1e-6,
        ..EstimatorConfig::default()
    };
    let fitted = Estimator::new(config)
        .fit(&x, &y, &FitOptions::default())
        .expect("hot-started stabilized fit");
    let u = fitted.coef.t().to_owned();
    let rho_fitted = spectral_radius_of(&u.slice(s![.., ..2]).to_owned());
    assert!(rho_fitted <= radius + 1e-4);
}

#[test]
fn hinf_constraint_bounds_the_gain_and_stabilizes() {
    init_logging();
    // Two lifted states plus one input column.
    let mixed = arr2(&[[0.9, 0.05, 1.0], [0.0, 0.8, 0.5]]);
    let mut rng = StdRng::seed_from_u64(11);
    let x = Array2::from_shape_fn((60, 3), |_| rng.gen_range(-1.0..1.0));
    let y = x.dot(&mixed.t());

    let config = EstimatorConfig {
        alpha: 1.0,
        ratio: 1.0,
        constraint: Some(OperatorConstraint::HinfGain { c: None, d: None }),
        max_iter: 4,
        iter_tol: 1e-4,
        ..EstimatorConfig::default()
    };
    let fitted = Estimator::new(config)
        .fit(&x, &y, &FitOptions::default())
        .expect("gain-regularized fit");
    assert!(fitted.iterations <= 4);
    if let StopReason::Stalled { status } = fitted.stop_reason {
        panic!("gain alternation stalled with backend status {status:?}");
    }

    let certificate = fitted.certificate.expect("gain fit must carry a certificate");
    let gain = certificate.gain.expect("gain bound must be recorded");
    println!(
        "attained gain bound {gain:.4} after {} rounds ({:?})",
        fitted.iterations, fitted.stop_reason
    );
    assert!(gain.is_finite() && gain > 0.0);

    let u = fitted.coef.t().to_owned();
    let rho = spectral_radius_of(&u.slice(s![.., ..2]).to_owned());
    assert!(
        rho <= 1.0 + 1e-4,
        "the bounded-real lemma implies Schur stability, got rho = {rho}"
    );
}

#[test]
fn dissipativity_constraint_holds_at_the_returned_pair() {
    init_logging();
    // Scalar state, scalar input; supply rate s(u, y) = 4 u^2 - y^2, the
    // finite-gain rate with bound 2. The true system (a, b) = (0.5, 0.3)
    // satisfies it, so the constrained fit stays near the data.
    let mixed = arr2(&[[0.5, 0.3]]);
    let mut rng = StdRng::seed_from_u64(5);
    let x = Array2::from_shape_fn((30, 2), |_| rng.gen_range(-1.0..1.0));
    let y = x.dot(&mixed.t());
    let xi = arr2(&[[-1.0, 0.0], [0.0, 4.0]]);

    let config = EstimatorConfig {
        constraint: Some(OperatorConstraint::Dissipativity),
        max_iter: 5,
        iter_tol: 1e-5,
        ..EstimatorConfig::default()
    };
    // Seed with P = 2 so the storage term P + Q starts strictly inside the
    // cone; the identity seed would pin it to the boundary for this rate.
    let options = FitOptions {
        supply_rate: Some(xi.clone()),
        warm_start_certificate: Some(arr2(&[[2.0]])),
        ..FitOptions::default()
    };
    let fitted = Estimator::new(config)
        .fit(&x, &y, &options)
        .expect("dissipativity-constrained fit");

    let certificate = fitted.certificate.expect("certificate must be returned");
    let p = certificate.matrix[[0, 0]];
    assert!(p > 0.0, "storage certificate must be positive, got {p}");

    // Rebuild the supply-rate LMI at the returned (U, P) pair and check it
    // is PSD up to solver slack.
    let u = fitted.coef.t().to_owned();
    let (a, b) = (u[[0, 0]], u[[0, 1]]);
    let (q, s_c, r) = (xi[[0, 0]], xi[[0, 1]], xi[[1, 1]]);
    let block = arr2(&[
        [p + q, s_c, a * p],
        [s_c, r, b * p],
        [a * p, b * p, p],
    ]);
    let (eigvals, _) = block.eig().unwrap();
    let min_eig = eigvals.iter().map(|l| l.re).fold(f64::INFINITY, f64::min);
    println!(
        "dissipation LMI minimum eigenvalue {min_eig:.3e} after {} rounds ({:?})",
        fitted.iterations, fitted.stop_reason
    );
    assert!(
        min_eig > -1e-5,
        "the returned pair must satisfy the supply-rate LMI, got min eig {min_eig}"
    );
}

#[test]
fn warm_start_certificate_is_accepted_and_shapes_are_checked() {
    init_logging();
    let a_true = arr2(&[[1.05, 0.0], [0.1, 0.7]]);
    let (x, y) = linear_snapshots(&a_true, 40, 3);
    let config = EstimatorConfig {
        constraint: Some(OperatorConstraint::SpectralRadius {
            radius: 0.95,
            hot_start: false,
        }),
        max_iter: 10,
        ..EstimatorConfig::default()
    };

    let good = FitOptions {
        warm_start_certificate: Some(Array2::eye(2) * 2.0),
        ..FitOptions::default()
    };
    Estimator::new(config.clone())
        .fit(&x, &y, &good)
        .expect("warm-started fit");

    let bad = FitOptions {
        warm_start_certificate: Some(Array2::eye(3)),
        ..FitOptions::default()
    };
    assert!(Estimator::new(config).fit(&x, &y, &bad).is_err());
}
