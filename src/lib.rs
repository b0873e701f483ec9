#![deny(dead_code)]
#![deny(unused_imports)]

//! # koopcert
//!
//! Estimation of lifted linear (Koopman) operators from snapshot data by
//! solving semidefinite relaxations of regularized least-squares regression,
//! optionally constrained so the returned operator carries a certificate of
//! stability, bounded H-infinity gain, or dissipativity.
//!
//! The crate is organized around one data flow: snapshot matrices are reduced
//! to regression covariances ([`stats`]), the SPD covariance is factorized
//! into a Schur-complement certificate ([`factorization`]), a base
//! loss-bounding SDP is assembled ([`problem`]) and decorated with convex
//! regularization terms ([`regularizers`]) or a bilinear operator constraint
//! ([`constraints`]), and the result is handed to a solver backend
//! ([`backend`], reference implementation in [`admm`]). Bilinear constraints
//! are driven to a fixed point by two-block alternation ([`alternation`]).
//! The [`estimator`] module ties the pieces into a fit/predict model layer.

pub mod admm;
pub mod alternation;
pub mod backend;
pub mod cache;
pub mod constraints;
pub mod data;
pub mod estimator;
pub mod factorization;
pub mod problem;
pub mod regularizers;
pub mod stats;
