//! Numeric aliases and solver wiring shared by the optimizer modules.
//!
//! argmin operates on plain `Vec<f64>` here; models convert to and from
//! `ndarray` at their boundary.

use argmin::solver::{
    linesearch::MoreThuenteLineSearch,
    quasinewton::LBFGS,
    trustregion::{Steihaug, TrustRegion},
};

/// Parameter vector `θ`.
pub type Theta = Vec<f64>;

/// Gradient vector, same length as [`Theta`].
pub type Grad = Vec<f64>;

/// Dense row-major Hessian.
pub type Hessian = Vec<Vec<f64>>;

/// Scalar cost `c(θ) = −ℓ(θ)`.
pub type Cost = f64;

/// Default history size (`m`) for L-BFGS runs.
pub const DEFAULT_LBFGS_MEM: usize = 7;

/// Trust-region iterations run between two gradient-norm checks.
pub const TRUST_REGION_ROUND: u64 = 25;

pub type MoreThuenteLS = MoreThuenteLineSearch<Theta, Grad, Cost>;

pub type LbfgsMoreThuente = LBFGS<MoreThuenteLS, Theta, Grad, Cost>;

pub type SteihaugTR = TrustRegion<Steihaug<Theta, Cost>, Cost>;
