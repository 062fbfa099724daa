//! Log-likelihood maximization on top of `argmin`.
//!
//! Callers implement [`LogLikelihood`] (value and analytic gradient) and
//! call [`maximize`]. Two solvers are available:
//!
//! - [`MleSolver::TrustRegion`]: Newton-type trust region with a Steihaug
//!   conjugate-gradient subproblem, Hessians from finite differences of the
//!   analytic gradient. This is the default for point estimation.
//! - [`MleSolver::Lbfgs`]: L-BFGS with More–Thuente line search, used by
//!   the variational engine where the parameter count doubles.
//!
//! Convergence is always judged by `‖∇ℓ(θ̂)‖₂ <= gtol` and reported on
//! [`OptimOutcome`]; running out of iterations is not an error.

pub mod adapter;
pub mod api;
pub mod errors;
pub mod run;
pub mod traits;
pub mod types;
pub mod validation;

pub use self::api::maximize;
pub use self::errors::{OptError, OptResult};
pub use self::traits::{LogLikelihood, MleOptions, MleSolver, OptimOutcome};
pub use self::types::{Grad, Theta};
