use thiserror::Error;

/// Result alias for optimizer operations.
pub type OptResult<T> = Result<T, OptError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptError {
    // ---- Options ----
    /// Gradient tolerance needs to be positive and finite.
    #[error("invalid gradient tolerance {tol}: {reason}")]
    InvalidTolGrad { tol: f64, reason: &'static str },

    /// Maximum iterations needs to be positive.
    #[error("invalid max_iter {max_iter}: {reason}")]
    InvalidMaxIter { max_iter: u64, reason: &'static str },

    /// lbfgs_mem needs to be at least 1.
    #[error("invalid L-BFGS memory {mem}: {reason}")]
    InvalidLbfgsMem { mem: usize, reason: &'static str },

    /// Unknown solver name.
    #[error("unknown solver `{name}`: {reason}")]
    InvalidSolver { name: String, reason: &'static str },

    // ---- Objective ----
    /// Objective returned a non-finite value.
    #[error("objective is not finite: {value}")]
    NonFiniteCost { value: f64 },

    /// Starting point has the wrong length.
    #[error("parameter vector has length {found}, expected {expected}")]
    ThetaDimMismatch { expected: usize, found: usize },

    /// Gradient dimensions do not match parameter dimensions.
    #[error("gradient has length {found}, expected {expected}")]
    GradientDimMismatch { expected: usize, found: usize },

    /// Gradient elements need to be finite.
    #[error("gradient element {index} is {value}")]
    InvalidGradient { index: usize, value: f64 },

    /// Hessian values need to be finite.
    #[error("hessian element ({row}, {col}) is {value}")]
    InvalidHessian { row: usize, col: usize, value: f64 },

    // ---- Outcome ----
    /// Estimated parameters must be finite.
    #[error("estimate element {index} is {value}")]
    InvalidThetaHat { index: usize, value: f64 },

    /// Solver finished without a best parameter.
    #[error("solver returned no parameter estimate")]
    MissingThetaHat,

    /// Anything raised from inside argmin.
    #[error("argmin: {text}")]
    Backend { text: String },
}

impl From<argmin::core::Error> for OptError {
    fn from(err: argmin::core::Error) -> Self {
        match err.downcast::<OptError>() {
            Ok(inner) => inner,
            Err(other) => OptError::Backend {
                text: other.to_string(),
            },
        }
    }
}
