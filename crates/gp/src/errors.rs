use thiserror::Error;

/// A result type for GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using a [`GaussianProcess`](crate::GaussianProcess) or one of the
/// elemental models built upon it
#[derive(Error, Debug)]
pub enum GpError {
    /// When the covariance matrix is not positive definite
    #[error("Covariance matrix factorization error: {0}")]
    FactorizationError(#[source] linfa_linalg::LinalgError),
    /// When a triangular solve against the covariance factor fails
    #[error("Triangular solve error: {0}")]
    SolveError(#[source] linfa_linalg::LinalgError),
    /// When a flat parameter vector or training data do not have the expected shape
    #[error("Shape mismatch: {0}")]
    ShapeMismatchError(String),
    /// When error due to a bad configuration value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When an operation is called out of sequence
    #[error("Invalid state: {0}")]
    InvalidStateError(String),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When the hyperparameters optimizer fails
    #[error(transparent)]
    OptimizationError(#[from] argmin::core::Error),
}
