//! Error types for GeoLift

use thiserror::Error;

/// GeoLift error type
#[derive(Error, Debug)]
pub enum Error {
    /// Panel input violates the upstream contract (gaps, duplicates, non-finite values)
    #[error("Malformed panel: {0}")]
    MalformedPanel(String),

    /// Not enough pre-period observations or donors to fit weights
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Donor pool too small to build a placebo reference distribution
    #[error("Insufficient donors: {0}")]
    InsufficientDonors(String),

    /// Augmentation regression is ill-conditioned
    #[error("Augmentation error: {0}")]
    Augmentation(String),

    /// Invalid parameter combination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid argument
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure
    #[error("Computation error: {0}")]
    Computation(String),

    /// Run aborted through its cancellation flag
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
