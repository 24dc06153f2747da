use thiserror::Error;

/// Error taxonomy for the platform. Configuration and data-availability
/// problems surface before a backtest loop starts; store and fetch errors
/// bubble up to the caller with their cause attached.
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no data available: {0}")]
    DataAvailability(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for QuantError {
    fn from(err: reqwest::Error) -> Self {
        QuantError::Fetch(err.to_string())
    }
}

impl From<zip::result::ZipError> for QuantError {
    fn from(err: zip::result::ZipError) -> Self {
        QuantError::Parse(err.to_string())
    }
}

impl From<csv::Error> for QuantError {
    fn from(err: csv::Error) -> Self {
        QuantError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuantError>;
