use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// The scan levels resolve to "do nothing" for a container.
    #[error("Scan policy error for {path}: {reason}")]
    Policy { path: PathBuf, reason: String },

    #[error("Could not extract {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("Depot inconsistency: {0}")]
    DepotInconsistency(String),

    #[error("Could not write {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Depot index transaction failed: {0}")]
    IndexTransaction(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Extraction {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
