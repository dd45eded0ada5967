//! Error hierarchy for the concentration solver and power localizer.
//!
//! Every failure is fatal for the current operation: a partially written or
//! partially read concentration file has no resynchronization markers, so
//! nothing is retried or salvaged.

use thiserror::Error;

/// Root error type for all solver and localizer failures.
#[derive(Error, Debug)]
pub enum LocalizeError {
    /// Missing or invalid configuration option.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input array has the wrong rank or element layout.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// File open/read/write/close failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header or record field disagrees with what the caller supplied.
    #[error("consistency error: {field} expected {expected}, got {actual}")]
    Consistency {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Decomposition failed or produced non-finite values.
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl LocalizeError {
    pub fn consistency(
        field: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        LocalizeError::Consistency {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<toml::de::Error> for LocalizeError {
    fn from(value: toml::de::Error) -> Self {
        LocalizeError::Configuration(format!("TOML parse error: {value}"))
    }
}

pub type LocalizeResult<T> = Result<T, LocalizeError>;
