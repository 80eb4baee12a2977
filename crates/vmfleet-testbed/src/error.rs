//! Testbed error types.

use thiserror::Error;

pub type TestbedResult<T> = Result<T, TestbedError>;

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error("catalog parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid catalog: {0}")]
    Invalid(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
