//! Deployment error types.

use std::time::Duration;

use thiserror::Error;

/// Failure of one remote operation on one host or VM.
///
/// Absorbed at fleet granularity: the host or VM is excluded and the
/// run goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("operation failed: {0}")]
    Failed(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled before it started")]
    Cancelled,
}

/// Errors that abort a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("resource resolution failed: {0}")]
    ResourceResolutionFailed(String),

    #[error("no virtual network found for job(s) {0}; reservation cancelled")]
    VlanMissing(String),

    #[error("no surviving host: {0}")]
    NoSurvivingHosts(String),

    #[error("service node configuration failed on {host}: {source}")]
    ServiceNode {
        host: String,
        #[source]
        source: ExecError,
    },

    #[error("addressing error: {0}")]
    Addressing(String),

    #[error("no VM could be placed")]
    NoVmPlaced,

    #[error("invalid deployment option: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DeployResult<T> = Result<T, DeployError>;
