//! Engine error types.

use sweeper_cloud::CloudError;
use sweeper_ledger::LedgerError;
use thiserror::Error;

/// Process exit code after an orderly shutdown caused by expired credentials.
pub const FATAL_EXIT_CODE: u8 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Credentials expired mid-run. Nothing further can succeed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Tasks were dropped because a queue lost its consumers.
    #[error("run incomplete: {0} tasks were never processed")]
    Incomplete(u64),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EngineError {
    pub fn fatal(err: &CloudError) -> Self {
        Self::Fatal(format!("credentials expired during {}: {}", err.op(), err.message()))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Exit code the binary reports for this error.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() { FATAL_EXIT_CODE } else { 1 }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
