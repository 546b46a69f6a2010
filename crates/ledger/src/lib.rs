//! Idempotency ledger for sweeper.
//!
//! Records objects whose remediation fully succeeded so a restarted run can
//! skip them. Backends: SQLite (durable) and in-memory.

pub mod error;
pub mod store;

pub use error::{LedgerError, LedgerResult};
pub use store::{IdempotencyLedger, LedgerKey, MemoryLedger, SqliteLedger};

use std::sync::Arc;
use sweeper_core::config::LedgerConfig;

/// Create a ledger from configuration.
pub async fn from_config(config: &LedgerConfig) -> LedgerResult<Arc<dyn IdempotencyLedger>> {
    match config {
        LedgerConfig::Sqlite { path } => {
            if path.as_os_str().is_empty() {
                return Err(LedgerError::Config(
                    "ledger.path must not be empty".to_string(),
                ));
            }
            let ledger = SqliteLedger::new(path).await?;
            Ok(Arc::new(ledger) as Arc<dyn IdempotencyLedger>)
        }
        LedgerConfig::Memory => {
            tracing::warn!("Using in-memory ledger; progress will not survive a restart");
            Ok(Arc::new(MemoryLedger::new()) as Arc<dyn IdempotencyLedger>)
        }
    }
}
