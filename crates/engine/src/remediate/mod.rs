//! Per-object audit and remediation.
//!
//! One [`ObjectRemediator`] is shared by every object worker. It selects a
//! handler from the run mode:
//!
//! - [`RunMode::ListOnly`]: report (and optionally delete) filtered objects
//! - [`RunMode::AclCheck`] / [`RunMode::AclMultiCheck`]: check and repair grants
//! - [`RunMode::EncryptionCheck`] / [`RunMode::EncryptionRepair`]: check and
//!   optionally re-encrypt
//! - [`RunMode::Recopy`]: re-encrypt every object once, tracked in the ledger

mod acl;
mod encryption;
mod listing;

pub use acl::{acl_ok, fixed_acl};
pub use encryption::encryption_ok;

use crate::broker::CredentialBroker;
use crate::caches::{BucketMetadataCache, CanonicalIdentityCache};
use crate::error::EngineResult;
use crate::metrics::{EngineMetrics, action};
use crate::retry::Retrier;
use crate::task::ObjectTask;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use sweeper_cloud::{RetryPolicy, Session};
use sweeper_core::config::{AuditConfig, DangerConfig};
use sweeper_core::{AccountId, AppConfig, FilterEngine, RunMode};
use sweeper_ledger::IdempotencyLedger;

/// Result of handling one object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// Checked, and repaired if needed and allowed.
    Done,
    /// Nothing was done to the object.
    Skipped,
    /// A remediation step failed permanently. Re-enqueue the object.
    Retry,
}

pub struct ObjectRemediator {
    mode: RunMode,
    audit: AuditConfig,
    danger: DangerConfig,
    readers: Vec<AccountId>,
    retrier: Retrier,
    broker: Arc<CredentialBroker>,
    identities: Arc<CanonicalIdentityCache>,
    bucket_keys: Arc<BucketMetadataCache>,
    ledger: Arc<dyn IdempotencyLedger>,
    filter: Arc<FilterEngine>,
    metrics: Arc<EngineMetrics>,
    unencrypted: AtomicU64,
}

impl ObjectRemediator {
    pub fn new(
        config: &AppConfig,
        broker: Arc<CredentialBroker>,
        identities: Arc<CanonicalIdentityCache>,
        bucket_keys: Arc<BucketMetadataCache>,
        ledger: Arc<dyn IdempotencyLedger>,
        filter: Arc<FilterEngine>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let readers = reader_accounts(&config.audit);
        Self {
            mode: config.run_mode(),
            audit: config.audit.clone(),
            danger: config.danger.clone(),
            readers,
            retrier: Retrier::new(RetryPolicy::from_config(&config.retry), metrics.clone()),
            broker,
            identities,
            bucket_keys,
            ledger,
            filter,
            metrics,
            unencrypted: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// The remediation this mode performs, as a metrics label.
    pub fn action(&self) -> &'static str {
        match self.mode {
            RunMode::ListOnly => action::DELETE,
            RunMode::AclCheck | RunMode::AclMultiCheck => action::FIX_ACL,
            RunMode::Recopy | RunMode::EncryptionCheck | RunMode::EncryptionRepair => {
                action::REENCRYPT
            }
        }
    }

    /// Reader accounts checked in multi-reader ACL mode.
    pub fn readers(&self) -> &[AccountId] {
        &self.readers
    }

    /// Handle one object with `session`, the owning account's session.
    pub async fn handle(&self, task: &ObjectTask, session: &Session) -> EngineResult<ObjectOutcome> {
        match self.mode {
            RunMode::ListOnly => self.handle_listing(task, session).await,
            RunMode::AclCheck | RunMode::AclMultiCheck => self.handle_acl(task, session).await,
            RunMode::Recopy => {
                if self.too_big(task, task.size) {
                    return Ok(ObjectOutcome::Skipped);
                }
                self.reencrypt(&task.bucket, &task.key, session).await
            }
            RunMode::EncryptionCheck | RunMode::EncryptionRepair => {
                self.check_encryption(task, session).await
            }
        }
    }
}

fn reader_accounts(audit: &AuditConfig) -> Vec<AccountId> {
    audit
        .acl_reader_accounts
        .iter()
        .filter_map(|id| match AccountId::new(id.trim()) {
            Ok(account) => Some(account),
            Err(e) => {
                tracing::warn!(account = %id, error = %e, "Ignoring reader account");
                None
            }
        })
        .collect()
}
