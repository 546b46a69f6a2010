//! Encryption check and the re-encrypt dance.

use super::{ObjectOutcome, ObjectRemediator};
use crate::error::EngineResult;
use crate::metrics::{action, finding, outcome};
use crate::task::ObjectTask;
use std::sync::atomic::Ordering;
use sweeper_cloud::types::SSE_KMS;
use sweeper_cloud::{DesiredEncryption, ErrorClass, HeadInfo, Session, op};
use sweeper_core::{RunMode, TEMP_SUFFIX};
use sweeper_ledger::LedgerKey;

/// Whether `head` satisfies the bucket's encryption requirement.
///
/// With a customer key on the bucket the object must use customer-managed
/// encryption with a key id containing it. Otherwise any algorithm passes.
pub fn encryption_ok(cached_key: Option<&str>, head: &HeadInfo) -> bool {
    let algorithm = head.sse_algorithm.as_deref().unwrap_or_default();
    match cached_key {
        Some(key) => {
            algorithm == SSE_KMS
                && head
                    .kms_key_id
                    .as_deref()
                    .is_some_and(|id| id.contains(key))
        }
        None => !algorithm.is_empty(),
    }
}

impl ObjectRemediator {
    pub(super) fn too_big(&self, task: &ObjectTask, size: u64) -> bool {
        if size <= self.audit.max_object_size {
            return false;
        }
        self.metrics.finding(finding::TOO_BIG);
        tracing::info!(bucket = %task.bucket, key = %task.key, size, "Big object, not copying");
        true
    }

    /// HEAD the object, report it if it fails the check, and repair it in
    /// repair mode.
    pub async fn check_encryption(
        &self,
        task: &ObjectTask,
        session: &Session,
    ) -> EngineResult<ObjectOutcome> {
        let tag = task.tag();
        let head = match self
            .retrier
            .run(op::HEAD_OBJECT, &tag, self.retrier.standard(), || {
                session.head_object(&task.bucket, &task.key)
            })
            .await?
        {
            Ok(head) => head,
            Err(failure) if failure.class == ErrorClass::NotFound => return Ok(ObjectOutcome::Done),
            Err(_) => return Ok(ObjectOutcome::Skipped),
        };

        self.metrics.object_bytes(head.size);
        let cached_key = self.bucket_keys.key_for(&task.bucket);
        if encryption_ok(cached_key.as_deref(), &head) {
            // A retried repair that already rewrote the object may still own a temporary copy.
            if task.attempt > 0 && self.mode == RunMode::EncryptionRepair && self.danger.reencrypt_allowed() {
                return self.clear_temp(&task.bucket, &task.key, session).await;
            }
            return Ok(ObjectOutcome::Done);
        }

        self.metrics.finding(finding::UNENCRYPTED);
        let count = self.unencrypted.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_power_of_two() {
            tracing::warn!(
                bucket = %task.bucket,
                key = %task.key,
                account = %task.account,
                algorithm = head.sse_algorithm.as_deref().unwrap_or(""),
                kms_key_id = head.kms_key_id.as_deref().unwrap_or(""),
                bucket_key = cached_key.as_deref().unwrap_or(""),
                replication = head.replication_status.as_deref().unwrap_or(""),
                count,
                "Object not encrypted as required"
            );
        }

        if self.mode != RunMode::EncryptionRepair || self.too_big(task, head.size) {
            return Ok(ObjectOutcome::Done);
        }
        self.reencrypt(&task.bucket, &task.key, session).await
    }

    /// Copy `key` to a temporary name and back with the desired encryption,
    /// then delete the temporary copy.
    ///
    /// Each step is safe to repeat, so a failed attempt is retried from the
    /// start. The ledger records the object only after the delete.
    pub async fn reencrypt(
        &self,
        bucket: &str,
        key: &str,
        session: &Session,
    ) -> EngineResult<ObjectOutcome> {
        if key.ends_with(TEMP_SUFFIX) {
            tracing::debug!(bucket, key, "Skipping temporary object");
            self.metrics.remediation(action::REENCRYPT, outcome::SKIPPED);
            return Ok(ObjectOutcome::Skipped);
        }

        let ledger_key = LedgerKey::new(bucket, key);
        if self.mode == RunMode::Recopy {
            match self.ledger.contains(&ledger_key).await {
                Ok(true) => {
                    tracing::debug!(bucket, key, "Already re-encrypted");
                    self.metrics.remediation(action::REENCRYPT, outcome::SKIPPED);
                    return Ok(ObjectOutcome::Skipped);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(bucket, key, error = %e, "Ledger lookup failed, redoing object");
                }
            }
        }

        let desired = DesiredEncryption::for_bucket_key(self.bucket_keys.key_for(bucket).as_deref());
        if !self.danger.reencrypt_allowed() {
            tracing::info!(bucket, key, encryption = desired.algorithm(), "Would re-encrypt (dry run)");
            self.metrics.remediation(action::REENCRYPT, outcome::DRY_RUN);
            return Ok(ObjectOutcome::Skipped);
        }

        let temp = format!("{key}{TEMP_SUFFIX}");
        let finished = self.copy_with_retry(session, bucket, key, &temp, &desired).await?
            && self.copy_with_retry(session, bucket, &temp, key, &desired).await?
            && self.delete_object(session, bucket, &temp).await?;

        if !finished {
            self.metrics.remediation(action::REENCRYPT, outcome::FAILED);
            return Ok(ObjectOutcome::Retry);
        }

        if let Err(e) = self.ledger.add(&ledger_key).await {
            tracing::warn!(bucket, key, error = %e, "Failed to record re-encrypted object");
        }
        self.metrics.remediation(action::REENCRYPT, outcome::OK);
        tracing::info!(bucket, key, encryption = desired.algorithm(), "Re-encrypted object");
        Ok(ObjectOutcome::Done)
    }

    /// Finish an interrupted dance whose copy back already succeeded.
    async fn clear_temp(&self, bucket: &str, key: &str, session: &Session) -> EngineResult<ObjectOutcome> {
        let temp = format!("{key}{TEMP_SUFFIX}");
        if !self.delete_object(session, bucket, &temp).await? {
            self.metrics.remediation(action::REENCRYPT, outcome::FAILED);
            return Ok(ObjectOutcome::Retry);
        }
        if let Err(e) = self.ledger.add(&LedgerKey::new(bucket, key)).await {
            tracing::warn!(bucket, key, error = %e, "Failed to record re-encrypted object");
        }
        self.metrics.remediation(action::REENCRYPT, outcome::OK);
        tracing::info!(bucket, key, "Removed leftover temporary copy");
        Ok(ObjectOutcome::Done)
    }

    /// Server-side copy, waiting out read-after-write lag and throttling.
    pub async fn copy_with_retry(
        &self,
        session: &Session,
        bucket: &str,
        source: &str,
        dest: &str,
        desired: &DesiredEncryption,
    ) -> EngineResult<bool> {
        let tag = format!("{bucket}/{source}");
        let result = self
            .retrier
            .run(op::COPY_OBJECT, &tag, self.retrier.mutating(true), || {
                session.copy_object(bucket, source, dest, desired)
            })
            .await?;
        match result {
            Ok(()) => Ok(true),
            Err(failure) => {
                tracing::warn!(bucket, source, dest, class = %failure.class, "Copy failed");
                Ok(false)
            }
        }
    }

    /// Delete `key`. An object that is already gone counts as deleted.
    pub async fn delete_object(&self, session: &Session, bucket: &str, key: &str) -> EngineResult<bool> {
        let tag = format!("{bucket}/{key}");
        let result = self
            .retrier
            .run(op::DELETE_OBJECT, &tag, self.retrier.mutating(false), || {
                session.delete_object(bucket, key)
            })
            .await?;
        match result {
            Ok(()) => Ok(true),
            Err(failure) if failure.class == ErrorClass::NotFound => Ok(true),
            Err(failure) => {
                tracing::warn!(bucket, key, class = %failure.class, "Delete failed");
                Ok(false)
            }
        }
    }
}
