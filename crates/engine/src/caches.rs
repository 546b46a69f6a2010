//! Process-lifetime caches shared by all workers.

use crate::error::{EngineError, EngineResult};
use crate::metrics::{EngineMetrics, record_error};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use sweeper_cloud::{BucketEncryption, ErrorClass, Session, op};
use sweeper_core::AccountId;
use tokio::sync::Mutex;

/// Account id to the canonical identity used in ACL grants.
pub struct CanonicalIdentityCache {
    ids: RwLock<HashMap<AccountId, String>>,
    // Serializes lookup, fetch and insert per account so each is fetched once.
    gates: DashMap<AccountId, Arc<Mutex<()>>>,
    metrics: Arc<EngineMetrics>,
}

impl CanonicalIdentityCache {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            ids: RwLock::new(HashMap::new()),
            gates: DashMap::new(),
            metrics,
        }
    }

    pub fn get(&self, account: &AccountId) -> Option<String> {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .cloned()
    }

    /// Learn the canonical identity of `account` through `session`.
    ///
    /// A failed lookup leaves the account unresolved, which ACL checks
    /// treat as compliant.
    pub async fn resolve(&self, account: &AccountId, session: &Session) -> EngineResult<()> {
        if self.get(account).is_some() {
            return Ok(());
        }
        let gate = self.gate(account);
        let _guard = gate.lock().await;
        if self.get(account).is_some() {
            return Ok(());
        }

        self.metrics.api_call(op::LIST_BUCKETS);
        match session.list_buckets().await {
            Ok(listing) => match listing.owner_id {
                Some(id) => {
                    tracing::debug!(account = %account, canonical_id = %id, "Resolved canonical identity");
                    self.ids
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(account.clone(), id);
                }
                None => tracing::warn!(account = %account, "Bucket listing has no owner"),
            },
            Err(err) => {
                let class = record_error(&self.metrics, &err, op::LIST_BUCKETS, account.as_str());
                if class == ErrorClass::ExpiredCredentials {
                    return Err(EngineError::fatal(&err));
                }
            }
        }
        Ok(())
    }

    fn gate(&self, account: &AccountId) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held across an await.
        self.gates.entry(account.clone()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bucket to its default customer-managed key id.
///
/// Buckets without one (provider-managed keys, or no default) have no
/// entry.
pub struct BucketMetadataCache {
    keys: RwLock<HashMap<String, String>>,
    metrics: Arc<EngineMetrics>,
}

impl BucketMetadataCache {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn key_for(&self, bucket: &str) -> Option<String> {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(bucket)
            .cloned()
    }

    pub async fn resolve(&self, bucket: &str, session: &Session) -> EngineResult<()> {
        self.metrics.api_call(op::GET_BUCKET_ENCRYPTION);
        match session.get_bucket_default_encryption(bucket).await {
            Ok(BucketEncryption::Kms {
                key_id: Some(key_id),
            }) => {
                tracing::debug!(bucket, key_id = %key_id, "Bucket default key");
                self.keys
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(bucket.to_string(), key_id);
            }
            Ok(encryption) => {
                tracing::debug!(bucket, encryption = ?encryption, "Bucket has no customer key");
            }
            Err(err) => {
                let class = record_error(&self.metrics, &err, op::GET_BUCKET_ENCRYPTION, bucket);
                if class == ErrorClass::ExpiredCredentials {
                    return Err(EngineError::fatal(&err));
                }
            }
        }
        Ok(())
    }
}
