//! Object work items.

use crate::tracker::PageCounter;
use std::sync::Arc;
use sweeper_core::AccountId;

/// One object to audit or remediate.
#[derive(Clone, Debug)]
pub struct ObjectTask {
    pub account: AccountId,
    pub bucket: String,
    pub key: String,
    /// Size reported by the listing.
    pub size: u64,
    /// Zero for the first delivery, incremented on each re-enqueue.
    pub attempt: u32,
    pub page: Arc<PageCounter>,
}

impl ObjectTask {
    pub fn new(
        account: AccountId,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        page: Arc<PageCounter>,
    ) -> Self {
        Self {
            account,
            bucket: bucket.into(),
            key: key.into(),
            size,
            attempt: 0,
            page,
        }
    }

    /// The same object, one attempt later.
    pub fn retried(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// `bucket/key`, used as a log tag.
    pub fn tag(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}
