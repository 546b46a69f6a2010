//! Account and bucket task types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an AWS account id.
pub const ACCOUNT_ID_LEN: usize = 12;

/// An organization account id, or the sentinel for the ambient account.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Sentinel meaning "the account the ambient credentials belong to".
    pub const SELF_SENTINEL: &'static str = "0";

    /// Parse a 12-digit account id.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id == Self::SELF_SENTINEL {
            return Ok(Self(id));
        }
        if id.len() != ACCOUNT_ID_LEN || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(crate::Error::InvalidAccountId(id));
        }
        Ok(Self(id))
    }

    /// The ambient account. Sessions for it use default credentials without
    /// assuming a role.
    pub fn self_account() -> Self {
        Self(Self::SELF_SENTINEL.to_string())
    }

    /// Account id named by the leading path segment of an object key.
    ///
    /// Keys written by member accounts into a shared bucket are commonly laid
    /// out as `<account-id>/...`.
    pub fn from_key_owner(key: &str) -> Option<Self> {
        let segment = key.split('/').next()?;
        if segment.is_empty() || segment == Self::SELF_SENTINEL {
            return None;
        }
        Self::new(segment).ok()
    }

    pub fn is_self(&self) -> bool {
        self.0 == Self::SELF_SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({self})")
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self() {
            f.write_str("self")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Organization membership status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

/// An account discovered from the organization listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRef {
    pub id: AccountId,
    pub status: AccountStatus,
}

impl AccountRef {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// One bucket to crawl, produced by an account worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketTask {
    pub account: AccountId,
    pub bucket: String,
}
