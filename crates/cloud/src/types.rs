//! Request and response shapes for the cloud APIs.

use aws_credential_types::provider::SharedCredentialsProvider;
use sweeper_core::{AccountId, AccountRef};

/// Permission string granting every right on an object.
pub const FULL_CONTROL: &str = "FULL_CONTROL";

/// Encryption algorithm reported for customer-managed keys.
pub const SSE_KMS: &str = "aws:kms";

/// Encryption algorithm reported for provider-managed keys.
pub const SSE_AES256: &str = "AES256";

/// Buckets visible to a session, plus the owner's canonical identity.
#[derive(Clone, Debug, Default)]
pub struct BucketListing {
    pub owner_id: Option<String>,
    pub buckets: Vec<String>,
}

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// One page of an object listing.
#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    pub keys: Vec<ObjectSummary>,
    /// Token for the next page. `None` on the last page.
    pub next_token: Option<String>,
}

/// One page of organization accounts.
#[derive(Clone, Debug, Default)]
pub struct AccountPage {
    pub accounts: Vec<AccountRef>,
    pub next_token: Option<String>,
}

/// Object metadata from a HEAD request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub size: u64,
    pub sse_algorithm: Option<String>,
    pub kms_key_id: Option<String>,
    pub replication_status: Option<String>,
    pub etag: Option<String>,
}

/// Encryption requested on a copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DesiredEncryption {
    Kms { key_id: String },
    Aes256,
}

impl DesiredEncryption {
    /// Customer key when the bucket requires one, else provider-managed.
    pub fn for_bucket_key(key_id: Option<&str>) -> Self {
        match key_id {
            Some(key_id) => Self::Kms {
                key_id: key_id.to_string(),
            },
            None => Self::Aes256,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Kms { .. } => SSE_KMS,
            Self::Aes256 => SSE_AES256,
        }
    }
}

/// Bucket default encryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketEncryption {
    Aes256,
    Kms { key_id: Option<String> },
    Unset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grantee {
    CanonicalUser {
        id: String,
        display_name: Option<String>,
    },
    Group {
        uri: String,
    },
    Email {
        address: String,
    },
}

impl Grantee {
    pub fn canonical_id(&self) -> Option<&str> {
        match self {
            Self::CanonicalUser { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclGrant {
    pub grantee: Grantee,
    pub permission: String,
}

/// Object access control list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAcl {
    pub owner_id: Option<String>,
    pub owner_display_name: Option<String>,
    pub grants: Vec<AclGrant>,
    /// Grants the backend returned but could not represent. An ACL with
    /// any of these cannot be written back without losing them.
    pub unparsed_grants: usize,
}

impl ObjectAcl {
    /// Whether every grant was understood, so the ACL can be rewritten.
    pub fn is_complete(&self) -> bool {
        self.unparsed_grants == 0
    }

    /// Whether any canonical-user grant names `id`.
    pub fn grants_to(&self, id: &str) -> bool {
        self.grants
            .iter()
            .any(|g| g.grantee.canonical_id() == Some(id))
    }
}

/// Credentials for a member account, obtained by assuming a role.
#[derive(Clone, Debug)]
pub struct Credential {
    pub account_id: AccountId,
    pub role_arn: String,
    /// `None` for backends that do not sign requests.
    pub provider: Option<SharedCredentialsProvider>,
}
