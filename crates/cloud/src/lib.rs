//! Cloud API abstractions for sweeper.
//!
//! This crate provides:
//! - `ObjectStoreApi` and `IdentityApi`, the only way the engine talks to the provider
//! - Request/response shapes and `CloudError`
//! - The retry classifier and retry timing policy
//! - Backends: AWS (S3, STS, Organizations) and in-memory

pub mod backends;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use backends::aws::{AwsIdentity, S3Session};
pub use backends::memory::{MemoryCloud, MemoryObject};
pub use error::{CloudError, CloudResult};
pub use retry::{ErrorClass, RetryPolicy, classify};
pub use traits::{IdentityApi, ObjectStoreApi, PageStream, Session, op};
pub use types::{
    AccountPage, AclGrant, BucketEncryption, BucketListing, Credential, DesiredEncryption,
    Grantee, HeadInfo, ObjectAcl, ObjectPage, ObjectSummary,
};
