//! Cloud API trait definitions.

use crate::error::CloudResult;
use crate::types::{
    AccountPage, BucketEncryption, BucketListing, Credential, DesiredEncryption, HeadInfo,
    ObjectAcl, ObjectPage,
};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use sweeper_core::AccountId;

/// Operation names used in errors, logs and call counters.
pub mod op {
    pub const LIST_ACCOUNTS: &str = "list_accounts";
    pub const ASSUME_ROLE: &str = "assume_role";
    pub const LIST_BUCKETS: &str = "list_buckets";
    pub const LIST_OBJECTS: &str = "list_objects";
    pub const HEAD_OBJECT: &str = "head_object";
    pub const COPY_OBJECT: &str = "copy_object";
    pub const DELETE_OBJECT: &str = "delete_object";
    pub const GET_OBJECT_ACL: &str = "get_object_acl";
    pub const PUT_OBJECT_ACL: &str = "put_object_acl";
    pub const GET_BUCKET_ENCRYPTION: &str = "get_bucket_encryption";
}

/// A stream of object listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = CloudResult<ObjectPage>> + Send + 'a>>;

/// An object store client bound to one account's credentials.
pub type Session = Arc<dyn ObjectStoreApi>;

/// Object storage operations available to a session.
#[async_trait]
pub trait ObjectStoreApi: Send + Sync + 'static {
    /// List the buckets the session's account owns.
    async fn list_buckets(&self) -> CloudResult<BucketListing>;

    /// Fetch one page of a bucket's object listing.
    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> CloudResult<ObjectPage>;

    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<HeadInfo>;

    /// Server-side copy within a bucket, applying `encryption` to the destination.
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        encryption: &DesiredEncryption,
    ) -> CloudResult<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()>;

    async fn get_object_acl(&self, bucket: &str, key: &str) -> CloudResult<ObjectAcl>;

    async fn put_object_acl(&self, bucket: &str, key: &str, acl: &ObjectAcl) -> CloudResult<()>;

    async fn get_bucket_default_encryption(&self, bucket: &str) -> CloudResult<BucketEncryption>;

    /// Static identifier for the backend type, used in logs.
    fn backend_name(&self) -> &'static str;

    /// Page through a bucket listing, starting after `start_token` if given.
    ///
    /// The stream ends after the first error. Callers that want to resume
    /// pass the last `next_token` they saw.
    fn list_objects<'a>(&'a self, bucket: &str, start_token: Option<String>) -> PageStream<'a> {
        let bucket = bucket.to_string();
        Box::pin(async_stream::try_stream! {
            let mut token = start_token;
            loop {
                let page = self.list_objects_page(&bucket, token.take()).await?;
                let next = page.next_token.clone();
                yield page;
                match next {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        })
    }
}

/// Organization and role-assumption operations.
#[async_trait]
pub trait IdentityApi: Send + Sync + 'static {
    /// Fetch one page of organization accounts.
    async fn list_accounts(&self, next_token: Option<String>) -> CloudResult<AccountPage>;

    /// Obtain credentials for `account` by assuming the configured role.
    async fn assume_role(&self, account: &AccountId) -> CloudResult<Credential>;

    /// Build a session. `None` uses the ambient credentials.
    async fn session(&self, credential: Option<&Credential>) -> CloudResult<Session>;

    fn backend_name(&self) -> &'static str;
}
