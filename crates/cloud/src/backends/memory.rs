//! In-memory cloud for tests and dry runs.
//!
//! Models accounts, buckets, objects, default encryption and ACLs closely
//! enough to drive the whole pipeline. Every call is counted per operation,
//! and failures can be scripted with [`MemoryCloud::fail_next`].

use crate::error::{CloudError, CloudResult};
use crate::traits::{IdentityApi, ObjectStoreApi, Session, op};
use crate::types::{
    AccountPage, AclGrant, BucketEncryption, BucketListing, Credential, DesiredEncryption,
    FULL_CONTROL, Grantee, HeadInfo, ObjectAcl, ObjectPage, ObjectSummary,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sweeper_core::{AccountId, AccountRef, AccountStatus};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// A stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryObject {
    pub size: u64,
    pub sse_algorithm: Option<String>,
    pub kms_key_id: Option<String>,
    pub acl: ObjectAcl,
    pub etag: String,
}

#[derive(Debug)]
struct MemoryBucket {
    owner: AccountId,
    encryption: BucketEncryption,
    objects: BTreeMap<String, MemoryObject>,
}

#[derive(Debug, Default)]
struct State {
    accounts: Vec<AccountRef>,
    canonical_ids: HashMap<AccountId, String>,
    buckets: BTreeMap<String, MemoryBucket>,
    deny_assume: HashSet<AccountId>,
}

#[derive(Debug)]
struct Inner {
    self_account: AccountId,
    page_size: usize,
    state: Mutex<State>,
    calls: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<HashMap<&'static str, VecDeque<CloudError>>>,
    expired: AtomicBool,
    etag_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory organization with object storage.
#[derive(Clone, Debug)]
pub struct MemoryCloud {
    inner: Arc<Inner>,
}

impl MemoryCloud {
    /// Create a cloud whose ambient credentials belong to `self_account`.
    pub fn new(self_account: &str, canonical_id: &str) -> CloudResult<Self> {
        Self::with_page_size(self_account, canonical_id, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(
        self_account: &str,
        canonical_id: &str,
        page_size: usize,
    ) -> CloudResult<Self> {
        let self_account =
            AccountId::new(self_account).map_err(|e| CloudError::Config(e.to_string()))?;
        let cloud = Self {
            inner: Arc::new(Inner {
                self_account: self_account.clone(),
                page_size: page_size.max(1),
                state: Mutex::new(State::default()),
                calls: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                expired: AtomicBool::new(false),
                etag_seq: AtomicU64::new(0),
            }),
        };
        cloud.register(self_account, canonical_id, AccountStatus::Active);
        Ok(cloud)
    }

    fn register(&self, id: AccountId, canonical_id: &str, status: AccountStatus) {
        let mut state = lock(&self.inner.state);
        state.canonical_ids.insert(id.clone(), canonical_id.to_string());
        state.accounts.retain(|a| a.id != id);
        state.accounts.push(AccountRef { id, status });
    }

    /// Add an organization member account.
    pub fn add_account(
        &self,
        id: &str,
        canonical_id: &str,
        status: AccountStatus,
    ) -> CloudResult<AccountId> {
        let id = AccountId::new(id).map_err(|e| CloudError::Config(e.to_string()))?;
        self.register(id.clone(), canonical_id, status);
        Ok(id)
    }

    /// Add a bucket owned by `owner`.
    pub fn add_bucket(&self, owner: &AccountId, bucket: &str, encryption: BucketEncryption) {
        lock(&self.inner.state).buckets.insert(
            bucket.to_string(),
            MemoryBucket {
                owner: self.resolve(owner),
                encryption,
                objects: BTreeMap::new(),
            },
        );
    }

    /// Store an unencrypted object owned by the bucket owner.
    pub fn put_object(&self, bucket: &str, key: &str, size: u64) {
        let owner_id = {
            let state = lock(&self.inner.state);
            state
                .buckets
                .get(bucket)
                .and_then(|b| state.canonical_ids.get(&b.owner))
                .cloned()
        };
        let object = MemoryObject {
            size,
            sse_algorithm: None,
            kms_key_id: None,
            acl: owner_acl(owner_id),
            etag: self.next_etag(),
        };
        self.insert_object(bucket, key, object);
    }

    /// Store an object with explicit metadata. Creates nothing if the bucket is missing.
    pub fn insert_object(&self, bucket: &str, key: &str, object: MemoryObject) {
        if let Some(b) = lock(&self.inner.state).buckets.get_mut(bucket) {
            b.objects.insert(key.to_string(), object);
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<MemoryObject> {
        lock(&self.inner.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.inner.state)
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn canonical_id(&self, account: &AccountId) -> Option<String> {
        let account = self.resolve(account);
        lock(&self.inner.state).canonical_ids.get(&account).cloned()
    }

    /// Make role assumption into `account` fail.
    pub fn deny_assume(&self, account: &AccountId) {
        lock(&self.inner.state)
            .deny_assume
            .insert(account.clone());
    }

    /// Fail the next call to `op` with `err`. Repeated calls queue further failures.
    pub fn fail_next(&self, op: &'static str, err: CloudError) {
        lock(&self.inner.faults).entry(op).or_default().push_back(err);
    }

    /// Fail every call from now on with an expired-token error.
    pub fn expire_credentials(&self) {
        self.inner.expired.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str) -> usize {
        lock(&self.inner.calls).get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.inner.calls).values().sum()
    }

    fn next_etag(&self) -> String {
        let seq = self.inner.etag_seq.fetch_add(1, Ordering::Relaxed);
        format!("\"{seq:032x}\"")
    }

    fn resolve(&self, account: &AccountId) -> AccountId {
        if account.is_self() {
            self.inner.self_account.clone()
        } else {
            account.clone()
        }
    }

    /// Count the call and apply any scripted failure.
    fn enter(&self, op: &'static str) -> CloudResult<()> {
        *lock(&self.inner.calls).entry(op).or_insert(0) += 1;
        if self.inner.expired.load(Ordering::SeqCst) {
            return Err(CloudError::expired_token(op));
        }
        if let Some(err) = lock(&self.inner.faults)
            .get_mut(op)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(())
    }

    fn session_for(&self, account: &AccountId) -> Session {
        Arc::new(MemorySession {
            cloud: self.clone(),
            account: self.resolve(account),
        })
    }
}

fn owner_acl(owner_id: Option<String>) -> ObjectAcl {
    let grants = owner_id
        .iter()
        .map(|id| AclGrant {
            grantee: Grantee::CanonicalUser {
                id: id.clone(),
                display_name: None,
            },
            permission: FULL_CONTROL.to_string(),
        })
        .collect();
    ObjectAcl {
        owner_id,
        owner_display_name: None,
        grants,
        unparsed_grants: 0,
    }
}

#[async_trait]
impl IdentityApi for MemoryCloud {
    async fn list_accounts(&self, next_token: Option<String>) -> CloudResult<AccountPage> {
        self.enter(op::LIST_ACCOUNTS)?;
        let state = lock(&self.inner.state);
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::service(op::LIST_ACCOUNTS, Some(400), Some("InvalidInputException"), "bad token"))?,
            None => 0,
        };
        let end = (start + self.inner.page_size).min(state.accounts.len());
        Ok(AccountPage {
            accounts: state.accounts[start.min(end)..end].to_vec(),
            next_token: (end < state.accounts.len()).then(|| end.to_string()),
        })
    }

    async fn assume_role(&self, account: &AccountId) -> CloudResult<Credential> {
        self.enter(op::ASSUME_ROLE)?;
        let state = lock(&self.inner.state);
        if state.deny_assume.contains(account) || !state.canonical_ids.contains_key(account) {
            return Err(CloudError::Credentials {
                op: op::ASSUME_ROLE,
                message: format!("AccessDenied: not authorized to assume role in {account}"),
            });
        }
        Ok(Credential {
            account_id: account.clone(),
            role_arn: format!("arn:aws:iam::{account}:role/OrganizationAccountAccessRole"),
            provider: None,
        })
    }

    async fn session(&self, credential: Option<&Credential>) -> CloudResult<Session> {
        Ok(match credential {
            Some(credential) => self.session_for(&credential.account_id),
            None => self.session_for(&AccountId::self_account()),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Session bound to one in-memory account.
#[derive(Debug)]
pub struct MemorySession {
    cloud: MemoryCloud,
    account: AccountId,
}

impl MemorySession {
    fn not_found_bucket(op: &'static str, bucket: &str) -> CloudError {
        CloudError::service(op, Some(404), Some("NoSuchBucket"), format!("no such bucket: {bucket}"))
    }
}

#[async_trait]
impl ObjectStoreApi for MemorySession {
    async fn list_buckets(&self) -> CloudResult<BucketListing> {
        self.cloud.enter(op::LIST_BUCKETS)?;
        let state = lock(&self.cloud.inner.state);
        Ok(BucketListing {
            owner_id: state.canonical_ids.get(&self.account).cloned(),
            buckets: state
                .buckets
                .iter()
                .filter(|(_, b)| b.owner == self.account)
                .map(|(name, _)| name.clone())
                .collect(),
        })
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> CloudResult<ObjectPage> {
        self.cloud.enter(op::LIST_OBJECTS)?;
        let state = lock(&self.cloud.inner.state);
        let b = state
            .buckets
            .get(bucket)
            .ok_or_else(|| Self::not_found_bucket(op::LIST_OBJECTS, bucket))?;

        let mut remaining = b.objects.iter().filter(|(key, _)| match &continuation {
            Some(after) => key.as_str() > after.as_str(),
            None => true,
        });
        let keys: Vec<ObjectSummary> = remaining
            .by_ref()
            .take(self.cloud.inner.page_size)
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                size: obj.size,
            })
            .collect();
        let next_token = match (remaining.next(), keys.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };
        Ok(ObjectPage { keys, next_token })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<HeadInfo> {
        self.cloud.enter(op::HEAD_OBJECT)?;
        let obj = self
            .cloud
            .object(bucket, key)
            .ok_or_else(|| CloudError::not_found(op::HEAD_OBJECT, key))?;
        Ok(HeadInfo {
            size: obj.size,
            sse_algorithm: obj.sse_algorithm,
            kms_key_id: obj.kms_key_id,
            replication_status: None,
            etag: Some(obj.etag),
        })
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        encryption: &DesiredEncryption,
    ) -> CloudResult<()> {
        self.cloud.enter(op::COPY_OBJECT)?;
        let source = self
            .cloud
            .object(bucket, source_key)
            .ok_or_else(|| CloudError::not_found(op::COPY_OBJECT, source_key))?;
        let (sse_algorithm, kms_key_id) = match encryption {
            DesiredEncryption::Kms { key_id } => {
                (encryption.algorithm().to_string(), Some(key_id.clone()))
            }
            DesiredEncryption::Aes256 => (encryption.algorithm().to_string(), None),
        };
        let copier = self.cloud.canonical_id(&self.account);
        let object = MemoryObject {
            size: source.size,
            sse_algorithm: Some(sse_algorithm),
            kms_key_id,
            acl: owner_acl(copier),
            etag: source.etag,
        };
        self.cloud.insert_object(bucket, dest_key, object);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.cloud.enter(op::DELETE_OBJECT)?;
        let mut state = lock(&self.cloud.inner.state);
        let b = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::not_found_bucket(op::DELETE_OBJECT, bucket))?;
        b.objects.remove(key);
        Ok(())
    }

    async fn get_object_acl(&self, bucket: &str, key: &str) -> CloudResult<ObjectAcl> {
        self.cloud.enter(op::GET_OBJECT_ACL)?;
        self.cloud
            .object(bucket, key)
            .map(|obj| obj.acl)
            .ok_or_else(|| CloudError::not_found(op::GET_OBJECT_ACL, key))
    }

    async fn put_object_acl(&self, bucket: &str, key: &str, acl: &ObjectAcl) -> CloudResult<()> {
        self.cloud.enter(op::PUT_OBJECT_ACL)?;
        let mut state = lock(&self.cloud.inner.state);
        let obj = state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.objects.get_mut(key))
            .ok_or_else(|| CloudError::not_found(op::PUT_OBJECT_ACL, key))?;
        obj.acl = acl.clone();
        Ok(())
    }

    async fn get_bucket_default_encryption(&self, bucket: &str) -> CloudResult<BucketEncryption> {
        self.cloud.enter(op::GET_BUCKET_ENCRYPTION)?;
        lock(&self.cloud.inner.state)
            .buckets
            .get(bucket)
            .map(|b| b.encryption.clone())
            .ok_or_else(|| Self::not_found_bucket(op::GET_BUCKET_ENCRYPTION, bucket))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
