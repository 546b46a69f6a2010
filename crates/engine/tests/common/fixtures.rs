use sweeper_cloud::types::FULL_CONTROL;
use sweeper_cloud::{AclGrant, BucketEncryption, Grantee, MemoryCloud, MemoryObject, ObjectAcl};
use sweeper_core::{AccountId, AccountStatus};

#[allow(dead_code)]
pub const SELF_ACCOUNT: &str = "100000000001";
#[allow(dead_code)]
pub const MEMBER_A: &str = "200000000002";
#[allow(dead_code)]
pub const MEMBER_B: &str = "300000000003";
#[allow(dead_code)]
pub const SUSPENDED: &str = "400000000004";
#[allow(dead_code)]
pub const DATA_KEY: &str = "arn:aws:kms:us-east-1:100000000001:key/data-key";

/// A single account with one customer-key bucket, `data`.
#[allow(dead_code)]
pub fn data_cloud() -> MemoryCloud {
    let cloud = MemoryCloud::with_page_size(SELF_ACCOUNT, "canon-self", 2).unwrap();
    cloud.add_bucket(
        &AccountId::self_account(),
        "data",
        BucketEncryption::Kms {
            key_id: Some(DATA_KEY.to_string()),
        },
    );
    cloud
}

/// An organization with two active members, one suspended member and a
/// bucket per account.
#[allow(dead_code)]
pub fn org_cloud() -> MemoryCloud {
    let cloud = MemoryCloud::with_page_size(SELF_ACCOUNT, "canon-self", 2).unwrap();
    let a = cloud
        .add_account(MEMBER_A, "canon-a", AccountStatus::Active)
        .unwrap();
    let b = cloud
        .add_account(MEMBER_B, "canon-b", AccountStatus::Active)
        .unwrap();
    let suspended = cloud
        .add_account(SUSPENDED, "canon-suspended", AccountStatus::Inactive)
        .unwrap();

    cloud.add_bucket(&AccountId::self_account(), "self-bucket", BucketEncryption::Aes256);
    cloud.add_bucket(&a, "a-bucket", BucketEncryption::Aes256);
    cloud.add_bucket(&b, "b-bucket", BucketEncryption::Unset);
    cloud.add_bucket(&suspended, "suspended-bucket", BucketEncryption::Unset);
    cloud
}

/// An object owned by `owner` and granted only to it.
#[allow(dead_code)]
pub fn foreign_object(owner: &str, size: u64) -> MemoryObject {
    MemoryObject {
        size,
        sse_algorithm: Some("AES256".to_string()),
        kms_key_id: None,
        acl: ObjectAcl {
            owner_id: Some(owner.to_string()),
            owner_display_name: None,
            grants: vec![AclGrant {
                grantee: Grantee::CanonicalUser {
                    id: owner.to_string(),
                    display_name: None,
                },
                permission: FULL_CONTROL.to_string(),
            }],
            unparsed_grants: 0,
        },
        etag: "\"foreign\"".to_string(),
    }
}
