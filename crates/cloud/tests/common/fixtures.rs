use sweeper_cloud::{BucketEncryption, MemoryCloud};
use sweeper_core::{AccountId, AccountStatus};

#[allow(dead_code)]
pub const SELF_ACCOUNT: &str = "100000000001";
#[allow(dead_code)]
pub const MEMBER_A: &str = "200000000002";
#[allow(dead_code)]
pub const MEMBER_B: &str = "300000000003";

/// An organization with two active members, one suspended member and a
/// bucket per active account.
#[allow(dead_code)]
pub fn org_cloud(page_size: usize) -> MemoryCloud {
    let cloud = MemoryCloud::with_page_size(SELF_ACCOUNT, "canon-self", page_size).unwrap();
    let a = cloud
        .add_account(MEMBER_A, "canon-a", AccountStatus::Active)
        .unwrap();
    let b = cloud
        .add_account(MEMBER_B, "canon-b", AccountStatus::Active)
        .unwrap();
    cloud
        .add_account("400000000004", "canon-suspended", AccountStatus::Inactive)
        .unwrap();

    cloud.add_bucket(&AccountId::self_account(), "self-bucket", BucketEncryption::Aes256);
    cloud.add_bucket(
        &a,
        "a-bucket",
        BucketEncryption::Kms {
            key_id: Some("arn:aws:kms:us-east-1:200000000002:key/a-key".to_string()),
        },
    );
    cloud.add_bucket(&b, "b-bucket", BucketEncryption::Unset);
    cloud
}
