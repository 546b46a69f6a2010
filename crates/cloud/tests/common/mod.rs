pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{MEMBER_A, MEMBER_B, SELF_ACCOUNT, org_cloud};
