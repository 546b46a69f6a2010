//! ACL check and repair.

mod common;

use common::{MEMBER_A, MEMBER_B, TestEngine, foreign_object, org_cloud, task};
use sweeper_cloud::{CloudError, op};
use sweeper_core::{AccountId, AppConfig, DANGER_SENTINEL};
use sweeper_engine::metrics::{action, finding, outcome};
use sweeper_engine::{ObjectOutcome, PipelineDeps};

fn acl_config(force: bool) -> AppConfig {
    let mut config = AppConfig::for_testing();
    config.audit.check_acl = true;
    config.audit.acl_owner_account = MEMBER_B.to_string();
    if force {
        config.danger.force_acl = DANGER_SENTINEL.to_string();
    }
    config
}

async fn resolve(deps: &PipelineDeps, account: &AccountId) {
    let session = deps
        .broker
        .session_for(account)
        .await
        .unwrap()
        .expect("session");
    deps.identities.resolve(account, &session).await.unwrap();
}

fn member_a() -> AccountId {
    AccountId::new(MEMBER_A).unwrap()
}

#[tokio::test]
async fn test_forbidden_read_retries_once_with_owner_account() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    engine
        .cloud
        .insert_object("a-bucket", "logs/x", foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    resolve(&deps, &a).await;
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    engine
        .cloud
        .fail_next(op::GET_OBJECT_ACL, CloudError::forbidden(op::GET_OBJECT_ACL));
    let result = remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();

    assert_eq!(result, ObjectOutcome::Done);
    assert_eq!(engine.cloud.calls(op::GET_OBJECT_ACL), 2);
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 1);
    let acl = engine.cloud.object("a-bucket", "logs/x").unwrap().acl;
    assert_eq!(acl.owner_id.as_deref(), Some("canon-writer"));
    assert!(acl.grants_to("canon-writer"));
    assert!(acl.grants_to("canon-a"));
    assert_eq!(engine.metrics.findings(finding::WRONG_ACL), 1);
    assert_eq!(engine.metrics.remediations(action::FIX_ACL, outcome::OK), 1);
}

#[tokio::test]
async fn test_forbidden_everywhere_gives_up() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    let key = format!("{MEMBER_A}/logs/x");
    engine
        .cloud
        .insert_object("a-bucket", &key, foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    for _ in 0..3 {
        engine
            .cloud
            .fail_next(op::GET_OBJECT_ACL, CloudError::forbidden(op::GET_OBJECT_ACL));
    }
    let result = remediator
        .handle_acl(&task(a, "a-bucket", &key, 5), &session)
        .await
        .unwrap();

    assert_eq!(result, ObjectOutcome::Skipped);
    // Task session, owner account, then the key owner.
    assert_eq!(engine.cloud.calls(op::GET_OBJECT_ACL), 3);
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 0);
    assert_eq!(engine.metrics.findings(finding::FORBIDDEN_SKIP), 1);
}

#[tokio::test]
async fn test_ladder_skips_missing_key_owner() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    engine
        .cloud
        .insert_object("a-bucket", "logs/x", foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    for _ in 0..2 {
        engine
            .cloud
            .fail_next(op::GET_OBJECT_ACL, CloudError::forbidden(op::GET_OBJECT_ACL));
    }
    let result = remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();

    assert_eq!(result, ObjectOutcome::Skipped);
    assert_eq!(engine.cloud.calls(op::GET_OBJECT_ACL), 2);
}

#[tokio::test]
async fn test_compliant_object_is_left_alone() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    engine.cloud.put_object("a-bucket", "mine", 5);
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    resolve(&deps, &a).await;
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    let result = remediator
        .handle_acl(&task(a, "a-bucket", "mine", 5), &session)
        .await
        .unwrap();
    assert_eq!(result, ObjectOutcome::Done);
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 0);
    assert_eq!(engine.metrics.findings(finding::WRONG_ACL), 0);
}

#[tokio::test]
async fn test_unresolved_identity_fails_open() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    engine
        .cloud
        .insert_object("a-bucket", "logs/x", foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    let result = remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();
    assert_eq!(result, ObjectOutcome::Done);
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 0);
}

#[tokio::test]
async fn test_dry_run_reports_without_writing() {
    let engine = TestEngine::new(org_cloud(), acl_config(false));
    engine
        .cloud
        .insert_object("a-bucket", "logs/x", foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    resolve(&deps, &a).await;
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 0);
    assert_eq!(engine.metrics.findings(finding::WRONG_ACL), 1);
    assert_eq!(engine.metrics.remediations(action::FIX_ACL, outcome::DRY_RUN), 1);
}

#[tokio::test]
async fn test_every_reader_is_granted() {
    let mut config = acl_config(true);
    config.audit.three_acl = true;
    config.audit.acl_reader_accounts = vec![MEMBER_A.to_string(), MEMBER_B.to_string()];
    config.validate().unwrap();
    let engine = TestEngine::new(org_cloud(), config);
    engine
        .cloud
        .insert_object("a-bucket", "logs/x", foreign_object("canon-writer", 5));
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    let b = AccountId::new(MEMBER_B).unwrap();
    resolve(&deps, &a).await;
    resolve(&deps, &b).await;
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();

    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 2);
    let acl = engine.cloud.object("a-bucket", "logs/x").unwrap().acl;
    assert!(acl.grants_to("canon-a"));
    assert!(acl.grants_to("canon-b"));
    assert!(acl.grants_to("canon-writer"));
    assert_eq!(acl.grants.len(), 3);
}

#[tokio::test]
async fn test_acl_with_unknown_grants_is_not_rewritten() {
    let engine = TestEngine::new(org_cloud(), acl_config(true));
    let mut object = foreign_object("canon-writer", 5);
    object.acl.unparsed_grants = 1;
    engine.cloud.insert_object("a-bucket", "logs/x", object);
    let deps = engine.deps();
    let remediator = engine.remediator(&deps);
    let a = member_a();
    resolve(&deps, &a).await;
    let session = deps.broker.session_for(&a).await.unwrap().unwrap();

    let result = remediator
        .handle_acl(&task(a, "a-bucket", "logs/x", 5), &session)
        .await
        .unwrap();

    assert_eq!(result, ObjectOutcome::Done);
    assert_eq!(engine.cloud.calls(op::PUT_OBJECT_ACL), 0);
    assert_eq!(engine.metrics.findings(finding::WRONG_ACL), 1);
    assert_eq!(engine.metrics.remediations(action::FIX_ACL, outcome::SKIPPED), 1);
}
