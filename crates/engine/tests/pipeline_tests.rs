//! End-to-end runs over the in-memory cloud.

mod common;

use common::{
    DATA_KEY, MEMBER_A, MEMBER_B, SELF_ACCOUNT, TestEngine, data_cloud, foreign_object, org_cloud,
};
use std::sync::Arc;
use sweeper_cloud::{CloudError, op};
use sweeper_core::config::{LedgerConfig, ScopeConfig};
use sweeper_core::{AccountId, AppConfig, DANGER_SENTINEL, FilterRules};
use sweeper_engine::{EngineMetrics, Pipeline, PipelineDeps, discover_accounts};
use sweeper_engine::metrics::{action, finding, outcome, stage};
use sweeper_ledger::{IdempotencyLedger, LedgerKey};

fn recopy_engine() -> TestEngine {
    TestEngine::one_bucket(data_cloud(), |config| {
        config.audit.re_copy_files = true;
        config.danger.reencrypt = DANGER_SENTINEL.to_string();
    })
}

#[tokio::test]
async fn test_discover_accounts_keeps_active_members() {
    let cloud = org_cloud();
    let scope = ScopeConfig {
        check_org_accounts: true,
        ..ScopeConfig::default()
    };
    let accounts = discover_accounts(&cloud, &scope).await.unwrap();
    let ids: Vec<&str> = accounts.iter().map(AccountId::as_str).collect();
    assert_eq!(ids, vec![SELF_ACCOUNT, MEMBER_A, MEMBER_B]);
    assert_eq!(cloud.calls(op::LIST_ACCOUNTS), 2);

    let scope = ScopeConfig {
        check_org_accounts: false,
        ..ScopeConfig::default()
    };
    let accounts = discover_accounts(&cloud, &scope).await.unwrap();
    assert_eq!(accounts, vec![AccountId::self_account()]);
}

#[tokio::test]
async fn test_org_crawl_reports_unencrypted_objects() {
    let cloud = org_cloud();
    for key in ["one", "two", "three"] {
        cloud.put_object("self-bucket", key, 10);
    }
    cloud.put_object("a-bucket", "x", 10);
    cloud.put_object("a-bucket", "y", 10);
    cloud.put_object("b-bucket", "z", 10);
    cloud.put_object("suspended-bucket", "hidden", 10);

    let mut config = AppConfig::for_testing();
    config.scope.check_org_accounts = true;
    let engine = TestEngine::new(cloud, config);
    let pipeline = engine.pipeline();
    let seed = discover_accounts(&engine.cloud, &engine.config.scope)
        .await
        .unwrap();

    let summary = pipeline.run(seed).await.unwrap();

    assert_eq!(summary.get("sweeper_findings_total{kind=\"unencrypted\"}"), 6);
    assert_eq!(summary.get("sweeper_tasks_total{stage=\"account\"}"), 3);
    assert_eq!(summary.get("sweeper_tasks_total{stage=\"bucket\"}"), 3);
    assert_eq!(summary.get("sweeper_tasks_total{stage=\"object\"}"), 6);
    assert_eq!(summary.get("sweeper_object_bytes_total"), 60);
    assert_eq!(summary.get("sweeper_in_flight"), 0);
    assert_eq!(engine.cloud.calls(op::HEAD_OBJECT), 6);
    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), 0);
    assert_eq!(pipeline.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_one_bucket_scope_limits_the_crawl() {
    let cloud = org_cloud();
    cloud.put_object("self-bucket", "one", 10);
    cloud.put_object("a-bucket", "x", 10);

    let mut config = AppConfig::for_testing();
    config.scope.check_org_accounts = true;
    config.scope.one_bucket = true;
    config.scope.one_bucket_name = "a-bucket".to_string();
    let engine = TestEngine::new(cloud, config);
    let seed = discover_accounts(&engine.cloud, &engine.config.scope)
        .await
        .unwrap();

    let summary = engine.pipeline().run(seed).await.unwrap();
    assert_eq!(summary.get("sweeper_tasks_total{stage=\"bucket\"}"), 1);
    assert_eq!(engine.cloud.calls(op::HEAD_OBJECT), 1);
}

#[tokio::test]
async fn test_recopy_skips_objects_in_ledger() {
    let engine = recopy_engine();
    for key in ["a", "b", "c"] {
        engine.cloud.put_object("data", key, 10);
    }
    engine.ledger.add(&LedgerKey::new("data", "a")).await.unwrap();
    engine.ledger.add(&LedgerKey::new("data", "b")).await.unwrap();

    engine
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap();

    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), 2);
    assert_eq!(engine.cloud.calls(op::DELETE_OBJECT), 1);
    assert_eq!(engine.ledger.len(), 3);
    let c = engine.cloud.object("data", "c").unwrap();
    assert_eq!(c.kms_key_id.as_deref(), Some(DATA_KEY));
    assert!(engine.cloud.object("data", "a").unwrap().sse_algorithm.is_none());

    // A second run finds everything recorded.
    let again = TestEngine {
        cloud: engine.cloud.clone(),
        config: engine.config.clone(),
        ledger: engine.ledger.clone(),
        metrics: Arc::new(EngineMetrics::new().unwrap()),
        rules: engine.rules.clone(),
    };
    again
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap();
    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), 2);
    assert_eq!(engine.cloud.calls(op::DELETE_OBJECT), 1);
}

#[tokio::test]
async fn test_recopy_resumes_from_durable_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = data_cloud();
    cloud.put_object("data", "a", 10);
    cloud.put_object("data", "b", 10);

    let mut config = AppConfig::for_testing();
    config.scope.one_bucket = true;
    config.scope.one_bucket_name = "data".to_string();
    config.audit.re_copy_files = true;
    config.danger.reencrypt = DANGER_SENTINEL.to_string();
    config.ledger = LedgerConfig::Sqlite {
        path: dir.path().join("done-objects.db"),
    };
    config.validate().unwrap();

    for _ in 0..2 {
        let ledger = sweeper_ledger::from_config(&config.ledger).await.unwrap();
        let deps = PipelineDeps::new(
            config.clone(),
            Arc::new(cloud.clone()),
            ledger,
            FilterRules::default(),
            Arc::new(EngineMetrics::new().unwrap()),
        )
        .unwrap();
        Pipeline::new(deps)
            .run(vec![AccountId::self_account()])
            .await
            .unwrap();
    }

    // Only the first run copied anything.
    assert_eq!(cloud.calls(op::COPY_OBJECT), 4);
    assert_eq!(cloud.calls(op::DELETE_OBJECT), 2);
}

#[tokio::test]
async fn test_failed_object_is_requeued_and_balanced() {
    let engine = recopy_engine();
    engine.cloud.put_object("data", "a", 10);
    engine
        .cloud
        .fail_next(op::COPY_OBJECT, CloudError::forbidden(op::COPY_OBJECT));

    let pipeline = engine.pipeline();
    pipeline.run(vec![AccountId::self_account()]).await.unwrap();

    assert_eq!(engine.metrics.object_retries(), 1);
    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), 3);
    assert_eq!(engine.metrics.remediations(action::REENCRYPT, outcome::OK), 1);
    assert_eq!(pipeline.tracker().in_flight(), 0);
    assert!(engine.ledger.contains(&LedgerKey::new("data", "a")).await.unwrap());
}

#[tokio::test]
async fn test_retries_stop_at_the_cap() {
    let engine = recopy_engine();
    engine.cloud.put_object("data", "a", 10);
    for _ in 0..10 {
        engine
            .cloud
            .fail_next(op::COPY_OBJECT, CloudError::forbidden(op::COPY_OBJECT));
    }

    let pipeline = engine.pipeline();
    pipeline.run(vec![AccountId::self_account()]).await.unwrap();

    let max = engine.config.pipeline.max_object_retries;
    assert_eq!(engine.metrics.object_retries(), u64::from(max));
    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), max as usize + 1);
    assert_eq!(engine.metrics.remediations(action::REENCRYPT, outcome::GAVE_UP), 1);
    assert_eq!(pipeline.tracker().in_flight(), 0);
    assert!(engine.ledger.is_empty());
}

#[tokio::test]
async fn test_list_mode_deletes_only_matching_objects() {
    let engine = TestEngine::one_bucket(data_cloud(), |config| {
        config.audit.just_list_files = true;
        config.audit.list_files_matching_prefix = "logs/".to_string();
        config.audit.list_files_matching_exclude = "archive".to_string();
        config.danger.delete_matching = DANGER_SENTINEL.to_string();
    });
    for key in ["logs/2024/x", "logs/archive/x", "other/x"] {
        engine.cloud.put_object("data", key, 1);
    }

    engine
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap();

    assert_eq!(
        engine.cloud.keys("data"),
        vec!["logs/archive/x".to_string(), "other/x".to_string()]
    );
    assert_eq!(engine.metrics.findings(finding::LIST_MATCH), 1);
    assert_eq!(engine.metrics.remediations(action::DELETE, outcome::OK), 1);
}

#[tokio::test]
async fn test_list_mode_without_sentinel_keeps_objects() {
    let engine = TestEngine::one_bucket(data_cloud(), |config| {
        config.audit.just_list_files = true;
        config.audit.list_files_matching_prefix = "*".to_string();
    });
    for key in ["a", "b", "c%%%"] {
        engine.cloud.put_object("data", key, 1);
    }

    engine
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap();

    assert_eq!(engine.cloud.keys("data").len(), 3);
    assert_eq!(engine.cloud.calls(op::DELETE_OBJECT), 0);
    // The default exclude keeps temporary objects out of scope.
    assert_eq!(engine.metrics.findings(finding::LIST_MATCH), 2);
    assert_eq!(engine.metrics.remediations(action::DELETE, outcome::DRY_RUN), 2);
}

#[tokio::test]
async fn test_multi_reader_run_grants_every_reader() {
    let cloud = org_cloud();
    cloud.insert_object("self-bucket", "shared/x", foreign_object("canon-writer", 5));

    let mut config = AppConfig::for_testing();
    config.audit.three_acl = true;
    config.audit.acl_reader_accounts = vec![MEMBER_A.to_string(), MEMBER_B.to_string()];
    config.danger.force_acl = DANGER_SENTINEL.to_string();
    config.validate().unwrap();
    let engine = TestEngine::new(cloud, config);

    engine
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap();

    let acl = engine.cloud.object("self-bucket", "shared/x").unwrap().acl;
    assert!(acl.grants_to("canon-a"));
    assert!(acl.grants_to("canon-b"));
    assert_eq!(engine.metrics.remediations(action::FIX_ACL, outcome::OK), 2);
}

#[tokio::test]
async fn test_expired_credentials_stop_the_run() {
    let engine = TestEngine::one_bucket(data_cloud(), |_| {});
    engine.cloud.put_object("data", "a", 10);
    engine.cloud.expire_credentials();

    let err = engine
        .pipeline()
        .run(vec![AccountId::self_account()])
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), 3);
    // The identity lookup fails and nothing else is attempted.
    assert_eq!(engine.cloud.total_calls(), 1);
}

#[tokio::test]
async fn test_denied_account_is_skipped() {
    let cloud = org_cloud();
    cloud.put_object("a-bucket", "x", 10);
    cloud.put_object("b-bucket", "y", 10);
    cloud.deny_assume(&AccountId::new(MEMBER_A).unwrap());

    let engine = TestEngine::new(cloud, AppConfig::for_testing());
    let seed = vec![
        AccountId::new(MEMBER_A).unwrap(),
        AccountId::new(MEMBER_B).unwrap(),
    ];
    let summary = engine.pipeline().run(seed).await.unwrap();

    assert_eq!(summary.get("sweeper_tasks_total{stage=\"account\"}"), 2);
    assert_eq!(engine.cloud.calls(op::HEAD_OBJECT), 1);
}

#[tokio::test]
async fn test_object_workers_outlive_a_listing_cooldown() {
    let engine = TestEngine::one_bucket(data_cloud(), |config| {
        config.pipeline.object_idle_secs = 1;
        config.retry.slow_down_ms = 2500;
    });
    engine.cloud.put_object("data", "a", 10);
    engine
        .cloud
        .fail_next(op::LIST_OBJECTS, CloudError::throttled(op::LIST_OBJECTS));

    let pipeline = engine.pipeline();
    pipeline.run(vec![AccountId::self_account()]).await.unwrap();

    // The object is listed after the idle period and still gets checked.
    assert_eq!(engine.cloud.calls(op::HEAD_OBJECT), 1);
    assert_eq!(engine.metrics.findings(finding::UNENCRYPTED), 1);
    assert_eq!(engine.metrics.dropped_tasks(stage::OBJECT), 0);
    assert_eq!(pipeline.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_repair_retry_removes_leftover_temp() {
    let engine = TestEngine::one_bucket(data_cloud(), |config| {
        config.audit.one_bucket_reencrypt = true;
        config.danger.reencrypt = DANGER_SENTINEL.to_string();
    });
    engine.cloud.put_object("data", "a", 10);
    engine
        .cloud
        .fail_next(op::DELETE_OBJECT, CloudError::forbidden(op::DELETE_OBJECT));

    let pipeline = engine.pipeline();
    pipeline.run(vec![AccountId::self_account()]).await.unwrap();

    assert_eq!(engine.cloud.keys("data"), vec!["a".to_string()]);
    assert_eq!(engine.cloud.calls(op::COPY_OBJECT), 2);
    assert_eq!(engine.cloud.calls(op::DELETE_OBJECT), 2);
    assert_eq!(engine.metrics.object_retries(), 1);
    assert_eq!(engine.metrics.remediations(action::REENCRYPT, outcome::FAILED), 1);
    assert_eq!(engine.metrics.remediations(action::REENCRYPT, outcome::OK), 1);
    assert!(engine.ledger.contains(&LedgerKey::new("data", "a")).await.unwrap());
    assert_eq!(pipeline.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_remediation_label_follows_mode() {
    let list = TestEngine::one_bucket(data_cloud(), |config| config.audit.just_list_files = true);
    assert_eq!(list.remediator(&list.deps()).action(), action::DELETE);

    let mut config = AppConfig::for_testing();
    config.audit.check_acl = true;
    let acl = TestEngine::new(org_cloud(), config);
    assert_eq!(acl.remediator(&acl.deps()).action(), action::FIX_ACL);

    let recopy = recopy_engine();
    assert_eq!(recopy.remediator(&recopy.deps()).action(), action::REENCRYPT);
}
