//! Engine test utilities.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

pub mod fixtures;

use std::sync::Arc;
use sweeper_cloud::{IdentityApi, MemoryCloud, Session};
use sweeper_core::{AccountId, AppConfig, FilterRules};
use sweeper_engine::{
    EngineMetrics, ObjectRemediator, ObjectTask, PageCounter, Pipeline, PipelineDeps,
};
use sweeper_ledger::{IdempotencyLedger, MemoryLedger};

#[allow(unused_imports)]
pub use fixtures::*;

/// An engine wired to an in-memory cloud and ledger.
#[allow(dead_code)]
pub struct TestEngine {
    pub cloud: MemoryCloud,
    pub config: AppConfig,
    pub ledger: Arc<MemoryLedger>,
    pub metrics: Arc<EngineMetrics>,
    pub rules: FilterRules,
}

#[allow(dead_code)]
impl TestEngine {
    pub fn new(cloud: MemoryCloud, config: AppConfig) -> Self {
        Self {
            cloud,
            config,
            ledger: Arc::new(MemoryLedger::new()),
            metrics: Arc::new(EngineMetrics::new().expect("metrics registry")),
            rules: FilterRules::default(),
        }
    }

    /// Config scoped to the `data` bucket.
    pub fn one_bucket(cloud: MemoryCloud, configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::for_testing();
        config.scope.one_bucket = true;
        config.scope.one_bucket_name = "data".to_string();
        configure(&mut config);
        config.validate().expect("valid test config");
        Self::new(cloud, config)
    }

    pub fn deps(&self) -> PipelineDeps {
        let ledger: Arc<dyn IdempotencyLedger> = self.ledger.clone();
        PipelineDeps::new(
            self.config.clone(),
            Arc::new(self.cloud.clone()),
            ledger,
            self.rules.clone(),
            self.metrics.clone(),
        )
        .expect("pipeline deps")
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.deps())
    }

    pub fn remediator(&self, deps: &PipelineDeps) -> ObjectRemediator {
        ObjectRemediator::new(
            &deps.config,
            deps.broker.clone(),
            deps.identities.clone(),
            deps.bucket_keys.clone(),
            deps.ledger.clone(),
            deps.filter.clone(),
            deps.metrics.clone(),
        )
    }

    pub async fn self_session(&self) -> Session {
        self.cloud.session(None).await.expect("ambient session")
    }
}

#[allow(dead_code)]
pub fn task(account: AccountId, bucket: &str, key: &str, size: u64) -> ObjectTask {
    let page = Arc::new(PageCounter::new(bucket, 0));
    page.add();
    ObjectTask::new(account, bucket, key, size, page)
}
