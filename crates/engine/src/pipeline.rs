//! Three-stage worker pipeline: accounts, then buckets, then objects.
//!
//! Each stage is a pool of identical tokio tasks sharing one bounded
//! `flume` queue. A full queue blocks its producers, which is the only
//! backpressure. Workers leave after an idle period. The run ends once the
//! [`CompletionTracker`] has been at zero for the quiet period, or when a
//! fatal error cancels it.

use crate::broker::CredentialBroker;
use crate::caches::{BucketMetadataCache, CanonicalIdentityCache};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{EngineMetrics, RunSummary, outcome, stage};
use crate::remediate::{ObjectOutcome, ObjectRemediator};
use crate::retry::{Next, Retrier, RetryBudget};
use crate::task::ObjectTask;
use crate::tracker::{CompletionTracker, PageCounter};
use flume::{Receiver, Sender, TrySendError};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sweeper_cloud::{ErrorClass, IdentityApi, RetryPolicy, op};
use sweeper_core::config::ScopeConfig;
use sweeper_core::{AccountId, AppConfig, BucketTask, FilterEngine, FilterRules, RunMode};
use sweeper_ledger::IdempotencyLedger;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything the workers share.
#[derive(Clone)]
pub struct PipelineDeps {
    pub config: Arc<AppConfig>,
    pub identity: Arc<dyn IdentityApi>,
    pub broker: Arc<CredentialBroker>,
    pub identities: Arc<CanonicalIdentityCache>,
    pub bucket_keys: Arc<BucketMetadataCache>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub filter: Arc<FilterEngine>,
    pub metrics: Arc<EngineMetrics>,
}

impl PipelineDeps {
    /// Build the broker, caches and filter around the given collaborators.
    pub fn new(
        config: AppConfig,
        identity: Arc<dyn IdentityApi>,
        ledger: Arc<dyn IdempotencyLedger>,
        rules: FilterRules,
        metrics: Arc<EngineMetrics>,
    ) -> EngineResult<Self> {
        let owner_account = config
            .acl_owner_account()
            .map(AccountId::new)
            .transpose()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let filter = FilterEngine::new(&config.audit, config.scope.one_bucket, rules);

        Ok(Self {
            broker: Arc::new(CredentialBroker::new(
                identity.clone(),
                owner_account,
                metrics.clone(),
            )),
            identities: Arc::new(CanonicalIdentityCache::new(metrics.clone())),
            bucket_keys: Arc::new(BucketMetadataCache::new(metrics.clone())),
            filter: Arc::new(filter),
            config: Arc::new(config),
            identity,
            ledger,
            metrics,
        })
    }
}

/// Accounts to crawl: every active organization member, or just the
/// ambient account.
pub async fn discover_accounts(
    identity: &dyn IdentityApi,
    scope: &ScopeConfig,
) -> EngineResult<Vec<AccountId>> {
    if !scope.check_org_accounts {
        return Ok(vec![AccountId::self_account()]);
    }

    let mut accounts = Vec::new();
    let mut skipped = 0usize;
    let mut token = None;
    loop {
        let page = identity.list_accounts(token.take()).await.map_err(|err| {
            if sweeper_cloud::classify(&err) == ErrorClass::ExpiredCredentials {
                EngineError::fatal(&err)
            } else {
                EngineError::Cloud(err)
            }
        })?;
        for account in page.accounts {
            if account.is_active() {
                accounts.push(account.id);
            } else {
                tracing::debug!(account = %account.id, "Skipping inactive account");
                skipped += 1;
            }
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    tracing::info!(accounts = accounts.len(), skipped, "Discovered organization accounts");
    Ok(accounts)
}

struct Shared {
    deps: PipelineDeps,
    remediator: ObjectRemediator,
    retrier: Retrier,
    tracker: Arc<CompletionTracker>,
    cancel: CancellationToken,
    fatal: Mutex<Option<EngineError>>,
    dropped: AtomicU64,
}

/// A single crawl. Not reusable once [`run`](Self::run) returns.
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let remediator = ObjectRemediator::new(
            &deps.config,
            deps.broker.clone(),
            deps.identities.clone(),
            deps.bucket_keys.clone(),
            deps.ledger.clone(),
            deps.filter.clone(),
            deps.metrics.clone(),
        );
        let retrier = Retrier::new(
            RetryPolicy::from_config(&deps.config.retry),
            deps.metrics.clone(),
        );
        let tracker = Arc::new(CompletionTracker::new(Some(deps.metrics.in_flight_gauge())));
        Self {
            shared: Arc::new(Shared {
                deps,
                remediator,
                retrier,
                tracker,
                cancel: CancellationToken::new(),
                fatal: Mutex::new(None),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn tracker(&self) -> Arc<CompletionTracker> {
        self.shared.tracker.clone()
    }

    /// Cancelling this token stops the run early.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Crawl `seed` accounts until every task is finished.
    pub async fn run(&self, seed: Vec<AccountId>) -> EngineResult<RunSummary> {
        let shared = &self.shared;
        let config = shared.deps.config.clone();
        let p = &config.pipeline;

        tracing::info!(
            mode = shared.remediator.mode().as_str(),
            accounts = seed.len(),
            ledger = shared.deps.ledger.backend_name(),
            identity = shared.deps.identity.backend_name(),
            "Starting run"
        );

        if shared.remediator.mode() == RunMode::AclMultiCheck {
            shared.resolve_readers().await?;
        }

        let (account_tx, account_rx) = flume::bounded::<AccountId>(p.account_queue);
        let (bucket_tx, bucket_rx) = flume::bounded::<BucketTask>(p.bucket_queue);
        let (object_tx, object_rx) = flume::bounded::<ObjectTask>(p.object_queue);

        let mut workers = JoinSet::new();
        for _ in 0..p.account_workers {
            workers.spawn(shared.clone().account_worker(account_rx.clone(), bucket_tx.clone()));
        }
        for _ in 0..p.bucket_workers {
            workers.spawn(shared.clone().bucket_worker(bucket_rx.clone(), object_tx.clone()));
        }
        for _ in 0..p.object_workers {
            workers.spawn(shared.clone().object_worker(object_rx.clone(), object_tx.clone()));
        }
        drop((account_rx, bucket_tx, bucket_rx, object_tx, object_rx));

        for account in seed {
            if !shared.send(&account_tx, account, stage::ACCOUNT).await {
                break;
            }
        }
        drop(account_tx);

        let drained = tokio::select! {
            drained = shared.tracker.wait_quiescent(p.poll_interval(), p.quiet_period(), &shared.cancel) => drained,
            _ = async { while workers.join_next().await.is_some() {} } => {
                let in_flight = shared.tracker.in_flight();
                if in_flight > 0 {
                    tracing::warn!(in_flight, "All workers exited with tasks outstanding");
                }
                in_flight <= 0
            }
        };

        shared.cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        let summary = shared.deps.metrics.summary();
        if let Some(err) = shared
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            return Err(err);
        }
        let dropped = shared.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            return Err(EngineError::Incomplete(dropped));
        }
        if !drained {
            tracing::warn!(in_flight = shared.tracker.in_flight(), "Run stopped before completion");
        }
        tracing::info!(in_flight = shared.tracker.in_flight(), "Run finished");
        Ok(summary)
    }
}

impl Shared {
    /// Record a worker error. Fatal errors stop the run.
    fn fail(&self, err: EngineError) {
        if err.is_fatal() {
            tracing::error!(error = %err, "Stopping run");
            let mut fatal = self.fatal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if fatal.is_none() {
                *fatal = Some(err);
            }
            self.cancel.cancel();
        } else {
            tracing::warn!(error = %err, "Task failed");
        }
    }

    async fn resolve_readers(&self) -> EngineResult<()> {
        for reader in self.remediator.readers() {
            if let Some(session) = self.deps.broker.session_for(reader).await? {
                self.deps.identities.resolve(reader, &session).await?;
            }
            if self.deps.identities.get(reader).is_none() {
                tracing::warn!(account = %reader, "Reader identity unresolved, its grants will not be checked");
            }
        }
        Ok(())
    }

    /// Next item from `rx`, or `None` once disconnected or cancelled, or
    /// idle with no task left anywhere in the pipeline.
    ///
    /// A worker never idles out while another stage still holds work: an
    /// upstream task sleeping through a cooldown may enqueue more later.
    async fn next<T>(&self, rx: &Receiver<T>, idle: Duration, stage: &str) -> Option<T> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = tokio::time::timeout(idle, rx.recv_async()) => match received {
                    Ok(Ok(item)) => return Some(item),
                    Ok(Err(_)) => return None,
                    Err(_) if self.tracker.in_flight() > 0 => {
                        tracing::trace!(stage, in_flight = self.tracker.in_flight(), "Worker idle, work outstanding");
                    }
                    Err(_) => {
                        tracing::debug!(stage, "Worker idle, exiting");
                        return None;
                    }
                },
            }
        }
    }

    /// Count and enqueue one task. Returns false if the run is stopping or
    /// the task could not be queued.
    async fn send<T>(&self, tx: &Sender<T>, item: T, stage: &str) -> bool {
        self.tracker.begin();
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = tx.send_async(item) => {
                if sent.is_err() && !self.cancel.is_cancelled() {
                    self.lost(stage);
                }
                sent.is_ok()
            }
        };
        if !sent {
            self.tracker.finish();
        }
        sent
    }

    /// A task was dropped because its queue has no consumers left.
    fn lost(&self, stage: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.deps.metrics.dropped(stage);
        tracing::error!(stage, "Queue closed, task dropped");
    }

    async fn account_worker(self: Arc<Self>, rx: Receiver<AccountId>, buckets: Sender<BucketTask>) {
        let idle = self.deps.config.pipeline.account_idle();
        while let Some(account) = self.next(&rx, idle, stage::ACCOUNT).await {
            if let Err(err) = self.process_account(&account, &buckets).await {
                self.fail(err);
            }
            self.deps.metrics.task(stage::ACCOUNT);
            self.tracker.finish();
        }
    }

    async fn process_account(&self, account: &AccountId, buckets: &Sender<BucketTask>) -> EngineResult<()> {
        let Some(session) = self.deps.broker.session_for(account).await? else {
            return Ok(());
        };
        self.deps.identities.resolve(account, &session).await?;

        let listing = match self
            .retrier
            .run(op::LIST_BUCKETS, account.as_str(), self.retrier.standard(), || {
                session.list_buckets()
            })
            .await?
        {
            Ok(listing) => listing,
            Err(_) => return Ok(()),
        };

        let scope = &self.deps.config.scope;
        let mut queued = 0usize;
        for bucket in listing.buckets.into_iter().filter(|b| scope.includes_bucket(b)) {
            let task = BucketTask {
                account: account.clone(),
                bucket,
            };
            if !self.send(buckets, task, stage::BUCKET).await {
                break;
            }
            queued += 1;
        }
        tracing::info!(account = %account, buckets = queued, "Queued buckets");
        Ok(())
    }

    async fn bucket_worker(self: Arc<Self>, rx: Receiver<BucketTask>, objects: Sender<ObjectTask>) {
        let idle = self.deps.config.pipeline.bucket_idle();
        while let Some(task) = self.next(&rx, idle, stage::BUCKET).await {
            if let Err(err) = self.process_bucket(&task, &objects).await {
                self.fail(err);
            }
            self.deps.metrics.task(stage::BUCKET);
            self.tracker.finish();
        }
    }

    async fn process_bucket(&self, task: &BucketTask, objects: &Sender<ObjectTask>) -> EngineResult<()> {
        let Some(session) = self.deps.broker.session_for(&task.account).await? else {
            return Ok(());
        };
        self.deps.bucket_keys.resolve(&task.bucket, &session).await?;

        let mut resume: Option<String> = None;
        let mut budget = RetryBudget::default();
        let mut pages = 0usize;
        let mut queued = 0u64;
        'listing: loop {
            let mut stream = session.list_objects(&task.bucket, resume.clone());
            while let Some(page) = stream.next().await {
                self.deps.metrics.api_call(op::LIST_OBJECTS);
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        let options = self.retrier.standard();
                        match self.retrier.decide(&err, op::LIST_OBJECTS, &task.bucket, options, &mut budget)? {
                            Next::RetryAfter(pause) => {
                                tokio::time::sleep(pause).await;
                                continue 'listing;
                            }
                            Next::GiveUp(_) => break 'listing,
                        }
                    }
                };

                resume = page.next_token.clone();
                let counter = Arc::new(PageCounter::new(task.bucket.clone(), pages));
                pages += 1;
                for item in page.keys {
                    counter.add();
                    let object = ObjectTask::new(
                        task.account.clone(),
                        task.bucket.clone(),
                        item.key,
                        item.size,
                        counter.clone(),
                    );
                    if !self.send(objects, object, stage::OBJECT).await {
                        counter.done();
                        break 'listing;
                    }
                    queued += 1;
                }
                self.tracker.touch();
            }
            break;
        }
        tracing::info!(account = %task.account, bucket = %task.bucket, pages, objects = queued, "Listed bucket");
        Ok(())
    }

    async fn object_worker(self: Arc<Self>, rx: Receiver<ObjectTask>, requeue: Sender<ObjectTask>) {
        let idle = self.deps.config.pipeline.object_idle();
        while let Some(task) = self.next(&rx, idle, stage::OBJECT).await {
            let outcome = match self.process_object(&task).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.fail(err);
                    ObjectOutcome::Skipped
                }
            };
            self.deps.metrics.task(stage::OBJECT);
            if outcome == ObjectOutcome::Retry {
                self.retry(task, &requeue);
            } else {
                task.page.done();
                self.tracker.finish();
            }
        }
    }

    async fn process_object(&self, task: &ObjectTask) -> EngineResult<ObjectOutcome> {
        let Some(session) = self.deps.broker.session_for(&task.account).await? else {
            return Ok(ObjectOutcome::Skipped);
        };
        self.remediator.handle(task, &session).await
    }

    /// Re-enqueue a failed object. The replacement is counted before the
    /// original is finished.
    fn retry(self: &Arc<Self>, task: ObjectTask, requeue: &Sender<ObjectTask>) {
        let max = self.deps.config.pipeline.max_object_retries;
        if task.attempt >= max || self.cancel.is_cancelled() {
            tracing::warn!(bucket = %task.bucket, key = %task.key, attempts = task.attempt + 1, "Giving up on object");
            self.deps.metrics.remediation(self.remediator.action(), outcome::GAVE_UP);
            task.page.done();
            self.tracker.finish();
            return;
        }

        self.deps.metrics.object_retry();
        let next = task.retried();
        tracing::debug!(bucket = %next.bucket, key = %next.key, attempt = next.attempt, "Re-enqueueing object");
        self.tracker.begin();
        match requeue.try_send(next) {
            Ok(()) => {}
            Err(TrySendError::Full(next)) => {
                // Every object worker may be blocked here; hand the send off.
                let shared = self.clone();
                let requeue = requeue.clone();
                tokio::spawn(async move {
                    let page = next.page.clone();
                    let sent = tokio::select! {
                        biased;
                        _ = shared.cancel.cancelled() => false,
                        sent = requeue.send_async(next) => sent.is_ok(),
                    };
                    if !sent {
                        if !shared.cancel.is_cancelled() {
                            shared.lost(stage::OBJECT);
                        }
                        page.done();
                        shared.tracker.finish();
                    }
                });
            }
            Err(TrySendError::Disconnected(next)) => {
                self.lost(stage::OBJECT);
                next.page.done();
                self.tracker.finish();
            }
        }
        self.tracker.finish();
    }
}
