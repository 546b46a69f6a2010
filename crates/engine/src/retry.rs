//! Retry loop shared by every remote call the workers make.

use crate::error::{EngineError, EngineResult};
use crate::metrics::{EngineMetrics, record_error};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use sweeper_cloud::{CloudError, ErrorClass, RetryPolicy};

/// A call that failed after retries ran out or were not applicable.
#[derive(Debug)]
pub struct CallFailure {
    pub class: ErrorClass,
    pub error: CloudError,
}

/// Attempts spent per error class on one call.
#[derive(Debug, Default)]
pub struct RetryBudget {
    throttled: u32,
    transient: u32,
    not_found: u32,
}

/// How to treat a failed call.
#[derive(Clone, Copy, Debug)]
pub struct CallOptions {
    /// Pause after a throttling response.
    pub cooldown: Duration,
    /// Retry not-found with linear backoff (read-after-write lag).
    pub retry_not_found: bool,
}

#[derive(Debug)]
pub enum Next {
    RetryAfter(Duration),
    GiveUp(ErrorClass),
}

#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, metrics: Arc<EngineMetrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Generic throttling cooldown.
    pub fn standard(&self) -> CallOptions {
        CallOptions {
            cooldown: self.policy.slow_down,
            retry_not_found: false,
        }
    }

    /// Options for copy and delete calls.
    pub fn mutating(&self, retry_not_found: bool) -> CallOptions {
        CallOptions {
            cooldown: self.policy.delete_slow_down,
            retry_not_found,
        }
    }

    /// Decide what to do about one failure. Expired credentials are fatal.
    pub fn decide(
        &self,
        err: &CloudError,
        op: &str,
        tag: &str,
        options: CallOptions,
        budget: &mut RetryBudget,
    ) -> EngineResult<Next> {
        let class = record_error(&self.metrics, err, op, tag);
        let next = match class {
            ErrorClass::ExpiredCredentials => return Err(EngineError::fatal(err)),
            ErrorClass::Throttled if budget.throttled < self.policy.max_throttle_retries => {
                budget.throttled += 1;
                Next::RetryAfter(options.cooldown)
            }
            ErrorClass::NotFound
                if options.retry_not_found && budget.not_found < self.policy.max_not_found_tries =>
            {
                budget.not_found += 1;
                Next::RetryAfter(self.policy.not_found_delay(budget.not_found))
            }
            ErrorClass::Transient if budget.transient < self.policy.max_transient_tries => {
                budget.transient += 1;
                if err.message().contains("send request failed") {
                    Next::RetryAfter(self.policy.send_slow_down)
                } else {
                    Next::RetryAfter(self.policy.transient_delay(budget.transient))
                }
            }
            class => Next::GiveUp(class),
        };
        if let Next::RetryAfter(pause) = next {
            tracing::debug!(op, tag, class = %class, pause_ms = pause.as_millis() as u64, "Retrying");
        }
        Ok(next)
    }

    /// Run `call` until it succeeds, becomes fatal, or retries run out.
    pub async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        tag: &str,
        options: CallOptions,
        mut call: F,
    ) -> EngineResult<Result<T, CallFailure>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut budget = RetryBudget::default();
        loop {
            self.metrics.api_call(op);
            let error = match call().await {
                Ok(value) => return Ok(Ok(value)),
                Err(error) => error,
            };
            match self.decide(&error, op, tag, options, &mut budget)? {
                Next::RetryAfter(pause) => tokio::time::sleep(pause).await,
                Next::GiveUp(class) => return Ok(Err(CallFailure { class, error })),
            }
        }
    }
}
