//! Prometheus metrics for a sweeper run.
//!
//! Every counter lives in a registry owned by [`EngineMetrics`], so tests and
//! concurrent runs in one process never share state. The diagnostics endpoint
//! serves the same registry, and [`EngineMetrics::summary`] folds it into the
//! end-of-run statistics.

use prometheus::proto::MetricType;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::BTreeMap;
use sweeper_cloud::{CloudError, ErrorClass, classify};

/// Values for the `kind` label of `sweeper_findings_total`.
pub mod finding {
    pub const UNENCRYPTED: &str = "unencrypted";
    pub const WRONG_ACL: &str = "wrong_acl";
    pub const TOO_BIG: &str = "too_big";
    pub const LIST_MATCH: &str = "list_match";
    pub const FORBIDDEN_SKIP: &str = "forbidden_skip";
}

/// Values for the `action` label of `sweeper_remediations_total`.
pub mod action {
    pub const REENCRYPT: &str = "reencrypt";
    pub const FIX_ACL: &str = "fix_acl";
    pub const DELETE: &str = "delete";
}

/// Values for the `result` label of `sweeper_remediations_total`.
pub mod outcome {
    pub const OK: &str = "ok";
    pub const FAILED: &str = "failed";
    pub const DRY_RUN: &str = "dry_run";
    pub const SKIPPED: &str = "skipped";
    pub const GAVE_UP: &str = "gave_up";
}

/// Values for the `stage` label of `sweeper_tasks_total`.
pub mod stage {
    pub const ACCOUNT: &str = "account";
    pub const BUCKET: &str = "bucket";
    pub const OBJECT: &str = "object";
}

pub struct EngineMetrics {
    registry: Registry,
    api_calls: IntCounterVec,
    api_errors: IntCounterVec,
    tasks: IntCounterVec,
    dropped: IntCounterVec,
    findings: IntCounterVec,
    remediations: IntCounterVec,
    object_retries: IntCounter,
    object_bytes: IntCounter,
    in_flight: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let api_calls = IntCounterVec::new(
            Opts::new("sweeper_api_calls_total", "Cloud API calls by operation"),
            &["op"],
        )?;
        let api_errors = IntCounterVec::new(
            Opts::new(
                "sweeper_api_errors_total",
                "Cloud API errors by classification and operation",
            ),
            &["class", "op"],
        )?;
        let tasks = IntCounterVec::new(
            Opts::new("sweeper_tasks_total", "Tasks processed by pipeline stage"),
            &["stage"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(
                "sweeper_dropped_tasks_total",
                "Tasks lost because their queue had no consumers",
            ),
            &["stage"],
        )?;
        let findings = IntCounterVec::new(
            Opts::new("sweeper_findings_total", "Audit findings by kind"),
            &["kind"],
        )?;
        let remediations = IntCounterVec::new(
            Opts::new(
                "sweeper_remediations_total",
                "Remediation attempts by action and result",
            ),
            &["action", "result"],
        )?;
        let object_retries = IntCounter::new(
            "sweeper_object_retries_total",
            "Object tasks re-enqueued after a failed remediation",
        )?;
        let object_bytes = IntCounter::new(
            "sweeper_object_bytes_total",
            "Bytes of object data inspected",
        )?;
        let in_flight = IntGauge::new("sweeper_in_flight", "Tasks not yet finished")?;

        registry.register(Box::new(api_calls.clone()))?;
        registry.register(Box::new(api_errors.clone()))?;
        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(findings.clone()))?;
        registry.register(Box::new(remediations.clone()))?;
        registry.register(Box::new(object_retries.clone()))?;
        registry.register(Box::new(object_bytes.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            api_calls,
            api_errors,
            tasks,
            dropped,
            findings,
            remediations,
            object_retries,
            object_bytes,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn api_call(&self, op: &str) {
        self.api_calls.with_label_values(&[op]).inc();
    }

    pub fn api_error(&self, class: ErrorClass, op: &str) {
        self.api_errors
            .with_label_values(&[class.as_str(), op])
            .inc();
    }

    pub fn task(&self, stage: &str) {
        self.tasks.with_label_values(&[stage]).inc();
    }

    pub fn dropped(&self, stage: &str) {
        self.dropped.with_label_values(&[stage]).inc();
    }

    pub fn finding(&self, kind: &str) {
        self.findings.with_label_values(&[kind]).inc();
    }

    pub fn remediation(&self, action: &str, result: &str) {
        self.remediations.with_label_values(&[action, result]).inc();
    }

    pub fn object_retry(&self) {
        self.object_retries.inc();
    }

    pub fn object_bytes(&self, bytes: u64) {
        self.object_bytes.inc_by(bytes);
    }

    pub fn in_flight_gauge(&self) -> IntGauge {
        self.in_flight.clone()
    }

    pub fn api_calls(&self, op: &str) -> u64 {
        self.api_calls.with_label_values(&[op]).get()
    }

    pub fn api_errors(&self, class: ErrorClass, op: &str) -> u64 {
        self.api_errors
            .with_label_values(&[class.as_str(), op])
            .get()
    }

    pub fn dropped_tasks(&self, stage: &str) -> u64 {
        self.dropped.with_label_values(&[stage]).get()
    }

    pub fn findings(&self, kind: &str) -> u64 {
        self.findings.with_label_values(&[kind]).get()
    }

    pub fn remediations(&self, action: &str, result: &str) -> u64 {
        self.remediations.with_label_values(&[action, result]).get()
    }

    pub fn object_retries(&self) -> u64 {
        self.object_retries.get()
    }

    pub fn bytes_inspected(&self) -> u64 {
        self.object_bytes.get()
    }

    /// Encode the registry in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Fold every counter and gauge into a sorted map.
    pub fn summary(&self) -> RunSummary {
        let mut values = BTreeMap::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let value = match family.get_field_type() {
                    MetricType::COUNTER => metric.get_counter().get_value(),
                    MetricType::GAUGE => metric.get_gauge().get_value(),
                    _ => continue,
                };
                let labels: Vec<String> = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}=\"{}\"", l.get_name(), l.get_value()))
                    .collect();
                let name = if labels.is_empty() {
                    family.get_name().to_string()
                } else {
                    format!("{}{{{}}}", family.get_name(), labels.join(","))
                };
                values.insert(name, value.max(0.0) as u64);
            }
        }
        RunSummary { values }
    }
}

/// End-of-run statistics keyed by series name with labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    values: BTreeMap<String, u64>,
}

impl RunSummary {
    /// Value of one series, e.g. `sweeper_findings_total{kind="unencrypted"}`.
    pub fn get(&self, series: &str) -> u64 {
        self.values.get(series).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|v| *v == 0)
    }

    /// Log every non-zero series.
    pub fn log(&self) {
        for (series, value) in self.iter().filter(|(_, v)| *v > 0) {
            tracing::info!(series, value, "Run statistic");
        }
    }
}

/// Classify, log and count a failed call.
pub fn record_error(metrics: &EngineMetrics, err: &CloudError, op: &str, tag: &str) -> ErrorClass {
    let class = classify(err);
    metrics.api_error(class, op);
    match class {
        ErrorClass::NotFound => {
            tracing::debug!(op, tag, class = %class, error = %err, "Not found");
        }
        ErrorClass::ExpiredCredentials => {
            tracing::error!(op, tag, class = %class, error = %err, "Credentials expired");
        }
        ErrorClass::Forbidden | ErrorClass::Throttled => {
            tracing::info!(op, tag, class = %class, error = %err, "API call refused");
        }
        ErrorClass::Transient | ErrorClass::Other => {
            tracing::warn!(op, tag, class = %class, error = %err, "API call failed");
        }
    }
    class
}
