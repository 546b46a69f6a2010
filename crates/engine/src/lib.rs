//! Sweeper engine: the worker pipeline and per-object remediation.
//!
//! The engine wires the cloud APIs, caches and ledger into three worker
//! pools. Everything is injected through [`PipelineDeps`]; nothing is global.

pub mod broker;
pub mod caches;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod remediate;
pub mod retry;
pub mod task;
pub mod tracker;

pub use broker::CredentialBroker;
pub use caches::{BucketMetadataCache, CanonicalIdentityCache};
pub use error::{EngineError, EngineResult};
pub use metrics::{EngineMetrics, RunSummary};
pub use pipeline::{Pipeline, PipelineDeps, discover_accounts};
pub use remediate::{ObjectOutcome, ObjectRemediator, acl_ok, encryption_ok, fixed_acl};
pub use task::ObjectTask;
pub use tracker::{CompletionTracker, PageCounter};
