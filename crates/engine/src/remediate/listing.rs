//! List-only mode: report filtered objects and optionally delete them.

use super::{ObjectOutcome, ObjectRemediator};
use crate::error::EngineResult;
use crate::metrics::{action, finding, outcome};
use crate::task::ObjectTask;
use sweeper_cloud::Session;

impl ObjectRemediator {
    /// Report objects in scope and delete them when deletion is allowed.
    pub async fn handle_listing(
        &self,
        task: &ObjectTask,
        session: &Session,
    ) -> EngineResult<ObjectOutcome> {
        if !self.filter.object_in_scope(&task.bucket, &task.key) {
            return Ok(ObjectOutcome::Skipped);
        }

        self.metrics.finding(finding::LIST_MATCH);
        tracing::info!(bucket = %task.bucket, key = %task.key, size = task.size, "Found match");

        if !self.danger.delete_allowed() {
            self.metrics.remediation(action::DELETE, outcome::DRY_RUN);
            return Ok(ObjectOutcome::Done);
        }

        if self.delete_object(session, &task.bucket, &task.key).await? {
            tracing::info!(bucket = %task.bucket, key = %task.key, "Deleted object");
            self.metrics.remediation(action::DELETE, outcome::OK);
        } else {
            self.metrics.remediation(action::DELETE, outcome::FAILED);
        }
        Ok(ObjectOutcome::Done)
    }
}
