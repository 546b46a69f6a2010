//! Object ACL check and repair.

use super::{ObjectOutcome, ObjectRemediator};
use crate::error::EngineResult;
use crate::metrics::{action, finding, outcome};
use crate::task::ObjectTask;
use sweeper_cloud::types::FULL_CONTROL;
use sweeper_cloud::{AclGrant, ErrorClass, Grantee, ObjectAcl, Session, op};
use sweeper_core::{AccountId, RunMode};

/// Whether `desired` can reach the object, either as its owner or through a
/// grant.
///
/// An unresolved identity is treated as compliant.
pub fn acl_ok(acl: &ObjectAcl, desired: Option<&str>) -> bool {
    let Some(desired) = desired else {
        return true;
    };
    acl.owner_id.as_deref() == Some(desired) || acl.grants_to(desired)
}

/// `acl` with a full-control grant for `desired` appended.
pub fn fixed_acl(acl: &ObjectAcl, desired: &str) -> ObjectAcl {
    let mut fixed = acl.clone();
    fixed.grants.push(AclGrant {
        grantee: Grantee::CanonicalUser {
            id: desired.to_string(),
            display_name: None,
        },
        permission: FULL_CONTROL.to_string(),
    });
    fixed
}

impl ObjectRemediator {
    /// Accounts whose canonical identity must be granted on this object.
    fn desired_accounts(&self, task: &ObjectTask) -> Vec<AccountId> {
        match self.mode {
            RunMode::AclMultiCheck => self.readers.clone(),
            _ => vec![task.account.clone()],
        }
    }

    /// Fetch the ACL, falling back to the owner-account session and then
    /// the key owner's session on 403. Returns the ACL and the session that
    /// could read it.
    async fn fetch_acl(
        &self,
        task: &ObjectTask,
        session: &Session,
    ) -> EngineResult<Option<(ObjectAcl, Session)>> {
        let tag = task.tag();
        let mut rung = 0;
        let mut current = Some(session.clone());
        loop {
            if let Some(session) = current.take() {
                let result = self
                    .retrier
                    .run(op::GET_OBJECT_ACL, &tag, self.retrier.standard(), || {
                        session.get_object_acl(&task.bucket, &task.key)
                    })
                    .await?;
                match result {
                    Ok(acl) => return Ok(Some((acl, session))),
                    Err(failure) if failure.class == ErrorClass::Forbidden => {
                        tracing::debug!(bucket = %task.bucket, key = %task.key, rung, "ACL read forbidden");
                    }
                    Err(_) => return Ok(None),
                }
            }
            rung += 1;
            current = match rung {
                1 => self.broker.owner_account_session().await?,
                2 => self.broker.session_for_key_owner(&task.key).await?,
                _ => {
                    self.metrics.finding(finding::FORBIDDEN_SKIP);
                    tracing::warn!(bucket = %task.bucket, key = %task.key, "Can't read ACL with any credentials");
                    return Ok(None);
                }
            };
        }
    }

    /// Check the object's grants and repair missing ones when allowed.
    pub async fn handle_acl(&self, task: &ObjectTask, session: &Session) -> EngineResult<ObjectOutcome> {
        let Some((mut acl, acl_session)) = self.fetch_acl(task, session).await? else {
            return Ok(ObjectOutcome::Skipped);
        };

        for account in self.desired_accounts(task) {
            let desired = self.identities.get(&account);
            if acl_ok(&acl, desired.as_deref()) {
                continue;
            }
            let Some(desired) = desired else { continue };

            self.metrics.finding(finding::WRONG_ACL);
            tracing::warn!(
                bucket = %task.bucket,
                key = %task.key,
                account = %account,
                owner = acl.owner_id.as_deref().unwrap_or(""),
                desired = %desired,
                "Object ACL missing grant"
            );

            if !self.danger.force_acl_allowed() {
                self.metrics.remediation(action::FIX_ACL, outcome::DRY_RUN);
                continue;
            }

            if !acl.is_complete() {
                tracing::warn!(
                    bucket = %task.bucket,
                    key = %task.key,
                    unparsed = acl.unparsed_grants,
                    "ACL has grants that cannot be preserved, not rewriting"
                );
                self.metrics.remediation(action::FIX_ACL, outcome::SKIPPED);
                continue;
            }

            let fixed = fixed_acl(&acl, &desired);
            let result = self
                .retrier
                .run(op::PUT_OBJECT_ACL, &task.tag(), self.retrier.standard(), || {
                    acl_session.put_object_acl(&task.bucket, &task.key, &fixed)
                })
                .await?;
            match result {
                Ok(()) => {
                    tracing::info!(bucket = %task.bucket, key = %task.key, desired = %desired, "Fixed object ACL");
                    self.metrics.remediation(action::FIX_ACL, outcome::OK);
                    acl = fixed;
                }
                Err(failure) => {
                    tracing::warn!(bucket = %task.bucket, key = %task.key, class = %failure.class, "ACL repair failed");
                    self.metrics.remediation(action::FIX_ACL, outcome::FAILED);
                }
            }
        }
        Ok(ObjectOutcome::Done)
    }
}
