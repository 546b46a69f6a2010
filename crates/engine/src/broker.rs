//! Per-account credentials and sessions.

use crate::error::{EngineError, EngineResult};
use crate::metrics::{EngineMetrics, record_error};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use sweeper_cloud::{Credential, ErrorClass, IdentityApi, Session, op};
use sweeper_core::AccountId;
use tokio::sync::OnceCell;

/// Hands out sessions for accounts, assuming roles on first use.
///
/// Credentials are cached per account for the life of the process. The
/// ambient session is built once.
pub struct CredentialBroker {
    identity: Arc<dyn IdentityApi>,
    credentials: RwLock<HashMap<AccountId, Credential>>,
    owner_account: Option<AccountId>,
    metrics: Arc<EngineMetrics>,
    ambient: OnceCell<Session>,
}

impl CredentialBroker {
    pub fn new(
        identity: Arc<dyn IdentityApi>,
        owner_account: Option<AccountId>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            identity,
            credentials: RwLock::new(HashMap::new()),
            owner_account,
            metrics,
            ambient: OnceCell::new(),
        }
    }

    fn cached(&self, account: &AccountId) -> Option<Credential> {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .cloned()
    }

    /// Session for `account`, or `None` if it cannot be obtained.
    ///
    /// Only expired ambient credentials are an error.
    pub async fn session_for(&self, account: &AccountId) -> EngineResult<Option<Session>> {
        if account.is_self() {
            return self.ambient_session().await;
        }

        let credential = match self.cached(account) {
            Some(credential) => credential,
            None => {
                self.metrics.api_call(op::ASSUME_ROLE);
                match self.identity.assume_role(account).await {
                    Ok(credential) => {
                        tracing::debug!(account = %account, role = %credential.role_arn, "Assumed role");
                        self.credentials
                            .write()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .entry(account.clone())
                            .or_insert(credential)
                            .clone()
                    }
                    Err(err) => {
                        let class = record_error(&self.metrics, &err, op::ASSUME_ROLE, account.as_str());
                        if class == ErrorClass::ExpiredCredentials {
                            return Err(EngineError::fatal(&err));
                        }
                        tracing::warn!(account = %account, "Can't log into account");
                        return Ok(None);
                    }
                }
            }
        };

        match self.identity.session(Some(&credential)).await {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                record_error(&self.metrics, &err, op::ASSUME_ROLE, account.as_str());
                Ok(None)
            }
        }
    }

    async fn ambient_session(&self) -> EngineResult<Option<Session>> {
        let session = self
            .ambient
            .get_or_try_init(|| self.identity.session(None))
            .await;
        match session {
            Ok(session) => Ok(Some(session.clone())),
            Err(err) => {
                let class = record_error(&self.metrics, &err, op::ASSUME_ROLE, "ambient");
                if class == ErrorClass::ExpiredCredentials {
                    return Err(EngineError::fatal(&err));
                }
                Ok(None)
            }
        }
    }

    /// Session for the configured ACL owner account.
    pub async fn owner_account_session(&self) -> EngineResult<Option<Session>> {
        match &self.owner_account {
            Some(account) => self.session_for(account).await,
            None => Ok(None),
        }
    }

    /// Session for the account named by the key's leading path segment.
    pub async fn session_for_key_owner(&self, key: &str) -> EngineResult<Option<Session>> {
        match AccountId::from_key_owner(key) {
            Some(account) => self.session_for(&account).await,
            None => Ok(None),
        }
    }

    pub fn cached_accounts(&self) -> usize {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweeper_cloud::{CloudError, MemoryCloud};
    use sweeper_core::AccountStatus;

    fn broker(cloud: &MemoryCloud, owner: Option<AccountId>) -> CredentialBroker {
        CredentialBroker::new(
            Arc::new(cloud.clone()),
            owner,
            Arc::new(EngineMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_assumes_role_once_per_account() {
        let cloud = MemoryCloud::new("111111111111", "canon-self").unwrap();
        let member = cloud
            .add_account("222222222222", "canon-member", AccountStatus::Active)
            .unwrap();
        let broker = broker(&cloud, None);

        assert!(broker.session_for(&member).await.unwrap().is_some());
        assert!(broker.session_for(&member).await.unwrap().is_some());
        assert_eq!(cloud.calls(op::ASSUME_ROLE), 1);
        assert_eq!(broker.cached_accounts(), 1);
    }

    #[tokio::test]
    async fn test_self_account_uses_ambient_session() {
        let cloud = MemoryCloud::new("111111111111", "canon-self").unwrap();
        let broker = broker(&cloud, None);
        assert!(broker.session_for(&AccountId::self_account()).await.unwrap().is_some());
        assert_eq!(cloud.calls(op::ASSUME_ROLE), 0);
    }

    #[tokio::test]
    async fn test_denied_assume_role_yields_none() {
        let cloud = MemoryCloud::new("111111111111", "canon-self").unwrap();
        let member = cloud
            .add_account("222222222222", "canon-member", AccountStatus::Active)
            .unwrap();
        cloud.deny_assume(&member);
        let broker = broker(&cloud, None);
        assert!(broker.session_for(&member).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_fatal() {
        let cloud = MemoryCloud::new("111111111111", "canon-self").unwrap();
        let member = cloud
            .add_account("222222222222", "canon-member", AccountStatus::Active)
            .unwrap();
        cloud.fail_next(op::ASSUME_ROLE, CloudError::expired_token(op::ASSUME_ROLE));
        let broker = broker(&cloud, None);
        let err = broker.session_for(&member).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_key_owner_and_owner_account_sessions() {
        let cloud = MemoryCloud::new("111111111111", "canon-self").unwrap();
        let owner = cloud
            .add_account("333333333333", "canon-owner", AccountStatus::Active)
            .unwrap();
        let broker = broker(&cloud, Some(owner));

        assert!(broker.owner_account_session().await.unwrap().is_some());
        assert!(
            broker
                .session_for_key_owner("333333333333/logs/x")
                .await
                .unwrap()
                .is_some()
        );
        assert!(broker.session_for_key_owner("logs/x").await.unwrap().is_none());
        assert!(broker.session_for_key_owner("/x").await.unwrap().is_none());
    }
}
