//! AWS backend: S3 sessions, STS role assumption and Organizations listing.

use crate::error::{CloudError, CloudResult};
use crate::traits::{IdentityApi, ObjectStoreApi, Session, op};
use crate::types::{
    AccountPage, AclGrant, BucketEncryption, BucketListing, Credential, DesiredEncryption,
    Grantee, HeadInfo, ObjectAcl, ObjectPage, ObjectSummary,
};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_config::sts::AssumeRoleProvider;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    AccessControlPolicy, Grant, Owner, Permission, ServerSideEncryption, Type,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::{Arc, OnceLock};
use sweeper_core::config::AwsConfig;
use sweeper_core::{AccountId, AccountRef, AccountStatus};
use tracing::{debug, instrument};

/// Session name recorded in CloudTrail for assumed roles.
const ROLE_SESSION_NAME: &str = "sweeper";

/// Service code returned when a bucket has no default encryption.
const NO_BUCKET_ENCRYPTION_CODE: &str = "ServerSideEncryptionConfigurationNotFoundError";

/// Convert an SDK error into a [`CloudError`], keeping status, code and message.
pub(crate) fn map_sdk_error<E>(op: &'static str, err: SdkError<E>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let inner = service_err.err();
            let message = inner
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
            CloudError::Service {
                op,
                status: Some(status),
                code: inner.code().map(str::to_string),
                message,
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => CloudError::Network {
            op,
            message: DisplayErrorContext(&err).to_string(),
        },
        _ => CloudError::Other {
            op,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

/// Identity API backed by Organizations and STS.
///
/// Every session shares the base SDK configuration; member-account sessions
/// swap in an assumed-role credentials provider.
pub struct AwsIdentity {
    base: SdkConfig,
    settings: AwsConfig,
    organizations: aws_sdk_organizations::Client,
    ambient: OnceLock<Session>,
}

impl std::fmt::Debug for AwsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsIdentity")
            .field("region", &self.settings.region)
            .field("role_name", &self.settings.role_name)
            .field("endpoint", &self.settings.endpoint)
            .finish_non_exhaustive()
    }
}

impl AwsIdentity {
    /// Load ambient AWS configuration and build the identity API.
    pub async fn new(settings: &AwsConfig) -> CloudResult<Self> {
        if settings.role_name.trim().is_empty() {
            return Err(CloudError::Config("aws.role_name must not be empty".to_string()));
        }
        let base = aws_config::from_env()
            .region(aws_config::Region::new(settings.region.clone()))
            .load()
            .await;
        Ok(Self::from_sdk_config(base, settings.clone()))
    }

    pub fn from_sdk_config(base: SdkConfig, settings: AwsConfig) -> Self {
        let organizations = aws_sdk_organizations::Client::new(&base);
        Self {
            base,
            settings,
            organizations,
            ambient: OnceLock::new(),
        }
    }

    fn build_s3_client(&self, provider: Option<SharedCredentialsProvider>) -> Client {
        let mut builder = aws_sdk_s3::config::Builder::from(&self.base);
        if let Some(provider) = provider {
            builder = builder.credentials_provider(provider);
        }
        if let Some(endpoint) = self.settings.endpoint.as_deref().filter(|e| !e.is_empty()) {
            // Bare host:port endpoints (e.g. "minio:9000") get an http:// scheme.
            let lower = endpoint.to_ascii_lowercase();
            let url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.to_string()
            } else {
                format!("http://{endpoint}")
            };
            builder = builder.endpoint_url(url);
        }
        if self.settings.force_path_style {
            builder = builder.force_path_style(true);
        }
        Client::from_conf(builder.build())
    }
}

#[async_trait]
impl IdentityApi for AwsIdentity {
    #[instrument(skip(self), fields(backend = "aws"))]
    async fn list_accounts(&self, next_token: Option<String>) -> CloudResult<AccountPage> {
        let output = self
            .organizations
            .list_accounts()
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::LIST_ACCOUNTS, e))?;

        let mut accounts = Vec::new();
        for account in output.accounts() {
            let Some(id) = account.id() else {
                continue;
            };
            let id = match AccountId::new(id) {
                Ok(id) => id,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable organization account");
                    continue;
                }
            };
            #[allow(deprecated)]
            let status = match account.status() {
                Some(aws_sdk_organizations::types::AccountStatus::Active) => AccountStatus::Active,
                _ => AccountStatus::Inactive,
            };
            accounts.push(AccountRef { id, status });
        }

        Ok(AccountPage {
            accounts,
            next_token: output.next_token().map(str::to_string),
        })
    }

    #[instrument(skip(self), fields(backend = "aws"))]
    async fn assume_role(&self, account: &AccountId) -> CloudResult<Credential> {
        let role_arn = self.settings.role_arn(account.as_str());
        let provider = AssumeRoleProvider::builder(role_arn.clone())
            .session_name(ROLE_SESSION_NAME)
            .region(aws_config::Region::new(self.settings.region.clone()))
            .configure(&self.base)
            .build()
            .await;

        // Fetch once so a role that cannot be assumed fails here rather than
        // on the first S3 call.
        provider
            .provide_credentials()
            .await
            .map_err(|e| CloudError::Credentials {
                op: op::ASSUME_ROLE,
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(Credential {
            account_id: account.clone(),
            role_arn,
            provider: Some(SharedCredentialsProvider::new(provider)),
        })
    }

    async fn session(&self, credential: Option<&Credential>) -> CloudResult<Session> {
        match credential {
            None => Ok(self
                .ambient
                .get_or_init(|| self.s3_session(AccountId::self_account(), None))
                .clone()),
            Some(credential) => Ok(self.s3_session(
                credential.account_id.clone(),
                credential.provider.clone(),
            )),
        }
    }

    fn backend_name(&self) -> &'static str {
        "aws"
    }
}

impl AwsIdentity {
    fn s3_session(
        &self,
        account: AccountId,
        provider: Option<SharedCredentialsProvider>,
    ) -> Session {
        Arc::new(S3Session {
            client: self.build_s3_client(provider),
            account,
        })
    }
}

/// S3 client bound to one account's credentials.
pub struct S3Session {
    client: Client,
    account: AccountId,
}

impl std::fmt::Debug for S3Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Session")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

fn parse_grant(grant: &Grant) -> Option<AclGrant> {
    let grantee = grant.grantee()?;
    let grantee = match grantee.r#type() {
        Type::CanonicalUser => Grantee::CanonicalUser {
            id: grantee.id()?.to_string(),
            display_name: grantee.display_name().map(str::to_string),
        },
        Type::Group => Grantee::Group {
            uri: grantee.uri()?.to_string(),
        },
        Type::AmazonCustomerByEmail => Grantee::Email {
            address: grantee.email_address()?.to_string(),
        },
        _ => return None,
    };
    Some(AclGrant {
        grantee,
        permission: grant
            .permission()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default(),
    })
}

fn build_grant(grant: &AclGrant) -> CloudResult<Grant> {
    let builder = aws_sdk_s3::types::Grantee::builder();
    let grantee = match &grant.grantee {
        Grantee::CanonicalUser { id, display_name } => builder
            .r#type(Type::CanonicalUser)
            .id(id)
            .set_display_name(display_name.clone()),
        Grantee::Group { uri } => builder.r#type(Type::Group).uri(uri),
        Grantee::Email { address } => builder
            .r#type(Type::AmazonCustomerByEmail)
            .email_address(address),
    }
    .build()
    .map_err(|e| CloudError::Other {
        op: op::PUT_OBJECT_ACL,
        message: format!("invalid grantee: {e}"),
    })?;

    Ok(Grant::builder()
        .grantee(grantee)
        .permission(Permission::from(grant.permission.as_str()))
        .build())
}

#[async_trait]
impl ObjectStoreApi for S3Session {
    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn list_buckets(&self) -> CloudResult<BucketListing> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| map_sdk_error(op::LIST_BUCKETS, e))?;

        Ok(BucketListing {
            owner_id: output.owner().and_then(|o| o.id()).map(str::to_string),
            buckets: output
                .buckets()
                .iter()
                .filter_map(|b| b.name())
                .map(str::to_string)
                .collect(),
        })
    }

    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> CloudResult<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::LIST_OBJECTS, e))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        let next_token = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { keys, next_token })
    }

    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<HeadInfo> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::HEAD_OBJECT, e))?;

        Ok(HeadInfo {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            sse_algorithm: output
                .server_side_encryption()
                .map(|s| s.as_str().to_string()),
            kms_key_id: output.ssekms_key_id().map(str::to_string),
            replication_status: output
                .replication_status()
                .map(|s| s.as_str().to_string()),
            etag: output.e_tag().map(str::to_string),
        })
    }

    #[instrument(skip(self, encryption), fields(backend = "s3", account = %self.account))]
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        encryption: &DesiredEncryption,
    ) -> CloudResult<()> {
        // CopySource is bucket/key with the key URL-encoded.
        let encoded_key = utf8_percent_encode(source_key, NON_ALPHANUMERIC).to_string();
        let copy_source = format!("{bucket}/{encoded_key}");

        let mut request = self
            .client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(copy_source);

        request = match encryption {
            DesiredEncryption::Kms { key_id } => request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id),
            DesiredEncryption::Aes256 => {
                request.server_side_encryption(ServerSideEncryption::Aes256)
            }
        };

        request
            .send()
            .await
            .map_err(|e| map_sdk_error(op::COPY_OBJECT, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::DELETE_OBJECT, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn get_object_acl(&self, bucket: &str, key: &str) -> CloudResult<ObjectAcl> {
        let output = self
            .client
            .get_object_acl()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::GET_OBJECT_ACL, e))?;

        let grants: Vec<AclGrant> = output.grants().iter().filter_map(parse_grant).collect();
        let unparsed_grants = output.grants().len() - grants.len();
        if unparsed_grants > 0 {
            debug!(bucket, key, unparsed_grants, "ACL has grants of unknown type");
        }
        Ok(ObjectAcl {
            owner_id: output.owner().and_then(|o| o.id()).map(str::to_string),
            owner_display_name: output
                .owner()
                .and_then(|o| o.display_name())
                .map(str::to_string),
            grants,
            unparsed_grants,
        })
    }

    #[instrument(skip(self, acl), fields(backend = "s3", account = %self.account))]
    async fn put_object_acl(&self, bucket: &str, key: &str, acl: &ObjectAcl) -> CloudResult<()> {
        let grants = acl
            .grants
            .iter()
            .map(build_grant)
            .collect::<CloudResult<Vec<_>>>()?;

        let owner = Owner::builder()
            .set_id(acl.owner_id.clone())
            .set_display_name(acl.owner_display_name.clone())
            .build();

        let policy = AccessControlPolicy::builder()
            .owner(owner)
            .set_grants(Some(grants))
            .build();

        self.client
            .put_object_acl()
            .bucket(bucket)
            .key(key)
            .access_control_policy(policy)
            .send()
            .await
            .map_err(|e| map_sdk_error(op::PUT_OBJECT_ACL, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", account = %self.account))]
    async fn get_bucket_default_encryption(&self, bucket: &str) -> CloudResult<BucketEncryption> {
        let output = match self.client.get_bucket_encryption().bucket(bucket).send().await {
            Ok(output) => output,
            Err(err) => {
                if err.code() == Some(NO_BUCKET_ENCRYPTION_CODE) {
                    return Ok(BucketEncryption::Unset);
                }
                return Err(map_sdk_error(op::GET_BUCKET_ENCRYPTION, err));
            }
        };

        let default = output
            .server_side_encryption_configuration()
            .and_then(|c| c.rules().first())
            .and_then(|r| r.apply_server_side_encryption_by_default());

        Ok(match default {
            None => BucketEncryption::Unset,
            Some(default) => match default.sse_algorithm() {
                ServerSideEncryption::AwsKms | ServerSideEncryption::AwsKmsDsse => {
                    BucketEncryption::Kms {
                        key_id: default.kms_master_key_id().map(str::to_string),
                    }
                }
                ServerSideEncryption::Aes256 => BucketEncryption::Aes256,
                _ => BucketEncryption::Unset,
            },
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
