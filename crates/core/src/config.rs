//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Literal value a `danger.*` option must hold to allow a destructive action.
pub const DANGER_SENTINEL: &str = "danger";

/// Objects above this size cannot be copied in a single call (5 GiB minus slack).
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 5_368_709_000;

/// Which accounts and buckets a run covers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Crawl every active account in the organization instead of only the
    /// account the ambient credentials belong to.
    #[serde(default = "default_true")]
    pub check_org_accounts: bool,
    /// Restrict the run to a single bucket. Required for every destructive mode.
    #[serde(default)]
    pub one_bucket: bool,
    /// Name of the bucket when `one_bucket` is set.
    #[serde(default)]
    pub one_bucket_name: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            check_org_accounts: true,
            one_bucket: false,
            one_bucket_name: String::new(),
        }
    }
}

impl ScopeConfig {
    /// Whether a listed bucket belongs to this run.
    pub fn includes_bucket(&self, bucket: &str) -> bool {
        !self.one_bucket || self.one_bucket_name == bucket
    }
}

/// What the object workers check and repair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit object ACLs against the account's canonical identity.
    #[serde(default = "default_true")]
    pub check_acl: bool,
    /// Audit object ACLs against every reader account in `acl_reader_accounts`.
    #[serde(default)]
    pub three_acl: bool,
    /// Account whose credentials are tried when reading an ACL is forbidden.
    #[serde(default)]
    pub acl_owner_account: String,
    /// Reader accounts that must each hold a grant in multi-reader mode.
    #[serde(default)]
    pub acl_reader_accounts: Vec<String>,
    /// Re-encrypt objects that fail the encryption check.
    #[serde(default)]
    pub one_bucket_reencrypt: bool,
    /// Re-encrypt every object, tracking progress in the ledger.
    #[serde(default)]
    pub re_copy_files: bool,
    /// List (and optionally delete) objects passing the filter.
    #[serde(default)]
    pub just_list_files: bool,
    /// Key prefix admitted by the filter; `*` matches every key.
    #[serde(default = "default_match_prefix")]
    pub list_files_matching_prefix: String,
    /// Substring that keeps a key out of the prefix filter.
    #[serde(default = "default_match_exclude")]
    pub list_files_matching_exclude: String,
    /// Allow-list file with one key prefix per line.
    #[serde(default = "default_filter_file")]
    pub filter_file: Option<PathBuf>,
    /// Objects larger than this are reported but never copied.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

fn default_true() -> bool {
    true
}

fn default_match_prefix() -> String {
    "dlv".to_string()
}

fn default_match_exclude() -> String {
    "%%%".to_string()
}

fn default_filter_file() -> Option<PathBuf> {
    Some(PathBuf::from("filter.txt"))
}

fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            check_acl: true,
            three_acl: false,
            acl_owner_account: String::new(),
            acl_reader_accounts: Vec::new(),
            one_bucket_reencrypt: false,
            re_copy_files: false,
            just_list_files: false,
            list_files_matching_prefix: default_match_prefix(),
            list_files_matching_exclude: default_match_exclude(),
            filter_file: default_filter_file(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

/// Explicit opt-ins for destructive actions.
///
/// Each field must be exactly [`DANGER_SENTINEL`] for the matching action to
/// run. Any other value, including the default, makes that action a dry run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DangerConfig {
    #[serde(default = "default_no", alias = "set_to_danger_to_delete_matching")]
    pub delete_matching: String,
    #[serde(default = "default_no", alias = "set_to_danger_to_force_acl")]
    pub force_acl: String,
    #[serde(default = "default_no", alias = "set_to_danger_to_reencrypt")]
    pub reencrypt: String,
}

fn default_no() -> String {
    "no".to_string()
}

impl Default for DangerConfig {
    fn default() -> Self {
        Self {
            delete_matching: default_no(),
            force_acl: default_no(),
            reencrypt: default_no(),
        }
    }
}

impl DangerConfig {
    pub fn delete_allowed(&self) -> bool {
        self.delete_matching == DANGER_SENTINEL
    }

    pub fn force_acl_allowed(&self) -> bool {
        self.force_acl == DANGER_SENTINEL
    }

    pub fn reencrypt_allowed(&self) -> bool {
        self.reencrypt == DANGER_SENTINEL
    }
}

/// Worker pool sizes, queue capacities and shutdown timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_account_workers")]
    pub account_workers: usize,
    #[serde(default = "default_bucket_workers")]
    pub bucket_workers: usize,
    #[serde(default = "default_object_workers")]
    pub object_workers: usize,
    #[serde(default = "default_account_queue")]
    pub account_queue: usize,
    #[serde(default = "default_bucket_queue")]
    pub bucket_queue: usize,
    #[serde(default = "default_object_queue")]
    pub object_queue: usize,
    /// A worker that receives nothing for this long exits.
    #[serde(default = "default_idle_secs")]
    pub account_idle_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub bucket_idle_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub object_idle_secs: u64,
    /// Time without any activity required, after the in-flight count
    /// reaches zero, before the run is considered complete.
    #[serde(default = "default_quiet_period_secs")]
    pub quiet_period_secs: u64,
    /// Interval between in-flight counter polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Re-enqueues allowed per object before it is skipped.
    #[serde(default = "default_max_object_retries")]
    pub max_object_retries: u32,
}

fn default_account_workers() -> usize {
    1
}

fn default_bucket_workers() -> usize {
    10
}

fn default_object_workers() -> usize {
    1000
}

fn default_account_queue() -> usize {
    100
}

fn default_bucket_queue() -> usize {
    100
}

fn default_object_queue() -> usize {
    100_000
}

fn default_idle_secs() -> u64 {
    60
}

fn default_quiet_period_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_max_object_retries() -> u32 {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            account_workers: default_account_workers(),
            bucket_workers: default_bucket_workers(),
            object_workers: default_object_workers(),
            account_queue: default_account_queue(),
            bucket_queue: default_bucket_queue(),
            object_queue: default_object_queue(),
            account_idle_secs: default_idle_secs(),
            bucket_idle_secs: default_idle_secs(),
            object_idle_secs: default_idle_secs(),
            quiet_period_secs: default_quiet_period_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_object_retries: default_max_object_retries(),
        }
    }
}

impl PipelineConfig {
    pub fn account_idle(&self) -> Duration {
        Duration::from_secs(self.account_idle_secs)
    }

    pub fn bucket_idle(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_secs)
    }

    pub fn object_idle(&self) -> Duration {
        Duration::from_secs(self.object_idle_secs)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Cooldowns and retry bounds applied to cloud API errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Pause after a generic throttling response.
    #[serde(default = "default_slow_down_ms")]
    pub slow_down_ms: u64,
    /// Pause after throttling on a copy or delete.
    #[serde(default = "default_delete_slow_down_ms")]
    pub delete_slow_down_ms: u64,
    /// Pause after a request could not be sent.
    #[serde(default = "default_send_slow_down_ms")]
    pub send_slow_down_ms: u64,
    /// Backoff step while a freshly written key is not yet visible.
    #[serde(default = "default_not_found_base_ms")]
    pub not_found_base_ms: u64,
    #[serde(default = "default_max_not_found_tries")]
    pub max_not_found_tries: u32,
    #[serde(default = "default_transient_base_ms")]
    pub transient_base_ms: u64,
    #[serde(default = "default_max_transient_tries")]
    pub max_transient_tries: u32,
    #[serde(default = "default_max_throttle_retries")]
    pub max_throttle_retries: u32,
}

fn default_slow_down_ms() -> u64 {
    120_000
}

fn default_delete_slow_down_ms() -> u64 {
    60_000
}

fn default_send_slow_down_ms() -> u64 {
    10_000
}

fn default_not_found_base_ms() -> u64 {
    5_000
}

fn default_max_not_found_tries() -> u32 {
    5
}

fn default_transient_base_ms() -> u64 {
    1_000
}

fn default_max_transient_tries() -> u32 {
    3
}

fn default_max_throttle_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            slow_down_ms: default_slow_down_ms(),
            delete_slow_down_ms: default_delete_slow_down_ms(),
            send_slow_down_ms: default_send_slow_down_ms(),
            not_found_base_ms: default_not_found_base_ms(),
            max_not_found_tries: default_max_not_found_tries(),
            transient_base_ms: default_transient_base_ms(),
            max_transient_tries: default_max_transient_tries(),
            max_throttle_retries: default_max_throttle_retries(),
        }
    }
}

impl RetryConfig {
    /// Retry settings with every pause shortened to a millisecond.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            slow_down_ms: 1,
            delete_slow_down_ms: 1,
            send_slow_down_ms: 1,
            not_found_base_ms: 1,
            transient_base_ms: 1,
            ..Self::default()
        }
    }
}

/// AWS connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Role assumed in every member account.
    #[serde(default = "default_role_name")]
    pub role_name: String,
    /// Optional S3 endpoint override (for S3-compatible services).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_role_name() -> String {
    "OrganizationAccountAccessRole".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            role_name: default_role_name(),
            endpoint: None,
            force_path_style: false,
        }
    }
}

impl AwsConfig {
    /// Role ARN assumed in the given account.
    pub fn role_arn(&self, account_id: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, self.role_name)
    }
}

/// Idempotency ledger backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LedgerConfig {
    /// SQLite file that survives restarts.
    Sqlite {
        #[serde(default = "default_ledger_path")]
        path: PathBuf,
    },
    /// Process-lifetime set; nothing survives a restart.
    Memory,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./data/done-objects.db")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: default_ledger_path(),
        }
    }
}

/// Diagnostic HTTP endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Listen address for `/metrics` and `/health`. Empty disables it.
    #[serde(default = "default_listen")]
    pub listen: Option<String>,
}

fn default_listen() -> Option<String> {
    Some("localhost:6060".to_string())
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// What object workers do with each object. Exactly one mode is active per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// List objects passing the filter, deleting them when allowed.
    ListOnly,
    /// Check (and optionally fix) the ACL grant for the account's identity.
    AclCheck,
    /// Check (and optionally fix) ACL grants for every reader account.
    AclMultiCheck,
    /// Re-encrypt every object once, tracked in the ledger.
    Recopy,
    /// Re-encrypt objects failing the encryption check.
    EncryptionRepair,
    /// Report objects failing the encryption check.
    EncryptionCheck,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListOnly => "list_only",
            Self::AclCheck => "acl_check",
            Self::AclMultiCheck => "acl_multi_check",
            Self::Recopy => "recopy",
            Self::EncryptionRepair => "encryption_repair",
            Self::EncryptionCheck => "encryption_check",
        }
    }

    /// Modes that may copy objects.
    pub fn rewrites_objects(self) -> bool {
        matches!(self, Self::Recopy | Self::EncryptionRepair)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub danger: DangerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl AppConfig {
    /// Create a configuration suited to in-process tests.
    ///
    /// **For testing only.** Uses an in-memory ledger, no diagnostics
    /// listener, small pools and millisecond timings.
    pub fn for_testing() -> Self {
        Self {
            scope: ScopeConfig {
                check_org_accounts: false,
                ..ScopeConfig::default()
            },
            audit: AuditConfig {
                check_acl: false,
                filter_file: None,
                ..AuditConfig::default()
            },
            danger: DangerConfig::default(),
            pipeline: PipelineConfig {
                account_workers: 1,
                bucket_workers: 2,
                object_workers: 4,
                account_queue: 16,
                bucket_queue: 16,
                object_queue: 256,
                account_idle_secs: 5,
                bucket_idle_secs: 5,
                object_idle_secs: 5,
                quiet_period_secs: 0,
                poll_interval_ms: 10,
                max_object_retries: 3,
            },
            retry: RetryConfig::for_testing(),
            aws: AwsConfig::default(),
            ledger: LedgerConfig::Memory,
            diagnostics: DiagnosticsConfig { listen: None },
        }
    }

    /// Derive the single active mode.
    ///
    /// Precedence: listing, then ACL audit, then full re-copy, then
    /// encryption repair, falling back to the encryption check.
    pub fn run_mode(&self) -> RunMode {
        if self.audit.just_list_files {
            RunMode::ListOnly
        } else if self.audit.three_acl {
            RunMode::AclMultiCheck
        } else if self.audit.check_acl {
            RunMode::AclCheck
        } else if self.audit.re_copy_files {
            RunMode::Recopy
        } else if self.audit.one_bucket_reencrypt {
            RunMode::EncryptionRepair
        } else {
            RunMode::EncryptionCheck
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        let p = &self.pipeline;
        for (name, value) in [
            ("pipeline.account_workers", p.account_workers),
            ("pipeline.bucket_workers", p.bucket_workers),
            ("pipeline.object_workers", p.object_workers),
            ("pipeline.account_queue", p.account_queue),
            ("pipeline.bucket_queue", p.bucket_queue),
            ("pipeline.object_queue", p.object_queue),
        ] {
            if value == 0 {
                return Err(crate::Error::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }

        if self.scope.one_bucket && self.scope.one_bucket_name.trim().is_empty() {
            return Err(crate::Error::InvalidConfig(
                "scope.one_bucket requires scope.one_bucket_name".to_string(),
            ));
        }

        let mode = self.run_mode();
        if mode.rewrites_objects() && !self.scope.one_bucket {
            return Err(crate::Error::InvalidConfig(format!(
                "{} mode rewrites objects and requires scope.one_bucket",
                mode.as_str()
            )));
        }

        if mode == RunMode::AclMultiCheck && self.audit.acl_reader_accounts.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "audit.three_acl requires at least one entry in audit.acl_reader_accounts"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Owner account used for forbidden ACL retries, if configured.
    pub fn acl_owner_account(&self) -> Option<&str> {
        let owner = self.audit.acl_owner_account.trim();
        (!owner.is_empty()).then_some(owner)
    }
}
