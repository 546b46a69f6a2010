//! Error classification and retry timing.

use crate::error::CloudError;
use std::fmt;
use std::time::Duration;
use sweeper_core::config::RetryConfig;

const EXPIRED_MARKERS: &[&str] = &[
    "security token included in the request is expired",
    "ExpiredToken",
];

const THROTTLE_MARKERS: &[&str] = &[
    "SlowDown",
    "Throttling",
    "TooManyRequests",
    "RequestLimitExceeded",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NotFound"];

/// What a caller should do with a failed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Resource is absent. Terminal, not an error.
    NotFound,
    /// Retry with alternate credentials.
    Forbidden,
    /// Pause for a cooldown before retrying.
    Throttled,
    /// Nothing further can succeed. The run must stop.
    ExpiredCredentials,
    /// Retry a bounded number of times with linear backoff.
    Transient,
    /// Log and give up.
    Other,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Throttled => "throttled",
            Self::ExpiredCredentials => "expired_credentials",
            Self::Transient => "transient",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a cloud API error.
///
/// Expired tokens are checked first because the provider reports them with
/// a 403 status.
pub fn classify(err: &CloudError) -> ErrorClass {
    let code = err.code().unwrap_or_default();
    let message = err.message();
    let status = err.status();

    if code == "ExpiredToken" || contains_any(message, EXPIRED_MARKERS) {
        return ErrorClass::ExpiredCredentials;
    }

    if status == Some(404) || NOT_FOUND_CODES.contains(&code) {
        return ErrorClass::NotFound;
    }

    if contains_any(code, THROTTLE_MARKERS)
        || contains_any(message, THROTTLE_MARKERS)
        || matches!(status, Some(429) | Some(503))
    {
        return ErrorClass::Throttled;
    }

    if status == Some(403) || code == "AccessDenied" {
        return ErrorClass::Forbidden;
    }

    if matches!(err, CloudError::Network { .. }) || message.contains("send request failed") {
        return ErrorClass::Transient;
    }

    ErrorClass::Other
}

/// Cooldowns and bounds for retried calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub slow_down: Duration,
    pub delete_slow_down: Duration,
    pub send_slow_down: Duration,
    pub not_found_base: Duration,
    pub max_not_found_tries: u32,
    pub transient_base: Duration,
    pub max_transient_tries: u32,
    pub max_throttle_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            slow_down: Duration::from_millis(config.slow_down_ms),
            delete_slow_down: Duration::from_millis(config.delete_slow_down_ms),
            send_slow_down: Duration::from_millis(config.send_slow_down_ms),
            not_found_base: Duration::from_millis(config.not_found_base_ms),
            max_not_found_tries: config.max_not_found_tries,
            transient_base: Duration::from_millis(config.transient_base_ms),
            max_transient_tries: config.max_transient_tries,
            max_throttle_retries: config.max_throttle_retries,
        }
    }

    /// Linear backoff: `attempt` times `base`.
    pub fn backoff(base: Duration, attempt: u32) -> Duration {
        base.saturating_mul(attempt)
    }

    pub fn not_found_delay(&self, attempt: u32) -> Duration {
        Self::backoff(self.not_found_base, attempt)
    }

    pub fn transient_delay(&self, attempt: u32) -> Duration {
        Self::backoff(self.transient_base, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_token_wins_over_forbidden() {
        let err = CloudError::service("head_object", Some(403), Some("ExpiredToken"), "expired");
        assert_eq!(classify(&err), ErrorClass::ExpiredCredentials);

        let err = CloudError::Credentials {
            op: "assume_role",
            message: "The security token included in the request is expired".to_string(),
        };
        assert_eq!(classify(&err), ErrorClass::ExpiredCredentials);
    }

    #[test]
    fn test_not_found() {
        assert_eq!(
            classify(&CloudError::not_found("head_object", "k")),
            ErrorClass::NotFound
        );
        let err = CloudError::service("list_objects", Some(400), Some("NoSuchBucket"), "gone");
        assert_eq!(classify(&err), ErrorClass::NotFound);
    }

    #[test]
    fn test_throttled() {
        assert_eq!(
            classify(&CloudError::throttled("copy_object")),
            ErrorClass::Throttled
        );
        let err = CloudError::service("list_accounts", Some(400), Some("TooManyRequestsException"), "");
        assert_eq!(classify(&err), ErrorClass::Throttled);
        let err = CloudError::service("delete_object", Some(429), None, "");
        assert_eq!(classify(&err), ErrorClass::Throttled);
    }

    #[test]
    fn test_forbidden() {
        assert_eq!(
            classify(&CloudError::forbidden("get_object_acl")),
            ErrorClass::Forbidden
        );
        let err = CloudError::service("get_object_acl", None, Some("AccessDenied"), "");
        assert_eq!(classify(&err), ErrorClass::Forbidden);
    }

    #[test]
    fn test_transient_and_other() {
        assert_eq!(
            classify(&CloudError::network("head_object", "connection reset")),
            ErrorClass::Transient
        );
        let err = CloudError::Other {
            op: "head_object",
            message: "dispatch failure: send request failed".to_string(),
        };
        assert_eq!(classify(&err), ErrorClass::Transient);
        let err = CloudError::service("put_object_acl", Some(400), Some("MalformedACLError"), "bad");
        assert_eq!(classify(&err), ErrorClass::Other);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.not_found_delay(0), Duration::ZERO);
        assert_eq!(policy.not_found_delay(1), Duration::from_secs(5));
        assert_eq!(policy.not_found_delay(3), Duration::from_secs(15));
        assert_eq!(policy.slow_down, Duration::from_secs(120));
        assert_eq!(policy.delete_slow_down, Duration::from_secs(60));
    }
}
