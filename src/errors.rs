// src/errors.rs
// Error taxonomy shared by every component, plus the one retry operator
// applied at component boundaries.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DomeError {
    /// Malformed spec or config. Never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A request failed a gating rule.
    #[error("denied by rule '{rule}': {message}")]
    Authorization {
        rule: String,
        message: String,
        remediation: Option<String>,
    },

    /// Timeouts, connection resets, platform 5xx, rate limits. Retriable.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
        platform_code: Option<String>,
    },

    /// Platform 4xx (other than rate limit), auth failures, schema mismatch.
    #[error("permanent failure: {message}")]
    Permanent {
        message: String,
        platform_code: Option<String>,
    },

    /// A referenced VM/template/network does not exist where it should.
    #[error("resource missing: {message}")]
    ResourceMissing { message: String },
}

pub type DomeResult<T> = Result<T, DomeError>;

impl DomeError {
    pub fn validation(message: impl Into<String>) -> Self {
        DomeError::Validation { message: message.into() }
    }

    pub fn denied(rule: impl Into<String>, message: impl Into<String>, remediation: Option<String>) -> Self {
        DomeError::Authorization {
            rule: rule.into(),
            message: message.into(),
            remediation,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        DomeError::Transient {
            message: message.into(),
            retry_after: None,
            platform_code: None,
        }
    }

    pub fn transient_coded(message: impl Into<String>, code: impl Into<String>) -> Self {
        DomeError::Transient {
            message: message.into(),
            retry_after: None,
            platform_code: Some(code.into()),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DomeError::Permanent { message: message.into(), platform_code: None }
    }

    pub fn permanent_coded(message: impl Into<String>, code: impl Into<String>) -> Self {
        DomeError::Permanent {
            message: message.into(),
            platform_code: Some(code.into()),
        }
    }

    pub fn missing(message: impl Into<String>) -> Self {
        DomeError::ResourceMissing { message: message.into() }
    }

    /// Timeout of an externally observable operation.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        DomeError::Transient {
            message: format!("{} timed out after {:?}", what.into(), after),
            retry_after: Some(after),
            platform_code: Some("timeout".to_string()),
        }
    }

    /// Stable error kind string carried on every external failure reply.
    pub fn kind(&self) -> &'static str {
        match self {
            DomeError::Validation { .. } => "validation",
            DomeError::Authorization { .. } => "authorization",
            DomeError::Transient { .. } => "transient",
            DomeError::Permanent { .. } => "permanent",
            DomeError::ResourceMissing { .. } => "resource_missing",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DomeError::Transient { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DomeError::Transient { platform_code: Some(code), .. } if code == "timeout"
        )
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            DomeError::Validation { .. } => 2,
            DomeError::Authorization { .. } => 3,
            DomeError::Transient { platform_code: Some(code), .. } if code == "timeout" => 5,
            DomeError::Transient { .. } => 4,
            DomeError::Permanent { .. } | DomeError::ResourceMissing { .. } => 1,
        }
    }
}

// Boundary conversions. Classification happens here so `?` stays usable in
// adapter and registry code without sprinkling match arms everywhere.

impl From<std::io::Error> for DomeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DomeError::missing(err.to_string()),
            std::io::ErrorKind::PermissionDenied => DomeError::permanent(err.to_string()),
            _ => DomeError::transient(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DomeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return DomeError::transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 => DomeError::Transient {
                message: err.to_string(),
                retry_after: Some(Duration::from_secs(2)),
                platform_code: Some("429".to_string()),
            },
            Some(status) if status.is_server_error() => {
                DomeError::transient_coded(err.to_string(), status.as_str().to_string())
            }
            Some(status) => DomeError::permanent_coded(err.to_string(), status.as_str().to_string()),
            None => DomeError::transient(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for DomeError {
    fn from(err: toml::de::Error) -> Self {
        DomeError::validation(err.to_string())
    }
}

impl From<serde_json::Error> for DomeError {
    fn from(err: serde_json::Error) -> Self {
        DomeError::validation(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomeError {
    fn from(err: serde_yaml::Error) -> Self {
        DomeError::validation(err.to_string())
    }
}

impl From<russh::Error> for DomeError {
    fn from(err: russh::Error) -> Self {
        DomeError::transient_coded(err.to_string(), "ssh")
    }
}

impl From<tokio::time::error::Elapsed> for DomeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DomeError::Transient {
            message: "operation deadline elapsed".to_string(),
            retry_after: None,
            platform_code: Some("timeout".to_string()),
        }
    }
}

/// Bounded exponential backoff with full jitter (base 2s, cap 60s by default).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            cap_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Full-jitter delay before attempt `attempt` (1-based, so the delay
    /// before the second try uses `attempt = 1`).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(20));
        let ceiling = exp.min(self.cap_delay.as_millis()).max(1);
        let jittered = rand::thread_rng().gen_range(0..ceiling) as u64;
        Duration::from_millis(jittered)
    }
}

/// The single retry operator applied at boundaries. Retries only Transient
/// failures, up to `policy.max_attempts` total attempts.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> DomeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DomeResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.delay_before(attempt);
            warn!(op = op_name, attempt, ?delay, "retrying after transient failure");
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| DomeError::transient(format!("{op_name} exhausted retries"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn kinds_and_exit_codes() {
        assert_eq!(DomeError::validation("x").exit_code(), 2);
        assert_eq!(DomeError::denied("authorization", "no", None).exit_code(), 3);
        assert_eq!(DomeError::transient("net down").exit_code(), 4);
        assert_eq!(DomeError::timeout("poll", Duration::from_secs(1)).exit_code(), 5);
        assert_eq!(DomeError::permanent("bad schema").exit_code(), 1);
        assert_eq!(DomeError::missing("no vm").kind(), "resource_missing");
    }

    #[test]
    fn io_not_found_maps_to_missing() {
        let err: DomeError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), "resource_missing");
    }

    #[test]
    fn jitter_stays_under_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            cap_delay: Duration::from_secs(60),
        };
        for attempt in 1..10 {
            assert!(policy.delay_before(attempt) <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: DomeResult<()> = retry(RetryPolicy::default(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DomeError::permanent("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            cap_delay: Duration::from_millis(2),
        };
        let result = retry(policy, "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DomeError::transient("blip"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
