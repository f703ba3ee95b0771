//! Admission decisions and the response metadata handed to the transport.

use serde::Serialize;

use super::bucket::Acquire;
use super::registry::Scope;

/// HTTP status for every rejection.
pub const TOO_MANY_REQUESTS: u16 = 429;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A token bucket in this scope was empty
    RateLimited(Scope),
    /// The client's pattern key is serving a burst block
    Blocked,
}

impl RejectReason {
    /// Machine-readable error code for the response body.
    pub fn error_code(&self) -> &'static str {
        match self {
            RejectReason::RateLimited(_) => "rate_limit_exceeded",
            RejectReason::Blocked => "too_many_requests",
        }
    }

    /// Human-readable message for the response body.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::RateLimited(_) => "too many requests",
            RejectReason::Blocked => "temporarily blocked due to suspicious activity",
        }
    }
}

/// Budget of the scope that decided the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub scope: Scope,
    /// Bucket capacity
    pub limit: u64,
    /// Whole tokens left
    pub remaining: u64,
    /// Seconds until the bucket is full again
    pub reset_after_secs: u64,
}

impl Quota {
    pub(crate) fn from_acquire(scope: Scope, acquire: &Acquire) -> Self {
        Self {
            scope,
            limit: acquire.limit(),
            remaining: acquire.remaining(),
            reset_after_secs: acquire.secs_until_full(),
        }
    }
}

/// Body sent with a 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectBody {
    pub error: &'static str,
    pub message: &'static str,
    pub retry_after: u64,
}

impl RejectBody {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The gate's verdict on one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Set only on rejection
    pub reason: Option<RejectReason>,
    /// Absent for whitelisted identities, which touch no bucket
    pub quota: Option<Quota>,
    /// Set only on rejection
    pub retry_after_secs: Option<u64>,
    /// Response headers, in the order they should be written
    pub headers: Vec<(&'static str, String)>,
}

impl Decision {
    /// Pass-through for a whitelisted identity.
    pub fn whitelisted() -> Self {
        Self {
            allowed: true,
            reason: None,
            quota: None,
            retry_after_secs: None,
            headers: Vec::new(),
        }
    }

    pub(crate) fn allow(quota: Quota, include_headers: bool, unix_now: i64) -> Self {
        let mut headers = Vec::new();
        if include_headers {
            headers.push((HEADER_LIMIT, quota.limit.to_string()));
            headers.push((HEADER_REMAINING, quota.remaining.to_string()));
            headers.push((
                HEADER_RESET,
                (unix_now + quota.reset_after_secs as i64).to_string(),
            ));
        }

        Self {
            allowed: true,
            reason: None,
            quota: Some(quota),
            retry_after_secs: None,
            headers,
        }
    }

    pub(crate) fn reject(
        reason: RejectReason,
        quota: Quota,
        retry_after_secs: u64,
        include_headers: bool,
        unix_now: i64,
    ) -> Self {
        let retry_after_secs = retry_after_secs.max(1);
        let mut headers = vec![(HEADER_RETRY_AFTER, retry_after_secs.to_string())];
        if include_headers {
            headers.push((HEADER_LIMIT, quota.limit.to_string()));
            headers.push((HEADER_REMAINING, "0".to_string()));
            headers.push((
                HEADER_RESET,
                (unix_now + retry_after_secs as i64).to_string(),
            ));
        }

        Self {
            allowed: false,
            reason: Some(reason),
            quota: Some(quota),
            retry_after_secs: Some(retry_after_secs),
            headers,
        }
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// HTTP status the transport should answer with instead of forwarding.
    pub fn status(&self) -> Option<u16> {
        (!self.allowed).then_some(TOO_MANY_REQUESTS)
    }

    /// Tokens left in the deciding scope.
    pub fn remaining(&self) -> Option<u64> {
        self.quota.map(|q| q.remaining)
    }

    /// Capacity of the deciding scope.
    pub fn limit(&self) -> Option<u64> {
        self.quota.map(|q| q.limit)
    }

    /// Value of a response header, if set.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body for a rejected request.
    pub fn reject_body(&self) -> Option<RejectBody> {
        let reason = self.reason?;
        Some(RejectBody {
            error: reason.error_code(),
            message: reason.message(),
            retry_after: self.retry_after_secs.unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota() -> Quota {
        Quota {
            scope: Scope::Identity,
            limit: 10,
            remaining: 4,
            reset_after_secs: 36,
        }
    }

    #[test]
    fn test_allow_with_headers() {
        let decision = Decision::allow(quota(), true, 1_000);

        assert!(decision.is_allowed());
        assert_eq!(decision.status(), None);
        assert_eq!(decision.limit(), Some(10));
        assert_eq!(decision.remaining(), Some(4));
        assert_eq!(decision.header("X-RateLimit-Limit"), Some("10"));
        assert_eq!(decision.header("x-ratelimit-remaining"), Some("4"));
        assert_eq!(decision.header(HEADER_RESET), Some("1036"));
        assert!(decision.reject_body().is_none());
    }

    #[test]
    fn test_allow_without_headers() {
        let decision = Decision::allow(quota(), false, 1_000);
        assert!(decision.headers.is_empty());
        assert_eq!(decision.remaining(), Some(4));
    }

    #[test]
    fn test_reject_always_sets_retry_after() {
        let decision = Decision::reject(
            RejectReason::RateLimited(Scope::Global),
            quota(),
            3,
            false,
            1_000,
        );

        assert!(!decision.is_allowed());
        assert_eq!(decision.status(), Some(TOO_MANY_REQUESTS));
        assert_eq!(decision.headers, vec![(HEADER_RETRY_AFTER, "3".to_string())]);
    }

    #[test]
    fn test_reject_with_headers() {
        let decision = Decision::reject(
            RejectReason::RateLimited(Scope::Endpoint),
            quota(),
            3,
            true,
            1_000,
        );

        assert_eq!(decision.header(HEADER_REMAINING), Some("0"));
        assert_eq!(decision.header(HEADER_LIMIT), Some("10"));
        assert_eq!(decision.header(HEADER_RESET), Some("1003"));
    }

    #[test]
    fn test_retry_after_floor_of_one() {
        let decision = Decision::reject(RejectReason::Blocked, quota(), 0, false, 0);
        assert_eq!(decision.retry_after_secs, Some(1));
    }

    #[test]
    fn test_reject_body_json() {
        let decision = Decision::reject(
            RejectReason::RateLimited(Scope::Identity),
            quota(),
            2,
            false,
            0,
        );
        let body = decision.reject_body().unwrap();
        assert_eq!(
            body.to_json().unwrap(),
            r#"{"error":"rate_limit_exceeded","message":"too many requests","retry_after":2}"#
        );

        let blocked = Decision::reject(RejectReason::Blocked, quota(), 300, false, 0);
        let body = blocked.reject_body().unwrap();
        assert_eq!(body.error, "too_many_requests");
        assert_eq!(body.message, "temporarily blocked due to suspicious activity");
        assert_eq!(body.retry_after, 300);
    }

    #[test]
    fn test_whitelisted_has_no_metadata() {
        let decision = Decision::whitelisted();
        assert!(decision.is_allowed());
        assert!(decision.quota.is_none());
        assert!(decision.headers.is_empty());
    }
}
