//! Rate limit policy: the immutable limits the gate enforces.
//!
//! Field names follow the admission config file; the older `per_ip_*`,
//! `burst_size`, `endpoint_limits` and `whitelist_ips` spellings are accepted
//! as aliases.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Limits for a single endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// Sustained requests per minute
    pub requests_per_minute: u32,
    /// Requests admitted back to back before refill applies
    #[serde(alias = "burst_size")]
    pub burst: u32,
}

impl EndpointLimit {
    /// Create an endpoint limit.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
        }
    }
}

/// The complete set of limits applied to inbound requests.
///
/// A field left out of a config file takes its default. An explicit zero
/// rate is honored: that scope never refills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Process-wide requests per minute
    #[serde(default = "default_global_rpm", alias = "requests_per_minute")]
    pub global_requests_per_minute: u32,

    /// Process-wide burst
    #[serde(default = "default_global_burst", alias = "burst_size")]
    pub global_burst: u32,

    /// Requests per minute for each client identity
    #[serde(default = "default_identity_rpm", alias = "per_ip_requests_per_minute")]
    pub per_identity_requests_per_minute: u32,

    /// Burst for each client identity
    #[serde(default = "default_identity_burst", alias = "per_ip_burst_size")]
    pub per_identity_burst: u32,

    /// Extra limits for specific paths
    #[serde(default = "default_endpoint_overrides", alias = "endpoint_limits")]
    pub endpoint_overrides: HashMap<String, EndpointLimit>,

    /// Identities exempt from every check
    #[serde(default, alias = "whitelist_ips")]
    pub whitelist: HashSet<String>,

    /// Emit `X-RateLimit-*` headers
    #[serde(default = "default_include_headers")]
    pub include_headers: bool,
}

fn default_global_rpm() -> u32 {
    1000
}

fn default_global_burst() -> u32 {
    50
}

fn default_identity_rpm() -> u32 {
    100
}

fn default_identity_burst() -> u32 {
    10
}

fn default_endpoint_overrides() -> HashMap<String, EndpointLimit> {
    HashMap::from([
        ("/api/auth/login".to_string(), EndpointLimit::new(5, 2)),
        ("/api/auth/register".to_string(), EndpointLimit::new(3, 1)),
        ("/api/deploy".to_string(), EndpointLimit::new(10, 3)),
    ])
}

fn default_include_headers() -> bool {
    true
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            global_requests_per_minute: default_global_rpm(),
            global_burst: default_global_burst(),
            per_identity_requests_per_minute: default_identity_rpm(),
            per_identity_burst: default_identity_burst(),
            endpoint_overrides: default_endpoint_overrides(),
            whitelist: HashSet::new(),
            include_headers: default_include_headers(),
        }
    }
}

impl RateLimitPolicy {
    /// Load and validate a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policy: RateLimitPolicy = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check the values serde cannot.
    ///
    /// Negative numbers never get this far; they fail to deserialize.
    pub fn validate(&self) -> Result<()> {
        for path in self.endpoint_overrides.keys() {
            if path.is_empty() {
                return Err(FloodgateError::Config(
                    "endpoint override path must not be empty".to_string(),
                ));
            }
            if !path.starts_with('/') {
                return Err(FloodgateError::Config(format!(
                    "endpoint override path '{}' must start with '/'",
                    path
                )));
            }
            if path.chars().any(char::is_whitespace) {
                return Err(FloodgateError::Config(format!(
                    "endpoint override path '{}' must not contain whitespace",
                    path
                )));
            }
        }

        if self.whitelist.iter().any(|id| id.trim().is_empty()) {
            return Err(FloodgateError::Config(
                "whitelist entries must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether an identity bypasses all checks.
    pub fn is_whitelisted(&self, identity: &str) -> bool {
        self.whitelist.contains(identity)
    }

    /// The override for an exact path, if any.
    pub fn endpoint_limit(&self, path: &str) -> Option<&EndpointLimit> {
        self.endpoint_overrides.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RateLimitPolicy::default();
        assert_eq!(policy.global_requests_per_minute, 1000);
        assert_eq!(policy.global_burst, 50);
        assert_eq!(policy.per_identity_requests_per_minute, 100);
        assert_eq!(policy.per_identity_burst, 10);
        assert!(policy.include_headers);
        assert_eq!(
            policy.endpoint_limit("/api/auth/login"),
            Some(&EndpointLimit::new(5, 2))
        );
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_parse_full_policy() {
        let yaml = r#"
global_requests_per_minute: 600
global_burst: 5
per_identity_requests_per_minute: 60
per_identity_burst: 1
endpoint_overrides:
  /login:
    requests_per_minute: 5
    burst: 2
whitelist:
  - 10.0.0.1
include_headers: false
"#;
        let policy = RateLimitPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy.global_requests_per_minute, 600);
        assert_eq!(policy.per_identity_burst, 1);
        assert_eq!(policy.endpoint_overrides.len(), 1);
        assert_eq!(policy.endpoint_limit("/login"), Some(&EndpointLimit::new(5, 2)));
        assert!(policy.is_whitelisted("10.0.0.1"));
        assert!(!policy.is_whitelisted("10.0.0.2"));
        assert!(!policy.include_headers);
    }

    #[test]
    fn test_parse_legacy_field_names() {
        let yaml = r#"
requests_per_minute: 120
burst_size: 7
per_ip_requests_per_minute: 30
per_ip_burst_size: 3
endpoint_limits:
  /api/deploy:
    requests_per_minute: 10
    burst_size: 3
whitelist_ips: ["127.0.0.1"]
"#;
        let policy = RateLimitPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy.global_requests_per_minute, 120);
        assert_eq!(policy.global_burst, 7);
        assert_eq!(policy.per_identity_requests_per_minute, 30);
        assert_eq!(policy.per_identity_burst, 3);
        assert_eq!(policy.endpoint_limit("/api/deploy"), Some(&EndpointLimit::new(10, 3)));
        assert!(policy.is_whitelisted("127.0.0.1"));
    }

    #[test]
    fn test_missing_fields_take_defaults_but_zero_is_kept() {
        let policy = RateLimitPolicy::from_yaml("global_requests_per_minute: 0\n").unwrap();
        assert_eq!(policy.global_requests_per_minute, 0);
        assert_eq!(policy.global_burst, 50);
        assert_eq!(policy.endpoint_overrides.len(), 3);
    }

    #[test]
    fn test_negative_rate_rejected() {
        let result = RateLimitPolicy::from_yaml("per_identity_requests_per_minute: -5\n");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_malformed_override_rejected() {
        let yaml = r#"
endpoint_overrides:
  /login:
    requests_per_minute: 5
"#;
        assert!(matches!(
            RateLimitPolicy::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_override_path_validation() {
        let mut policy = RateLimitPolicy::default();
        policy
            .endpoint_overrides
            .insert("login".to_string(), EndpointLimit::new(1, 1));
        assert!(policy.validate().is_err());

        let mut policy = RateLimitPolicy::default();
        policy
            .endpoint_overrides
            .insert("/log in".to_string(), EndpointLimit::new(1, 1));
        assert!(policy.validate().is_err());

        let mut policy = RateLimitPolicy::default();
        policy
            .endpoint_overrides
            .insert(String::new(), EndpointLimit::new(1, 1));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_empty_whitelist_entry_rejected() {
        let mut policy = RateLimitPolicy::default();
        policy.whitelist.insert("  ".to_string());
        assert!(policy.validate().is_err());
    }
}
