//! Deterministic classification of raw provider failure strings.
//!
//! Rules are an explicit ordered table rather than nested conditionals:
//! the first rule whose needle appears in the (lowercased) message wins.
//! Order matters because needles overlap — e.g. "permission denied while
//! waiting" must classify as a permission error, not a timeout.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ProvisioningRequired,
    PermissionError,
    AuthenticationError,
    ConfigurationError,
    RateLimit,
    Timeout,
    Unavailable,
    ValidationError,
    Unknown,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Critical,
    Warning,
    Info,
}

impl ErrorCategory {
    /// Temporary errors ride the queue's retry/backoff budget; permanent
    /// ones are surfaced immediately since retrying cannot fix them.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::Unavailable
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::ProvisioningRequired => ErrorSeverity::Warning,
            ErrorCategory::PermissionError => ErrorSeverity::Critical,
            ErrorCategory::AuthenticationError => ErrorSeverity::Critical,
            ErrorCategory::ConfigurationError => ErrorSeverity::Critical,
            ErrorCategory::RateLimit => ErrorSeverity::Warning,
            ErrorCategory::Timeout => ErrorSeverity::Warning,
            ErrorCategory::Unavailable => ErrorSeverity::Warning,
            ErrorCategory::ValidationError => ErrorSeverity::Info,
            ErrorCategory::Unknown => ErrorSeverity::Warning,
        }
    }

    pub fn suggested_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self {
            ErrorCategory::ProvisioningRequired => &[
                "Request provisioned throughput for this model/region",
                "Use an on-demand-capable model variant instead",
            ],
            ErrorCategory::PermissionError => &[
                "Verify the service role has invoke permission for this model",
                "Check model access grants for the target region",
            ],
            ErrorCategory::AuthenticationError => &[
                "Rotate or re-issue the provider API credentials",
                "Confirm the credentials are valid for the target region",
            ],
            ErrorCategory::ConfigurationError => &[
                "Verify the model identifier and region are correct",
                "Confirm the deployment still exists with the provider",
            ],
            ErrorCategory::RateLimit => &[
                "Retry after backoff",
                "Lower worker concurrency or request a quota increase",
            ],
            ErrorCategory::Timeout => &[
                "Retry after backoff",
                "Check provider status for elevated latency",
            ],
            ErrorCategory::Unavailable => &[
                "Retry after backoff",
                "Check provider status page for the region",
            ],
            ErrorCategory::ValidationError => &[
                "Inspect the request payload for malformed fields",
            ],
            ErrorCategory::Unknown => &[
                "Inspect the raw error message",
                "Retry once; escalate if it persists",
            ],
        };
        actions.iter().map(|s| s.to_string()).collect()
    }
}

/// Structured classification of a raw failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub is_temporary: bool,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

struct Rule {
    category: ErrorCategory,
    needles: &'static [&'static str],
}

/// Classification rules, highest priority first. Needles are matched as
/// substrings of the lowercased message.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::ProvisioningRequired,
        needles: &[
            "provisioned throughput",
            "not provisioned",
            "provisioning required",
            "requires provisioning",
        ],
    },
    Rule {
        category: ErrorCategory::PermissionError,
        needles: &[
            "permission",
            "access denied",
            "accessdenied",
            "forbidden",
            "not authorized",
            "403",
        ],
    },
    Rule {
        category: ErrorCategory::AuthenticationError,
        needles: &[
            "authentication",
            "unauthenticated",
            "unauthorized",
            "invalid credentials",
            "api key",
            "token expired",
            "401",
        ],
    },
    Rule {
        category: ErrorCategory::ConfigurationError,
        needles: &[
            "model not found",
            "no such model",
            "unknown model",
            "unsupported model",
            "invalid model",
            "not supported in region",
            "404",
        ],
    },
    Rule {
        category: ErrorCategory::RateLimit,
        needles: &[
            "rate limit",
            "ratelimit",
            "too many requests",
            "quota exceeded",
            "throttl",
            "429",
        ],
    },
    Rule {
        category: ErrorCategory::Timeout,
        needles: &["timeout", "timed out", "deadline exceeded"],
    },
    Rule {
        category: ErrorCategory::Unavailable,
        needles: &[
            "unavailable",
            "connection refused",
            "connection reset",
            "overloaded",
            "bad gateway",
            "503",
            "502",
        ],
    },
    Rule {
        category: ErrorCategory::ValidationError,
        needles: &[
            "validation",
            "invalid request",
            "malformed",
            "bad request",
            "400",
        ],
    },
];

/// Map a raw failure message to a structured classification.
///
/// Pure and deterministic: identical input always yields identical output.
pub fn categorize(raw_message: &str) -> CategorizedError {
    let lowered = raw_message.to_lowercase();

    let category = RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| lowered.contains(n)))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::Unknown);

    CategorizedError {
        category,
        severity: category.severity(),
        is_temporary: category.is_temporary(),
        message: raw_message.trim().to_string(),
        suggested_actions: category.suggested_actions(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_temporary() {
        let c = categorize("rate limit exceeded");
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert!(c.is_temporary);
        assert_eq!(c.severity, ErrorSeverity::Warning);
    }

    #[test]
    fn permission_beats_timeout_on_overlap() {
        // Both "permission" and "timed out" appear; the earlier rule wins.
        let c = categorize("permission denied: request timed out waiting for grant");
        assert_eq!(c.category, ErrorCategory::PermissionError);
        assert!(!c.is_temporary);
    }

    #[test]
    fn provisioning_beats_configuration() {
        let c = categorize("Model requires provisioned throughput, model not found in on-demand");
        assert_eq!(c.category, ErrorCategory::ProvisioningRequired);
    }

    #[test]
    fn authentication_detected() {
        let c = categorize("HTTP 401: invalid credentials");
        assert_eq!(c.category, ErrorCategory::AuthenticationError);
        assert_eq!(c.severity, ErrorSeverity::Critical);
        assert!(!c.is_temporary);
    }

    #[test]
    fn unavailable_and_timeout() {
        assert_eq!(
            categorize("503 Service Unavailable").category,
            ErrorCategory::Unavailable
        );
        assert_eq!(
            categorize("deadline exceeded after 30s").category,
            ErrorCategory::Timeout
        );
        assert!(categorize("connection refused").is_temporary);
    }

    #[test]
    fn unknown_fallback() {
        let c = categorize("something inexplicable happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(!c.is_temporary);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let raw = "Too many requests, throttling in effect (429)";
        let a = categorize(raw);
        let b = categorize(raw);
        assert_eq!(a, b);
        assert_eq!(a.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn case_insensitive_matching() {
        assert_eq!(
            categorize("RATE LIMIT EXCEEDED").category,
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn message_preserved_verbatim() {
        let c = categorize("  ThrottlingException: slow down  ");
        assert_eq!(c.message, "ThrottlingException: slow down");
        assert_eq!(c.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn category_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCategory::RateLimit).unwrap();
        assert_eq!(json, "\"RATE_LIMIT\"");
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RATE_LIMIT");
    }
}
