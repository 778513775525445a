//! Tagged failure classification for retry decisions.
//!
//! Workers decide whether to retry from a [`FailureKind`] tag, never from
//! free-form text. For errors that crossed a process boundary and arrive as
//! a bare string (failure events, DLQ replays), [`FailureKind::classify`]
//! provides the legacy substring fallback.

use serde::{Deserialize, Serialize};

/// Substrings that mark an error message as non-retryable, matched
/// case-insensitively. Only used by the legacy string fallback.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "invalid request",
    "validation failed",
    "not found",
    "unauthorized",
    "forbidden",
    "duplicate",
    "already exists",
    "schema",
    "json",
    "unmarshal",
];

/// How a failure should be treated by retry machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request itself is malformed; retrying cannot help.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// The operation conflicts with current state (duplicate, already done).
    Conflict,
    /// The caller is not allowed to perform the operation.
    Unauthorized,
    /// Transient infrastructure fault; retry with backoff.
    Retryable,
    /// A deadline elapsed; retryable, tracked separately for observability.
    Timeout,
}

impl FailureKind {
    /// Whether a failure of this kind is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable | Self::Timeout)
    }

    /// Classify a bare error message from across a process boundary.
    ///
    /// Anything not matching a known non-retryable marker is assumed
    /// retryable, mirroring the behaviour consumers already depend on.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        for marker in NON_RETRYABLE_MARKERS {
            if lower.contains(marker) {
                return match *marker {
                    "not found" => Self::NotFound,
                    "unauthorized" | "forbidden" => Self::Unauthorized,
                    "duplicate" | "already exists" => Self::Conflict,
                    _ => Self::Validation,
                };
            }
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            return Self::Timeout;
        }
        Self::Retryable
    }

    /// Stable string tag carried in failure events.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Retryable => "retryable",
            Self::Timeout => "timeout",
        }
    }
}

/// Convenience trait for errors that carry their own classification.
pub trait Classified {
    /// The failure kind of this error.
    fn failure_kind(&self) -> FailureKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_markers_are_terminal() {
        for message in [
            "invalid request: quantity missing",
            "Validation failed on field zone_id",
            "booking not found",
            "Unauthorized",
            "access forbidden for tenant",
            "duplicate key value violates unique constraint",
            "entry already exists",
            "schema mismatch at offset 3",
            "json: cannot unmarshal string into Go value",
        ] {
            assert!(
                !FailureKind::classify(message).is_retryable(),
                "{message} should be terminal"
            );
        }
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        assert_eq!(
            FailureKind::classify("connection reset by peer"),
            FailureKind::Retryable
        );
        assert_eq!(FailureKind::classify(""), FailureKind::Retryable);
    }

    #[test]
    fn timeouts_are_classified_separately_but_retryable() {
        let kind = FailureKind::classify("operation timed out after 500ms");
        assert_eq!(kind, FailureKind::Timeout);
        assert!(kind.is_retryable());
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(
            FailureKind::classify("NOT FOUND: zone VIP"),
            FailureKind::NotFound
        );
    }
}
