// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-error
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The closed set of error kinds exposed at public boundaries.
///
/// Each variant serialises to a stable `snake_case` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing input.
    Validation,
    /// Identity could not be established.
    Unauthenticated,
    /// Identity established but the capability check failed.
    Unauthorized,
    /// Addressed entity absent.
    NotFound,
    /// Version-token mismatch or duplicate unique key.
    Conflict,
    /// Legal input, illegal transition or rule violation.
    BusinessRule,
    /// External system did not answer within its deadline.
    UpstreamTimeout,
    /// External system is unreachable or failing.
    UpstreamUnavailable,
    /// External system answered with a well-formed but unusable response.
    UpstreamInvalid,
    /// A token bucket drained.
    RateLimited,
    /// Unexpected failure; details stay server-side.
    Internal,
    /// A compound operation completed some items and skipped others.
    PartialSuccess,
}

impl ErrorKind {
    /// Stable `&'static str` wire code (e.g. `"business_rule"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::BusinessRule => "business_rule",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamInvalid => "upstream_invalid",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal",
            Self::PartialSuccess => "partial_success",
        }
    }

    /// The HTTP status this kind maps to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Unauthenticated => 401,
            Self::Unauthorized => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::BusinessRule => 422,
            Self::RateLimited => 429,
            Self::UpstreamTimeout | Self::UpstreamUnavailable | Self::UpstreamInvalid => 503,
            Self::Internal => 500,
            Self::PartialSuccess => 207,
        }
    }

    /// Whether one bounded local retry is appropriate for this kind.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout | Self::RateLimited)
    }

    /// Whether a background job failing with this kind should stop retrying
    /// immediately.
    #[must_use]
    pub fn is_terminal_for_jobs(&self) -> bool {
        matches!(self, Self::Validation | Self::BusinessRule)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Unified SiteLedger error.
///
/// Carries a stable [`ErrorKind`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use sl_error::{CoreError, ErrorKind};
///
/// let err = CoreError::new(ErrorKind::Conflict, "stale version token")
///     .with_context("expense_id", "e-42")
///     .with_context("expected", "v-1");
/// ```
pub struct CoreError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CoreError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for a `validation` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Shorthand for a `not_found` error naming the absent entity.
    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{entity} {id} not found"))
    }

    /// Shorthand for a `conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Shorthand for a `business_rule` error.
    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule, message)
    }

    /// Shorthand for an `unauthorized` error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Shorthand for an `internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The user-facing wire form: `{error_kind, message, details?}`.
    ///
    /// For [`ErrorKind::Internal`] the message is replaced with a generic
    /// string and the context is dropped — stack traces and internals stay
    /// server-side.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        if self.kind == ErrorKind::Internal {
            return WireError {
                error_kind: self.kind,
                message: "internal error".to_string(),
                details: None,
            };
        }
        WireError {
            error_kind: self.kind,
            message: self.message.clone(),
            details: if self.context.is_empty() {
                None
            } else {
                Some(self.context.clone())
            },
        }
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CoreError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used across the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Serialisable user-facing error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    /// Stable error kind.
    pub error_kind: ErrorKind,
    /// Human-readable message (generic for `internal`).
    pub message: String,
    /// Structured details, omitted when empty or internal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All kinds for exhaustive iteration in tests.
    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::Validation,
        ErrorKind::Unauthenticated,
        ErrorKind::Unauthorized,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::BusinessRule,
        ErrorKind::UpstreamTimeout,
        ErrorKind::UpstreamUnavailable,
        ErrorKind::UpstreamInvalid,
        ErrorKind::RateLimited,
        ErrorKind::Internal,
        ErrorKind::PartialSuccess,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = CoreError::new(ErrorKind::Internal, "boom");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = CoreError::not_found("expense", "e-1");
        assert_eq!(err.to_string(), "[not_found] expense e-1 not found");
    }

    #[test]
    fn display_with_context() {
        let err = CoreError::conflict("stale token").with_context("expected", "v1");
        let s = err.to_string();
        assert!(s.starts_with("[conflict] stale token"));
        assert!(s.contains("expected"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = CoreError::internal("blob read failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    // -- HTTP mapping ----------------------------------------------------

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorKind::Unauthorized.http_status(), 403);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::BusinessRule.http_status(), 422);
        assert_eq!(ErrorKind::RateLimited.http_status(), 429);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
        assert_eq!(ErrorKind::UpstreamTimeout.http_status(), 503);
        assert_eq!(ErrorKind::UpstreamUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::UpstreamInvalid.http_status(), 503);
        assert_eq!(ErrorKind::PartialSuccess.http_status(), 207);
    }

    // -- Retry / job classification --------------------------------------

    #[test]
    fn retryable_kinds_are_exactly_timeout_and_rate_limited() {
        for kind in ALL_KINDS {
            let expected =
                matches!(kind, ErrorKind::UpstreamTimeout | ErrorKind::RateLimited);
            assert_eq!(kind.is_retryable(), expected, "kind {kind}");
        }
    }

    #[test]
    fn job_terminal_kinds() {
        assert!(ErrorKind::Validation.is_terminal_for_jobs());
        assert!(ErrorKind::BusinessRule.is_terminal_for_jobs());
        assert!(!ErrorKind::UpstreamTimeout.is_terminal_for_jobs());
        assert!(!ErrorKind::Internal.is_terminal_for_jobs());
    }

    // -- Wire form --------------------------------------------------------

    #[test]
    fn wire_form_carries_details() {
        let err = CoreError::validation("amount malformed").with_context("field", "amount");
        let wire = err.to_wire();
        assert_eq!(wire.error_kind, ErrorKind::Validation);
        assert_eq!(wire.message, "amount malformed");
        assert_eq!(
            wire.details.unwrap()["field"],
            serde_json::json!("amount")
        );
    }

    #[test]
    fn wire_form_redacts_internal() {
        let err = CoreError::internal("db connection pool exhausted at 10.0.0.3")
            .with_context("pool", "primary");
        let wire = err.to_wire();
        assert_eq!(wire.message, "internal error");
        assert!(wire.details.is_none());
    }

    #[test]
    fn wire_serde_roundtrip() {
        let wire = CoreError::business_rule("authorized expenses cannot return to pending")
            .to_wire();
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"business_rule\""));
        let back: WireError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wire);
    }

    // -- Stable codes ------------------------------------------------------

    #[test]
    fn all_kinds_have_unique_codes() {
        let mut seen = HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()), "duplicate code {}", kind.as_str());
        }
        assert_eq!(seen.len(), ALL_KINDS.len());
    }

    #[test]
    fn kind_count() {
        // Ensure we don't silently drop a variant from ALL_KINDS.
        assert_eq!(ALL_KINDS.len(), 12);
    }

    #[test]
    fn serde_matches_as_str() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    // -- Error chain -------------------------------------------------------

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::TimedOut, "socket timeout");
        let err = CoreError::new(ErrorKind::UpstreamTimeout, "llm call").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "socket timeout");
    }

    #[test]
    fn std_error_source_none_by_default() {
        let err = CoreError::internal("oops");
        assert!(std::error::Error::source(&err).is_none());
    }
}
