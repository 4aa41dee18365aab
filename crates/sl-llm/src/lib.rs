// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-llm
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Token-bucket admission control.
pub mod bucket;
/// The HTTP gateway implementation.
pub mod http;
/// Output normalization: fence stripping and schema validation.
pub mod json;
/// Canned-reply gateway for tests and offline runs.
pub mod mock;

pub use bucket::TokenBucket;
pub use http::HttpGateway;
pub use mock::{MockCall, MockCallKind, MockGateway};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sl_error::{CoreError, ErrorKind};

// ---------------------------------------------------------------------------
// Reply types
// ---------------------------------------------------------------------------

/// Token counts reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A normalized gateway reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    /// The structured JSON value, already schema-validated.
    pub value: serde_json::Value,
    /// Token usage for metering.
    pub usage: TokenUsage,
    /// Wall-clock duration of the call in milliseconds.
    pub elapsed_ms: u64,
}

/// One rasterized page handed to the vision tier.
///
/// Buffers are dropped as soon as the call returns; no image bytes outlive
/// a single OCR call.
#[derive(Clone)]
pub struct PageImage {
    /// Raw image bytes.
    pub bytes: Vec<u8>,
    /// MIME type of the image (e.g. `image/png`).
    pub mime: String,
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("mime", &self.mime)
            .field("bytes", &format!("{} bytes", self.bytes.len()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Gateway failure modes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    /// The call did not complete within its wall-clock deadline.
    #[error("llm call timed out")]
    Timeout,
    /// The token bucket drained and did not refill within the grace window.
    #[error("llm tier rate limited")]
    RateLimited,
    /// The provider answered, but not with usable JSON for the schema.
    #[error("invalid llm response: {0}")]
    InvalidResponse(String),
    /// The provider failed outright.
    #[error("llm upstream error: {0}")]
    Upstream(String),
}

impl LlmError {
    /// Map onto the workspace error taxonomy.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::UpstreamTimeout,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::InvalidResponse(_) => ErrorKind::UpstreamInvalid,
            Self::Upstream(_) => ErrorKind::UpstreamUnavailable,
        }
    }
}

impl From<LlmError> for CoreError {
    fn from(err: LlmError) -> Self {
        CoreError::new(err.error_kind(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// The gateway every caller programs against. Model identity stays behind
/// this trait; callers name a tier, never a model.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Structured classification on the small tier.
    async fn classify_small(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<LlmReply, LlmError>;

    /// Structured analysis on the large tier, optionally with images.
    async fn analyze_large(
        &self,
        prompt: &str,
        images: &[PageImage],
        schema: &serde_json::Value,
    ) -> Result<LlmReply, LlmError>;

    /// Vision extraction over a page set on the large tier.
    async fn extract_vision(
        &self,
        images: &[PageImage],
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<LlmReply, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 30,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(LlmError::Timeout.error_kind(), ErrorKind::UpstreamTimeout);
        assert_eq!(LlmError::RateLimited.error_kind(), ErrorKind::RateLimited);
        assert_eq!(
            LlmError::InvalidResponse("bad".into()).error_kind(),
            ErrorKind::UpstreamInvalid
        );
        assert_eq!(
            LlmError::Upstream("500".into()).error_kind(),
            ErrorKind::UpstreamUnavailable
        );
    }

    #[test]
    fn page_image_debug_hides_bytes() {
        let image = PageImage {
            bytes: vec![0u8; 4096],
            mime: "image/png".into(),
        };
        let dbg = format!("{image:?}");
        assert!(dbg.contains("4096 bytes"));
        assert!(!dbg.contains("[0, 0"));
    }
}
