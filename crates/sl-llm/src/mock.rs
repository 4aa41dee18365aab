// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canned-reply gateway for tests and offline runs.

use crate::{LlmError, LlmGateway, LlmReply, PageImage, TokenUsage};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Which gateway operation a recorded call hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCallKind {
    /// `classify_small`.
    ClassifySmall,
    /// `analyze_large`.
    AnalyzeLarge,
    /// `extract_vision`.
    ExtractVision,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// The operation.
    pub kind: MockCallKind,
    /// The prompt text.
    pub prompt: String,
    /// How many images were attached.
    pub image_count: usize,
}

/// A gateway that replays queued replies in order.
///
/// When the queue is empty, every call fails with
/// [`LlmError::Upstream`] — a test that forgot to queue a reply fails
/// loudly instead of hanging.
#[derive(Default)]
pub struct MockGateway {
    replies: Mutex<VecDeque<Result<Value, LlmError>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockGateway {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn push_reply(&self, value: Value) {
        self.replies
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(value));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: LlmError) {
        self.replies
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
    }

    /// All calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }

    /// Number of calls recorded so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock lock poisoned").len()
    }

    fn next(&self, kind: MockCallKind, prompt: &str, image_count: usize) -> Result<LlmReply, LlmError> {
        self.calls.lock().expect("mock lock poisoned").push(MockCall {
            kind,
            prompt: prompt.to_string(),
            image_count,
        });
        let reply = self
            .replies
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Upstream("mock reply queue empty".into())));
        reply.map(|value| LlmReply {
            value,
            usage: TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 10,
            },
            elapsed_ms: 5,
        })
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn classify_small(
        &self,
        prompt: &str,
        _schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        self.next(MockCallKind::ClassifySmall, prompt, 0)
    }

    async fn analyze_large(
        &self,
        prompt: &str,
        images: &[PageImage],
        _schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        self.next(MockCallKind::AnalyzeLarge, prompt, images.len())
    }

    async fn extract_vision(
        &self,
        images: &[PageImage],
        prompt: &str,
        _schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        self.next(MockCallKind::ExtractVision, prompt, images.len())
    }
}
