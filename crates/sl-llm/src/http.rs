// SPDX-License-Identifier: MIT OR Apache-2.0
//! The HTTP gateway.
//!
//! One long-lived `reqwest::Client` per tier, each with its own wall-clock
//! timeout. The heavy tier additionally runs behind a token bucket and a
//! per-process token budget. Rate-limited calls are retried exactly once
//! after an exponential delay; invalid responses are never retried.

use crate::bucket::TokenBucket;
use crate::json::{normalize_json, validate_schema};
use crate::{LlmError, LlmGateway, LlmReply, PageImage, TokenUsage};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use sl_config::{LLM_LARGE_TIMEOUT, LLM_SMALL_TIMEOUT, SiteLedgerConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RETRY_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Tier client
// ---------------------------------------------------------------------------

struct TierClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl TierClient {
    fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Upstream(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn complete(&self, messages: Value) -> Result<(String, TokenUsage), LlmError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": { "type": "json_object" },
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Upstream(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream(format!("status {status}: {body}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("bad response body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".into()))?;
        Ok((content, parsed.usage.unwrap_or_default().into()))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(wire: WireUsage) -> Self {
        Self {
            prompt_tokens: wire.prompt_tokens,
            completion_tokens: wire.completion_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// HttpGateway
// ---------------------------------------------------------------------------

/// The production gateway over an OpenAI-compatible chat-completions API.
pub struct HttpGateway {
    small: TierClient,
    large: TierClient,
    small_bucket: TokenBucket,
    large_bucket: TokenBucket,
    /// Remaining token budget for the heavy tier this process.
    large_budget_remaining: AtomicU64,
}

impl HttpGateway {
    /// Build a gateway from configuration.
    ///
    /// Fails when no base URL or API key is configured — callers fall back
    /// to the [`crate::MockGateway`] in that case.
    pub fn from_config(config: &SiteLedgerConfig) -> Result<Self, LlmError> {
        let base_url = config
            .llm_base_url
            .as_deref()
            .ok_or_else(|| LlmError::Upstream("no LLM base URL configured".into()))?;
        let api_key = config
            .llm_api_key
            .as_deref()
            .ok_or_else(|| LlmError::Upstream("no LLM API key configured".into()))?;
        Ok(Self {
            small: TierClient::new(
                base_url,
                &config.small_model_id,
                api_key,
                LLM_SMALL_TIMEOUT,
            )?,
            large: TierClient::new(
                base_url,
                &config.large_model_id,
                api_key,
                LLM_LARGE_TIMEOUT,
            )?,
            small_bucket: TokenBucket::per_minute(config.small_tier_rpm),
            large_bucket: TokenBucket::per_minute(config.large_tier_rpm),
            large_budget_remaining: AtomicU64::new(config.large_tier_token_budget),
        })
    }

    /// Tokens still available to the heavy tier this process.
    #[must_use]
    pub fn large_budget_remaining(&self) -> u64 {
        self.large_budget_remaining.load(Ordering::Relaxed)
    }

    async fn call_tier(
        &self,
        heavy: bool,
        messages: Value,
        schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.call_tier_once(heavy, messages.clone(), schema).await {
                Err(LlmError::RateLimited) if attempt == 1 => {
                    warn!(heavy, "llm tier rate limited; retrying once");
                    tokio::time::sleep(RETRY_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err),
                Ok(mut reply) => {
                    reply.elapsed_ms = started.elapsed().as_millis() as u64;
                    return Ok(reply);
                }
            }
        }
    }

    async fn call_tier_once(
        &self,
        heavy: bool,
        messages: Value,
        schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        let (tier, bucket) = if heavy {
            (&self.large, &self.large_bucket)
        } else {
            (&self.small, &self.small_bucket)
        };
        if heavy && self.large_budget_remaining.load(Ordering::Relaxed) == 0 {
            return Err(LlmError::RateLimited);
        }
        bucket.acquire().await?;

        let started = Instant::now();
        let (content, usage) = tier.complete(messages).await?;
        debug!(
            heavy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            tokens = usage.total(),
            "llm call completed"
        );

        if heavy {
            // Saturating: the budget floor is zero.
            let mut current = self.large_budget_remaining.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub(usage.total());
                match self.large_budget_remaining.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }

        let value = normalize_json(&content)?;
        validate_schema(&value, schema)?;
        Ok(LlmReply {
            value,
            usage,
            elapsed_ms: 0, // overwritten by call_tier
        })
    }
}

fn text_message(prompt: &str) -> Value {
    json!([{ "role": "user", "content": prompt }])
}

fn vision_message(prompt: &str, images: &[PageImage]) -> Value {
    let mut content = vec![json!({ "type": "text", "text": prompt })];
    for image in images {
        content.push(json!({
            "type": "image_url",
            "image_url": {
                "url": format!(
                    "data:{};base64,{}",
                    image.mime,
                    BASE64.encode(&image.bytes)
                )
            }
        }));
    }
    json!([{ "role": "user", "content": content }])
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn classify_small(
        &self,
        prompt: &str,
        schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        self.call_tier(false, text_message(prompt), schema).await
    }

    async fn analyze_large(
        &self,
        prompt: &str,
        images: &[PageImage],
        schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        let messages = if images.is_empty() {
            text_message(prompt)
        } else {
            vision_message(prompt, images)
        };
        self.call_tier(true, messages, schema).await
    }

    async fn extract_vision(
        &self,
        images: &[PageImage],
        prompt: &str,
        schema: &Value,
    ) -> Result<LlmReply, LlmError> {
        self.call_tier(true, vision_message(prompt, images), schema)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> SiteLedgerConfig {
        SiteLedgerConfig {
            llm_base_url: Some(server.uri()),
            llm_api_key: Some("test-key".into()),
            ..Default::default()
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 20 }
        })
    }

    fn any_object_schema() -> Value {
        json!({ "type": "object" })
    }

    #[tokio::test]
    async fn classify_small_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"account":"a1","confidence":88}"#)),
            )
            .mount(&server)
            .await;

        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let reply = gateway
            .classify_small("categorize: 2x4 lumber", &any_object_schema())
            .await
            .unwrap();
        assert_eq!(reply.value["account"], "a1");
        assert_eq!(reply.usage.total(), 120);
    }

    #[tokio::test]
    async fn fenced_output_is_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("```json\n{\"ok\":true}\n```")),
            )
            .mount(&server)
            .await;

        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let reply = gateway
            .classify_small("x", &any_object_schema())
            .await
            .unwrap();
        assert_eq!(reply.value["ok"], true);
    }

    #[tokio::test]
    async fn schema_mismatch_is_invalid_response_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(r#"{"other": 1}"#)),
            )
            .expect(1) // exactly one call: invalid_response is never retried
            .mount(&server)
            .await;

        let schema = json!({
            "type": "object",
            "required": ["account"],
            "properties": { "account": { "type": "string" } }
        });
        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let err = gateway.classify_small("x", &schema).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn rate_limited_retries_once_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(r#"{"ok":true}"#)),
            )
            .mount(&server)
            .await;

        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let reply = gateway
            .classify_small("x", &any_object_schema())
            .await
            .unwrap();
        assert_eq!(reply.value["ok"], true);
    }

    #[tokio::test]
    async fn persistent_rate_limit_fails_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2) // first call plus exactly one retry
            .mount(&server)
            .await;

        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let err = gateway
            .classify_small("x", &any_object_schema())
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::RateLimited);
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let gateway = HttpGateway::from_config(&config_for(&server)).unwrap();
        let err = gateway
            .classify_small("x", &any_object_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Upstream(_)));
    }

    #[tokio::test]
    async fn heavy_tier_meters_token_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body(r#"{"ok":true}"#)),
            )
            .mount(&server)
            .await;

        let config = SiteLedgerConfig {
            large_tier_token_budget: 150,
            ..config_for(&server)
        };
        let gateway = HttpGateway::from_config(&config).unwrap();
        gateway
            .analyze_large("x", &[], &any_object_schema())
            .await
            .unwrap();
        // 120 tokens consumed out of 150.
        assert_eq!(gateway.large_budget_remaining(), 30);
        gateway
            .analyze_large("x", &[], &any_object_schema())
            .await
            .unwrap();
        assert_eq!(gateway.large_budget_remaining(), 0);
        // Budget exhausted: the next heavy call is rate limited.
        let err = gateway
            .analyze_large("x", &[], &any_object_schema())
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::RateLimited);
    }

    #[tokio::test]
    async fn from_config_requires_credentials() {
        let config = SiteLedgerConfig::default();
        assert!(HttpGateway::from_config(&config).is_err());
    }

    #[test]
    fn vision_message_embeds_data_urls() {
        let images = vec![PageImage {
            bytes: vec![1, 2, 3],
            mime: "image/png".into(),
        }];
        let messages = vision_message("read this", &images);
        let content = &messages[0]["content"];
        assert_eq!(content[0]["text"], "read this");
        let url = content[1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
