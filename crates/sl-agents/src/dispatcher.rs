// SPDX-License-Identifier: MIT OR Apache-2.0
//! The agent dispatcher — the sole entry point for chat-driven actions.
//!
//! Each inbound event is cooldown-checked per hashed (user, channel, agent)
//! key, routed through the small model against the target agent's function
//! catalog, executed, and posted back as a structured message. Cross-agent
//! forwards happen at most once per event.

use crate::{Agent, AgentEvent, AgentKind, AgentReply, function_allowed};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use sl_chat::{Author, MessageHub, PostMessage};
use sl_core::{ChannelKey, UserId};
use sl_error::{CoreError, CoreResult};
use sl_llm::LlmGateway;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Hard cap on cooldown entries; the oldest half is evicted when exceeded.
const COOLDOWN_CAP: usize = 200;

/// Messages of channel history given to the router as context.
const CONTEXT_MESSAGES: usize = 5;

// ---------------------------------------------------------------------------
// Cooldown map
// ---------------------------------------------------------------------------

/// A suppressed-event audit row. Keys are hashes; no PII lives in memory.
#[derive(Debug, Clone)]
pub struct SuppressionRow {
    /// The hashed (user, channel, agent) key.
    pub key_hash: String,
    /// When the suppression happened.
    pub at: DateTime<Utc>,
}

/// Bounded cooldown tracking per hashed (user, channel, agent) key.
pub struct CooldownMap {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
    suppressions: Mutex<Vec<SuppressionRow>>,
}

impl CooldownMap {
    /// Create a map with the given cooldown window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
            suppressions: Mutex::new(Vec::new()),
        }
    }

    /// Check and update the cooldown for an event key.
    ///
    /// Returns `true` when the event is suppressed (a prior event is still
    /// inside the window).
    pub async fn check_and_touch(&self, user: UserId, channel: &ChannelKey, agent: AgentKind) -> bool {
        let key = hash_key(user, channel, agent);
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some(last) = entries.get(&key)
            && now.duration_since(*last) < self.window
        {
            self.suppressions.lock().await.push(SuppressionRow {
                key_hash: key.clone(),
                at: Utc::now(),
            });
            debug!(key = %key, "event suppressed by cooldown");
            return true;
        }

        if entries.len() >= COOLDOWN_CAP {
            // Half-eviction by oldest last-use.
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (key, _) in by_age.into_iter().take(COOLDOWN_CAP / 2) {
                entries.remove(&key);
            }
        }
        entries.insert(key, now);
        false
    }

    /// Suppression audit rows recorded so far.
    pub async fn suppressions(&self) -> Vec<SuppressionRow> {
        self.suppressions.lock().await.clone()
    }

    /// Number of live cooldown entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn hash_key(user: UserId, channel: &ChannelKey, agent: AgentKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(agent.name().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// Dispatch outcome
// ---------------------------------------------------------------------------

/// What the dispatcher did with an event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The event was inside the cooldown window; nothing ran.
    Suppressed,
    /// The agent replied; the message was posted.
    Replied {
        /// The posted message id.
        message: sl_core::MessageId,
    },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes inbound events to agents.
pub struct AgentDispatcher {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
    gateway: Arc<dyn LlmGateway>,
    hub: MessageHub,
    cooldowns: CooldownMap,
}

impl AgentDispatcher {
    /// Create a dispatcher with the given cooldown window.
    #[must_use]
    pub fn new(gateway: Arc<dyn LlmGateway>, hub: MessageHub, cooldown: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            gateway,
            hub,
            cooldowns: CooldownMap::new(cooldown),
        }
    }

    /// Register an agent, replacing any previous one of the same kind.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.kind(), agent);
    }

    /// The cooldown map, for diagnostics and tests.
    #[must_use]
    pub fn cooldowns(&self) -> &CooldownMap {
        &self.cooldowns
    }

    /// Handle one inbound event end to end.
    pub async fn dispatch(&self, event: AgentEvent) -> CoreResult<DispatchOutcome> {
        if self
            .cooldowns
            .check_and_touch(event.user, &event.channel, event.target)
            .await
        {
            // No model call, no message.
            return Ok(DispatchOutcome::Suppressed);
        }

        let reply = self.route(&event, event.target, true).await?;
        let agent_name = event.target.name();
        let message = self
            .hub
            .post(PostMessage {
                channel: event.channel.clone(),
                author: Author::Bot {
                    name: agent_name.to_string(),
                },
                body: reply.text,
                blocks: reply.blocks,
                metadata: json!({ "agent": agent_name }),
                mentions: vec![],
                reply_to: None,
            })
            .await?;
        info!(agent = agent_name, channel = %event.channel, "agent reply posted");
        Ok(DispatchOutcome::Replied {
            message: message.id,
        })
    }

    /// Route an event to an agent; `allow_forward` guards cross-agent loops.
    async fn route(
        &self,
        event: &AgentEvent,
        target: AgentKind,
        allow_forward: bool,
    ) -> CoreResult<AgentReply> {
        let agent = self
            .agents
            .get(&target)
            .ok_or_else(|| CoreError::internal(format!("agent {target} not registered")))?;

        let context = self.hub.recent(&event.channel, CONTEXT_MESSAGES).await;
        let prompt = router_prompt(agent.as_ref(), event, &context);
        let decision = self
            .gateway
            .classify_small(&prompt, &router_schema())
            .await
            .map_err(CoreError::from)?;

        let action = decision.value["action"].as_str().unwrap_or("free_chat");
        match action {
            "function_call" => {
                let function = decision.value["function"].as_str().unwrap_or_default();
                if !function_allowed(agent.as_ref(), function) {
                    warn!(agent = %target, function, "routed to unknown function");
                    return Ok(AgentReply::text(format!(
                        "{} cannot do that ({function} is not one of its capabilities).",
                        agent.persona()
                    )));
                }
                let arguments = decision
                    .value
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                agent.call(function, &arguments, event).await
            }
            "cross_agent" if allow_forward => {
                let forwarded: AgentKind = decision
                    .value
                    .get("target")
                    .cloned()
                    .and_then(|t| serde_json::from_value(t).ok())
                    .unwrap_or(AgentKind::Chat);
                // One forward per event, never back again.
                Box::pin(self.route(event, forwarded, false)).await
            }
            "cross_agent" => {
                warn!("second cross-agent hop blocked");
                Ok(AgentReply::text(
                    "I could not route that request any further.".to_string(),
                ))
            }
            _ => {
                let ack = decision.value["ack_message"]
                    .as_str()
                    .unwrap_or("Happy to help.")
                    .to_string();
                Ok(AgentReply::text(format!("{} {}", agent.persona(), ack)))
            }
        }
    }
}

fn router_schema() -> Value {
    json!({
        "type": "object",
        "required": ["action"],
        "properties": {
            "action": { "type": "string", "enum": ["function_call", "free_chat", "cross_agent"] },
            "function": { "type": "string" },
            "arguments": { "type": "object" },
            "target": { "type": "string" },
            "ack_message": { "type": "string" }
        }
    })
}

fn router_prompt(agent: &dyn Agent, event: &AgentEvent, context: &[sl_chat::Message]) -> String {
    let mut prompt = format!(
        "You route construction-expense chat requests for the {} agent.\n",
        agent.kind()
    );
    prompt.push_str("Functions:\n");
    for function in agent.functions() {
        prompt.push_str(&format!("  {}: {}\n", function.name, function.description));
    }
    if !context.is_empty() {
        prompt.push_str("Recent channel messages:\n");
        for message in context {
            prompt.push_str(&format!("  {}\n", message.body));
        }
    }
    prompt.push_str(&format!("User message: {}\n", event.text));
    prompt.push_str(
        "Respond with JSON {\"action\": \"function_call\"|\"free_chat\"|\"cross_agent\", \
         \"function\"?, \"arguments\"?, \"target\"?, \"ack_message\"?}.",
    );
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
