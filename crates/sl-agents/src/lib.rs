// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-agents
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The authorization agent.
pub mod auth_agent;
/// The general chat agent.
pub mod chat_agent;
/// The dispatcher and cooldown map.
pub mod dispatcher;
/// The receipt-processing agent.
pub mod receipt_agent;

pub use auth_agent::AuthorizationAgent;
pub use chat_agent::ChatAgent;
pub use dispatcher::{AgentDispatcher, CooldownMap, DispatchOutcome};
pub use receipt_agent::{ReceiptAgent, ReceiptFlowState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sl_chat::MessageBlock;
use sl_core::{ChannelKey, UserId};
use sl_error::CoreResult;
use std::fmt;

// ---------------------------------------------------------------------------
// Agent vocabulary
// ---------------------------------------------------------------------------

/// The closed set of agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Receipt-processing agent.
    Receipt,
    /// Authorization agent.
    Authorization,
    /// General read-only chat agent.
    Chat,
}

impl AgentKind {
    /// Stable agent name, also the bot author identity.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Receipt => "receipt-agent",
            Self::Authorization => "authorization-agent",
            Self::Chat => "chat-agent",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of an agent's capability table.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    /// Function name.
    pub name: &'static str,
    /// One-line description shown to the router model.
    pub description: &'static str,
}

/// An inbound chat event addressed to an agent.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    /// The speaking user.
    pub user: UserId,
    /// The channel the event arrived on.
    pub channel: ChannelKey,
    /// The agent addressed (from the mention).
    pub target: AgentKind,
    /// The message text.
    pub text: String,
    /// When the event arrived.
    pub at: DateTime<Utc>,
}

/// What an agent produced for the user.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    /// Plain-text reply.
    pub text: String,
    /// Rendered blocks (cards, buttons, receipt blocks).
    pub blocks: Vec<MessageBlock>,
}

impl AgentReply {
    /// A plain-text reply.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blocks: Vec::new(),
        }
    }
}

/// Implemented by every agent. Agents never bypass the core component
/// APIs; they are consumers.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Which agent this is.
    fn kind(&self) -> AgentKind;

    /// The persona line wrapped around free-chat replies.
    fn persona(&self) -> &'static str;

    /// The closed capability table.
    fn functions(&self) -> &'static [FunctionSpec];

    /// Execute a capability. Unknown names must be rejected, not guessed.
    async fn call(
        &self,
        function: &str,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply>;
}

/// Whether `function` appears in an agent's capability table.
#[must_use]
pub fn function_allowed(agent: &dyn Agent, function: &str) -> bool {
    agent.functions().iter().any(|f| f.name == function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_names_are_stable() {
        assert_eq!(AgentKind::Receipt.name(), "receipt-agent");
        assert_eq!(AgentKind::Authorization.name(), "authorization-agent");
        assert_eq!(AgentKind::Chat.name(), "chat-agent");
    }

    #[test]
    fn agent_kind_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentKind::Authorization).unwrap(),
            "\"authorization\""
        );
    }
}
