// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-chat
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sl_auth::{Action, CapabilityGate, Module};
use sl_core::{ChannelKey, IntakeId, MessageId, UserId};
use sl_error::{CoreError, CoreResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Author {
    /// A human user.
    User {
        /// The user id.
        id: UserId,
    },
    /// A bot identity (agents, the auto-auth engine).
    Bot {
        /// Stable bot name, e.g. `"authorization-agent"`.
        name: String,
    },
}

/// An actionable button rendered under a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageButton {
    /// Button label.
    pub label: String,
    /// Action identifier posted back on click.
    pub action: String,
    /// Opaque value carried with the action.
    pub value: String,
}

/// A rendered content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBlock {
    /// Plain text.
    Text {
        /// The text body.
        body: String,
    },
    /// A card with optional buttons.
    Card {
        /// Card title.
        title: String,
        /// Card body.
        body: String,
        /// Buttons, in render order.
        #[serde(default)]
        buttons: Vec<MessageButton>,
    },
    /// A receipt summary block.
    Receipt {
        /// The intake the block renders.
        intake_id: IntakeId,
        /// Vendor line.
        vendor: Option<String>,
        /// Total line, already formatted.
        total: Option<String>,
        /// Number of extracted items.
        line_count: usize,
    },
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// The channel it was posted to.
    pub channel: ChannelKey,
    /// Author (user or bot).
    pub author: Author,
    /// Plain-text body.
    pub body: String,
    /// Rendered blocks.
    pub blocks: Vec<MessageBlock>,
    /// Structured metadata (receipt id, flow state, run id).
    pub metadata: serde_json::Value,
    /// Mentioned users.
    pub mentions: Vec<UserId>,
    /// Threaded reply target.
    pub reply_to: Option<MessageId>,
    /// Reactions: emoji → reacting users.
    pub reactions: BTreeMap<String, Vec<UserId>>,
    /// Soft-deletion flag. Deleted rows never count toward unread totals.
    pub deleted: bool,
    /// When the message was posted.
    pub created_at: DateTime<Utc>,
}

/// Unread count for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    /// The channel.
    pub channel_key: ChannelKey,
    /// Messages after the user's read mark.
    pub count: usize,
}

// ---------------------------------------------------------------------------
// Push fan-out
// ---------------------------------------------------------------------------

/// Fire-and-forget push notifications; delivery is never awaited on the
/// message path's success.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Notify a user. Failures are logged by the caller, not surfaced.
    async fn notify(&self, user: UserId, title: &str, body: &str) -> CoreResult<()>;
}

/// Discards notifications.
#[derive(Debug, Default)]
pub struct NoopPushNotifier;

#[async_trait]
impl PushNotifier for NoopPushNotifier {
    async fn notify(&self, _user: UserId, _title: &str, _body: &str) -> CoreResult<()> {
        Ok(())
    }
}

/// Records notifications for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingPushNotifier {
    sent: std::sync::Mutex<Vec<(UserId, String)>>,
}

impl RecordingPushNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications recorded so far as (user, title).
    #[must_use]
    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl PushNotifier for RecordingPushNotifier {
    async fn notify(&self, user: UserId, title: &str, _body: &str) -> CoreResult<()> {
        self.sent
            .lock()
            .expect("notifier lock poisoned")
            .push((user, title.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MessageHub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HubState {
    messages: Vec<Message>,
    /// (user, channel) → read-up-to timestamp.
    read_marks: HashMap<(UserId, ChannelKey), DateTime<Utc>>,
}

/// The message store and fan-out point. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageHub {
    gate: Arc<CapabilityGate>,
    notifier: Arc<dyn PushNotifier>,
    state: Arc<RwLock<HubState>>,
}

/// Input for posting a message.
pub struct PostMessage {
    /// Target channel.
    pub channel: ChannelKey,
    /// Author.
    pub author: Author,
    /// Plain-text body.
    pub body: String,
    /// Rendered blocks.
    pub blocks: Vec<MessageBlock>,
    /// Structured metadata.
    pub metadata: serde_json::Value,
    /// Mentioned users to notify.
    pub mentions: Vec<UserId>,
    /// Threaded reply target.
    pub reply_to: Option<MessageId>,
}

impl MessageHub {
    /// Create a hub over the given notifier.
    #[must_use]
    pub fn new(gate: Arc<CapabilityGate>, notifier: Arc<dyn PushNotifier>) -> Self {
        Self {
            gate,
            notifier,
            state: Arc::new(RwLock::new(HubState::default())),
        }
    }

    /// Post a message.
    ///
    /// Human authors need `Messages.Create`; bot identities post freely.
    /// Mention notifications are fire-and-forget.
    pub async fn post(&self, input: PostMessage) -> CoreResult<Message> {
        if let Author::User { id } = input.author
            && !self
                .gate
                .capability(id, Module::Messages, Action::Create)
                .await
        {
            return Err(CoreError::unauthorized(format!(
                "user {id} lacks Messages.Create"
            )));
        }
        let message = Message {
            id: MessageId::new(),
            channel: input.channel,
            author: input.author,
            body: input.body,
            blocks: input.blocks,
            metadata: input.metadata,
            mentions: input.mentions.clone(),
            reply_to: input.reply_to,
            reactions: BTreeMap::new(),
            deleted: false,
            created_at: Utc::now(),
        };
        {
            let mut state = self.state.write().await;
            state.messages.push(message.clone());
        }

        for user in input.mentions {
            if let Err(err) = self
                .notifier
                .notify(user, "You were mentioned", &message.body)
                .await
            {
                warn!(user = %user, error = %err, "push notification failed");
            }
        }
        debug!(channel = %message.channel, "message posted");
        Ok(message)
    }

    /// Soft-delete a message.
    pub async fn soft_delete(&self, id: MessageId) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| CoreError::not_found("message", id))?;
        message.deleted = true;
        Ok(())
    }

    /// Add a reaction.
    pub async fn react(&self, id: MessageId, user: UserId, emoji: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| CoreError::not_found("message", id))?;
        let users = message.reactions.entry(emoji.to_string()).or_default();
        if !users.contains(&user) {
            users.push(user);
        }
        Ok(())
    }

    /// Recent non-deleted messages of a channel, oldest first.
    pub async fn recent(&self, channel: &ChannelKey, limit: usize) -> Vec<Message> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| &m.channel == channel && !m.deleted)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        if messages.len() > limit {
            messages.split_off(messages.len() - limit)
        } else {
            messages
        }
    }

    /// Replies to a message, oldest first.
    pub async fn thread(&self, root: MessageId) -> Vec<Message> {
        let state = self.state.read().await;
        let mut replies: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.reply_to == Some(root) && !m.deleted)
            .cloned()
            .collect();
        replies.sort_by_key(|m| (m.created_at, m.id));
        replies
    }

    /// Mark a channel read up to now for a user.
    pub async fn mark_read(&self, user: UserId, channel: ChannelKey) {
        let mut state = self.state.write().await;
        state.read_marks.insert((user, channel), Utc::now());
    }

    /// Unread counts per channel for a user.
    ///
    /// Requires `Messages.Read`. Soft-deleted messages and the user's own
    /// messages never count.
    pub async fn unread_counts(&self, user: UserId) -> CoreResult<Vec<UnreadCount>> {
        if !self
            .gate
            .capability(user, Module::Messages, Action::Read)
            .await
        {
            return Err(CoreError::unauthorized(format!(
                "user {user} lacks Messages.Read"
            )));
        }
        let state = self.state.read().await;
        let mut counts: BTreeMap<ChannelKey, usize> = BTreeMap::new();
        for message in &state.messages {
            if message.deleted {
                continue;
            }
            if message.author == (Author::User { id: user }) {
                continue;
            }
            let read_mark = state.read_marks.get(&(user, message.channel.clone()));
            let unread = match read_mark {
                Some(mark) => message.created_at > *mark,
                None => true,
            };
            if unread {
                *counts.entry(message.channel.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(channel_key, count)| UnreadCount { channel_key, count })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
