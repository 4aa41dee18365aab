// SPDX-License-Identifier: MIT OR Apache-2.0
//! The receipt-processing agent.
//!
//! A thin adapter over the intake service. The receipt-flow dialog is a
//! per-channel finite state machine: awaiting_file → extracting →
//! awaiting_fields → creating → done | failed.

use crate::{Agent, AgentEvent, AgentKind, AgentReply, FunctionSpec};
use async_trait::async_trait;
use serde_json::Value;
use sl_categorize::AccountRef;
use sl_chat::MessageBlock;
use sl_core::{ChannelKey, IntakeId, IntakeStatus, Money};
use sl_error::{CoreError, CoreResult};
use sl_intake::IntakeService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Dialog states of the receipt flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptFlowState {
    /// Waiting for an upload.
    AwaitingFile,
    /// OCR is running.
    Extracting,
    /// OCR finished but fields are missing or weak.
    AwaitingFields,
    /// Expenses are being created.
    Creating,
    /// The flow finished with a linked intake.
    Done,
    /// The flow failed terminally.
    Failed,
}

/// The agent.
pub struct ReceiptAgent {
    service: Arc<IntakeService>,
    accounts: Vec<AccountRef>,
    /// Per-channel dialog state.
    flows: Mutex<HashMap<ChannelKey, ReceiptFlowState>>,
}

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec {
        name: "process_receipt",
        description: "run OCR and create expenses for an uploaded receipt (intake_id, stage)",
    },
    FunctionSpec {
        name: "answer_missing_field",
        description: "supply a missing receipt field (intake_id, field, value)",
    },
    FunctionSpec {
        name: "reject_intake",
        description: "reject a receipt that should not become expenses (intake_id, reason)",
    },
];

impl ReceiptAgent {
    /// Create the agent over the intake service and account catalog.
    #[must_use]
    pub fn new(service: Arc<IntakeService>, accounts: Vec<AccountRef>) -> Self {
        Self {
            service,
            accounts,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// The dialog state for a channel.
    pub async fn flow_state(&self, channel: &ChannelKey) -> ReceiptFlowState {
        self.flows
            .lock()
            .await
            .get(channel)
            .copied()
            .unwrap_or(ReceiptFlowState::AwaitingFile)
    }

    async fn set_flow(&self, channel: &ChannelKey, state: ReceiptFlowState) {
        self.flows.lock().await.insert(channel.clone(), state);
    }

    async fn process_receipt(&self, arguments: &Value, event: &AgentEvent) -> CoreResult<AgentReply> {
        let intake_id = arg_intake(arguments)?;
        let stage = arguments
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or("general");

        self.set_flow(&event.channel, ReceiptFlowState::Extracting).await;
        let record = match self.service.process(event.user, intake_id, stage).await {
            Ok(record) => record,
            Err(err) => {
                self.set_flow(&event.channel, ReceiptFlowState::Failed).await;
                return Err(err);
            }
        };

        match record.status {
            IntakeStatus::Duplicate => {
                self.set_flow(&event.channel, ReceiptFlowState::Done).await;
                return Ok(AgentReply::text(
                    "That receipt was already uploaded; nothing new to book.",
                ));
            }
            IntakeStatus::Error => {
                self.set_flow(&event.channel, ReceiptFlowState::Failed).await;
                return Ok(AgentReply::text(
                    "I could not read that file. Try a clearer photo or the original PDF.",
                ));
            }
            IntakeStatus::CheckReview => {
                self.set_flow(&event.channel, ReceiptFlowState::AwaitingFields)
                    .await;
                return Ok(AgentReply {
                    text: format!(
                        "I read the receipt but need a human check: {}",
                        record.status_reason.as_deref().unwrap_or("low confidence")
                    ),
                    blocks: vec![receipt_block(&record)],
                });
            }
            _ => {}
        }

        self.set_flow(&event.channel, ReceiptFlowState::Creating).await;
        let outcome = self
            .service
            .create_expenses(event.user, intake_id, stage, &self.accounts, &[])
            .await?;
        if outcome.created.is_empty() {
            self.set_flow(&event.channel, ReceiptFlowState::Failed).await;
            return Ok(AgentReply::text(
                "I could not turn any line of that receipt into an expense.",
            ));
        }
        self.set_flow(&event.channel, ReceiptFlowState::Done).await;
        let mut text = format!("Booked {} expense(s)", outcome.created.len());
        if outcome.skipped > 0 {
            text.push_str(&format!(", skipped {}", outcome.skipped));
        }
        text.push('.');
        Ok(AgentReply {
            text,
            blocks: vec![receipt_block(&outcome.intake)],
        })
    }

    async fn answer_missing_field(
        &self,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        let intake_id = arg_intake(arguments)?;
        let field = arguments
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::validation("missing argument: field"))?;
        let value = arguments
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::validation("missing argument: value"))?;

        let record = self.service.queue().get(event.user, intake_id).await?;
        let mut parsed = record
            .parsed
            .ok_or_else(|| CoreError::business_rule("intake has no parsed receipt yet"))?;
        match field {
            "vendor" => parsed.vendor = Some(value.to_string()),
            "date" => {
                parsed.date = Some(value.parse().map_err(|_| {
                    CoreError::validation("date must be ISO-8601 (YYYY-MM-DD)")
                })?);
            }
            "total" => {
                parsed.total = Some(
                    Money::parse(value)
                        .map_err(|e| CoreError::validation(e.to_string()))?,
                );
            }
            other => {
                return Err(CoreError::validation(format!(
                    "unknown receipt field: {other}"
                )));
            }
        }
        self.service.queue().attach_parse(intake_id, parsed, None).await?;
        self.set_flow(&event.channel, ReceiptFlowState::AwaitingFields)
            .await;
        Ok(AgentReply::text(format!(
            "Recorded {field}. Say \"process it\" when everything looks right."
        )))
    }

    async fn reject_intake(&self, arguments: &Value, event: &AgentEvent) -> CoreResult<AgentReply> {
        let intake_id = arg_intake(arguments)?;
        let reason = arguments
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("rejected from chat")
            .to_string();
        self.service
            .queue()
            .mark_rejected(event.user, intake_id, reason)
            .await?;
        self.set_flow(&event.channel, ReceiptFlowState::Done).await;
        Ok(AgentReply::text("Receipt rejected; nothing was booked."))
    }
}

fn arg_intake(arguments: &Value) -> CoreResult<IntakeId> {
    arguments
        .get("intake_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CoreError::validation("missing or malformed argument: intake_id"))
}

fn receipt_block(record: &sl_core::IntakeRecord) -> MessageBlock {
    let parsed = record.parsed.as_ref();
    MessageBlock::Receipt {
        intake_id: record.id,
        vendor: parsed.and_then(|p| p.vendor.clone()),
        total: parsed.and_then(|p| p.total).map(|t| t.to_string()),
        line_count: parsed.map(|p| p.line_items.len()).unwrap_or(0),
    }
}

#[async_trait]
impl Agent for ReceiptAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Receipt
    }

    fn persona(&self) -> &'static str {
        "[receipts]"
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        FUNCTIONS
    }

    async fn call(
        &self,
        function: &str,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        match function {
            "process_receipt" => self.process_receipt(arguments, event).await,
            "answer_missing_field" => self.answer_missing_field(arguments, event).await,
            "reject_intake" => self.reject_intake(arguments, event).await,
            other => Err(CoreError::validation(format!("unknown function {other}"))),
        }
    }
}
