// SPDX-License-Identifier: MIT OR Apache-2.0
//! The authorization agent.
//!
//! A thin adapter over the auto-auth engine: run it, explain its decisions,
//! and prompt for missing information.

use crate::{Agent, AgentEvent, AgentKind, AgentReply, FunctionSpec};
use async_trait::async_trait;
use serde_json::Value;
use sl_autoauth::AutoAuthEngine;
use sl_chat::{MessageBlock, MessageButton};
use sl_core::{ExpenseId, ProjectId};
use sl_error::{CoreError, CoreResult};
use std::sync::Arc;
use uuid::Uuid;

/// The agent.
pub struct AuthorizationAgent {
    engine: Arc<AutoAuthEngine>,
}

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec {
        name: "run_auto_auth",
        description: "run the auto-authorization engine for a project (project)",
    },
    FunctionSpec {
        name: "explain_decision",
        description: "explain the engine's latest decision for an expense (expense_id)",
    },
    FunctionSpec {
        name: "request_missing_info",
        description: "ask the channel for missing expense fields (expense_id, fields)",
    },
];

impl AuthorizationAgent {
    /// Create the agent over the engine.
    #[must_use]
    pub fn new(engine: Arc<AutoAuthEngine>) -> Self {
        Self { engine }
    }

    async fn run_auto_auth(&self, arguments: &Value) -> CoreResult<AgentReply> {
        let project: ProjectId = arguments
            .get("project")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CoreError::validation("missing or malformed argument: project"))?;
        let report = self.engine.run(project, None, Uuid::new_v4()).await?;
        Ok(AgentReply {
            text: format!(
                "Scanned {} pending expense(s): {} authorized, {} flagged as duplicates, \
                 {} missing info, {} escalated.",
                report.scanned,
                report.count(sl_autoauth::Decision::Authorized),
                report.count(sl_autoauth::Decision::Duplicate),
                report.count(sl_autoauth::Decision::MissingInfo),
                report.count(sl_autoauth::Decision::Escalated),
            ),
            blocks: vec![MessageBlock::Card {
                title: "Auto-authorization run".into(),
                body: format!("report {}", report.id),
                buttons: vec![MessageButton {
                    label: "View report".into(),
                    action: "open_report".into(),
                    value: report.id.to_string(),
                }],
            }],
        })
    }

    async fn explain_decision(&self, arguments: &Value) -> CoreResult<AgentReply> {
        let expense: ExpenseId = arguments
            .get("expense_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CoreError::validation("missing or malformed argument: expense_id"))?;
        match self.engine.explain(expense).await {
            Some(decision) => Ok(AgentReply::text(format!(
                "{}: {:?} — {}",
                decision.rule, decision.decision, decision.reason
            ))),
            None => Ok(AgentReply::text(
                "The engine has not decided on that expense yet.",
            )),
        }
    }

    fn request_missing_info(&self, arguments: &Value) -> CoreResult<AgentReply> {
        let expense = arguments
            .get("expense_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::validation("missing argument: expense_id"))?;
        let fields: Vec<String> = arguments
            .get("fields")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if fields.is_empty() {
            return Err(CoreError::validation("fields must name at least one field"));
        }
        Ok(AgentReply {
            text: format!(
                "Expense {expense} needs: {}. Reply with the values to continue.",
                fields.join(", ")
            ),
            blocks: vec![MessageBlock::Card {
                title: "Missing information".into(),
                body: fields.join(", "),
                buttons: fields
                    .iter()
                    .map(|field| MessageButton {
                        label: format!("Provide {field}"),
                        action: "provide_field".into(),
                        value: format!("{expense}:{field}"),
                    })
                    .collect(),
            }],
        })
    }
}

#[async_trait]
impl Agent for AuthorizationAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Authorization
    }

    fn persona(&self) -> &'static str {
        "[authorizations]"
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        FUNCTIONS
    }

    async fn call(
        &self,
        function: &str,
        arguments: &Value,
        _event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        match function {
            "run_auto_auth" => self.run_auto_auth(arguments).await,
            "explain_decision" => self.explain_decision(arguments).await,
            "request_missing_info" => self.request_missing_info(arguments),
            other => Err(CoreError::validation(format!("unknown function {other}"))),
        }
    }
}
