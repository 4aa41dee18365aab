// SPDX-License-Identifier: MIT OR Apache-2.0
//! The general chat agent — read-only surfaces over the ledger.

use crate::{Agent, AgentEvent, AgentKind, AgentReply, FunctionSpec};
use async_trait::async_trait;
use serde_json::Value;
use sl_core::{ExpenseFilter, ExpenseStatus, PageRequest, ProjectId};
use sl_error::{CoreError, CoreResult};
use sl_store::{ExpenseStore, SummaryGroupBy};

/// The agent.
pub struct ChatAgent {
    store: ExpenseStore,
}

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec {
        name: "fetch_project_summary",
        description: "summarize a project's expenses by authorization state (project)",
    },
    FunctionSpec {
        name: "fetch_expense_list",
        description: "list recent expenses, optionally by project and status (project?, status?)",
    },
    FunctionSpec {
        name: "fetch_budget_status",
        description: "show authorized spend for a project (project)",
    },
];

impl ChatAgent {
    /// Create the agent over the store.
    #[must_use]
    pub fn new(store: ExpenseStore) -> Self {
        Self { store }
    }

    fn parse_project(arguments: &Value) -> CoreResult<ProjectId> {
        arguments
            .get("project")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CoreError::validation("missing or malformed argument: project"))
    }

    async fn fetch_project_summary(
        &self,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        let project = Self::parse_project(arguments)?;
        let report = self
            .store
            .summaries(
                event.user,
                &ExpenseFilter {
                    project: Some(project),
                    ..Default::default()
                },
                SummaryGroupBy::AuthorizationState,
            )
            .await?;
        if report.rows.is_empty() {
            return Ok(AgentReply::text("No expenses on that project yet."));
        }
        let lines: Vec<String> = report
            .rows
            .iter()
            .map(|row| format!("{}: {} expense(s), {}", row.key, row.count, row.total))
            .collect();
        Ok(AgentReply::text(lines.join("\n")))
    }

    async fn fetch_expense_list(
        &self,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        let filter = ExpenseFilter {
            project: arguments
                .get("project")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok()),
            status: arguments
                .get("status")
                .cloned()
                .and_then(|s| serde_json::from_value(s).ok()),
            ..Default::default()
        };
        let page = self
            .store
            .list(event.user, &filter, PageRequest::first(10))
            .await?;
        if page.items.is_empty() {
            return Ok(AgentReply::text("No matching expenses."));
        }
        let lines: Vec<String> = page
            .items
            .iter()
            .map(|e| format!("{} — {} ({})", e.description, e.amount, e.status))
            .collect();
        Ok(AgentReply::text(format!(
            "{} of {} matching expense(s):\n{}",
            page.items.len(),
            page.total,
            lines.join("\n")
        )))
    }

    async fn fetch_budget_status(
        &self,
        arguments: &Value,
        event: &AgentEvent,
    ) -> CoreResult<AgentReply> {
        let project = Self::parse_project(arguments)?;
        let authorized = self
            .store
            .sum_amounts(
                event.user,
                &ExpenseFilter {
                    project: Some(project),
                    status: Some(ExpenseStatus::Authorized),
                    ..Default::default()
                },
            )
            .await?;
        let pending = self
            .store
            .sum_amounts(
                event.user,
                &ExpenseFilter {
                    project: Some(project),
                    status: Some(ExpenseStatus::Pending),
                    ..Default::default()
                },
            )
            .await?;
        Ok(AgentReply::text(format!(
            "Authorized spend: {authorized}. Pending: {pending}."
        )))
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Chat
    }

    fn persona(&self) -> &'static str {
        "[siteledger]"
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
            "fetch_project_summary" => self.fetch_project_summary(arguments, event).await,
            "fetch_expense_list" => self.fetch_expense_list(arguments, event).await,
            "fetch_budget_status" => self.fetch_budget_status(arguments, event).await,
            other => Err(CoreError::validation(format!("unknown function {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use sl_auth::{CapabilityGate, InMemoryRoleProvider, Role};
    use sl_core::{ChannelKey, Money, NewExpense, UserId};
    use std::sync::Arc;

    fn setup() -> (ChatAgent, ExpenseStore, UserId, ProjectId) {
        let provider = Arc::new(InMemoryRoleProvider::new());
        let admin = UserId::new();
        provider.add_user(admin, "admin@x", "pw", Role::Admin);
        let gate = Arc::new(CapabilityGate::new(provider));
        let store = ExpenseStore::new(gate);
        (
            ChatAgent::new(store.clone()),
            store,
            admin,
            ProjectId::nil(),
        )
    }

    fn event(user: UserId) -> AgentEvent {
        AgentEvent {
            user,
            channel: ChannelKey::new("project", "p1"),
            target: AgentKind::Chat,
            text: "summary please".into(),
            at: Utc::now(),
        }
    }

    async fn seed(store: &ExpenseStore, admin: UserId, project: ProjectId) {
        for (description, cents) in [("lumber", 1_200), ("screws", 450)] {
            store
                .create(
                    admin,
                    NewExpense {
                        project,
                        transaction_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
                        amount: Money::from_cents(cents),
                        vendor: None,
                        account: None,
                        description: description.into(),
                        payment_method: None,
                        bill: None,
                        external_ref: None,
                        confidence: None,
                        categorization_source: None,
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn project_summary_lists_buckets() {
        let (agent, store, admin, project) = setup();
        seed(&store, admin, project).await;
        let reply = agent
            .call(
                "fetch_project_summary",
                &json!({ "project": project.to_string() }),
                &event(admin),
            )
            .await
            .unwrap();
        assert!(reply.text.contains("pending: 2 expense(s), 16.50"));
    }

    #[tokio::test]
    async fn expense_list_renders_lines() {
        let (agent, store, admin, project) = setup();
        seed(&store, admin, project).await;
        let reply = agent
            .call(
                "fetch_expense_list",
                &json!({ "project": project.to_string(), "status": "pending" }),
                &event(admin),
            )
            .await
            .unwrap();
        assert!(reply.text.contains("2 of 2"));
        assert!(reply.text.contains("lumber — 12.00 (pending)"));
    }

    #[tokio::test]
    async fn budget_status_sums_by_state() {
        let (agent, store, admin, project) = setup();
        seed(&store, admin, project).await;
        let reply = agent
            .call(
                "fetch_budget_status",
                &json!({ "project": project.to_string() }),
                &event(admin),
            )
            .await
            .unwrap();
        assert!(reply.text.contains("Pending: 16.50"));
        assert!(reply.text.contains("Authorized spend: 0.00"));
    }

    #[tokio::test]
    async fn empty_project_summary() {
        let (agent, _, admin, _) = setup();
        let reply = agent
            .call(
                "fetch_project_summary",
                &json!({ "project": ProjectId::new().to_string() }),
                &event(admin),
            )
            .await
            .unwrap();
        assert!(reply.text.contains("No expenses"));
    }
}
