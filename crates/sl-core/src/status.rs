// SPDX-License-Identifier: MIT OR Apache-2.0
//! Status enums and their transition tables.
//!
//! Transition validity lives here, next to the enums, so every component
//! (store, intake queue, auto-auth engine, HTTP layer) enforces the same
//! rules.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ExpenseStatus
// ---------------------------------------------------------------------------

/// Authorization state of a ledger expense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved for the ledger; carries the authorizer's identity.
    Authorized,
    /// Held for human review; carries a reason.
    Review,
}

impl ExpenseStatus {
    /// Statuses reachable from `self` in one step.
    ///
    /// `authorized → pending` is deliberately absent: it would lose the
    /// authorizer trail.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [ExpenseStatus] {
        match self {
            Self::Pending => &[Self::Authorized, Self::Review],
            Self::Authorized => &[Self::Review],
            Self::Review => &[Self::Authorized, Self::Pending],
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: ExpenseStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// IntakeStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a receipt intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStatus {
    /// Uploaded, not yet picked up by OCR.
    Pending,
    /// OCR in progress.
    Processing,
    /// OCR succeeded; awaiting expense creation.
    Ready,
    /// Expenses were created from this intake.
    Linked,
    /// Rejected as a duplicate upload before processing began.
    Duplicate,
    /// OCR produced totals but confidence requires a human check.
    CheckReview,
    /// Rejected by a user or operator.
    Rejected,
    /// OCR failed.
    Error,
}

impl IntakeStatus {
    /// Whether this status ends the intake's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Linked | Self::Rejected | Self::Duplicate | Self::Error
        )
    }

    /// Statuses reachable from `self` in one step.
    ///
    /// Any non-terminal state may be manually rejected.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [IntakeStatus] {
        match self {
            Self::Pending => &[Self::Processing, Self::Rejected],
            Self::Processing => &[
                Self::Ready,
                Self::CheckReview,
                Self::Duplicate,
                Self::Error,
                Self::Rejected,
            ],
            Self::Ready => &[Self::Linked, Self::Rejected],
            Self::CheckReview => &[Self::Ready, Self::Linked, Self::Rejected],
            Self::Linked | Self::Rejected | Self::Duplicate | Self::Error => &[],
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: IntakeStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Linked => "linked",
            Self::Duplicate => "duplicate",
            Self::CheckReview => "check_review",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for IntakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CategorizationSource
// ---------------------------------------------------------------------------

/// Which tier of the categorization cascade produced an account assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationSource {
    /// Content-addressed cache hit.
    Cache,
    /// Vendor-account affinity dominance.
    Affinity,
    /// ML classifier prediction.
    Ml,
    /// Small-model LLM call.
    LlmSmall,
    /// Large-model LLM call.
    LlmLarge,
    /// Assigned by a human.
    Manual,
}

impl CategorizationSource {
    /// Whether this source counts as human-verified for classifier training.
    #[must_use]
    pub fn is_human_verified(&self) -> bool {
        matches!(self, Self::Manual | Self::Cache)
    }

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Affinity => "affinity",
            Self::Ml => "ml",
            Self::LlmSmall => "llm_small",
            Self::LlmLarge => "llm_large",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CategorizationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
