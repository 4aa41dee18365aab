// SPDX-License-Identifier: MIT OR Apache-2.0
//! Opaque entity identifiers.
//!
//! Every identifier is a newtype over a UUID so that an expense id can never
//! be passed where a vendor id is expected. Master-data identifiers (users,
//! projects, vendors, accounts) are weak references — SiteLedger stores them
//! but never owns the referenced rows.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil identifier (all zeros). Useful as a sentinel in tests.
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id!(
    /// Identifier of a canonical ledger expense.
    ExpenseId
);
entity_id!(
    /// Identifier of a receipt intake in flight toward becoming expenses.
    IntakeId
);
entity_id!(
    /// Identifier of an acting user (weak reference to master data).
    UserId
);
entity_id!(
    /// Identifier of a construction project (weak reference).
    ProjectId
);
entity_id!(
    /// Identifier of a vendor (weak reference).
    VendorId
);
entity_id!(
    /// Identifier of a ledger account (weak reference).
    AccountId
);
entity_id!(
    /// Identifier of a payment method (weak reference).
    PaymentMethodId
);
entity_id!(
    /// Identifier of a bill record (weak reference).
    BillId
);
entity_id!(
    /// Identifier of an auto-authorization run report.
    ReportId
);
entity_id!(
    /// Identifier of a chat message.
    MessageId
);
entity_id!(
    /// Identifier of a background job.
    JobId
);
entity_id!(
    /// Identifier of an upload batch.
    BatchId
);

// ---------------------------------------------------------------------------
// ChannelKey
// ---------------------------------------------------------------------------

/// A synthetic chat-channel address of the form `type:scope_id`.
///
/// The type segment names the kind of conversation (e.g. `project`,
/// `intake`), the scope segment addresses the entity it is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Build a channel key from its two segments.
    #[must_use]
    pub fn new(kind: &str, scope: impl fmt::Display) -> Self {
        Self(format!("{kind}:{scope}"))
    }

    /// Parse a raw `type:scope_id` string, rejecting keys without the
    /// separator or with an empty segment.
    pub fn parse(raw: &str) -> Result<Self, ChannelKeyError> {
        match raw.split_once(':') {
            Some((kind, scope)) if !kind.is_empty() && !scope.is_empty() => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(ChannelKeyError::Malformed(raw.to_string())),
        }
    }

    /// The `type` segment.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map(|(k, _)| k).unwrap_or_default()
    }

    /// The `scope_id` segment.
    #[must_use]
    pub fn scope(&self) -> &str {
        self.0.split_once(':').map(|(_, s)| s).unwrap_or_default()
    }

    /// The raw `type:scope_id` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from [`ChannelKey::parse`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelKeyError {
    /// The raw string is not of the form `type:scope_id`.
    #[error("malformed channel key: {0:?}")]
    Malformed(String),
}
