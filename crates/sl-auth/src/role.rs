// SPDX-License-Identifier: MIT OR Apache-2.0
//! Roles and the capability vocabulary.
//!
//! Capabilities are exact (module, action) pairs — no wildcards, no glob
//! patterns. The tables below are the single authority for what each role
//! may do.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A module a capability applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    /// The expense ledger.
    Expenses,
    /// Receipt intakes.
    Receipts,
    /// The auto-authorization engine.
    AutoAuth,
    /// Chat channels and messages.
    Messages,
    /// Auth reports and decision records.
    Reports,
}

/// An action within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read rows, including financial detail.
    Read,
    /// Create new rows.
    Create,
    /// Update existing rows.
    Update,
    /// Change authorization state.
    Authorize,
    /// Soft-delete rows.
    Delete,
}

/// A (module, action) capability pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    /// The module.
    pub module: Module,
    /// The action.
    pub action: Action,
}

impl Capability {
    /// Construct a capability pair.
    #[must_use]
    pub const fn new(module: Module, action: Action) -> Self {
        Self { module, action }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{:?}", self.module, self.action)
    }
}

/// The closed set of roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full access.
    Admin,
    /// Ledger maintenance; edits to authorized expenses trigger review.
    Bookkeeper,
    /// Field staff: uploads receipts, reads own project data.
    Field,
    /// The auto-authorization engine's identity.
    Bot,
}

impl Role {
    /// The capability table for this role.
    #[must_use]
    pub fn capabilities(&self) -> &'static [Capability] {
        use Action::*;
        use Module::*;
        const ADMIN: &[Capability] = &[
            Capability::new(Expenses, Read),
            Capability::new(Expenses, Create),
            Capability::new(Expenses, Update),
            Capability::new(Expenses, Authorize),
            Capability::new(Expenses, Delete),
            Capability::new(Receipts, Read),
            Capability::new(Receipts, Create),
            Capability::new(Receipts, Update),
            Capability::new(AutoAuth, Read),
            Capability::new(AutoAuth, Create),
            Capability::new(Messages, Read),
            Capability::new(Messages, Create),
            Capability::new(Reports, Read),
        ];
        const BOOKKEEPER: &[Capability] = &[
            Capability::new(Expenses, Read),
            Capability::new(Expenses, Create),
            Capability::new(Expenses, Update),
            Capability::new(Expenses, Delete),
            Capability::new(Receipts, Read),
            Capability::new(Receipts, Update),
            Capability::new(Messages, Read),
            Capability::new(Messages, Create),
            Capability::new(Reports, Read),
        ];
        const FIELD: &[Capability] = &[
            Capability::new(Expenses, Read),
            Capability::new(Receipts, Read),
            Capability::new(Receipts, Create),
            Capability::new(Messages, Read),
            Capability::new(Messages, Create),
        ];
        const BOT: &[Capability] = &[
            Capability::new(Expenses, Read),
            Capability::new(Expenses, Create),
            Capability::new(Expenses, Update),
            Capability::new(Expenses, Authorize),
            Capability::new(Receipts, Read),
            Capability::new(Receipts, Update),
            Capability::new(AutoAuth, Read),
            Capability::new(AutoAuth, Create),
            Capability::new(Messages, Create),
            Capability::new(Reports, Read),
        ];
        match self {
            Role::Admin => ADMIN,
            Role::Bookkeeper => BOOKKEEPER,
            Role::Field => FIELD,
            Role::Bot => BOT,
        }
    }

    /// Whether this role holds the given capability.
    #[must_use]
    pub fn allows(&self, module: Module, action: Action) -> bool {
        self.capabilities()
            .contains(&Capability::new(module, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_can_authorize() {
        assert!(Role::Admin.allows(Module::Expenses, Action::Authorize));
    }

    #[test]
    fn bookkeeper_cannot_authorize() {
        assert!(!Role::Bookkeeper.allows(Module::Expenses, Action::Authorize));
        assert!(Role::Bookkeeper.allows(Module::Expenses, Action::Update));
    }

    #[test]
    fn field_is_read_mostly() {
        assert!(Role::Field.allows(Module::Receipts, Action::Create));
        assert!(!Role::Field.allows(Module::Expenses, Action::Create));
        assert!(!Role::Field.allows(Module::Expenses, Action::Delete));
    }

    #[test]
    fn bot_can_run_auto_auth() {
        assert!(Role::Bot.allows(Module::AutoAuth, Action::Create));
        assert!(Role::Bot.allows(Module::Expenses, Action::Authorize));
        assert!(!Role::Bot.allows(Module::Expenses, Action::Delete));
    }

    #[test]
    fn capability_display() {
        let cap = Capability::new(Module::Expenses, Action::Read);
        assert_eq!(cap.to_string(), "Expenses.Read");
    }

    #[test]
    fn role_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::Bookkeeper).unwrap(),
            "\"bookkeeper\""
        );
    }
}
