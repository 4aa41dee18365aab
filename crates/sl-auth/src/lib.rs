// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-auth
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Capability gate and role capability tables.
pub mod gate;
/// Role and capability vocabulary.
pub mod role;
/// Bearer-token issuing and validation.
pub mod token;

pub use gate::{CapabilityGate, InMemoryRoleProvider, LoginResponse, RoleProvider};
pub use role::{Action, Capability, Module, Role};
pub use token::{TokenError, TokenValidator};
