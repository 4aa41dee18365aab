// SPDX-License-Identifier: MIT OR Apache-2.0
//! Facade crate re-exporting the SiteLedger workspace.
//!
//! Most integrations depend on the individual `sl-*` crates; this crate
//! exists for the workspace-level integration tests and for consumers that
//! want the whole pipeline under one name.
#![deny(unsafe_code)]

pub use sl_agents as agents;
pub use sl_auth as auth;
pub use sl_autoauth as autoauth;
pub use sl_categorize as categorize;
pub use sl_chat as chat;
pub use sl_config as config;
pub use sl_core as core;
pub use sl_daemon as daemon;
pub use sl_error as error;
pub use sl_intake as intake;
pub use sl_jobs as jobs;
pub use sl_llm as llm;
pub use sl_ocr as ocr;
pub use sl_reconcile as reconcile;
pub use sl_store as store;
pub use sl_telemetry as telemetry;
