// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sl-intake
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The blob-storage seam.
pub mod blob;
/// The intake queue and state machine.
pub mod queue;
/// The composed ingest service.
pub mod service;

pub use blob::{BlobStore, InMemoryBlobStore};
pub use queue::{IntakeQueue, UploadRequest};
pub use service::{
    CreationOutcome, InMemoryVendorResolver, IntakeService, SkipReason, VendorResolver,
};
