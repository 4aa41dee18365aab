// SPDX-License-Identifier: MIT OR Apache-2.0
//! The blob-storage seam.
//!
//! File storage is an external collaborator with a put/get-by-key
//! interface. Components hold blob keys, never buffers.

use async_trait::async_trait;
use sl_error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> CoreResult<()>;

    /// Fetch the bytes for a key.
    async fn get(&self, key: &str) -> CoreResult<Vec<u8>>;
}

/// In-memory blob store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> CoreResult<()> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::not_found("blob", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = InMemoryBlobStore::new();
        store.put("receipts/a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("receipts/a").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.kind, sl_error::ErrorKind::NotFound);
    }
}
