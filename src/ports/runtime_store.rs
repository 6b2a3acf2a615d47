//! Runtime key/value store port.
//!
//! The host persists everything this crate needs durably through a single
//! key/value interface. This port is the seam: `IdentityRegistry`,
//! `CAStore` and `ConnectivityShadowMachine` all go through it rather
//! than touching a filesystem or database directly.

use async_trait::async_trait;
use thiserror::Error;

/// Port for durable key/value persistence. Keys are `.`-segmented
/// logical paths (e.g. `runtime.caPassphrase`, `runtime.things.<name>`).
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Write a value, replacing any existing entry at `key`.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Read a value, or `None` if `key` is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a value. A no-op (not an error) if `key` is absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys with the given prefix, e.g. `runtime.things.` to
    /// enumerate every persisted Thing record.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Runtime store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying backend failed (I/O, serialization, etc).
    #[error("runtime store backend error: {0}")]
    Backend(String),
}
