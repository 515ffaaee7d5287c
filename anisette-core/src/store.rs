//! Secure identity store seam.
//!
//! The storage *mechanism* (keychain, encrypted file, platform keystore) is
//! supplied by the embedding application; the engine only consumes the
//! get/set contract below. Writes must be atomic with respect to concurrent
//! readers: a reader never observes a half-written value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Store key for the persistent 16-byte device identifier (base64 at rest).
pub const KEY_IDENTIFIER: &str = "identifier";

/// Store key for the opaque provisioning blob returned by a successful
/// handshake. Absence means the device is not yet provisioned.
pub const KEY_ADI_PB: &str = "adi_pb";

/// Store key for the recorded legacy-server consent list.
pub const KEY_TRUSTED_SERVERS: &str = "trusted_servers";

/// Errors surfaced by a [`SecureIdentityStore`] implementation or by the
/// typed accessors layered on top of it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed to read or write.
    #[error("store_backend: {0}")]
    Backend(String),
    /// A stored value exists but cannot be decoded.
    #[error("store_corrupted: {key}: {reason}")]
    Corrupted {
        /// The store key whose value failed to decode.
        key: String,
        /// Why decoding failed.
        reason: String,
    },
}

impl StoreError {
    /// Builds a [`StoreError::Backend`] from any displayable failure.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    pub(crate) fn corrupted(key: &str, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Durable key/value store holding the per-device secrets.
///
/// Implementations must make `set` atomic from the perspective of concurrent
/// `get` calls, and must persist across process restarts for the device
/// identity to be reused. Only one writer at a time may act on a given
/// device's store.
pub trait SecureIdentityStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removes the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`SecureIdentityStore`] for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureIdentityStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::backend("store mutex poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::backend("store mutex poisoned"))?;
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::backend("store mutex poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

/// Consent records for legacy (V1) servers, persisted in the secure store as
/// a JSON list of server addresses the user has explicitly trusted.
pub(crate) struct TrustedServers {
    store: Arc<dyn SecureIdentityStore>,
}

impl TrustedServers {
    pub(crate) fn new(store: Arc<dyn SecureIdentityStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<Vec<String>, StoreError> {
        let Some(bytes) = self.store.get(KEY_TRUSTED_SERVERS)? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::corrupted(KEY_TRUSTED_SERVERS, err.to_string()))
    }

    pub(crate) fn is_trusted(&self, address: &str) -> Result<bool, StoreError> {
        Ok(self.load()?.iter().any(|entry| entry == address))
    }

    pub(crate) fn record(&self, address: &str) -> Result<(), StoreError> {
        let mut servers = self.load()?;
        if servers.iter().any(|entry| entry == address) {
            return Ok(());
        }
        servers.push(address.to_string());
        let bytes = serde_json::to_vec(&servers)
            .map_err(|err| StoreError::backend(err.to_string()))?;
        self.store.set(KEY_TRUSTED_SERVERS, &bytes)
    }

    pub(crate) fn revoke(&self, address: &str) -> Result<(), StoreError> {
        let mut servers = self.load()?;
        servers.retain(|entry| entry != address);
        if servers.is_empty() {
            self.store.remove(KEY_TRUSTED_SERVERS)
        } else {
            let bytes = serde_json::to_vec(&servers)
                .map_err(|err| StoreError::backend(err.to_string()))?;
            self.store.set(KEY_TRUSTED_SERVERS, &bytes)
        }
    }
}
