//! Persistent per-device identity and its derived header values.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::{SecureIdentityStore, StoreError, KEY_ADI_PB, KEY_IDENTIFIER};

/// Length of the raw device identifier.
pub const IDENTIFIER_LEN: usize = 16;

/// The persistent device identity: 16 secure-random bytes generated once per
/// installation and reused forever.
///
/// The two header values Apple derives from it (`localUserID` and
/// `deviceUniqueIdentifier`) are always recomputed from the identifier and
/// never stored separately, so they cannot diverge from it.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    identifier: [u8; IDENTIFIER_LEN],
}

impl DeviceIdentity {
    /// Generates a fresh identity from the OS secure random source.
    #[must_use]
    pub fn generate() -> Self {
        let mut identifier = [0u8; IDENTIFIER_LEN];
        OsRng.fill_bytes(&mut identifier);
        Self { identifier }
    }

    /// Reconstructs an identity from its base64 at-rest encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or does not decode
    /// to exactly [`IDENTIFIER_LEN`] bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, StoreError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| StoreError::corrupted(KEY_IDENTIFIER, err.to_string()))?;
        let identifier: [u8; IDENTIFIER_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            StoreError::corrupted(
                KEY_IDENTIFIER,
                format!("expected {IDENTIFIER_LEN} bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self { identifier })
    }

    /// Returns the base64 encoding used at rest and on the wire.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.identifier)
    }

    /// The `X-Apple-I-MD-LU` value: upper-case hex SHA-256 of the identifier.
    #[must_use]
    pub fn local_user_id(&self) -> String {
        hex::encode_upper(Sha256::digest(self.identifier))
    }

    /// The `X-Mme-Device-Id` value: the identifier bytes read as a UUID,
    /// upper-cased.
    #[must_use]
    pub fn device_unique_identifier(&self) -> String {
        Uuid::from_bytes(self.identifier)
            .hyphenated()
            .to_string()
            .to_ascii_uppercase()
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("identifier", &"[REDACTED]")
            .field("device_unique_identifier", &self.device_unique_identifier())
            .finish()
    }
}

/// Typed accessors for the identity slots of a [`SecureIdentityStore`].
pub(crate) struct IdentityVault {
    store: Arc<dyn SecureIdentityStore>,
}

impl IdentityVault {
    pub(crate) fn new(store: Arc<dyn SecureIdentityStore>) -> Self {
        Self { store }
    }

    /// Reads the persisted identity, if one exists.
    pub(crate) fn identifier(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let Some(bytes) = self.store.get(KEY_IDENTIFIER)? else {
            return Ok(None);
        };
        let encoded = String::from_utf8(bytes)
            .map_err(|err| StoreError::corrupted(KEY_IDENTIFIER, err.to_string()))?;
        DeviceIdentity::from_base64(&encoded).map(Some)
    }

    /// Reads the persisted identity, generating and persisting a fresh one
    /// if none exists yet. Generation is idempotent-safe: an interrupted
    /// write is simply regenerated on the next run.
    pub(crate) fn load_or_generate(&self) -> Result<DeviceIdentity, StoreError> {
        if let Some(identity) = self.identifier()? {
            return Ok(identity);
        }
        log::info!("generating device identifier");
        let identity = DeviceIdentity::generate();
        self.store
            .set(KEY_IDENTIFIER, identity.to_base64().as_bytes())?;
        Ok(identity)
    }

    /// Reads the provisioning blob, if the device has been provisioned.
    pub(crate) fn adi_pb(&self) -> Result<Option<String>, StoreError> {
        let Some(bytes) = self.store.get(KEY_ADI_PB)? else {
            return Ok(None);
        };
        String::from_utf8(bytes).map(Some).map_err(|err| {
            StoreError::corrupted(KEY_ADI_PB, err.to_string())
        })
    }

    /// Persists the provisioning blob. Only ever called with the complete
    /// value from a `ProvisioningSuccess` message.
    pub(crate) fn set_adi_pb(&self, adi_pb: &str) -> Result<(), StoreError> {
        self.store.set(KEY_ADI_PB, adi_pb.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn derived_values_are_deterministic() {
        let identity = DeviceIdentity::from_base64("AAECAwQFBgcICQoLDA0ODw==").unwrap();
        assert_eq!(identity.local_user_id(), identity.local_user_id());
        assert_eq!(
            identity.device_unique_identifier(),
            identity.device_unique_identifier()
        );
    }

    #[test]
    fn derived_values_change_with_identifier() {
        // Differ in exactly one byte.
        let a = DeviceIdentity::from_base64("AAECAwQFBgcICQoLDA0ODw==").unwrap();
        let b = DeviceIdentity::from_base64("AQECAwQFBgcICQoLDA0ODw==").unwrap();
        assert_ne!(a.local_user_id(), b.local_user_id());
        assert_ne!(a.device_unique_identifier(), b.device_unique_identifier());
    }

    #[test]
    fn local_user_id_is_upper_hex_sha256() {
        let identity = DeviceIdentity::from_base64("AAAAAAAAAAAAAAAAAAAAAA==").unwrap();
        // SHA-256 of 16 zero bytes.
        assert_eq!(
            identity.local_user_id(),
            "374708FFF7719DD5979EC875D56CD2286F6D3CF7EC317A3B25632AAB28EC37BB"
        );
    }

    #[test]
    fn device_unique_identifier_is_upper_uuid() {
        let identity = DeviceIdentity::from_base64("AAECAwQFBgcICQoLDA0ODw==").unwrap();
        assert_eq!(
            identity.device_unique_identifier(),
            "00010203-0405-0607-0809-0A0B0C0D0E0F"
        );
    }

    #[test]
    fn rejects_short_identifier() {
        let short = STANDARD.encode([0u8; 8]);
        assert!(DeviceIdentity::from_base64(&short).is_err());
        let long = STANDARD.encode([0u8; 24]);
        assert!(DeviceIdentity::from_base64(&long).is_err());
    }

    #[test]
    fn base64_round_trip() {
        let identity = DeviceIdentity::generate();
        let restored = DeviceIdentity::from_base64(&identity.to_base64()).unwrap();
        assert_eq!(identity, restored);
    }

    #[test]
    fn vault_generates_once() {
        let vault = IdentityVault::new(std::sync::Arc::new(MemoryStore::new()));
        assert!(vault.identifier().unwrap().is_none());

        let first = vault.load_or_generate().unwrap();
        let second = vault.load_or_generate().unwrap();
        assert_eq!(first, second);
        assert_eq!(vault.identifier().unwrap(), Some(first));
    }

    #[test]
    fn vault_round_trips_adi_pb() {
        let vault = IdentityVault::new(std::sync::Arc::new(MemoryStore::new()));
        assert!(vault.adi_pb().unwrap().is_none());
        vault.set_adi_pb("XYZ").unwrap();
        assert_eq!(vault.adi_pb().unwrap().as_deref(), Some("XYZ"));
    }
}
