//! JSON-file-backed identity store for the CLI.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anisette_core::{SecureIdentityStore, StoreError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eyre::WrapErr;

/// Stores the device identity as a JSON object of base64 values. Good enough
/// for a developer tool; applications should back the store with a real
/// keychain.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Opens (or initializes) the store at `path`.
    pub fn open(path: PathBuf) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }

        let values = if path.exists() {
            let bytes = fs::read(&path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            let encoded: HashMap<String, String> = serde_json::from_slice(&bytes)
                .wrap_err_with(|| format!("parsing {}", path.display()))?;
            encoded
                .into_iter()
                .map(|(key, value)| {
                    let bytes = STANDARD
                        .decode(&value)
                        .wrap_err_with(|| format!("decoding store key {key}"))?;
                    Ok((key, bytes))
                })
                .collect::<eyre::Result<_>>()?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &HashMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let encoded: HashMap<&String, String> = values
            .iter()
            .map(|(key, value)| (key, STANDARD.encode(value)))
            .collect();
        let bytes = serde_json::to_vec_pretty(&encoded)
            .map_err(|err| StoreError::backend(err.to_string()))?;

        // Write-then-rename so a concurrent reader never sees a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(|err| StoreError::backend(err.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|err| StoreError::backend(err.to_string()))
    }
}

impl SecureIdentityStore for FileStore {
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
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::backend("store mutex poisoned"))?;
        values.remove(key);
        self.persist(&values)
    }
}
