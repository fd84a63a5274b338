//! C1 — Secret Store adapter (spec §3, §4.2, §4.3).
//!
//! Opaque get/put/delete of secret bytes by key. The default implementation
//! is backed by the OS-provided secret store via the `keyring` crate; tests
//! and embedding hosts that don't want OS keychain prompts can swap in
//! [`MemorySecretStore`].

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, secret: &[u8]) -> EngineResult<()>;
    fn delete(&self, key: &str) -> EngineResult<()>;
}

/// OS keychain / Secret Service backed store.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> EngineResult<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| EngineError::Internal(format!("keyring entry: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let entry = self.entry(key)?;
        match entry.get_secret() {
            Ok(bytes) => Ok(Some(bytes)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::MissingSecret(format!("{key}: {e}"))),
        }
    }

    fn put(&self, key: &str, secret: &[u8]) -> EngineResult<()> {
        let entry = self.entry(key)?;
        entry
            .set_secret(secret)
            .map_err(|e| EngineError::Internal(format!("keyring set {key}: {e}")))
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        let entry = self.entry(key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::Internal(format!("keyring delete {key}: {e}"))),
        }
    }
}

/// In-memory store for tests and hosts without OS keychain access.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, secret: &[u8]) -> EngineResult<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), secret.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore").field("inner", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemorySecretStore::default();
        store.put("host.password.abc", b"hunter2").unwrap();
        assert_eq!(store.get("host.password.abc").unwrap().unwrap(), b"hunter2");
        store.delete("host.password.abc").unwrap();
        assert!(store.get("host.password.abc").unwrap().is_none());
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let store = MemorySecretStore::default();
        assert!(store.get("nope").unwrap().is_none());
    }
}
