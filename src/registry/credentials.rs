//! C4 — Credential Registry (spec §4.3).

use crate::error::{EngineError, EngineResult};
use crate::models::{Credential, CredentialType, now_ts};
use crate::secret_store::SecretStore;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct CredentialInput {
    pub id: Option<String>,
    pub name: String,
    pub username: String,
    pub kind: CredentialType,
    pub folder: Option<String>,
    pub tags: BTreeSet<String>,
}

/// Emitted after a successful `save`/`delete` so subscribers can refresh.
#[derive(Debug, Clone)]
pub enum CredentialChange {
    Saved(Credential),
    Deleted(String),
}

pub struct CredentialRegistry {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    credentials: Mutex<Vec<Credential>>,
    changes: tokio::sync::broadcast::Sender<CredentialChange>,
}

impl CredentialRegistry {
    pub fn load(path: PathBuf, secrets: Arc<dyn SecretStore>) -> EngineResult<Self> {
        let credentials: Vec<Credential> = super::storage::load(&path)?;
        let (changes, _rx) = tokio::sync::broadcast::channel(64);
        Ok(Self {
            path,
            secrets,
            credentials: Mutex::new(credentials),
            changes,
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CredentialChange> {
        self.changes.subscribe()
    }

    fn persist(&self, credentials: &[Credential]) -> EngineResult<()> {
        super::storage::save(&self.path, credentials)
    }

    pub fn list(&self) -> Vec<Credential> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> EngineResult<Credential> {
        self.credentials
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("credential {id}")))
    }

    /// `save(credential, secret)` — `secret` is stored under
    /// `"credential.{id}"` in the secret store.
    pub fn save(&self, input: CredentialInput, secret: &[u8]) -> EngineResult<Credential> {
        let id = input.id.clone().unwrap_or_else(Credential::new_id);
        let now = now_ts();

        self.secrets.put(&format!("credential.{id}"), secret)?;

        let key_type = if input.kind == CredentialType::Key {
            infer_key_type(secret)
        } else {
            None
        };

        let mut credentials = self.credentials.lock().unwrap();
        let credential = if let Some(existing) = credentials.iter_mut().find(|c| c.id == id) {
            existing.name = input.name;
            existing.username = input.username;
            existing.kind = input.kind;
            existing.folder = input.folder;
            existing.tags = input.tags;
            existing.key_type = key_type;
            existing.updated_at = now;
            existing.clone()
        } else {
            let credential = Credential {
                id: id.clone(),
                name: input.name,
                username: input.username,
                kind: input.kind,
                folder: input.folder,
                tags: input.tags,
                key_type,
                usage_count: 0,
                last_used_at: None,
                created_at: now,
                updated_at: now,
            };
            credentials.push(credential.clone());
            credential
        };
        self.persist(&credentials)?;
        let _ = self.changes.send(CredentialChange::Saved(credential.clone()));
        Ok(credential)
    }

    pub fn delete(&self, id: &str) -> EngineResult<()> {
        let mut credentials = self.credentials.lock().unwrap();
        let before = credentials.len();
        credentials.retain(|c| c.id != id);
        if credentials.len() == before {
            return Err(EngineError::NotFound(format!("credential {id}")));
        }
        self.persist(&credentials)?;
        self.secrets.delete(&format!("credential.{id}"))?;
        let _ = self.changes.send(CredentialChange::Deleted(id.to_string()));
        Ok(())
    }

    pub fn record_usage(&self, id: &str) -> EngineResult<()> {
        let mut credentials = self.credentials.lock().unwrap();
        let credential = credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("credential {id}")))?;
        credential.usage_count += 1;
        credential.last_used_at = Some(now_ts());
        self.persist(&credentials)
    }

    pub fn secret(&self, id: &str) -> EngineResult<Vec<u8>> {
        self.secrets
            .get(&format!("credential.{id}"))?
            .ok_or_else(|| EngineError::MissingSecret(format!("credential.{id}")))
    }

    /// Generate a fresh SSH keypair and store the private key body as this
    /// credential's secret (supplemented feature, grounded in the teacher's
    /// `ssh/keys.rs`). Returns the credential and the public key text so the
    /// caller can show/export it.
    pub fn generate_key(
        &self,
        name: String,
        username: String,
        algorithm: &str,
        passphrase: Option<&str>,
    ) -> EngineResult<(Credential, String)> {
        let (private_pem, public_openssh) = crate::keys::generate_key_pair(algorithm, passphrase)?;
        let credential = self.save(
            CredentialInput {
                id: None,
                name,
                username,
                kind: CredentialType::Key,
                folder: None,
                tags: BTreeSet::new(),
            },
            private_pem.as_bytes(),
        )?;
        Ok((credential, public_openssh))
    }
}

fn infer_key_type(private_key_pem: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(private_key_pem).ok()?;
    if text.contains("ssh-ed25519") || text.contains("OPENSSH PRIVATE KEY") && text.contains("ed25519") {
        Some("ed25519".to_string())
    } else if text.contains("RSA PRIVATE KEY") || text.contains("ssh-rsa") {
        Some("rsa".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::MemorySecretStore;

    fn fixture() -> (tempfile::TempDir, CredentialRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let registry = CredentialRegistry::load(path, Arc::new(MemorySecretStore::default())).unwrap();
        (dir, registry)
    }

    #[test]
    fn save_then_secret_roundtrips() {
        let (_dir, reg) = fixture();
        let cred = reg
            .save(
                CredentialInput {
                    name: "c1".into(),
                    username: "u".into(),
                    kind: CredentialType::Password,
                    ..Default::default()
                },
                b"s3cr3t",
            )
            .unwrap();
        assert_eq!(reg.secret(&cred.id).unwrap(), b"s3cr3t");
    }

    #[test]
    fn delete_removes_metadata_and_secret() {
        let (_dir, reg) = fixture();
        let cred = reg
            .save(
                CredentialInput {
                    name: "c1".into(),
                    username: "u".into(),
                    kind: CredentialType::Password,
                    ..Default::default()
                },
                b"s3cr3t",
            )
            .unwrap();
        reg.delete(&cred.id).unwrap();
        assert!(reg.get(&cred.id).is_err());
        assert!(reg.secret(&cred.id).is_err());
    }

    #[test]
    fn save_emits_change_event() {
        let (_dir, reg) = fixture();
        let mut rx = reg.subscribe();
        reg.save(
            CredentialInput {
                name: "c1".into(),
                username: "u".into(),
                kind: CredentialType::Password,
                ..Default::default()
            },
            b"s",
        )
        .unwrap();
        let change = rx.try_recv().unwrap();
        matches!(change, CredentialChange::Saved(_));
    }
}
