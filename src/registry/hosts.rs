//! C3 — Host Registry (spec §4.2).

use crate::error::{EngineError, EngineResult};
use crate::models::{AuthType, Host};
use crate::secret_store::SecretStore;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    Add,
    Replace,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BulkResult {
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub errors: Vec<String>,
}

/// Fields accepted on `save`/`import`; secret bodies never round-trip
/// through the persisted `Host` record itself.
#[derive(Debug, Clone, Default)]
pub struct HostInput {
    pub id: Option<String>,
    pub name: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    pub auth_type: Option<AuthType>,
    pub credential_id: Option<String>,
    pub folder: Option<String>,
    pub tags: BTreeSet<String>,
    pub notes: Option<String>,
    pub os_hint: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<String>,
}

pub struct HostRegistry {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    hosts: Mutex<Vec<Host>>,
}

impl HostRegistry {
    pub fn load(path: PathBuf, secrets: Arc<dyn SecretStore>) -> EngineResult<Self> {
        let hosts: Vec<Host> = super::storage::load(&path)?;
        Ok(Self {
            path,
            secrets,
            hosts: Mutex::new(hosts),
        })
    }

    fn persist(&self, hosts: &[Host]) -> EngineResult<()> {
        super::storage::save(&self.path, hosts)
    }

    pub fn list(&self) -> Vec<Host> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> EngineResult<Host> {
        self.hosts
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("host {id}")))
    }

    /// Validate a port per spec §8 boundary rule: `0` or `>65535` rejected
    /// at save time. `u16` already excludes `>65535`; `0` is the remaining case.
    fn validate_port(port: u16) -> EngineResult<()> {
        if port == 0 {
            return Err(EngineError::Conflict("port must be in 1..=65535".into()));
        }
        Ok(())
    }

    /// Upsert. When `input.password`/`input.key_path` is set, the secret
    /// body is written to the secret store under a key derived from the
    /// host id, and the returned `Host` never carries it.
    pub fn save(&self, input: HostInput) -> EngineResult<Host> {
        let port = input.port.unwrap_or(22);
        Self::validate_port(port)?;

        let id = input.id.clone().unwrap_or_else(Host::new_id);

        let auth_type = input.auth_type.unwrap_or(if input.password.is_some() {
            AuthType::Password
        } else {
            AuthType::Agent
        });

        if auth_type == AuthType::CredentialRef && input.credential_id.is_none() {
            return Err(EngineError::Conflict(
                "credential_ref auth_type requires credential_id".into(),
            ));
        }

        if let Some(password) = &input.password {
            self.secrets
                .put(&format!("host.password.{id}"), password.as_bytes())?;
        }
        if let Some(key_path) = &input.key_path {
            let bytes = std::fs::read(key_path).map_err(|e| {
                EngineError::NotFound(format!("key file {key_path}: {e}"))
            })?;
            self.secrets.put(&format!("host.key.{id}"), &bytes)?;
        }

        let host = Host {
            id: id.clone(),
            name: input.name,
            hostname: input.hostname,
            port,
            username: input.username,
            auth_type,
            credential_id: input.credential_id,
            folder: input.folder,
            tags: input.tags,
            pinned: false,
            last_used_at: None,
            notes: input.notes,
            os_hint: input.os_hint,
        };

        let mut hosts = self.hosts.lock().unwrap();
        if let Some(existing) = hosts.iter_mut().find(|h| h.id == id) {
            let pinned = existing.pinned;
            let last_used_at = existing.last_used_at;
            *existing = host;
            existing.pinned = pinned;
            existing.last_used_at = last_used_at;
        } else {
            hosts.push(host);
        }
        self.persist(&hosts)?;
        Ok(hosts.iter().find(|h| h.id == id).cloned().unwrap())
    }

    pub fn delete(&self, id: &str) -> EngineResult<()> {
        let mut hosts = self.hosts.lock().unwrap();
        let before = hosts.len();
        hosts.retain(|h| h.id != id);
        if hosts.len() == before {
            return Err(EngineError::NotFound(format!("host {id}")));
        }
        self.persist(&hosts)?;
        let _ = self.secrets.delete(&format!("host.password.{id}"));
        let _ = self.secrets.delete(&format!("host.key.{id}"));
        Ok(())
    }

    pub fn clone_host(&self, id: &str) -> EngineResult<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        let original = hosts
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("host {id}")))?;
        let mut copy = original;
        copy.id = Host::new_id();
        copy.name = format!("{} (copy)", copy.name);
        copy.pinned = false;
        copy.last_used_at = None;
        hosts.push(copy.clone());
        self.persist(&hosts)?;
        Ok(copy)
    }

    pub fn toggle_pin(&self, id: &str) -> EngineResult<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("host {id}")))?;
        host.pinned = !host.pinned;
        let result = host.clone();
        self.persist(&hosts)?;
        Ok(result)
    }

    pub fn update_last_used(&self, id: &str) -> EngineResult<()> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("host {id}")))?;
        host.last_used_at = Some(crate::models::now_ts());
        self.persist(&hosts)
    }

    pub fn rename_folder(&self, old: &str, new: &str) -> EngineResult<usize> {
        let mut hosts = self.hosts.lock().unwrap();
        let mut count = 0;
        for host in hosts.iter_mut() {
            if host.folder.as_deref() == Some(old) {
                host.folder = Some(new.to_string());
                count += 1;
            }
        }
        if count > 0 {
            self.persist(&hosts)?;
        }
        Ok(count)
    }

    pub fn move_to_folder(&self, id: &str, folder: Option<String>) -> EngineResult<()> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("host {id}")))?;
        host.folder = folder;
        self.persist(&hosts)
    }

    pub fn bulk_delete(&self, ids: &[String]) -> BulkResult {
        let mut result = BulkResult::default();
        for id in ids {
            match self.delete(id) {
                Ok(()) => result.success.push(id.clone()),
                Err(e) => {
                    result.failed.push(id.clone());
                    result.errors.push(e.to_string());
                }
            }
        }
        result
    }

    pub fn bulk_move_to_folder(&self, ids: &[String], folder: Option<String>) -> BulkResult {
        let mut result = BulkResult::default();
        for id in ids {
            match self.move_to_folder(id, folder.clone()) {
                Ok(()) => result.success.push(id.clone()),
                Err(e) => {
                    result.failed.push(id.clone());
                    result.errors.push(e.to_string());
                }
            }
        }
        result
    }

    pub fn bulk_assign_tags(&self, ids: &[String], tags: &BTreeSet<String>, mode: TagMode) -> BulkResult {
        let mut result = BulkResult::default();
        let mut hosts = self.hosts.lock().unwrap();
        for id in ids {
            match hosts.iter_mut().find(|h| &h.id == id) {
                Some(host) => {
                    match mode {
                        TagMode::Add => host.tags.extend(tags.iter().cloned()),
                        TagMode::Replace => host.tags = tags.clone(),
                    }
                    result.success.push(id.clone());
                }
                None => {
                    result.failed.push(id.clone());
                    result.errors.push(format!("host {id} not found"));
                }
            }
        }
        let _ = self.persist(&hosts);
        result
    }

    pub fn import(&self, inputs: Vec<HostInput>) -> BulkResult {
        let mut result = BulkResult::default();
        for input in inputs {
            let label = input.name.clone();
            match self.save(input) {
                Ok(host) => result.success.push(host.id),
                Err(e) => {
                    result.failed.push(label);
                    result.errors.push(e.to_string());
                }
            }
        }
        result
    }

    pub fn export(&self, ids: Option<&[String]>) -> Vec<Host> {
        let hosts = self.hosts.lock().unwrap();
        match ids {
            Some(ids) => hosts.iter().filter(|h| ids.contains(&h.id)).cloned().collect(),
            None => hosts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::MemorySecretStore;

    fn fixture() -> (tempfile::TempDir, HostRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        let secrets = Arc::new(MemorySecretStore::default());
        let registry = HostRegistry::load(path, secrets).unwrap();
        (dir, registry)
    }

    fn input(name: &str) -> HostInput {
        HostInput {
            name: name.to_string(),
            hostname: "127.0.0.1".to_string(),
            username: "u".to_string(),
            password: Some("p".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_get_roundtrips() {
        let (_dir, reg) = fixture();
        let host = reg.save(input("h1")).unwrap();
        assert_eq!(host.port, 22);
        assert_eq!(host.auth_type, AuthType::Password);
        let fetched = reg.get(&host.id).unwrap();
        assert_eq!(fetched.name, "h1");
    }

    #[test]
    fn port_zero_rejected() {
        let (_dir, reg) = fixture();
        let mut i = input("h");
        i.port = Some(0);
        assert!(reg.save(i).is_err());
    }

    #[test]
    fn save_strips_secret_from_returned_record() {
        let (_dir, reg) = fixture();
        let host = reg.save(input("h")).unwrap();
        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("\"password\""));
    }

    #[test]
    fn clone_suffixes_name_and_mints_new_id() {
        let (_dir, reg) = fixture();
        let host = reg.save(input("h1")).unwrap();
        let copy = reg.clone_host(&host.id).unwrap();
        assert_ne!(copy.id, host.id);
        assert_eq!(copy.name, "h1 (copy)");
    }

    #[test]
    fn bulk_delete_is_best_effort() {
        let (_dir, reg) = fixture();
        let host = reg.save(input("h1")).unwrap();
        let result = reg.bulk_delete(&[host.id.clone(), "missing".to_string()]);
        assert_eq!(result.success, vec![host.id]);
        assert_eq!(result.failed, vec!["missing".to_string()]);
    }

    #[test]
    fn export_import_roundtrips_under_new_ids() {
        let (_dir, reg) = fixture();
        reg.save(input("h1")).unwrap();
        reg.save(input("h2")).unwrap();
        let exported = reg.export(None);
        assert_eq!(exported.len(), 2);

        let (_dir2, reg2) = fixture();
        let inputs: Vec<HostInput> = exported
            .into_iter()
            .map(|h| HostInput {
                id: None,
                name: h.name,
                hostname: h.hostname,
                port: Some(h.port),
                username: h.username,
                auth_type: Some(h.auth_type),
                credential_id: h.credential_id,
                folder: h.folder,
                tags: h.tags,
                notes: h.notes,
                os_hint: h.os_hint,
                password: None,
                key_path: None,
            })
            .collect();
        let result = reg2.import(inputs);
        assert_eq!(result.success.len(), 2);
        assert_eq!(reg2.list().len(), 2);
    }

    #[test]
    fn rename_folder_reports_count() {
        let (_dir, reg) = fixture();
        let mut i1 = input("h1");
        i1.folder = Some("old".into());
        reg.save(i1).unwrap();
        let mut i2 = input("h2");
        i2.folder = Some("old".into());
        reg.save(i2).unwrap();
        let count = reg.rename_folder("old", "new").unwrap();
        assert_eq!(count, 2);
        assert!(reg.list().iter().all(|h| h.folder.as_deref() == Some("new")));
    }
}
