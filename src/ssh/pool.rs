//! C5 — Connection Pool (spec §4.4), grounded in the teacher's
//! `ssh/connection.rs` (`SessionSshPool`, `establish_connection_with_retry`,
//! `connect_with_timeout`) and `ssh/manager.rs` (actor-thread pattern).
//!
//! `PoolEntry` states map directly onto spec §4.4: `Connecting`, `Ready`,
//! `Failed(reason)`, `Closing`. A single `Mutex` guards the `host_id ->
//! PoolEntry` map and is held only while mutating that map's metadata,
//! never across network I/O — connects, handshakes and auth all run
//! inside `spawn_blocking` since `ssh2` is synchronous.

use crate::bus::{Bus, Event};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::host_key_store::HostKeyStore;
use crate::models::{AuthType, Host, KeyVerdict};
use crate::registry::{CredentialRegistry, HostRegistry};
use crate::secret_store::SecretStore;
use crate::ssh::actor::{self, ActorSender};
use crate::ssh::connect::{self, AuthMaterial};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::info;

enum Entry {
    Connecting(Arc<Notify>),
    Ready(ReadyEntry),
    Failed(String),
}

struct ReadyEntry {
    actor: ActorSender,
    ref_count: usize,
    idle_since: Option<Instant>,
}

struct PoolInner {
    entries: Mutex<HashMap<String, Entry>>,
    pending_host_keys: Mutex<HashMap<(String, u16), Vec<oneshot::Sender<Option<bool>>>>>,
    hosts: Arc<HostRegistry>,
    credentials: Arc<CredentialRegistry>,
    secrets: Arc<dyn SecretStore>,
    host_keys: Arc<HostKeyStore>,
    bus: Bus,
    config: EngineConfig,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Move-only RAII guard; dropping it releases the pool's reference count.
pub struct Handle {
    host_id: String,
    pool: Arc<PoolInner>,
    actor: ActorSender,
}

impl Handle {
    pub fn actor(&self) -> &ActorSender {
        &self.actor
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.pool.release(&self.host_id);
    }
}

impl ConnectionPool {
    pub fn new(
        hosts: Arc<HostRegistry>,
        credentials: Arc<CredentialRegistry>,
        secrets: Arc<dyn SecretStore>,
        host_keys: Arc<HostKeyStore>,
        bus: Bus,
        config: EngineConfig,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            entries: Mutex::new(HashMap::new()),
            pending_host_keys: Mutex::new(HashMap::new()),
            hosts,
            credentials,
            secrets,
            host_keys,
            bus,
            config,
        });
        Self { inner }
    }

    /// Spawns the idle reaper loop; the returned task runs until the
    /// engine is dropped.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.reaper_interval);
            loop {
                ticker.tick().await;
                inner.reap_idle();
            }
        })
    }

    pub async fn acquire(&self, host_id: &str) -> EngineResult<Handle> {
        self.inner.acquire(host_id).await
    }

    pub fn close(&self, host_id: &str) {
        self.inner.close(host_id);
    }

    pub fn close_all(&self) {
        self.inner.close_all();
    }

    /// Resolves a pending `HostKeyDecisionRequired` prompt for
    /// `(hostname, port)`. `decision = Some(save)` trusts the key for this
    /// connection attempt, persisting it to `known_hosts` iff `save`;
    /// `decision = None` denies it (spec §6 `HostKey.Deny`).
    pub fn resolve_host_key_decision(&self, hostname: &str, port: u16, decision: Option<bool>) {
        self.inner.resolve_host_key_decision(hostname, port, decision);
    }
}

impl PoolInner {
    fn release(&self, host_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(Entry::Ready(ready)) = entries.get_mut(host_id) {
            ready.ref_count = ready.ref_count.saturating_sub(1);
            if ready.ref_count == 0 {
                ready.idle_since = Some(Instant::now());
            }
        }
    }

    fn close(&self, host_id: &str) {
        let removed = self.entries.lock().unwrap().remove(host_id);
        if let Some(Entry::Ready(ready)) = removed {
            let _ = ready.actor.send(actor::ActorCommand::Shutdown);
        }
    }

    fn close_all(&self) {
        let drained: Vec<Entry> = self.entries.lock().unwrap().drain().map(|(_, v)| v).collect();
        for entry in drained {
            if let Entry::Ready(ready) = entry {
                let _ = ready.actor.send(actor::ActorCommand::Shutdown);
            }
        }
    }

    fn reap_idle(&self) {
        let mut to_close = Vec::new();
        {
            let entries = self.entries.lock().unwrap();
            for (id, entry) in entries.iter() {
                if let Entry::Ready(ready) = entry {
                    if ready.ref_count == 0 {
                        if let Some(idle_since) = ready.idle_since {
                            if idle_since.elapsed() >= self.config.idle_grace {
                                to_close.push(id.clone());
                            }
                        }
                    }
                }
            }
        }
        for id in to_close {
            info!(host_id = %id, "pool: reaping idle connection");
            self.close(&id);
        }
    }

    fn resolve_host_key_decision(&self, hostname: &str, port: u16, decision: Option<bool>) {
        let waiters = self
            .pending_host_keys
            .lock()
            .unwrap()
            .remove(&(hostname.to_string(), port));
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(decision);
            }
        }
    }

    async fn acquire(self: &Arc<Self>, host_id: &str) -> EngineResult<Handle> {
        loop {
            let notify = {
                let mut entries = self.entries.lock().unwrap();
                match entries.get_mut(host_id) {
                    Some(Entry::Ready(ready)) => {
                        ready.ref_count += 1;
                        ready.idle_since = None;
                        return Ok(Handle {
                            host_id: host_id.to_string(),
                            pool: self.clone(),
                            actor: ready.actor.clone(),
                        });
                    }
                    Some(Entry::Connecting(notify)) => Some(notify.clone()),
                    Some(Entry::Failed(reason)) => {
                        let reason = reason.clone();
                        entries.remove(host_id);
                        drop(entries);
                        return self.clone().connect_and_insert(host_id, Some(reason)).await;
                    }
                    None => {
                        let notify = Arc::new(Notify::new());
                        entries.insert(host_id.to_string(), Entry::Connecting(notify));
                        drop(entries);
                        return self.clone().connect_and_insert(host_id, None).await;
                    }
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue;
            }
        }
    }

    async fn connect_and_insert(self: Arc<Self>, host_id: &str, _prior_failure: Option<String>) -> EngineResult<Handle> {
        // Entry is already `Connecting` (inserted by the caller) when this
        // runs. On any path out, replace it with `Ready`/`Failed` and wake
        // every waiter parked on the old `Notify`.
        let notify = match self.entries.lock().unwrap().get(host_id) {
            Some(Entry::Connecting(n)) => n.clone(),
            _ => Arc::new(Notify::new()),
        };

        let result = self.do_connect(host_id).await;

        let mut entries = self.entries.lock().unwrap();
        match &result {
            Ok(actor) => {
                entries.insert(
                    host_id.to_string(),
                    Entry::Ready(ReadyEntry {
                        actor: actor.clone(),
                        ref_count: 1,
                        idle_since: None,
                    }),
                );
            }
            Err(e) => {
                entries.insert(host_id.to_string(), Entry::Failed(e.to_string()));
            }
        }
        drop(entries);
        notify.notify_waiters();

        result.map(|actor| Handle {
            host_id: host_id.to_string(),
            pool: self.clone(),
            actor,
        })
    }

    async fn do_connect(&self, host_id: &str) -> EngineResult<ActorSender> {
        let host = self.hosts.get(host_id)?;
        let connect_timeout = self.config.connect_timeout;

        let host_for_tcp = host.clone();
        let stream = tokio::task::spawn_blocking(move || connect::tcp_connect(&host_for_tcp, connect_timeout))
            .await
            .map_err(|e| EngineError::Internal(format!("connect task join: {e}")))??;

        let (session, presented) = tokio::task::spawn_blocking(move || connect::handshake(stream))
            .await
            .map_err(|e| EngineError::Internal(format!("handshake task join: {e}")))??;

        self.verify_host_key(&host, &presented).await?;

        let auth = self.resolve_auth_material(&host)?;

        let mut session = session;
        let host_for_auth = host.clone();
        let session = tokio::task::spawn_blocking(move || {
            connect::authenticate(&mut session, &host_for_auth, auth).map(|_| session)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("auth task join: {e}")))??;

        if let Some(id) = host.credential_id.as_ref() {
            let _ = self.credentials.record_usage(id);
        }
        let _ = self.hosts.update_last_used(host_id);

        Ok(actor::spawn(session))
    }

    async fn verify_host_key(&self, host: &Host, presented: &connect::PresentedHostKey) -> EngineResult<()> {
        let verdict = self
            .host_keys
            .verify(&host.hostname, host.port, &presented.algo, &presented.bytes);

        match verdict {
            KeyVerdict::Valid => Ok(()),
            KeyVerdict::Unknown | KeyVerdict::Changed => {
                let (tx, rx) = oneshot::channel();
                self.pending_host_keys
                    .lock()
                    .unwrap()
                    .entry((host.hostname.clone(), host.port))
                    .or_default()
                    .push(tx);

                let fingerprint_sha256 = hex::encode(Sha256::digest(&presented.bytes));
                self.bus.publish(Event::HostKeyDecisionRequired {
                    hostname: host.hostname.clone(),
                    port: host.port,
                    algo: presented.algo.clone(),
                    fingerprint_sha256,
                });

                let decision = rx
                    .await
                    .map_err(|_| EngineError::Internal("host key decision channel dropped".into()))?;

                let Some(save) = decision else {
                    return Err(if verdict == KeyVerdict::Changed {
                        EngineError::HostKeyChanged { hostname: host.hostname.clone(), port: host.port }
                    } else {
                        EngineError::HostKeyUnknown { hostname: host.hostname.clone(), port: host.port }
                    });
                };

                if save {
                    self.host_keys
                        .accept(&host.hostname, host.port, &presented.algo, &presented.bytes)
                        .map_err(EngineError::Internal)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_auth_material(&self, host: &Host) -> EngineResult<AuthMaterial> {
        match host.auth_type {
            AuthType::Agent => Ok(AuthMaterial::Agent),
            AuthType::Password => {
                let secret = self
                    .secrets
                    .get(&format!("host.password.{}", host.id))?
                    .ok_or_else(|| EngineError::MissingSecret(format!("host.password.{}", host.id)))?;
                let password = String::from_utf8(secret)
                    .map_err(|_| EngineError::MissingSecret("password is not valid UTF-8".into()))?;
                Ok(AuthMaterial::Password(password))
            }
            AuthType::Key => {
                let bytes = self
                    .secrets
                    .get(&format!("host.key.{}", host.id))?
                    .ok_or_else(|| EngineError::MissingSecret(format!("host.key.{}", host.id)))?;
                Ok(AuthMaterial::PrivateKey { bytes, passphrase: None })
            }
            AuthType::CredentialRef => {
                let credential_id = host
                    .credential_id
                    .as_ref()
                    .ok_or_else(|| EngineError::Conflict("credential_ref host has no credential_id".into()))?;
                let credential = self.credentials.get(credential_id)?;
                let secret = self.credentials.secret(credential_id)?;
                match credential.kind {
                    crate::models::CredentialType::Password => {
                        let password = String::from_utf8(secret)
                            .map_err(|_| EngineError::MissingSecret("password is not valid UTF-8".into()))?;
                        Ok(AuthMaterial::Password(password))
                    }
                    crate::models::CredentialType::Key => {
                        Ok(AuthMaterial::PrivateKey { bytes: secret, passphrase: None })
                    }
                }
            }
        }
    }
}

