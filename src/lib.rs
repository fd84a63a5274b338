//! SSH/SFTP session and transfer engine (spec §1-§2).
//!
//! `Engine` is the top-level orchestrator: it owns every registry, the
//! connection pool, the transfer queue, the edit-on-fly handler, the
//! status prober and the session tracker, and is the single thing an
//! embedding host constructs. There is no ambient/global state anywhere
//! in this crate — every component is a field reached through `Engine`,
//! matching the "singleton services" redesign note in spec §9.

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod edit;
pub mod error;
pub mod host_key_store;
pub mod keys;
pub mod localfs;
pub mod models;
pub mod prober;
pub mod registry;
pub mod secret_store;
pub mod session_tracker;
pub mod ssh;
pub mod transfer;

use bus::{Bus, Command, Event};
use config::EngineConfig;
use error::{EngineError, EngineResult};
use models::SessionKind;
use registry::{CredentialRegistry, FolderRegistry, HostRegistry, TagMode};
use secret_store::{KeyringSecretStore, SecretStore};
use ssh::{ConnectionPool, OwnerNameCache, SshSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// Top-level orchestrator (spec §2, §9). Constructed once by the embedding
/// host; every long-running component is spawned from `Engine::new` and
/// torn down from `Engine::shutdown`.
pub struct Engine {
    config: EngineConfig,
    bus: Bus,
    hosts: Arc<HostRegistry>,
    credentials: Arc<CredentialRegistry>,
    folders: Arc<FolderRegistry>,
    secrets: Arc<dyn SecretStore>,
    host_keys: Arc<host_key_store::HostKeyStore>,
    pool: Arc<ConnectionPool>,
    transfers: Arc<transfer::TransferQueue>,
    edit: Arc<edit::EditHandler>,
    sessions: AsyncMutex<HashMap<String, Arc<SshSession>>>,
    session_tracker: Arc<session_tracker::SessionTracker>,
    owner_names: OwnerNameCache,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Constructs every component from `config.data_dir` and spawns the
    /// pool reaper, transfer scheduler, status prober, and edit-on-fly
    /// sweeper. Call once at process startup.
    pub fn new(config: EngineConfig) -> EngineResult<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let bus = Bus::new(1024);
        let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new(config.secret_service_name.clone()));

        let hosts = Arc::new(HostRegistry::load(config.data_dir.join("hosts.json"), secrets.clone())?);
        let credentials = Arc::new(CredentialRegistry::load(
            config.data_dir.join("credentials.json"),
            secrets.clone(),
        )?);
        let folders = Arc::new(FolderRegistry::load(config.data_dir.join("folders.json"))?);
        let session_tracker = Arc::new(session_tracker::SessionTracker::load(
            config.data_dir.join("sessions.json"),
        )?);
        let host_keys = Arc::new(host_key_store::HostKeyStore::new(config.data_dir.join("known_hosts")));

        let pool = Arc::new(ConnectionPool::new(
            hosts.clone(),
            credentials.clone(),
            secrets.clone(),
            host_keys.clone(),
            bus.clone(),
            config.clone(),
        ));

        let transfers = transfer::TransferQueue::new(pool.clone(), bus.clone(), config.clone());
        let edit = edit::EditHandler::new(
            pool.clone(),
            bus.clone(),
            std::env::temp_dir(),
            config.edit_debounce,
            config.edit_temp_ttl,
        );

        let engine = Arc::new(Self {
            config: config.clone(),
            bus,
            hosts,
            credentials,
            folders,
            secrets,
            host_keys,
            pool,
            transfers,
            edit,
            sessions: AsyncMutex::new(HashMap::new()),
            session_tracker,
            owner_names: OwnerNameCache::new(),
            background: std::sync::Mutex::new(Vec::new()),
        });

        let mut background = Vec::new();
        background.push(engine.pool.spawn_reaper());
        background.push(engine.transfers.spawn_scheduler());
        background.push(
            prober::StatusProber::new(engine.hosts.clone(), engine.bus.clone(), &config).spawn(),
        );
        background.push(engine.edit.spawn_sweeper(config.edit_sweep_interval));
        *engine.background.lock().unwrap() = background;

        info!(data_dir = %config.data_dir.display(), "engine: started");
        Ok(engine)
    }

    /// A fresh subscriber to the outbound event stream (spec §4.13).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    // ---- Host Registry (C3) ----------------------------------------

    pub fn list_hosts(&self) -> Vec<models::Host> {
        self.hosts.list()
    }

    pub fn get_host(&self, id: &str) -> EngineResult<models::Host> {
        self.hosts.get(id)
    }

    pub fn save_host(&self, input: registry::HostInput) -> EngineResult<models::Host> {
        let host = self.hosts.save(input)?;
        self.bus.publish(Event::DataUpdate { hosts: Some(self.hosts.list()), credentials: None, folders: None });
        Ok(host)
    }

    pub fn delete_host(&self, id: &str) -> EngineResult<()> {
        self.hosts.delete(id)?;
        self.pool.close(id);
        self.bus.publish(Event::DataUpdate { hosts: Some(self.hosts.list()), credentials: None, folders: None });
        Ok(())
    }

    pub fn clone_host(&self, id: &str) -> EngineResult<models::Host> {
        let host = self.hosts.clone_host(id)?;
        self.bus.publish(Event::DataUpdate { hosts: Some(self.hosts.list()), credentials: None, folders: None });
        Ok(host)
    }

    pub fn toggle_pin(&self, id: &str) -> EngineResult<models::Host> {
        self.hosts.toggle_pin(id)
    }

    pub fn rename_folder(&self, old: &str, new: &str) -> EngineResult<usize> {
        let hosts_count = self.hosts.rename_folder(old, new)?;
        let _ = self.folders.rename(old, new);
        Ok(hosts_count)
    }

    pub fn move_host_to_folder(&self, id: &str, folder: Option<String>) -> EngineResult<()> {
        self.hosts.move_to_folder(id, folder)
    }

    pub fn bulk_delete_hosts(&self, ids: &[String]) -> registry::BulkResult {
        let result = self.hosts.bulk_delete(ids);
        for id in &result.success {
            self.pool.close(id);
        }
        result
    }

    pub fn bulk_move_hosts_to_folder(&self, ids: &[String], folder: Option<String>) -> registry::BulkResult {
        self.hosts.bulk_move_to_folder(ids, folder)
    }

    pub fn bulk_assign_tags(
        &self,
        ids: &[String],
        tags: &std::collections::BTreeSet<String>,
        mode: TagMode,
    ) -> registry::BulkResult {
        self.hosts.bulk_assign_tags(ids, tags, mode)
    }

    pub fn import_hosts(&self, inputs: Vec<registry::HostInput>) -> registry::BulkResult {
        self.hosts.import(inputs)
    }

    pub fn export_hosts(&self, ids: Option<&[String]>) -> Vec<models::Host> {
        self.hosts.export(ids)
    }

    // ---- Credential Registry (C4) -----------------------------------

    pub fn list_credentials(&self) -> Vec<models::Credential> {
        self.credentials.list()
    }

    pub fn save_credential(&self, input: registry::CredentialInput, secret: &[u8]) -> EngineResult<models::Credential> {
        self.credentials.save(input, secret)
    }

    pub fn delete_credential(&self, id: &str) -> EngineResult<()> {
        self.credentials.delete(id)
    }

    // ---- Folders ------------------------------------------------------

    pub fn list_folders(&self) -> Vec<models::Folder> {
        self.folders.list()
    }

    pub fn create_folder(&self, name: String, parent: Option<String>) -> EngineResult<()> {
        self.folders.create(name, parent)
    }

    pub fn delete_folder(&self, name: &str) -> EngineResult<()> {
        self.folders.delete(name)
    }

    // ---- SSH Session (C6) ----------------------------------------------

    pub async fn open_terminal(self: &Arc<Self>, host_id: String, cols: u32, rows: u32) -> EngineResult<String> {
        self.bus.publish(Event::SessionStatus { session_id: String::new(), status: "connecting".into() });
        let session = SshSession::open(&self.pool, self.bus.clone(), host_id.clone(), cols, rows).await?;
        let session = Arc::new(session);
        let session_id = session.id.clone();

        self.sessions.lock().await.insert(session_id.clone(), session);
        let _ = self.session_tracker.register_session(session_id.clone(), host_id, SessionKind::Terminal);

        self.bus.publish(Event::SessionStatus { session_id: session_id.clone(), status: "connected".into() });
        Ok(session_id)
    }

    pub async fn write_terminal(&self, session_id: &str, data: Vec<u8>) -> EngineResult<()> {
        let session = self.get_session(session_id).await?;
        session.write(data).await
    }

    pub async fn resize_terminal(&self, session_id: &str, cols: u32, rows: u32) -> EngineResult<()> {
        let session = self.get_session(session_id).await?;
        session.resize(cols, rows).await
    }

    pub async fn close_terminal(&self, session_id: &str) -> EngineResult<()> {
        let session = self.sessions.lock().await.remove(session_id);
        if let Some(session) = session {
            session.close().await?;
        }
        let _ = self.session_tracker.unregister(session_id);
        self.bus.publish(Event::SessionStatus { session_id: session_id.to_string(), status: "closed".into() });
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> EngineResult<Arc<SshSession>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    /// `get_persisted_sessions()` per spec §4.12: the UI's own decision
    /// whether to restore any of them; the core never reconnects itself.
    pub fn get_persisted_sessions(&self) -> Vec<models::SessionTrackerRecord> {
        self.session_tracker.get_persisted_sessions()
    }

    // ---- Broadcast Coordinator (C11) ------------------------------------

    pub async fn broadcast(&self, host_ids: &[String], command: &str) -> HashMap<String, Result<(), String>> {
        // `self.sessions` is keyed by session_id; broadcast targets hosts, so
        // re-index by host_id first. If a host has more than one open
        // session, the last one encountered wins.
        let mut sessions_by_host: HashMap<String, Arc<SshSession>> = HashMap::new();
        for session in self.sessions.lock().await.values() {
            sessions_by_host.insert(session.host_id().to_string(), session.clone());
        }
        let results = broadcast::broadcast(host_ids, command, &sessions_by_host).await;
        self.bus.publish(Event::BroadcastResult { results: results.clone() });
        results
    }

    // ---- SFTP Service (C7) ----------------------------------------------

    pub async fn sftp_list(&self, host_id: &str, path: &str) -> EngineResult<Vec<models::FileEntry>> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::list_files(&handle, host_id, path, &self.owner_names).await
    }

    pub async fn sftp_stat(&self, host_id: &str, path: &str) -> EngineResult<models::FileEntry> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::stat(&handle, path).await
    }

    pub async fn sftp_mkdir(&self, host_id: &str, path: &str) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::mkdir(&handle, path).await
    }

    /// `recursive` only matters when `is_dir` is true: a non-empty directory
    /// deleted without it fails with `Conflict` per spec §8 (no partial
    /// deletion of its contents happens either way).
    pub async fn sftp_delete(&self, host_id: &str, path: &str, is_dir: bool, recursive: bool) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::delete(&handle, path, is_dir, recursive).await
    }

    pub async fn sftp_rename(&self, host_id: &str, from: &str, to: &str) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::rename(&handle, from, to).await
    }

    pub async fn sftp_copy(&self, host_id: &str, source: &str, target: &str) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::copy(&handle, source, target).await
    }

    pub async fn sftp_symlink(&self, host_id: &str, target: &str, link_path: &str) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::create_symlink(&handle, target, link_path).await
    }

    pub async fn sftp_read(&self, host_id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::read_file(&handle, path).await
    }

    pub async fn sftp_write(&self, host_id: &str, path: &str, data: &[u8]) -> EngineResult<()> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::write_file(&handle, path, data).await
    }

    pub async fn sftp_checksum(&self, host_id: &str, path: &str, algo: &str) -> EngineResult<String> {
        let handle = self.pool.acquire(host_id).await?;
        ssh::sftp::calculate_checksum(&handle, path, algo).await
    }

    // ---- Local FS Service (C8) -------------------------------------------

    pub fn local_list(&self, dir: &std::path::Path) -> EngineResult<Vec<models::FileEntry>> {
        localfs::list_files(dir)
    }

    // ---- Transfer Queue (C9) ---------------------------------------------

    pub fn enqueue_transfer(&self, spec: transfer::TransferJobSpec) -> models::TransferJob {
        self.transfers.enqueue(spec)
    }

    pub fn pause_transfer(&self, job_id: &str) -> EngineResult<()> {
        self.transfers.pause(job_id)
    }

    pub fn resume_transfer(&self, job_id: &str) -> EngineResult<()> {
        self.transfers.resume(job_id)
    }

    pub fn cancel_transfer(&self, job_id: &str) -> EngineResult<()> {
        self.transfers.cancel(job_id)
    }

    pub fn resolve_transfer_conflict(&self, job_id: &str, action: models::ConflictAction) -> EngineResult<()> {
        self.transfers.resolve_conflict(job_id, action)
    }

    pub fn clear_completed_transfers(&self) {
        self.transfers.clear_completed()
    }

    pub fn list_transfers(&self) -> Vec<models::TransferJob> {
        self.transfers.list()
    }

    // ---- Edit-on-Fly Handler (C10) ----------------------------------------

    pub async fn edit_open(self: &Arc<Self>, host_id: String, remote_path: String) -> EngineResult<(String, String)> {
        self.edit.open(host_id, remote_path).await
    }

    pub fn edit_close(&self, watcher_id: &str) -> EngineResult<()> {
        self.edit.close(watcher_id)
    }

    // ---- Host-key decisions (C2/C5) ---------------------------------------

    pub fn accept_host_key(&self, hostname: &str, port: u16, save: bool) {
        self.pool.resolve_host_key_decision(hostname, port, Some(save));
    }

    pub fn deny_host_key(&self, hostname: &str, port: u16) {
        self.pool.resolve_host_key_decision(hostname, port, None);
    }

    // ---- Message Bus dispatch (C14) ----------------------------------------

    /// Single inbound command surface (spec §4.13, §6). Mutating commands
    /// also publish their own `DataUpdate`/`TransferStateChanged`/etc.
    /// events on the bus; the `Event` returned here is the direct reply to
    /// the caller (useful for request/response embeddings that don't want
    /// to correlate against the broadcast stream for simple acks).
    pub async fn dispatch(self: &Arc<Self>, command: Command) -> Event {
        match self.dispatch_inner(command).await {
            Ok(event) => event,
            Err(e) => Event::Error { code: e.code(), message: e.to_string(), correlation_id: None },
        }
    }

    async fn dispatch_inner(self: &Arc<Self>, command: Command) -> EngineResult<Event> {
        match command {
            Command::HostList => Ok(Event::DataUpdate { hosts: Some(self.list_hosts()), credentials: None, folders: None }),
            Command::HostGet { id } => {
                let host = self.get_host(&id)?;
                Ok(Event::DataUpdate { hosts: Some(vec![host]), credentials: None, folders: None })
            }
            Command::HostSave { host, password, key_path } => {
                let input = registry::HostInput {
                    id: Some(host.id),
                    name: host.name,
                    hostname: host.hostname,
                    port: Some(host.port),
                    username: host.username,
                    auth_type: Some(host.auth_type),
                    credential_id: host.credential_id,
                    folder: host.folder,
                    tags: host.tags,
                    notes: host.notes,
                    os_hint: host.os_hint,
                    password,
                    key_path,
                };
                let saved = self.save_host(input)?;
                Ok(Event::DataUpdate { hosts: Some(vec![saved]), credentials: None, folders: None })
            }
            Command::HostDelete { id } => {
                self.delete_host(&id)?;
                Ok(Event::DataUpdate { hosts: Some(self.list_hosts()), credentials: None, folders: None })
            }
            Command::HostClone { id } => {
                let host = self.clone_host(&id)?;
                Ok(Event::DataUpdate { hosts: Some(vec![host]), credentials: None, folders: None })
            }
            Command::HostTogglePin { id } => {
                let host = self.toggle_pin(&id)?;
                Ok(Event::DataUpdate { hosts: Some(vec![host]), credentials: None, folders: None })
            }
            Command::HostRenameFolder { old, new } => {
                self.rename_folder(&old, &new)?;
                Ok(Event::DataUpdate { hosts: Some(self.list_hosts()), credentials: None, folders: Some(self.list_folders()) })
            }
            Command::HostMoveToFolder { id, folder } => {
                self.move_host_to_folder(&id, folder)?;
                Ok(Event::DataUpdate { hosts: Some(self.list_hosts()), credentials: None, folders: None })
            }
            Command::HostBulkDelete { ids } => {
                let r = self.bulk_delete_hosts(&ids);
                Ok(Event::BulkOperationResult { success: r.success, failed: r.failed, errors: r.errors })
            }
            Command::HostBulkMoveToFolder { ids, folder } => {
                let r = self.bulk_move_hosts_to_folder(&ids, folder);
                Ok(Event::BulkOperationResult { success: r.success, failed: r.failed, errors: r.errors })
            }
            Command::HostBulkAssignTags { ids, tags, mode } => {
                let r = self.bulk_assign_tags(&ids, &tags, mode);
                Ok(Event::BulkOperationResult { success: r.success, failed: r.failed, errors: r.errors })
            }
            Command::HostImport { hosts } => {
                let inputs = hosts.into_iter().map(Into::into).collect();
                let r = self.import_hosts(inputs);
                Ok(Event::BulkOperationResult { success: r.success, failed: r.failed, errors: r.errors })
            }
            Command::HostExport { ids } => {
                let exported = self.export_hosts(ids.as_deref());
                Ok(Event::DataUpdate { hosts: Some(exported), credentials: None, folders: None })
            }
            Command::CredentialList => Ok(Event::DataUpdate { hosts: None, credentials: Some(self.list_credentials()), folders: None }),
            Command::CredentialSave { input, secret } => {
                let credential = self.save_credential(
                    registry::CredentialInput {
                        id: input.id,
                        name: input.name,
                        username: input.username,
                        kind: input.kind,
                        folder: input.folder,
                        tags: input.tags,
                    },
                    secret.as_bytes(),
                )?;
                Ok(Event::DataUpdate { hosts: None, credentials: Some(vec![credential]), folders: None })
            }
            Command::CredentialDelete { id } => {
                self.delete_credential(&id)?;
                Ok(Event::DataUpdate { hosts: None, credentials: Some(self.list_credentials()), folders: None })
            }
            Command::FolderList => Ok(Event::DataUpdate { hosts: None, credentials: None, folders: Some(self.list_folders()) }),
            Command::FolderCreate { name, parent } => {
                self.create_folder(name, parent)?;
                Ok(Event::DataUpdate { hosts: None, credentials: None, folders: Some(self.list_folders()) })
            }
            Command::FolderDelete { name } => {
                self.delete_folder(&name)?;
                Ok(Event::DataUpdate { hosts: None, credentials: None, folders: Some(self.list_folders()) })
            }
            Command::SessionOpen { host_id } => {
                let session_id = self.open_terminal(host_id, 80, 24).await?;
                Ok(Event::SessionStatus { session_id, status: "connected".into() })
            }
            Command::SessionWrite { session_id, data } => {
                self.write_terminal(&session_id, data).await?;
                Ok(Event::SessionStatus { session_id, status: "ack".into() })
            }
            Command::SessionResize { session_id, cols, rows } => {
                self.resize_terminal(&session_id, cols, rows).await?;
                Ok(Event::SessionStatus { session_id, status: "resized".into() })
            }
            Command::SessionClose { session_id } => {
                self.close_terminal(&session_id).await?;
                Ok(Event::SessionStatus { session_id, status: "closed".into() })
            }
            Command::SftpList { host_id, path } => {
                let entries = self.sftp_list(&host_id, &path).await?;
                Ok(Event::SftpListing { host_id, path, entries })
            }
            Command::SftpStat { host_id, path } => {
                let entry = self.sftp_stat(&host_id, &path).await?;
                Ok(Event::SftpEntry { host_id, path, entry })
            }
            Command::SftpMkdir { host_id, path } => {
                self.sftp_mkdir(&host_id, &path).await?;
                Ok(Event::SftpAck { host_id, path })
            }
            Command::SftpDelete { host_id, path, is_dir, recursive } => {
                self.sftp_delete(&host_id, &path, is_dir, recursive).await?;
                Ok(Event::SftpAck { host_id, path })
            }
            Command::SftpRename { host_id, from, to } => {
                self.sftp_rename(&host_id, &from, &to).await?;
                Ok(Event::SftpAck { host_id, path: to })
            }
            Command::SftpCopy { host_id, source, target } => {
                self.sftp_copy(&host_id, &source, &target).await?;
                Ok(Event::SftpAck { host_id, path: target })
            }
            Command::SftpMove { host_id, from, to } => {
                // Move is rename (spec §4.6).
                self.sftp_rename(&host_id, &from, &to).await?;
                Ok(Event::SftpAck { host_id, path: to })
            }
            Command::SftpRead { host_id, path } => {
                let data = self.sftp_read(&host_id, &path).await?;
                Ok(Event::SftpData { host_id, path, data })
            }
            Command::SftpWrite { host_id, path, data } => {
                self.sftp_write(&host_id, &path, &data).await?;
                Ok(Event::SftpAck { host_id, path })
            }
            Command::SftpSymlink { host_id, target, link_path } => {
                self.sftp_symlink(&host_id, &target, &link_path).await?;
                Ok(Event::SftpAck { host_id, path: link_path })
            }
            Command::SftpChecksum { host_id, path, algo } => {
                let checksum = self.sftp_checksum(&host_id, &path, &algo).await?;
                Ok(Event::SftpChecksum { host_id, path, algo, checksum })
            }
            Command::TransferEnqueue { host_id, kind, source_path, target_path } => {
                let job = self.enqueue_transfer(transfer::TransferJobSpec { kind, host_id, source_path, target_path });
                Ok(Event::TransferStateChanged { job_id: job.id.clone(), job })
            }
            Command::TransferPause { job_id } => {
                self.pause_transfer(&job_id)?;
                self.job_event(&job_id)
            }
            Command::TransferResume { job_id } => {
                self.resume_transfer(&job_id)?;
                self.job_event(&job_id)
            }
            Command::TransferCancel { job_id } => {
                self.cancel_transfer(&job_id)?;
                self.job_event(&job_id)
            }
            Command::TransferResolveConflict { job_id, action } => {
                self.resolve_transfer_conflict(&job_id, action)?;
                self.job_event(&job_id)
            }
            Command::HostKeyAccept { hostname, port, save } => {
                self.accept_host_key(&hostname, port, save);
                Ok(Event::Pong { correlation_id: format!("{hostname}:{port}") })
            }
            Command::HostKeyDeny { hostname, port } => {
                self.deny_host_key(&hostname, port);
                Ok(Event::Pong { correlation_id: format!("{hostname}:{port}") })
            }
            Command::EditOpen { host_id, remote_path } => {
                let (watcher_id, local_path) = self.edit_open(host_id, remote_path).await?;
                Ok(Event::EditSessionOpened { watcher_id, local_path })
            }
            Command::EditClose { watcher_id } => {
                self.edit_close(&watcher_id)?;
                Ok(Event::Pong { correlation_id: watcher_id })
            }
            Command::Broadcast { host_ids, command } => {
                let results = self.broadcast(&host_ids, &command).await;
                Ok(Event::BroadcastResult { results })
            }
            Command::Ping { correlation_id } => Ok(Event::Pong { correlation_id }),
        }
    }

    fn job_event(&self, job_id: &str) -> EngineResult<Event> {
        let job = self
            .transfers
            .list()
            .into_iter()
            .find(|j| j.id == job_id)
            .ok_or_else(|| EngineError::NotFound(format!("transfer job {job_id}")))?;
        Ok(Event::TransferStateChanged { job_id: job_id.to_string(), job })
    }

    /// Shutdown (spec §5): cancel the reaper/scheduler/prober/sweeper,
    /// abort running transfers, close every session, remove edit-on-fly
    /// temp files, then close the pool.
    pub async fn shutdown(&self) {
        info!("engine: shutting down");
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }

        for job in self.transfers.list() {
            if !job.state.is_terminal() {
                let _ = self.transfers.cancel(&job.id);
            }
        }

        let sessions: Vec<Arc<SshSession>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.close().await;
        }

        self.edit.shutdown();
        self.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secret_store::MemorySecretStore;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.data_dir = dir.to_path_buf();
        config.secret_service_name = format!("sshbench-test-{}", uuid::Uuid::new_v4());
        config
    }

    #[tokio::test]
    async fn engine_starts_and_persists_a_host() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let host = engine
            .save_host(registry::HostInput {
                name: "h1".into(),
                hostname: "127.0.0.1".into(),
                username: "u".into(),
                password: Some("p".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(engine.list_hosts().len(), 1);
        assert_eq!(engine.get_host(&host.id).unwrap().name, "h1");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_host_list_round_trips_through_bus() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();
        let event = engine.dispatch(Command::HostList).await;
        match event {
            Event::DataUpdate { hosts: Some(hosts), .. } => assert!(hosts.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_transfer_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();
        let event = engine.dispatch(Command::TransferPause { job_id: "nope".into() }).await;
        matches!(event, Event::Error { .. });
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn sftp_commands_against_an_unknown_host_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();
        let event = engine
            .dispatch(Command::SftpStat { host_id: "nope".into(), path: "/etc/hostname".into() })
            .await;
        assert!(matches!(event, Event::Error { .. }));
        let event = engine
            .dispatch(Command::SftpChecksum { host_id: "nope".into(), path: "/etc/hostname".into(), algo: "sha256".into() })
            .await;
        assert!(matches!(event, Event::Error { .. }));
        engine.shutdown().await;
    }

    #[test]
    fn memory_secret_store_is_available_for_embedding_hosts_that_skip_keyring() {
        let store = MemorySecretStore::default();
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v");
    }
}
