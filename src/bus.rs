//! C14 — Message Bus (spec §4.13, §6).
//!
//! One inbound `Command` per operation across C3-C11 (the `Engine` struct
//! in `lib.rs` owns the dispatch), one outbound `Event` enum subscribers
//! drain via `tokio::sync::broadcast`. Delivery is ordered per-subscriber;
//! a lagging subscriber is told how many events it missed via
//! `RecvError::Lagged(n)` rather than silently losing them.

use crate::error::ErrorCode;
use crate::models::{Credential, FileEntry, Folder, Host, HostStatus, TransferJob};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    HostList,
    HostGet { id: String },
    HostSave { host: Host, password: Option<String>, key_path: Option<String> },
    HostDelete { id: String },
    HostClone { id: String },
    HostTogglePin { id: String },
    HostRenameFolder { old: String, new: String },
    HostMoveToFolder { id: String, folder: Option<String> },
    HostBulkDelete { ids: Vec<String> },
    HostBulkMoveToFolder { ids: Vec<String>, folder: Option<String> },
    HostBulkAssignTags {
        ids: Vec<String>,
        tags: std::collections::BTreeSet<String>,
        mode: crate::registry::TagMode,
    },
    HostImport { hosts: Vec<HostInputWire> },
    HostExport { ids: Option<Vec<String>> },
    CredentialList,
    CredentialSave { input: CredentialInputWire, secret: String },
    CredentialDelete { id: String },
    FolderList,
    FolderCreate { name: String, parent: Option<String> },
    FolderDelete { name: String },
    SessionOpen { host_id: String },
    SessionWrite { session_id: String, data: Vec<u8> },
    SessionResize { session_id: String, cols: u32, rows: u32 },
    SessionClose { session_id: String },
    SftpList { host_id: String, path: String },
    SftpStat { host_id: String, path: String },
    SftpMkdir { host_id: String, path: String },
    SftpDelete { host_id: String, path: String, is_dir: bool, recursive: bool },
    SftpRename { host_id: String, from: String, to: String },
    SftpCopy { host_id: String, source: String, target: String },
    SftpMove { host_id: String, from: String, to: String },
    SftpRead { host_id: String, path: String },
    SftpWrite { host_id: String, path: String, data: Vec<u8> },
    SftpSymlink { host_id: String, target: String, link_path: String },
    SftpChecksum { host_id: String, path: String, algo: String },
    TransferEnqueue {
        host_id: Option<String>,
        kind: crate::models::TransferKind,
        source_path: String,
        target_path: String,
    },
    TransferPause { job_id: String },
    TransferResume { job_id: String },
    TransferCancel { job_id: String },
    TransferResolveConflict { job_id: String, action: crate::models::ConflictAction },
    HostKeyAccept { hostname: String, port: u16, save: bool },
    HostKeyDeny { hostname: String, port: u16 },
    EditOpen { host_id: String, remote_path: String },
    EditClose { watcher_id: String },
    Broadcast { host_ids: Vec<String>, command: String },
    /// Opaque correlation id the embedding host can thread through replies;
    /// not interpreted by the engine itself.
    Ping { correlation_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialInputWire {
    pub id: Option<String>,
    pub name: String,
    pub username: String,
    pub kind: crate::models::CredentialType,
    pub folder: Option<String>,
    pub tags: std::collections::BTreeSet<String>,
}

/// Wire shape for `HostImport`/`HostExport` — mirrors `HostInput` but stays
/// serde-friendly (`HostInput` carries no `Deserialize` since it is built
/// directly by in-process callers too).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInputWire {
    pub id: Option<String>,
    pub name: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    pub auth_type: Option<crate::models::AuthType>,
    pub credential_id: Option<String>,
    pub folder: Option<String>,
    pub tags: std::collections::BTreeSet<String>,
    pub notes: Option<String>,
    pub os_hint: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<String>,
}

impl From<HostInputWire> for crate::registry::HostInput {
    fn from(w: HostInputWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            hostname: w.hostname,
            port: w.port,
            username: w.username,
            auth_type: w.auth_type,
            credential_id: w.credential_id,
            folder: w.folder,
            tags: w.tags,
            notes: w.notes,
            os_hint: w.os_hint,
            password: w.password,
            key_path: w.key_path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    DataUpdate { hosts: Option<Vec<Host>>, credentials: Option<Vec<Credential>>, folders: Option<Vec<Folder>> },
    HostStatusChanged { host_id: String, status: HostStatus, last_checked_at: i64 },
    HostKeyDecisionRequired { hostname: String, port: u16, algo: String, fingerprint_sha256: String },
    SessionData { session_id: String, data: Vec<u8> },
    SessionStatus { session_id: String, status: String },
    SftpListing { host_id: String, path: String, entries: Vec<FileEntry> },
    SftpEntry { host_id: String, path: String, entry: FileEntry },
    SftpAck { host_id: String, path: String },
    SftpData { host_id: String, path: String, data: Vec<u8> },
    SftpChecksum { host_id: String, path: String, algo: String, checksum: String },
    TransferProgress { job_id: String, bytes_done: u64 },
    TransferStateChanged { job_id: String, job: TransferJob },
    TransferQueueState { jobs: Vec<TransferJob>, summary: crate::transfer::QueueSummary },
    TransferConflict { job_id: String, source_path: String, target_path: String },
    BroadcastResult { results: HashMap<String, Result<(), String>> },
    BulkOperationResult { success: Vec<String>, failed: Vec<String>, errors: Vec<String> },
    EditSessionOpened { watcher_id: String, local_path: String },
    Error { code: ErrorCode, message: String, correlation_id: Option<String> },
    Pong { correlation_id: String },
}

#[derive(Clone)]
pub struct Bus {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish; a channel with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = Bus::new(16);
        bus.publish(Event::Pong { correlation_id: "x".into() });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::Pong { correlation_id: "abc".into() });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::Pong { .. });
    }
}
