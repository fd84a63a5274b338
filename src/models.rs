//! Persistent and runtime data model (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Password,
    Key,
    Agent,
    CredentialRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    pub credential_id: Option<String>,
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub pinned: bool,
    pub last_used_at: Option<i64>,
    pub notes: Option<String>,
    pub os_hint: Option<String>,
}

impl Host {
    pub fn new_id() -> String {
        new_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    #[default]
    Password,
    Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(rename = "type")]
    pub kind: CredentialType,
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub key_type: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Credential {
    pub fn new_id() -> String {
        new_id()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub parent: Option<String>,
}

/// `(hostname, port, key_algo)` uniquely identifies a record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyRecord {
    pub hostname: String,
    pub port: u16,
    pub key_algo: String,
    #[serde(with = "base64_bytes")]
    pub key_bytes: Vec<u8>,
    pub first_seen_at: i64,
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    Valid,
    Unknown,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub permissions: u32,
    pub mtime: i64,
    pub owner_uid: u32,
    pub owner_gid: u32,
    /// Human-readable owner name, resolved best-effort (supplemented feature).
    pub owner_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
    RemoteCopy,
    RemoteMove,
    LocalCopy,
    LocalMove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TransferState {
    Pending,
    Running,
    Paused,
    AwaitingConflict,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed { .. } | TransferState::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Running => "running",
            TransferState::Paused => "paused",
            TransferState::AwaitingConflict => "awaiting_conflict",
            TransferState::Completed => "completed",
            TransferState::Failed { .. } => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeHint {
    Known(u64),
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: String,
    pub kind: TransferKind,
    pub host_id: Option<String>,
    pub source_path: String,
    pub target_path: String,
    pub size_bytes: SizeHint,
    pub bytes_done: u64,
    pub state: TransferState,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

impl TransferJob {
    pub fn new_id() -> String {
        new_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Overwrite,
    Skip,
    Rename,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSession {
    pub watcher_id: String,
    pub host_id: String,
    pub remote_path: String,
    pub local_temp_path: String,
    pub last_uploaded_hash: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Terminal,
    Sftp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTrackerRecord {
    pub host_id: String,
    pub kind: SessionKind,
    pub opened_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
    Unknown,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
