//! C13 — Session Tracker (spec §4.12): a durable record of open sessions
//! so the embedding host can offer "restore previous session" on startup.
//! No 1:1 teacher module covers this (the teacher persists connections,
//! not live session state); grounded in the same atomic-JSON persistence
//! `registry::storage` gives C3/C4, since the shape (`sessions.json`, one
//! array, write-to-temp-then-rename) is identical.
//!
//! The core never re-establishes sessions itself — `get_persisted_sessions`
//! only feeds the UI's own restoration decision (spec §4.12).

use crate::error::EngineResult;
use crate::models::{now_ts, SessionKind, SessionTrackerRecord};
use crate::registry::storage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// `SessionTrackerRecord` has no id field in the data model (spec §3); the
/// tracker key used for `unregister` is the caller's own session/handle id
/// and is never persisted — on reload, persisted records are anonymous
/// entries keyed by a fresh synthetic id.
pub struct SessionTracker {
    path: PathBuf,
    records: Mutex<HashMap<String, SessionTrackerRecord>>,
}

impl SessionTracker {
    pub fn load(path: PathBuf) -> EngineResult<Self> {
        let persisted: Vec<SessionTrackerRecord> = storage::load(&path)?;
        let records = persisted
            .into_iter()
            .map(|record| (uuid::Uuid::new_v4().to_string(), record))
            .collect();
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &HashMap<String, SessionTrackerRecord>) -> EngineResult<()> {
        let list: Vec<SessionTrackerRecord> = records.values().cloned().collect();
        storage::save(&self.path, &list)
    }

    /// `register_session(host_id, kind)` per spec §4.12: appends a record
    /// keyed by `id` (the caller's session/sftp-handle id).
    pub fn register_session(&self, id: String, host_id: String, kind: SessionKind) -> EngineResult<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(
            id,
            SessionTrackerRecord {
                host_id,
                kind,
                opened_at: now_ts(),
            },
        );
        self.persist(&records)
    }

    pub fn unregister(&self, id: &str) -> EngineResult<()> {
        let mut records = self.records.lock().unwrap();
        if records.remove(id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    pub fn get_persisted_sessions(&self) -> Vec<SessionTrackerRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, SessionTracker) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let tracker = SessionTracker::load(path).unwrap();
        (dir, tracker)
    }

    #[test]
    fn register_then_list_contains_record() {
        let (_dir, tracker) = fixture();
        tracker
            .register_session("s1".into(), "h1".into(), SessionKind::Terminal)
            .unwrap();
        let sessions = tracker.get_persisted_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].host_id, "h1");
    }

    #[test]
    fn unregister_removes_record() {
        let (_dir, tracker) = fixture();
        tracker
            .register_session("s1".into(), "h1".into(), SessionKind::Sftp)
            .unwrap();
        tracker.unregister("s1").unwrap();
        assert!(tracker.get_persisted_sessions().is_empty());
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let tracker = SessionTracker::load(path.clone()).unwrap();
            tracker
                .register_session("s1".into(), "h1".into(), SessionKind::Terminal)
                .unwrap();
        }
        let reloaded = SessionTracker::load(path).unwrap();
        assert_eq!(reloaded.get_persisted_sessions().len(), 1);
    }

    #[test]
    fn unregister_unknown_id_is_a_no_op() {
        let (_dir, tracker) = fixture();
        assert!(tracker.unregister("nope").is_ok());
    }
}
