//! C10 — Edit-on-Fly Handler (spec §4.9), grounded in the teacher's
//! download/upload chunked I/O (`ssh/file_ops.rs`) for the round-trip and
//! in the pack's `notify`-based watcher pattern (`other_examples`
//! `Nohac-rum/src/watch.rs`) for the debounced filesystem watch, adapted
//! from a one-shot bridge into a per-session registry with hash-gated
//! write-back.

use crate::bus::{Bus, Event};
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, EditSession};
use crate::ssh::pool::ConnectionPool;
use crate::ssh::sftp;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

struct ActiveWatch {
    session: EditSession,
    _watcher: RecommendedWatcher,
    uploading: Arc<std::sync::atomic::AtomicBool>,
}

pub struct EditHandler {
    pool: Arc<ConnectionPool>,
    bus: Bus,
    temp_dir: PathBuf,
    debounce: Duration,
    sweep_ttl: Duration,
    watches: Mutex<HashMap<String, ActiveWatch>>,
}

impl EditHandler {
    pub fn new(pool: Arc<ConnectionPool>, bus: Bus, base_temp_dir: PathBuf, debounce: Duration, sweep_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            temp_dir: base_temp_dir.join("ssh-workbench-edit"),
            debounce,
            sweep_ttl,
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// `open(host_id, remote_path)` per spec §4.9: download, watch, return
    /// the watcher id (for `close`) and the local temp path for the
    /// embedding UI to open in its editor.
    pub async fn open(self: &Arc<Self>, host_id: String, remote_path: String) -> EngineResult<(String, String)> {
        std::fs::create_dir_all(&self.temp_dir)?;

        let watcher_id = uuid::Uuid::new_v4().to_string();
        let short_id = &watcher_id[..8];
        let basename = sanitize_basename(&remote_path);
        let local_temp_path = self.temp_dir.join(format!("{short_id}_{basename}"));

        let handle = self.pool.acquire(&host_id).await?;
        let bytes = sftp::read_file(&handle, &remote_path).await?;
        std::fs::write(&local_temp_path, &bytes)?;
        drop(handle);

        let last_uploaded_hash = Some(hex::encode(Sha256::digest(&bytes)));

        let session = EditSession {
            watcher_id: watcher_id.clone(),
            host_id: host_id.clone(),
            remote_path: remote_path.clone(),
            local_temp_path: local_temp_path.to_string_lossy().to_string(),
            last_uploaded_hash,
            created_at: now_ts(),
        };

        let watcher = self.spawn_watcher(watcher_id.clone(), local_temp_path.clone())?;

        self.watches.lock().unwrap().insert(
            watcher_id.clone(),
            ActiveWatch {
                session: session.clone(),
                _watcher: watcher,
                uploading: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
        );

        info!(watcher_id, remote_path, local_temp_path = %local_temp_path.display(), "edit-on-fly: opened");
        Ok((watcher_id, session.local_temp_path))
    }

    fn spawn_watcher(self: &Arc<Self>, watcher_id: String, local_path: PathBuf) -> EngineResult<RecommendedWatcher> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| EngineError::Internal(format!("watcher init: {e}")))?;

        watcher
            .watch(&local_path, RecursiveMode::NonRecursive)
            .map_err(|e| EngineError::Internal(format!("watch {}: {e}", local_path.display())))?;

        let handler = self.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Some(()) => {
                        // Debounce: coalesce a burst of fs events into one check.
                        tokio::time::sleep(debounce).await;
                        while rx.try_recv().is_ok() {}
                        handler.on_change(&watcher_id).await;
                    }
                    None => break,
                }
            }
        });

        Ok(watcher)
    }

    async fn on_change(self: &Arc<Self>, watcher_id: &str) {
        let (session, uploading) = {
            let watches = self.watches.lock().unwrap();
            match watches.get(watcher_id) {
                Some(w) => (w.session.clone(), w.uploading.clone()),
                None => return,
            }
        };

        if uploading.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        let result = self.writeback(&session).await;
        uploading.store(false, std::sync::atomic::Ordering::SeqCst);

        match result {
            Ok(Some(new_hash)) => {
                if let Some(watch) = self.watches.lock().unwrap().get_mut(watcher_id) {
                    watch.session.last_uploaded_hash = Some(new_hash);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(watcher_id, error = %e, "edit-on-fly: write-back failed");
                self.bus.publish(Event::Error {
                    code: e.code(),
                    message: format!("edit write-back failed for {}: {e}", session.remote_path),
                    correlation_id: None,
                });
            }
        }
    }

    /// Reads the temp file, and if its content hash differs from
    /// `last_uploaded_hash`, uploads it back. Returns the new hash on a
    /// successful write-back, `None` if the save was a no-op.
    async fn writeback(&self, session: &EditSession) -> EngineResult<Option<String>> {
        let bytes = std::fs::read(&session.local_temp_path)?;
        let hash = hex::encode(Sha256::digest(&bytes));
        if Some(&hash) == session.last_uploaded_hash.as_ref() {
            return Ok(None);
        }

        let handle = self.pool.acquire(&session.host_id).await?;
        sftp::write_file(&handle, &session.remote_path, &bytes).await?;
        info!(remote_path = %session.remote_path, "edit-on-fly: wrote back change");
        Ok(Some(hash))
    }

    /// `close(watcher_id)` per spec §4.9: stop the watcher, delete the temp
    /// file, remove the registry entry.
    pub fn close(&self, watcher_id: &str) -> EngineResult<()> {
        let watch = self
            .watches
            .lock()
            .unwrap()
            .remove(watcher_id)
            .ok_or_else(|| EngineError::NotFound(format!("edit session {watcher_id}")))?;
        let _ = std::fs::remove_file(&watch.session.local_temp_path);
        Ok(())
    }

    pub fn list(&self) -> Vec<EditSession> {
        self.watches.lock().unwrap().values().map(|w| w.session.clone()).collect()
    }

    /// Periodic sweep (spec §4.9: hourly): deletes temp files older than
    /// the configured TTL whose watcher is gone (i.e. not tracked here).
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                handler.sweep();
            }
        })
    }

    fn sweep(&self) {
        let Ok(read_dir) = std::fs::read_dir(&self.temp_dir) else {
            return;
        };
        let tracked: std::collections::HashSet<String> = self
            .watches
            .lock()
            .unwrap()
            .values()
            .map(|w| w.session.local_temp_path.clone())
            .collect();

        for entry in read_dir.flatten() {
            let path = entry.path();
            let path_str = path.to_string_lossy().to_string();
            if tracked.contains(&path_str) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let age = modified.elapsed().unwrap_or_default();
            if age > self.sweep_ttl {
                info!(path = %path.display(), "edit-on-fly: sweeping stale temp file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    /// Shutdown: remove every temp file this handler created, tracked or not.
    pub fn shutdown(&self) {
        let watches: Vec<ActiveWatch> = self.watches.lock().unwrap().drain().map(|(_, w)| w).collect();
        for watch in watches {
            let _ = std::fs::remove_file(&watch.session.local_temp_path);
        }
    }
}

fn sanitize_basename(remote_path: &str) -> String {
    let basename = remote_path.rsplit('/').next().unwrap_or(remote_path);
    basename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_basename_strips_directory_and_odd_chars() {
        assert_eq!(sanitize_basename("/etc/nginx/sites-available/site one.conf"), "site_one.conf");
        assert_eq!(sanitize_basename("plain.txt"), "plain.txt");
    }
}
