//! C2 — Host-Key Store (spec §4.1).
//!
//! Persists known server host keys as a line-oriented text file, one
//! record per line: `"[host]:port algo base64(key)"`. Lookup matches on
//! `(hostname, port, algo)`; bytes must match exactly for `Valid`.
//!
//! Per REDESIGN FLAGS: the caller MUST pass the real server-presented host
//! key obtained from the SSH handshake (`ssh2::Session::host_key`), never a
//! synthetic buffer — the store itself is agnostic to where the bytes came
//! from, so that invariant lives in the connection-pool caller (see
//! `ssh::pool`).

use crate::models::KeyVerdict;
use base64::Engine as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

type HostKey = (String, u16, String);

#[derive(Default)]
struct Records {
    by_key: HashMap<HostKey, Vec<u8>>,
}

impl Records {
    fn parse(text: &str) -> Self {
        let mut by_key = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(rec) = parse_line(line) else {
                continue;
            };
            by_key.insert((rec.0, rec.1, rec.2), rec.3);
        }
        Records { by_key }
    }

    fn render(&self) -> String {
        let mut lines: Vec<String> = self
            .by_key
            .iter()
            .map(|((hostname, port, algo), key_bytes)| {
                format!(
                    "[{hostname}]:{port} {algo} {}",
                    base64::engine::general_purpose::STANDARD.encode(key_bytes)
                )
            })
            .collect();
        lines.sort();
        lines.join("\n") + if lines.is_empty() { "" } else { "\n" }
    }
}

fn parse_line(line: &str) -> Option<(String, u16, String, Vec<u8>)> {
    let mut parts = line.splitn(3, ' ');
    let host_port = parts.next()?;
    let algo = parts.next()?;
    let b64 = parts.next()?;

    let host_port = host_port.strip_prefix('[')?;
    let (hostname, rest) = host_port.split_once("]:")?;
    let port: u16 = rest.parse().ok()?;
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .ok()?;

    Some((hostname.to_string(), port, algo.to_string(), key_bytes))
}

pub struct HostKeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn read_records(&self) -> Records {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Records::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::default(),
            Err(e) => {
                // A read failure is treated as Unknown, never Valid — return
                // an empty record set so every lookup misses.
                warn!("host key store: failed to read {:?}: {e}", self.path);
                Records::default()
            }
        }
    }

    /// `verify(hostname, port, algo, key_bytes) -> {Valid, Unknown, Changed}`.
    pub fn verify(&self, hostname: &str, port: u16, algo: &str, key_bytes: &[u8]) -> KeyVerdict {
        let _guard = self.lock.lock().unwrap();
        let records = self.read_records();
        let key = (hostname.to_string(), port, algo.to_string());
        match records.by_key.get(&key) {
            Some(existing) if existing.as_slice() == key_bytes => KeyVerdict::Valid,
            Some(_) => KeyVerdict::Changed,
            None => KeyVerdict::Unknown,
        }
    }

    /// Persists `(hostname, port, algo, key_bytes)`, overwriting any prior
    /// record for the same `(hostname, port, algo)`.
    pub fn accept(&self, hostname: &str, port: u16, algo: &str, key_bytes: &[u8]) -> Result<(), String> {
        let _guard = self.lock.lock().unwrap();
        self.ensure_parent().map_err(|e| e.to_string())?;

        let mut records = self.read_records();
        records
            .by_key
            .insert((hostname.to_string(), port, algo.to_string()), key_bytes.to_vec());

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, records.render()).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, &self.path).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::new(dir.path().join("known_hosts"));
        let verdict = store.verify("example.com", 22, "ssh-ed25519", b"not-a-real-key");
        assert_eq!(verdict, KeyVerdict::Unknown);
    }

    #[test]
    fn accept_then_verify_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::new(dir.path().join("known_hosts"));
        let key = b"fake-key-bytes-for-test";
        store.accept("example.com", 2222, "ssh-ed25519", key).unwrap();
        assert_eq!(
            store.verify("example.com", 2222, "ssh-ed25519", key),
            KeyVerdict::Valid
        );
    }

    #[test]
    fn changed_key_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::new(dir.path().join("known_hosts"));
        store
            .accept("example.com", 22, "ssh-ed25519", b"key-one")
            .unwrap();
        assert_eq!(
            store.verify("example.com", 22, "ssh-ed25519", b"key-two"),
            KeyVerdict::Changed
        );
    }

    #[test]
    fn different_algo_is_independent_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::new(dir.path().join("known_hosts"));
        store.accept("h", 22, "ssh-ed25519", b"k1").unwrap();
        assert_eq!(store.verify("h", 22, "ssh-rsa", b"k1"), KeyVerdict::Unknown);
    }

    #[test]
    fn corrupt_file_is_unknown_not_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, b"\xff\xfe not a valid utf8 line at all \x00").ok();
        let store = HostKeyStore::new(path);
        assert_eq!(
            store.verify("h", 22, "ssh-ed25519", b"anything"),
            KeyVerdict::Unknown
        );
    }
}
