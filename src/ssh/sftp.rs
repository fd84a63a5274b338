//! C7 — SFTP Service (spec §4.6), grounded in the teacher's
//! `ssh/file_ops.rs` (read/write/list) and `ssh/utils.rs`
//! (`get_remote_file_hash`, `get_dir_size`, `get_sftp_buffer_size`).
//!
//! Every call goes through a pool [`Handle`]'s actor; the actor already
//! holds one `ssh2::Sftp` channel per connection and multiplexes calls
//! onto it, so there is no separate "open/close" lifecycle here beyond the
//! handle's own ref-counted lifetime.

use crate::error::{EngineError, EngineResult};
use crate::models::{FileEntry, FileKind};
use crate::ssh::actor::{ActorCommand, FileStat};
use crate::ssh::pool::Handle;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

pub(crate) const CHUNK_SIZE: usize = 32 * 1024;
const EXEC_COPY_DEADLINE: Duration = Duration::from_secs(5);

/// Caches uid -> username lookups per host so a directory listing of N
/// entries owned by the same user doesn't spawn N `id` execs.
#[derive(Default)]
pub struct OwnerNameCache {
    by_host: Mutex<HashMap<(String, u32), Option<String>>>,
}

impl OwnerNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(&self, handle: &Handle, host_id: &str, uid: u32) -> Option<String> {
        if let Some(cached) = self.by_host.lock().unwrap().get(&(host_id.to_string(), uid)) {
            return cached.clone();
        }
        let name = exec(handle, &format!("id -nu {uid}"), Duration::from_secs(3))
            .await
            .ok()
            .and_then(|(status, out)| {
                if status == 0 {
                    let name = String::from_utf8_lossy(&out).trim().to_string();
                    (!name.is_empty()).then_some(name)
                } else {
                    None
                }
            });
        self.by_host
            .lock()
            .unwrap()
            .insert((host_id.to_string(), uid), name.clone());
        name
    }
}

fn file_stat_to_entry(name: String, path: String, stat: FileStat) -> FileEntry {
    let kind = if stat.is_symlink {
        FileKind::Symlink
    } else if stat.is_dir {
        FileKind::Directory
    } else {
        FileKind::File
    };
    FileEntry {
        name,
        path,
        kind,
        size: stat.size,
        permissions: stat.permissions,
        mtime: stat.mtime,
        owner_uid: stat.uid,
        owner_gid: stat.gid,
        owner_name: None,
    }
}

pub async fn list_files(
    handle: &Handle,
    host_id: &str,
    path: &str,
    owner_cache: &OwnerNameCache,
) -> EngineResult<Vec<FileEntry>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpList { path: path.to_string(), reply: reply_tx })
        .map_err(actor_gone)?;
    let entries = reply_rx.await.map_err(reply_dropped)??;

    let mut out = Vec::with_capacity(entries.len());
    for (name, stat) in entries {
        let child_path = join_remote(path, &name);
        let uid = stat.uid;
        let mut entry = file_stat_to_entry(name, child_path, stat);
        entry.owner_name = owner_cache.resolve(handle, host_id, uid).await;
        out.push(entry);
    }
    Ok(out)
}

pub async fn stat(handle: &Handle, path: &str) -> EngineResult<FileEntry> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpStat { path: path.to_string(), reply: reply_tx })
        .map_err(actor_gone)?;
    let stat = reply_rx.await.map_err(reply_dropped)??;
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    Ok(file_stat_to_entry(name, path.to_string(), stat))
}

pub async fn mkdir(handle: &Handle, path: &str) -> EngineResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpMkdir { path: path.to_string(), reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

pub async fn delete(handle: &Handle, path: &str, is_dir: bool, recursive: bool) -> EngineResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpDelete { path: path.to_string(), is_dir, recursive, reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

pub async fn rename(handle: &Handle, from: &str, to: &str) -> EngineResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpRename { from: from.to_string(), to: to.to_string(), reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

pub async fn create_symlink(handle: &Handle, target: &str, link_path: &str) -> EngineResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpSymlink {
            target: target.to_string(),
            link_path: link_path.to_string(),
            reply: reply_tx,
        })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

/// Remote-to-remote copy. Tries a server-side `cp -a` first (bounded by
/// `EXEC_COPY_DEADLINE`), falling back to a streamed read/write loop
/// through this process on any exec failure.
pub async fn copy(handle: &Handle, source: &str, target: &str) -> EngineResult<()> {
    let command = format!("cp -a -- {} {}", shell_quote(source), shell_quote(target));
    if let Ok((status, _)) = exec(handle, &command, EXEC_COPY_DEADLINE).await {
        if status == 0 {
            return Ok(());
        }
    }
    stream_copy(handle, source, target).await
}

async fn stream_copy(handle: &Handle, source: &str, target: &str) -> EngineResult<()> {
    let size = stat(handle, source).await?.size;
    let mut offset = 0u64;
    let mut first = true;
    while offset < size || first {
        first = false;
        let want = std::cmp::min(CHUNK_SIZE as u64, size.saturating_sub(offset)) as usize;
        if want == 0 {
            break;
        }
        let bytes = read_chunk(handle, source, offset, want).await?;
        if bytes.is_empty() {
            break;
        }
        write_chunk(handle, target, offset, bytes.clone(), offset == 0).await?;
        offset += bytes.len() as u64;
    }
    Ok(())
}

pub(crate) async fn read_chunk(handle: &Handle, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpReadChunk { path: path.to_string(), offset, len, reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

pub(crate) async fn write_chunk(handle: &Handle, path: &str, offset: u64, data: Vec<u8>, truncate_new: bool) -> EngineResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::SftpWriteChunk { path: path.to_string(), offset, data, truncate_new, reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

pub async fn read_file(handle: &Handle, path: &str) -> EngineResult<Vec<u8>> {
    let size = stat(handle, path).await?.size;
    let mut out = Vec::with_capacity(size as usize);
    let mut offset = 0u64;
    loop {
        let want = CHUNK_SIZE;
        let bytes = read_chunk(handle, path, offset, want).await?;
        if bytes.is_empty() {
            break;
        }
        let got = bytes.len();
        out.extend_from_slice(&bytes);
        offset += got as u64;
        if got < want {
            break;
        }
    }
    Ok(out)
}

pub async fn write_file(handle: &Handle, path: &str, data: &[u8]) -> EngineResult<()> {
    let mut offset = 0u64;
    if data.is_empty() {
        return write_chunk(handle, path, 0, Vec::new(), true).await;
    }
    while offset < data.len() as u64 {
        let end = std::cmp::min(offset as usize + CHUNK_SIZE, data.len());
        let chunk = data[offset as usize..end].to_vec();
        write_chunk(handle, path, offset, chunk, offset == 0).await?;
        offset = end as u64;
    }
    Ok(())
}

/// Uploads `local_path` to `remote_path`, calling `on_progress(bytes_done)`
/// after each chunk so C9's transfer worker can rate-limit progress events.
pub async fn put_file(
    handle: &Handle,
    local_path: &std::path::Path,
    remote_path: &str,
    mut on_progress: impl FnMut(u64),
) -> EngineResult<()> {
    let mut file = std::fs::File::open(local_path)?;
    let mut offset = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut first = true;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 && !first {
            break;
        }
        first = false;
        write_chunk(handle, remote_path, offset, buf[..n].to_vec(), offset == 0).await?;
        offset += n as u64;
        on_progress(offset);
        if n == 0 {
            break;
        }
    }
    Ok(())
}

/// Downloads `remote_path` to `local_path`.
pub async fn get_file(
    handle: &Handle,
    remote_path: &str,
    local_path: &std::path::Path,
    mut on_progress: impl FnMut(u64),
) -> EngineResult<()> {
    let mut file = std::fs::File::create(local_path)?;
    let mut offset = 0u64;
    loop {
        let bytes = read_chunk(handle, remote_path, offset, CHUNK_SIZE).await?;
        if bytes.is_empty() {
            break;
        }
        let n = bytes.len();
        file.write_all(&bytes)?;
        offset += n as u64;
        on_progress(offset);
        if n < CHUNK_SIZE {
            break;
        }
    }
    Ok(())
}

/// `algo` is one of `"sha256"`, `"sha1"`, `"md5"`. Tries a remote exec
/// fast path (`shaNsum`/`md5sum`) first, falling back to a local streaming
/// hash over the same chunked read path `get_file` uses.
pub async fn calculate_checksum(handle: &Handle, path: &str, algo: &str) -> EngineResult<String> {
    let remote_cmd = match algo {
        "sha256" => "sha256sum",
        "sha1" => "sha1sum",
        "md5" => "md5sum",
        other => return Err(EngineError::Conflict(format!("unsupported checksum algorithm: {other}"))),
    };

    let command = format!("{remote_cmd} -- {}", shell_quote(path));
    if let Ok((status, out)) = exec(handle, &command, Duration::from_secs(30)).await {
        if status == 0 {
            if let Some(hash) = String::from_utf8_lossy(&out).split_whitespace().next() {
                return Ok(hash.to_string());
            }
        }
    }

    local_streaming_checksum(handle, path, algo).await
}

async fn local_streaming_checksum(handle: &Handle, path: &str, algo: &str) -> EngineResult<String> {
    use md5::{Digest as Md5Digest, Md5};
    use sha1::{Digest as Sha1Digest, Sha1};
    use sha2::{Digest as Sha2Digest, Sha256};

    enum Hasher {
        Sha256(Sha256),
        Sha1(Sha1),
        Md5(Md5),
    }

    let mut hasher = match algo {
        "sha256" => Hasher::Sha256(Sha256::new()),
        "sha1" => Hasher::Sha1(Sha1::new()),
        "md5" => Hasher::Md5(Md5::new()),
        other => return Err(EngineError::Conflict(format!("unsupported checksum algorithm: {other}"))),
    };

    let mut offset = 0u64;
    loop {
        let bytes = read_chunk(handle, path, offset, CHUNK_SIZE).await?;
        if bytes.is_empty() {
            break;
        }
        let n = bytes.len();
        match &mut hasher {
            Hasher::Sha256(h) => h.update(&bytes),
            Hasher::Sha1(h) => h.update(&bytes),
            Hasher::Md5(h) => h.update(&bytes),
        }
        offset += n as u64;
        if n < CHUNK_SIZE {
            break;
        }
    }

    Ok(match hasher {
        Hasher::Sha256(h) => hex::encode(h.finalize()),
        Hasher::Sha1(h) => hex::encode(h.finalize()),
        Hasher::Md5(h) => hex::encode(h.finalize()),
    })
}

async fn exec(handle: &Handle, command: &str, timeout: Duration) -> EngineResult<(i32, Vec<u8>)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .actor()
        .send(ActorCommand::Exec { command: command.to_string(), timeout, reply: reply_tx })
        .map_err(actor_gone)?;
    reply_rx.await.map_err(reply_dropped)?
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn actor_gone<T>(_: std::sync::mpsc::SendError<T>) -> EngineError {
    EngineError::Transport("ssh actor is gone".into())
}

fn reply_dropped(_: oneshot::error::RecvError) -> EngineError {
    EngineError::Internal("sftp reply channel dropped".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[test]
    fn join_remote_avoids_double_slash() {
        assert_eq!(join_remote("/home/u/", "f.txt"), "/home/u/f.txt");
        assert_eq!(join_remote("/home/u", "f.txt"), "/home/u/f.txt");
    }
}
