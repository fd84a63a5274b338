//! Per-connection actor thread (grounded in the teacher's `ssh/manager.rs`
//! `SshManager::run` poll loop). One dedicated OS thread owns one
//! `ssh2::Session` exclusively — `ssh2::Session` is not `Sync`, so rather
//! than guard every call with a mutex (which would serialize channel reads
//! against channel writes on the same connection) every operation against
//! a connection is funneled through this thread's command queue, and SSH's
//! own channel multiplexing does the concurrency.

use crate::error::{EngineError, EngineResult};
use crate::ssh::connect::ssh2_retry;
use ssh2::Session;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

pub enum ShellEvent {
    Data(Vec<u8>),
    Disconnected,
}

pub struct FileStat {
    pub size: u64,
    pub permissions: u32,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
}

pub enum ActorCommand {
    ShellOpen {
        cols: u32,
        rows: u32,
        data_tx: tokio::sync::mpsc::UnboundedSender<ShellEvent>,
        reply: oneshot::Sender<EngineResult<ShellHandle>>,
    },
    ShellWrite {
        channel: ShellHandle,
        data: Vec<u8>,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ShellResize {
        channel: ShellHandle,
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ShellClose {
        channel: ShellHandle,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Exec {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<EngineResult<(i32, Vec<u8>)>>,
    },
    SftpList {
        path: String,
        reply: oneshot::Sender<EngineResult<Vec<(String, FileStat)>>>,
    },
    SftpStat {
        path: String,
        reply: oneshot::Sender<EngineResult<FileStat>>,
    },
    SftpMkdir {
        path: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SftpDelete {
        path: String,
        is_dir: bool,
        recursive: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SftpRename {
        from: String,
        to: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SftpSymlink {
        target: String,
        link_path: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SftpReadChunk {
        path: String,
        offset: u64,
        len: usize,
        reply: oneshot::Sender<EngineResult<Vec<u8>>>,
    },
    SftpWriteChunk {
        path: String,
        offset: u64,
        data: Vec<u8>,
        truncate_new: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Shutdown,
}

/// Handle identifying a shell channel owned by the actor thread; channels
/// themselves never leave the thread, so this is just an opaque numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShellHandle(pub u64);

pub type ActorSender = std_mpsc::Sender<ActorCommand>;

/// Spawns the actor thread and returns a sender for commands. The thread
/// exits once the sender (and every clone) is dropped or a `Shutdown`
/// command is received.
pub fn spawn(session: Session) -> ActorSender {
    let (tx, rx) = std_mpsc::channel::<ActorCommand>();
    std::thread::spawn(move || run(session, rx));
    tx
}

struct Shell {
    channel: ssh2::Channel,
    data_tx: tokio::sync::mpsc::UnboundedSender<ShellEvent>,
}

fn run(session: Session, rx: std_mpsc::Receiver<ActorCommand>) {
    let mut shells: HashMap<u64, Shell> = HashMap::new();
    let mut next_handle: u64 = 1;
    let mut sftp = session.sftp().ok();

    loop {
        let cmd = match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(cmd) => cmd,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                pump_shells(&mut shells);
                continue;
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match cmd {
            ActorCommand::Shutdown => break,
            ActorCommand::ShellOpen { cols, rows, data_tx, reply } => {
                let result = open_shell(&session, cols, rows).map(|channel| {
                    let handle = ShellHandle(next_handle);
                    next_handle += 1;
                    shells.insert(handle.0, Shell { channel, data_tx: data_tx.clone() });
                    // drive at least one pump so early banner output isn't lost
                    pump_one(&mut shells.get_mut(&handle.0).unwrap().channel, &data_tx);
                    handle
                });
                let _ = reply.send(result);
            }
            ActorCommand::ShellWrite { channel, data, reply } => {
                let result = match shells.get_mut(&channel.0) {
                    Some(sh) => ssh2_retry(|| sh.channel.write(&data))
                        .map(|_| ())
                        .map_err(EngineError::from),
                    None => Err(EngineError::Transport("shell channel closed".into())),
                };
                let _ = reply.send(result);
            }
            ActorCommand::ShellResize { channel, cols, rows, reply } => {
                let result = match shells.get_mut(&channel.0) {
                    Some(sh) => ssh2_retry(|| sh.channel.request_pty_size(cols, rows, None, None))
                        .map_err(EngineError::from),
                    None => Err(EngineError::Transport("shell channel closed".into())),
                };
                let _ = reply.send(result);
            }
            ActorCommand::ShellClose { channel, reply } => {
                if let Some(mut sh) = shells.remove(&channel.0) {
                    let _ = sh.channel.close();
                }
                let _ = reply.send(Ok(()));
            }
            ActorCommand::Exec { command, timeout, reply } => {
                let result = exec(&session, &command, timeout);
                let _ = reply.send(result);
            }
            ActorCommand::SftpList { path, reply } => {
                let result = sftp_list(&session, &mut sftp, &path);
                let _ = reply.send(result);
            }
            ActorCommand::SftpStat { path, reply } => {
                let result = sftp_stat(&session, &mut sftp, &path);
                let _ = reply.send(result);
            }
            ActorCommand::SftpMkdir { path, reply } => {
                let result = sftp_op(&session, &mut sftp, |s| s.mkdir(std::path::Path::new(&path), 0o755));
                let _ = reply.send(result);
            }
            ActorCommand::SftpDelete { path, is_dir, recursive, reply } => {
                let result = sftp_delete(&session, &mut sftp, &path, is_dir, recursive);
                let _ = reply.send(result);
            }
            ActorCommand::SftpRename { from, to, reply } => {
                let result = sftp_op(&session, &mut sftp, |s| {
                    s.rename(
                        std::path::Path::new(&from),
                        std::path::Path::new(&to),
                        Some(ssh2::RenameFlags::OVERWRITE),
                    )
                });
                let _ = reply.send(result);
            }
            ActorCommand::SftpSymlink { target, link_path, reply } => {
                let result = sftp_op(&session, &mut sftp, |s| {
                    s.symlink(std::path::Path::new(&target), std::path::Path::new(&link_path))
                });
                let _ = reply.send(result);
            }
            ActorCommand::SftpReadChunk { path, offset, len, reply } => {
                let result = sftp_read_chunk(&session, &mut sftp, &path, offset, len);
                let _ = reply.send(result);
            }
            ActorCommand::SftpWriteChunk { path, offset, data, truncate_new, reply } => {
                let result = sftp_write_chunk(&session, &mut sftp, &path, offset, &data, truncate_new);
                let _ = reply.send(result);
            }
        }

        pump_shells(&mut shells);
    }

    debug!("ssh actor thread exiting");
}

fn no_sftp() -> EngineError {
    EngineError::Transport("sftp channel unavailable".into())
}

/// libssh2's `LIBSSH2_ERROR_CHANNEL_CLOSED`.
fn is_channel_closed(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(-27))
}

/// Runs `op` against the current SFTP channel, opening one first if none is
/// held yet. On a channel-closed error the channel is reopened exactly once
/// and `op` retried; any other error, or a second failure after reopening,
/// is surfaced as-is (spec §4.6, DESIGN.md [C7]).
fn sftp_op<T>(
    session: &Session,
    sftp: &mut Option<ssh2::Sftp>,
    op: impl Fn(&ssh2::Sftp) -> Result<T, ssh2::Error>,
) -> EngineResult<T> {
    if sftp.is_none() {
        *sftp = session.sftp().ok();
    }
    let Some(current) = sftp.as_ref() else {
        return Err(no_sftp());
    };

    match ssh2_retry(|| op(current)) {
        Err(e) if is_channel_closed(&e) => {
            debug!("sftp channel closed, reopening once");
            *sftp = session.sftp().ok();
            let Some(reopened) = sftp.as_ref() else {
                return Err(no_sftp());
            };
            ssh2_retry(|| op(reopened)).map_err(EngineError::from)
        }
        other => other.map_err(EngineError::from),
    }
}

/// Non-recursive delete of a non-empty directory fails with `Conflict`
/// rather than surfacing the server's raw rmdir error (spec §8).
fn sftp_delete(
    session: &Session,
    sftp: &mut Option<ssh2::Sftp>,
    path: &str,
    is_dir: bool,
    recursive: bool,
) -> EngineResult<()> {
    let p = std::path::Path::new(path);
    if !is_dir {
        return sftp_op(session, sftp, |s| s.unlink(p));
    }
    if recursive {
        return sftp_op(session, sftp, |s| recursive_rmdir(s, p));
    }
    let entries = sftp_op(session, sftp, |s| s.readdir(p))?;
    if !entries.is_empty() {
        return Err(EngineError::Conflict(format!("directory not empty: {path}")));
    }
    sftp_op(session, sftp, |s| s.rmdir(p))
}

fn recursive_rmdir(sftp: &ssh2::Sftp, path: &std::path::Path) -> Result<(), ssh2::Error> {
    for (entry_path, stat) in sftp.readdir(path)? {
        if stat.is_dir() {
            recursive_rmdir(sftp, &entry_path)?;
        } else {
            sftp.unlink(&entry_path)?;
        }
    }
    sftp.rmdir(path)
}

fn open_shell(session: &Session, cols: u32, rows: u32) -> EngineResult<ssh2::Channel> {
    let mut channel = ssh2_retry(|| session.channel_session()).map_err(EngineError::from)?;
    ssh2_retry(|| channel.request_pty("xterm-256color", None, Some((cols, rows, 0, 0))))
        .map_err(EngineError::from)?;
    ssh2_retry(|| channel.shell()).map_err(EngineError::from)?;
    Ok(channel)
}

fn pump_shells(shells: &mut HashMap<u64, Shell>) {
    let mut dead = Vec::new();
    for (&id, sh) in shells.iter_mut() {
        let died = pump_one(&mut sh.channel, &sh.data_tx);
        if died {
            dead.push(id);
        } else if sh.channel.eof() {
            let _ = sh.data_tx.send(ShellEvent::Disconnected);
            dead.push(id);
        }
    }
    for id in dead {
        shells.remove(&id);
    }
}

/// Reads whatever is currently available and forwards it; returns `true`
/// once the channel has died (hard read error — EOF alone is handled by
/// the caller's own `channel.eof()` check so a final partial read still
/// gets forwarded first).
fn pump_one(channel: &mut ssh2::Channel, data_tx: &tokio::sync::mpsc::UnboundedSender<ShellEvent>) -> bool {
    let mut buf = [0u8; 4096];
    match channel.read(&mut buf) {
        Ok(0) => false,
        Ok(n) => {
            let _ = data_tx.send(ShellEvent::Data(buf[..n].to_vec()));
            false
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => {
            let _ = data_tx.send(ShellEvent::Disconnected);
            true
        }
    }
}

fn exec(session: &Session, command: &str, timeout: Duration) -> EngineResult<(i32, Vec<u8>)> {
    let mut channel = ssh2_retry(|| session.channel_session()).map_err(EngineError::from)?;
    ssh2_retry(|| channel.exec(command)).map_err(EngineError::from)?;

    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() > deadline {
                    return Err(EngineError::Transport(format!("exec '{command}' timed out")));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(EngineError::Transport(e.to_string())),
        }
    }
    ssh2_retry(|| channel.close()).map_err(EngineError::from)?;
    let status = ssh2_retry(|| channel.exit_status()).unwrap_or(-1);
    Ok((status, out))
}

fn sftp_list(session: &Session, sftp: &mut Option<ssh2::Sftp>, path: &str) -> EngineResult<Vec<(String, FileStat)>> {
    let entries = sftp_op(session, sftp, |s| s.readdir(std::path::Path::new(path)))?;
    Ok(entries
        .into_iter()
        .filter_map(|(path, stat)| {
            let name = path.file_name()?.to_string_lossy().to_string();
            Some((name, from_ssh2_stat(&stat)))
        })
        .collect())
}

fn sftp_stat(session: &Session, sftp: &mut Option<ssh2::Sftp>, path: &str) -> EngineResult<FileStat> {
    let stat = sftp_op(session, sftp, |s| s.stat(std::path::Path::new(path)))?;
    Ok(from_ssh2_stat(&stat))
}

fn from_ssh2_stat(stat: &ssh2::FileStat) -> FileStat {
    FileStat {
        size: stat.size.unwrap_or(0),
        permissions: stat.perm.unwrap_or(0),
        mtime: stat.mtime.unwrap_or(0) as i64,
        uid: stat.uid.unwrap_or(0),
        gid: stat.gid.unwrap_or(0),
        is_dir: stat.is_dir(),
        is_symlink: stat.file_type() == ssh2::FileType::Symlink,
    }
}

fn sftp_read_chunk(session: &Session, sftp: &mut Option<ssh2::Sftp>, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
    let mut file = sftp_op(session, sftp, |s| s.open(std::path::Path::new(path)))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).map_err(EngineError::from)?;
    }
    let mut buf = vec![0u8; len];
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(EngineError::Transport(e.to_string())),
        }
    }
    buf.truncate(total);
    Ok(buf)
}

fn sftp_write_chunk(
    session: &Session,
    sftp: &mut Option<ssh2::Sftp>,
    path: &str,
    offset: u64,
    data: &[u8],
    truncate_new: bool,
) -> EngineResult<()> {
    let flags = if truncate_new {
        ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE
    } else {
        ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE
    };
    let mut file = sftp_op(session, sftp, |s| {
        s.open_mode(std::path::Path::new(path), flags, 0o644, ssh2::OpenType::File)
    })?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).map_err(EngineError::from)?;
    }
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(EngineError::Transport(e.to_string())),
        }
    }
    Ok(())
}

