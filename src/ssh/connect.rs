//! Low-level TCP connect + SSH handshake (spec §4.4 step 3), grounded in
//! the teacher's `ssh/connection.rs`. Jump-host forwarding is intentionally
//! not carried forward (see DESIGN.md) — the `Host` data model in spec §3
//! has no `jump_*` fields.

use crate::error::{EngineError, EngineResult};
use crate::models::{AuthType, Host};
use socket2::{SockRef, TcpKeepalive};
use ssh2::Session;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Credential material resolved for a connection attempt. Never logged.
pub enum AuthMaterial {
    Password(String),
    PrivateKey { bytes: Vec<u8>, passphrase: Option<String> },
    Agent,
}

/// The server's real handshake-presented host key (REDESIGN FLAGS: never a
/// synthetic/mocked buffer).
pub struct PresentedHostKey {
    pub algo: String,
    pub bytes: Vec<u8>,
}

pub fn tcp_connect(host: &Host, timeout: Duration) -> EngineResult<TcpStream> {
    let addr_str = format!("{}:{}", host.hostname, host.port);
    let addr = addr_str
        .to_socket_addrs()
        .map_err(|e| EngineError::Transport(format!("invalid address '{addr_str}': {e}")))?
        .next()
        .ok_or_else(|| EngineError::Transport(format!("no address for '{addr_str}'")))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| EngineError::Transport(format!("connect to '{addr_str}' failed: {e}")))?;

    let sock = SockRef::from(&stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&keepalive);
    let _ = stream.set_nodelay(true);

    Ok(stream)
}

/// Performs the SSH handshake only; does not authenticate. Returns the
/// session (still unauthenticated, non-blocking mode not yet set) plus the
/// real presented host key for C2 verification.
pub fn handshake(stream: TcpStream) -> EngineResult<(Session, PresentedHostKey)> {
    let mut session = Session::new().map_err(EngineError::from)?;
    session.set_tcp_stream(stream);
    session.handshake().map_err(EngineError::from)?;

    let (key_bytes, key_type) = session
        .host_key()
        .ok_or_else(|| EngineError::Protocol("server presented no host key".into()))?;

    let algo = match key_type {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed255219 => "ssh-ed25519",
        _ => "unknown",
    }
    .to_string();

    Ok((
        session,
        PresentedHostKey {
            algo,
            bytes: key_bytes.to_vec(),
        },
    ))
}

/// Authenticates an already-handshaken session, then enables keepalive and
/// switches the session to non-blocking mode for actor-loop polling.
pub fn authenticate(session: &mut Session, host: &Host, auth: AuthMaterial) -> EngineResult<()> {
    match (host.auth_type, &auth) {
        (AuthType::Password, AuthMaterial::Password(pw)) => {
            session
                .userauth_password(&host.username, pw)
                .map_err(|e| EngineError::AuthFailed(e.to_string()))?;
        }
        (AuthType::Key, AuthMaterial::PrivateKey { bytes, passphrase }) => {
            authenticate_with_key(session, &host.username, bytes, passphrase.as_deref())?;
        }
        (AuthType::Agent, AuthMaterial::Agent) => {
            let mut agent = session.agent().map_err(EngineError::from)?;
            agent.connect().map_err(|e| EngineError::AuthFailed(e.to_string()))?;
            agent.list_identities().map_err(EngineError::from)?;
            let identities = agent.identities().map_err(EngineError::from)?;
            let mut authenticated = false;
            for identity in &identities {
                if agent.userauth(&host.username, identity).is_ok() {
                    authenticated = true;
                    break;
                }
            }
            if !authenticated {
                return Err(EngineError::AuthFailed("no agent identity accepted".into()));
            }
        }
        _ => {
            return Err(EngineError::MissingSecret(
                "auth material does not match host auth_type".into(),
            ))
        }
    }

    if !session.authenticated() {
        return Err(EngineError::AuthFailed("server rejected authentication".into()));
    }

    session.set_keepalive(true, 30);
    session.set_blocking(false);
    Ok(())
}

fn authenticate_with_key(
    session: &mut Session,
    username: &str,
    key_bytes: &[u8],
    passphrase: Option<&str>,
) -> EngineResult<()> {
    let key_text = std::str::from_utf8(key_bytes)
        .map_err(|_| EngineError::AuthFailed("private key is not valid UTF-8".into()))?;
    session
        .userauth_pubkey_memory(username, None, key_text, passphrase)
        .map_err(|e| EngineError::AuthFailed(e.to_string()))
}

/// Retry helper for ssh2 calls that may return `EAGAIN` while the session
/// is in non-blocking mode (grounded in the teacher's `ssh2_retry`).
pub fn ssh2_retry<F, T>(mut f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.code() == ssh2::ErrorCode::Session(-37) => {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
