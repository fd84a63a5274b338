//! C6 — SSH Session (spec §4.5): an interactive shell channel over a pool
//! [`Handle`]. Grounded in the teacher's `ssh/terminal.rs`
//! (`write_to_pty`/`resize_pty`/`start_shell_thread`), adapted onto the
//! actor-thread command queue instead of a raw channel the caller owns
//! directly.

use crate::bus::{Bus, Event};
use crate::error::{EngineError, EngineResult};
use crate::models::SessionKind;
use crate::ssh::actor::{ActorCommand, ShellEvent, ShellHandle};
use crate::ssh::pool::{ConnectionPool, Handle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct SshSession {
    pub id: String,
    host_id: String,
    _pool_handle: Handle,
    shell: ShellHandle,
    disconnected: Arc<AtomicBool>,
}

impl SshSession {
    pub async fn open(pool: &ConnectionPool, bus: Bus, host_id: String, cols: u32, rows: u32) -> EngineResult<Self> {
        let handle = pool.acquire(&host_id).await?;
        let session_id = uuid::Uuid::new_v4().to_string();

        let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel::<ShellEvent>();
        let (reply_tx, reply_rx) = oneshot::channel();

        handle
            .actor()
            .send(ActorCommand::ShellOpen { cols, rows, data_tx, reply: reply_tx })
            .map_err(|_| EngineError::Transport("ssh actor is gone".into()))?;

        let shell = reply_rx
            .await
            .map_err(|_| EngineError::Internal("shell open reply channel dropped".into()))??;

        let disconnected = Arc::new(AtomicBool::new(false));
        let forward_bus = bus.clone();
        let forward_session_id = session_id.clone();
        let forward_disconnected = disconnected.clone();
        tokio::spawn(async move {
            while let Some(event) = data_rx.recv().await {
                match event {
                    ShellEvent::Data(bytes) => {
                        forward_bus.publish(Event::SessionData {
                            session_id: forward_session_id.clone(),
                            data: bytes,
                        });
                    }
                    ShellEvent::Disconnected => {
                        if !forward_disconnected.swap(true, Ordering::SeqCst) {
                            forward_bus.publish(Event::SessionStatus {
                                session_id: forward_session_id.clone(),
                                status: "disconnected".to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        });

        Ok(Self {
            id: session_id,
            host_id,
            _pool_handle: handle,
            shell,
            disconnected,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn kind(&self) -> SessionKind {
        SessionKind::Terminal
    }

    pub async fn write(&self, data: Vec<u8>) -> EngineResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("session already disconnected".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self._pool_handle
            .actor()
            .send(ActorCommand::ShellWrite { channel: self.shell, data, reply: reply_tx })
            .map_err(|_| EngineError::Transport("ssh actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Internal("shell write reply channel dropped".into()))?
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> EngineResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self._pool_handle
            .actor()
            .send(ActorCommand::ShellResize { channel: self.shell, cols, rows, reply: reply_tx })
            .map_err(|_| EngineError::Transport("ssh actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Internal("shell resize reply channel dropped".into()))?
    }

    pub async fn close(&self) -> EngineResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self._pool_handle
            .actor()
            .send(ActorCommand::ShellClose { channel: self.shell, reply: reply_tx })
            .map_err(|_| EngineError::Transport("ssh actor is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Internal("shell close reply channel dropped".into()))?
    }
}
