//! Process-wide tunables (spec §5, §4.4, §4.8, §4.9, §4.11).
//!
//! The embedding host builds one of these and hands it to [`crate::Engine::new`];
//! the core never reads environment variables or config files of its own.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `hosts.json`, `credentials.json`, `folders.json`,
    /// `sessions.json` and `known_hosts`.
    pub data_dir: PathBuf,

    /// How long a pool entry with `ref_count = 0` is retained before close.
    pub idle_grace: Duration,
    /// Reaper sweep interval.
    pub reaper_interval: Duration,

    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// SSH handshake + auth deadline.
    pub handshake_timeout: Duration,
    /// Default per-call SFTP deadline (overridable per call).
    pub sftp_timeout: Duration,
    /// Stall timeout for a transfer byte pump with no progress.
    pub transfer_stall_timeout: Duration,

    /// Concurrency cap `N` for the transfer queue.
    pub transfer_concurrency: usize,
    /// Maximum rate of `bytes_done` progress events per job.
    pub transfer_progress_hz: u32,

    /// Status prober cadence.
    pub prober_interval: Duration,
    /// Status prober per-host connect timeout.
    pub prober_timeout: Duration,

    /// Edit-on-fly watcher debounce.
    pub edit_debounce: Duration,
    /// Edit-on-fly temp file sweep interval.
    pub edit_sweep_interval: Duration,
    /// Edit-on-fly temp file max age before opportunistic sweep.
    pub edit_temp_ttl: Duration,

    /// keyring service name secrets are stored under.
    pub secret_service_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ssh-workbench");

        Self {
            data_dir,
            idle_grace: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            sftp_timeout: Duration::from_secs(60),
            transfer_stall_timeout: Duration::from_secs(30),
            transfer_concurrency: 3,
            transfer_progress_hz: 10,
            prober_interval: Duration::from_secs(30),
            prober_timeout: Duration::from_secs(3),
            edit_debounce: Duration::from_millis(500),
            edit_sweep_interval: Duration::from_secs(3600),
            edit_temp_ttl: Duration::from_secs(24 * 3600),
            secret_service_name: "ssh-workbench".to_string(),
        }
    }
}

/// Install a process-wide `tracing` subscriber. Safe to call more than once;
/// subsequent calls are no-ops. The embedding host may instead install its
/// own subscriber before constructing the `Engine`, in which case it should
/// not call this.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
