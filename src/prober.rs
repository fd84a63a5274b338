//! C12 — Status Prober (spec §4.11): fixed-cadence TCP reachability sweep
//! over every registered host, independent of the connection pool.
//! Grounded in the teacher's `ssh/connection.rs` `connect_with_timeout`
//! (same `TcpStream::connect_timeout` primitive), run here on a schedule
//! instead of inside a connection attempt.

use crate::bus::{Bus, Event};
use crate::config::EngineConfig;
use crate::models::{now_ts, HostStatus};
use crate::registry::HostRegistry;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct StatusProber {
    hosts: Arc<HostRegistry>,
    bus: Bus,
    interval: Duration,
    timeout: Duration,
}

impl StatusProber {
    pub fn new(hosts: Arc<HostRegistry>, bus: Bus, config: &EngineConfig) -> Self {
        Self {
            hosts,
            bus,
            interval: config.prober_interval,
            timeout: config.prober_timeout,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let hosts = self.hosts.list();
        let timeout = self.timeout;
        let tasks: Vec<_> = hosts
            .into_iter()
            .map(|host| {
                tokio::task::spawn_blocking(move || {
                    let status = probe_one(&host.hostname, host.port, timeout);
                    (host.id, status)
                })
            })
            .collect();

        for task in tasks {
            if let Ok((host_id, status)) = task.await {
                self.bus.publish(Event::HostStatusChanged {
                    host_id,
                    status,
                    last_checked_at: now_ts(),
                });
            }
        }
    }
}

fn probe_one(hostname: &str, port: u16, timeout: Duration) -> HostStatus {
    let addr_str = format!("{hostname}:{port}");
    let Ok(mut addrs) = addr_str.to_socket_addrs() else {
        return HostStatus::Unknown;
    };
    let Some(addr) = addrs.next() else {
        return HostStatus::Unknown;
    };

    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => HostStatus::Online,
        Err(e) => {
            debug!(hostname, port, error = %e, "status prober: host unreachable");
            HostStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_host_is_unknown() {
        let status = probe_one("this-host-does-not-resolve.invalid", 22, Duration::from_millis(200));
        assert_eq!(status, HostStatus::Unknown);
    }

    #[test]
    fn closed_local_port_is_offline() {
        // Port 1 is reserved and refuses connections on loopback, this test
        // assumes nothing is bound to it.
        let status = probe_one("127.0.0.1", 1, Duration::from_millis(500));
        assert_eq!(status, HostStatus::Offline);
    }
}
