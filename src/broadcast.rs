//! C11 — Broadcast Coordinator (spec §4.10). No 1:1 teacher module covers
//! fan-out (the teacher drives one terminal at a time); this generalizes
//! C6's single-session `write` into a concurrent multi-host fan-out using
//! the same `tokio::spawn`-per-unit-of-work idiom the pool reaper and
//! transfer workers use elsewhere in this crate.

use crate::ssh::SshSession;
use std::collections::HashMap;
use std::sync::Arc;

/// `broadcast(host_ids, command) -> per-host {success, error?}`. `sessions`
/// is the caller's snapshot of host_id -> live terminal session; hosts
/// absent from it, or whose session write fails, get an explicit error and
/// never abort the others.
pub async fn broadcast(
    host_ids: &[String],
    command: &str,
    sessions: &HashMap<String, Arc<SshSession>>,
) -> HashMap<String, Result<(), String>> {
    let line = format!("{command}\n");

    let tasks: Vec<_> = host_ids
        .iter()
        .map(|host_id| {
            let line = line.clone();
            let session = sessions.get(host_id).cloned();
            let host_id = host_id.clone();
            tokio::spawn(async move {
                let result = match session {
                    Some(session) => session.write(line.into_bytes()).await.map_err(|e| e.to_string()),
                    None => Err("no active session for host".to_string()),
                };
                (host_id, result)
            })
        })
        .collect();

    let mut results = HashMap::with_capacity(tasks.len());
    for task in tasks {
        if let Ok((host_id, result)) = task.await {
            results.insert(host_id, result);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_session_reports_error_without_aborting_others() {
        let sessions: HashMap<String, Arc<SshSession>> = HashMap::new();
        let results = broadcast(&["h1".to_string(), "h2".to_string()], "echo hi", &sessions).await;
        assert_eq!(results.len(), 2);
        assert!(results["h1"].is_err());
        assert!(results["h2"].is_err());
    }
}
