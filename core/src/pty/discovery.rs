//! Conversation-id discovery for CLIs that invent their own ids. The copilot
//! CLI writes conversation state to ${HOME}/.copilot/session-state/<id>/; we
//! snapshot that directory before spawn and poll afterwards until a new
//! subdirectory appears, then persist its name through the injected sink.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::ConversationSink;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 5;

/// The copilot state directory: ${HOME}/.copilot/session-state.
pub fn copilot_state_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".copilot").join("session-state")
}

/// Names of the immediate subdirectories of `dir`. Missing directory reads as empty.
pub fn snapshot_state_dirs(dir: &std::path::Path) -> HashSet<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

/// Subdirectories present now but not in the snapshot, lexically sorted.
pub fn new_entries(before: &HashSet<String>, after: &HashSet<String>) -> Vec<String> {
    let mut fresh: Vec<String> = after.difference(before).cloned().collect();
    fresh.sort();
    fresh
}

/// Poll the state directory until the CLI has created its conversation
/// directory, then persist the id. Gives up after a bounded number of
/// attempts; the session stays usable but cannot be resumed.
pub(crate) fn spawn_discovery(
    sink: Arc<dyn ConversationSink>,
    session_id: String,
    dir: PathBuf,
    before: HashSet<String>,
) {
    tokio::spawn(async move {
        for _ in 0..MAX_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let after = snapshot_state_dirs(&dir);
            if let Some(id) = new_entries(&before, &after).pop() {
                match sink.persist_conversation_id(&session_id, &id).await {
                    Ok(()) => info!(%session_id, conversation_id = %id, "discovered conversation id"),
                    Err(e) => warn!(%session_id, error = %e, "failed to persist conversation id"),
                }
                return;
            }
        }
        warn!(
            %session_id,
            dir = %dir.display(),
            "conversation id discovery exhausted; session will not be resumable"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_missing_dir_is_empty() {
        assert!(snapshot_state_dirs(std::path::Path::new("/no/such/dir")).is_empty());
    }

    #[test]
    fn snapshot_lists_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("x")).unwrap();
        std::fs::create_dir(dir.path().join("y")).unwrap();
        std::fs::write(dir.path().join("stray-file"), b"").unwrap();
        let snap = snapshot_state_dirs(dir.path());
        assert_eq!(snap.len(), 2);
        assert!(snap.contains("x") && snap.contains("y"));
    }

    #[test]
    fn new_entries_returns_the_difference_sorted() {
        let before: HashSet<String> = ["x".to_string(), "y".to_string()].into();
        let after: HashSet<String> =
            ["x".to_string(), "y".to_string(), "b".to_string(), "a".to_string()].into();
        assert_eq!(new_entries(&before, &after), vec!["a", "b"]);
        assert!(new_entries(&before, &before).is_empty());
    }
}
