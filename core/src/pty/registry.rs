//! Session registry: the one map from session id to live [`PtySession`].
//! Owns the spawn path (workspace check, argv build, PTY spawn, pump tasks),
//! the exit path (residual flush + `pty-exit` + removal), and the silent
//! restart that replaces a stale-resume PTY underneath its clients.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::notify::PushNotifier;
use crate::session::SessionRecord;

use super::client::ClientHandle;
use super::command::{command_for_agent, docker_mode};
use super::discovery;
use super::process::PtyProcess;
use super::session::PtySession;
use super::{AgentKind, ConversationSink, INITIAL_COLS, INITIAL_ROWS};

/// Delay before re-attaching preserved clients to a restarted session, giving
/// the fresh CLI a beat to print its banner first.
const RESTART_REATTACH_DELAY_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("workspace directory missing: {0}")]
    WorkspaceMissing(PathBuf),
    #[error("failed to spawn agent CLI: {0}")]
    SpawnFailed(String),
}

/// Concurrent-safe registry of live PTY sessions. All engine operations enter
/// through here; the map lock is never held across PTY or socket I/O.
pub struct PtyRegistry {
    sessions: DashMap<String, Arc<PtySession>>,
    sink: Arc<dyn ConversationSink>,
    notifier: Arc<dyn PushNotifier>,
}

impl PtyRegistry {
    pub fn new(sink: Arc<dyn ConversationSink>, notifier: Arc<dyn PushNotifier>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            sink,
            notifier,
        })
    }

    /// Start a PTY for this session. Idempotent: a second start with the same
    /// id returns the already-running session.
    pub async fn start(
        self: &Arc<Self>,
        record: SessionRecord,
        prompt: Option<String>,
        resume: bool,
    ) -> Result<Arc<PtySession>, StartError> {
        if let Some(existing) = self.sessions.get(&record.session_id) {
            return Ok(existing.clone());
        }
        self.spawn_session(record, prompt, resume).await
    }

    /// Spawn and register, replacing any existing entry for the id in one map
    /// operation (the restart path relies on there being no gap where the id
    /// reads as inactive).
    fn spawn_session<'a>(
        self: &'a Arc<Self>,
        record: SessionRecord,
        prompt: Option<String>,
        resume: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<PtySession>, StartError>> + Send + 'a>> {
        Box::pin(async move {
        let workspace = Path::new(&record.workspace_path);
        if !workspace.is_dir() {
            return Err(StartError::WorkspaceMissing(workspace.to_path_buf()));
        }

        let resume_with_conversation = resume && record.conversation_id.is_some();

        // For CLIs that invent their own conversation id, snapshot the state
        // directory before spawn so the new entry stands out afterwards.
        let discovery_before: Option<(PathBuf, HashSet<String>)> =
            (record.agent == AgentKind::Copilot && record.conversation_id.is_none()).then(|| {
                let dir = discovery::copilot_state_dir();
                let before = discovery::snapshot_state_dirs(&dir);
                (dir, before)
            });

        let cmd = command_for_agent(
            record.agent,
            workspace,
            &record.session_id,
            record.conversation_id.as_deref(),
            prompt.as_deref(),
            resume,
            docker_mode(),
        );
        let (process, mut out_rx, mut exit_rx) =
            PtyProcess::spawn(cmd, INITIAL_COLS, INITIAL_ROWS)
                .map_err(|e| StartError::SpawnFailed(e.to_string()))?;

        let session = PtySession::new(
            record,
            prompt,
            resume_with_conversation,
            process,
            Arc::clone(&self.notifier),
        );
        self.sessions
            .insert(session.session_id().to_string(), Arc::clone(&session));
        info!(
            session_id = %session.session_id(),
            agent = %session.record().agent,
            resume = resume_with_conversation,
            "pty session started"
        );

        // Output pump: every chunk from the reader thread goes through the
        // session's single-writer handler.
        {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while let Some(chunk) = out_rx.recv().await {
                    session.handle_output(chunk);
                }
            });
        }

        // Exit watcher: exactly one exit event per PTY.
        {
            let registry = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                if let Some(code) = exit_rx.recv().await {
                    registry.handle_exit(session, code).await;
                }
            });
        }

        if let Some((dir, before)) = discovery_before {
            discovery::spawn_discovery(
                Arc::clone(&self.sink),
                session.session_id().to_string(),
                dir,
                before,
            );
        }

        // The claude CLI was just handed our session id as its conversation id
        // (`--session-id`); record that so the next start can resume.
        if session.record().agent == AgentKind::Claude && !resume_with_conversation {
            let stored = session.record().conversation_id.as_deref();
            if stored != Some(session.session_id()) {
                let sink = Arc::clone(&self.sink);
                let session_id = session.session_id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = sink
                        .persist_conversation_id(&session_id, &session_id)
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist conversation id");
                    }
                });
            }
        }

        Ok(session)
        })
    }

    async fn handle_exit(self: &Arc<Self>, session: Arc<PtySession>, exit_code: u32) {
        if session.is_restarting() {
            // Stale resume: respawn with the create-new-conversation flag and
            // carry the clients over. No pty-exit is emitted for the old PTY.
            let clients: Vec<ClientHandle> = session.take_clients_for_restart();
            let record = session.record().clone();
            let prompt = session.initial_prompt.clone();
            let session_id = record.session_id.clone();
            match self.spawn_session(record, prompt, false).await {
                Ok(new_session) => {
                    tokio::time::sleep(Duration::from_millis(RESTART_REATTACH_DELAY_MS)).await;
                    for client in clients {
                        if !client.is_closed() {
                            new_session.attach(client);
                        }
                    }
                    info!(%session_id, "pty session restarted after stale resume");
                }
                Err(e) => {
                    error!(%session_id, error = %e, "restart respawn failed");
                    self.sessions
                        .remove_if(&session_id, |_, s| Arc::ptr_eq(s, &session));
                }
            }
            return;
        }

        session.finish_exit(exit_code);
        self.sessions
            .remove_if(&session.session_id().to_string(), |_, s| {
                Arc::ptr_eq(s, &session)
            });
        info!(session_id = %session.session_id(), exit_code, "pty session exited");
    }

    /// Add a WebSocket client to a session's fan-out set.
    pub fn attach(&self, session_id: &str, client: ClientHandle) -> bool {
        match self.sessions.get(session_id) {
            Some(s) => s.attach(client),
            None => false,
        }
    }

    /// Remove a client; a stuck client leaving releases the pause.
    pub fn detach(&self, session_id: &str, client_id: u64) {
        if let Some(s) = self.sessions.get(session_id) {
            s.detach(client_id);
        }
    }

    /// Write raw bytes to the CLI's stdin.
    pub async fn input(&self, session_id: &str, data: String) -> bool {
        let Some(s) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return false;
        };
        let res = tokio::task::spawn_blocking(move || s.process.write(data.as_bytes())).await;
        match res {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "pty write failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Resize the PTY.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        match self.sessions.get(session_id) {
            Some(s) => {
                s.process.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    /// Apply a client ACK.
    pub fn ack(&self, session_id: &str, client_id: u64, bytes: u64) {
        if let Some(s) = self.sessions.get(session_id) {
            s.handle_ack(client_id, bytes);
        }
    }

    /// Kill a session's PTY. Cleanup and the `pty-exit` broadcast run in the
    /// exit handler.
    pub fn stop(&self, session_id: &str) -> bool {
        // Clone the session out so the map shard is not held across kill.
        let Some(s) = self.sessions.get(session_id).map(|e| e.clone()) else {
            return false;
        };
        s.mark_stopping();
        if let Err(e) = s.process.kill() {
            warn!(session_id, error = %e, "kill failed");
        }
        true
    }

    /// Best-effort shutdown of every live session.
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn list_active(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Look up a live session.
    pub fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }
}
