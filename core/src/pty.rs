//! PTY multiplexing engine: each live session owns one PTY running an agent CLI
//! and fans its output out to any number of attached browser clients. Output is
//! batched and size-capped, per-client acknowledgements drive flow control
//! (the PTY reader is paused when a client falls behind), prompt-looking output
//! triggers a push notification, and a failed resume respawns the CLI without
//! the clients noticing.

use async_trait::async_trait;

pub mod client;
pub mod command;
pub mod discovery;
pub mod interaction;
pub mod process;
pub mod registry;
pub mod session;

pub use client::{ClientHandle, ClientMessage, ServerMessage};
pub use registry::{PtyRegistry, StartError};
pub use session::PtySession;

/// Delay between the first byte of a burst and the first flush.
pub const OUTPUT_BATCH_INTERVAL_MS: u64 = 16;
/// Minimum interval between consecutive flushes while draining a backlog.
pub const OUTPUT_THROTTLE_MS: u64 = 8;
/// Upper bound on one outbound `pty-data` message.
pub const OUTPUT_MAX_CHUNK_SIZE: usize = 64 * 1024;
/// Hard cap on buffered-but-unsent output. Only reachable when flow control is
/// broken; crossing it drops the oldest chunks.
pub const OUTPUT_MAX_BUFFER_SIZE: usize = 256 * 1024;

/// A client this many bytes behind on ACKs pauses the PTY reader.
pub const ACK_PAUSE_THRESHOLD: u64 = 64 * 1024;
/// All clients under this many unacked bytes resumes the PTY reader.
pub const ACK_RESUME_THRESHOLD: u64 = 32 * 1024;
/// A pause older than this is force-released so a stuck client cannot wedge the CLI.
pub const PAUSE_TIMEOUT_MS: u64 = 30_000;

/// Silence longer than this after output counts as "waiting for input".
pub const IDLE_THRESHOLD_MS: u64 = 8_000;

/// Initial terminal size for spawned CLIs.
pub const INITIAL_COLS: u16 = 120;
pub const INITIAL_ROWS: u16 = 40;

/// How much resume output is scanned for the stale-conversation marker.
pub const RETRY_DETECTION_LIMIT: usize = 1024;
/// Printed by the claude CLI when `--resume` references an unknown conversation.
pub const RESUME_FAILURE_MARKER: &str = "No conversation found with session ID";

/// Which agent CLI a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Accepts a caller-chosen conversation id (`--session-id`) and resumes with `--resume <id>`.
    Claude,
    /// Invents its own conversation ids; we learn them from its state directory.
    Copilot,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Copilot => "copilot",
        }
    }

    /// Parse a stored agent name; unknown values map to Claude.
    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "copilot" => AgentKind::Copilot,
            _ => AgentKind::Claude,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Injected persistence for discovered conversation ids. The server wires this
/// to the sessions table; tests use an in-memory recorder.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn persist_conversation_id(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> anyhow::Result<()>;
}
