//! AgentDeck server: Axum HTTP + WebSocket. The PTY engine lives in common.

mod web_server;

pub use web_server::{app, run_web_server, AppState, SqliteSink};
