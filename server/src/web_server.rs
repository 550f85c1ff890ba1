//! Axum HTTP + WebSocket server: workspace/session CRUD (/api/workspaces,
//! /api/sessions), PTY attach at /ws/terminal/{session_id}, and optional SPA
//! serving for the browser dashboard. The PTY engine itself lives in common;
//! this layer is routing, persistence wiring, and the JSON boundary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use common::pty::{
    client::MAX_FRAME_BYTES, AgentKind, ClientHandle, ClientMessage, ConversationSink,
    PtyRegistry, ServerMessage, StartError,
};
use common::{session, workspace};

/// Close code when the path references no live PTY session.
const CLOSE_NO_SESSION: u16 = 4000;
/// Close code when the session went away between lookup and attach.
const CLOSE_ATTACH_FAILED: u16 = 4001;

/// Shared app state: engine registry, SQLite handle, working dir, optional SPA dist.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PtyRegistry>,
    pub db: Arc<Mutex<Connection>>,
    pub working_dir: PathBuf,
    pub dist: Option<PathBuf>,
}

/// Conversation-id persistence wired to the sessions table.
pub struct SqliteSink {
    pub db: Arc<Mutex<Connection>>,
}

#[async_trait::async_trait]
impl ConversationSink for SqliteSink {
    async fn persist_conversation_id(
        &self,
        session_id: &str,
        conversation_id: &str,
    ) -> anyhow::Result<()> {
        let db = self.db.lock().expect("db mutex");
        session::set_conversation_id(&db, session_id, conversation_id)?;
        Ok(())
    }
}

/// POST /api/workspaces body.
#[derive(serde::Deserialize)]
struct CreateWorkspaceBody {
    name: String,
    /// Existing directory to register; omitted = create one under working_dir.
    #[serde(default)]
    path: Option<String>,
}

/// POST /api/sessions body.
#[derive(serde::Deserialize)]
struct CreateSessionBody {
    agent: String,
    workspace_id: String,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    branch_name: Option<String>,
    #[serde(default = "default_interactive")]
    interactive: bool,
}

fn default_interactive() -> bool {
    true
}

/// POST /api/sessions/{id}/start body.
#[derive(serde::Deserialize, Default)]
struct StartSessionBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    resume: bool,
}

/// Session list item (GET /api/sessions).
#[derive(serde::Serialize)]
struct SessionListItem {
    session_id: String,
    agent: String,
    workspace_id: String,
    workspace_path: String,
    friendly_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch_name: Option<String>,
    interactive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    created_at: String,
    updated_at: String,
    active: bool,
}

fn session_item(rec: &session::SessionRecord, active: bool) -> SessionListItem {
    SessionListItem {
        session_id: rec.session_id.clone(),
        agent: rec.agent.as_str().to_string(),
        workspace_id: rec.workspace_id.clone(),
        workspace_path: rec.workspace_path.clone(),
        friendly_name: rec.friendly_name.clone(),
        branch_name: rec.branch_name.clone(),
        interactive: rec.interactive,
        conversation_id: rec.conversation_id.clone(),
        created_at: rec.created_at.clone(),
        updated_at: rec.updated_at.clone(),
        active,
    }
}

fn parse_agent(s: &str) -> Option<AgentKind> {
    match s.to_lowercase().as_str() {
        "claude" => Some(AgentKind::Claude),
        "copilot" => Some(AgentKind::Copilot),
        _ => None,
    }
}

fn db_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Build the router. Factored out of [`run_web_server`] so tests can drive it.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route(
            "/api/workspaces",
            get(list_workspaces_handler).post(create_workspace_handler),
        )
        .route("/api/workspaces/{id}", delete(delete_workspace_handler))
        .route(
            "/api/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route(
            "/api/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/api/sessions/{id}/start", post(start_session_handler))
        .route("/api/sessions/{id}/stop", post(stop_session_handler))
        .route("/ws/terminal/{id}", get(ws_terminal_handler));

    if let Some(dist) = state.dist.clone() {
        let assets = dist.join("assets");
        router = router
            .nest_service("/assets", ServeDir::new(assets))
            .fallback(any(spa_fallback_handler));
    }
    router.with_state(state)
}

/// Runs the Axum server. Binds to 127.0.0.1; remote access is expected to go
/// through the surrounding deployment (reverse proxy or tunnel).
pub async fn run_web_server(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let registry = state.registry.clone();
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("agentdeck server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down; stopping all pty sessions");
            registry.stop_all();
        })
        .await?;
    Ok(())
}

async fn spa_fallback_handler(State(state): State<AppState>) -> Response {
    let Some(dist) = state.dist else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let index_path = dist.join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(content))
            .unwrap(),
        Err(e) => {
            warn!(error = %e, "failed to read index.html");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to load index.html: {e}"))
                .into_response()
        }
    }
}

// -- workspaces --

async fn list_workspaces_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<workspace::Workspace>>, (StatusCode, String)> {
    let db = state.db.lock().expect("db mutex");
    workspace::list_workspaces(&db).map(Json).map_err(db_error)
}

async fn create_workspace_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkspaceBody>,
) -> Result<Json<workspace::Workspace>, (StatusCode, String)> {
    let db = state.db.lock().expect("db mutex");
    workspace::create_workspace(
        &db,
        &state.working_dir,
        body.name,
        body.path.map(PathBuf::from),
    )
    .map(Json)
    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn delete_workspace_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    // Stop and remove the workspace's sessions first; the sessions table
    // references workspaces.
    let sessions = {
        let db = state.db.lock().expect("db mutex");
        session::list_sessions_by_workspace(&db, &id).map_err(db_error)?
    };
    for s in &sessions {
        state.registry.stop(&s.session_id);
    }
    let db = state.db.lock().expect("db mutex");
    for s in &sessions {
        session::delete_session(&db, &s.session_id).map_err(db_error)?;
    }
    workspace::delete_workspace(&db, &state.working_dir, &id).map_err(db_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- sessions --

async fn list_sessions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionListItem>>, (StatusCode, String)> {
    let records = {
        let db = state.db.lock().expect("db mutex");
        session::list_sessions(&db).map_err(db_error)?
    };
    let items = records
        .iter()
        .map(|r| session_item(r, state.registry.is_active(&r.session_id)))
        .collect();
    Ok(Json(items))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionListItem>, (StatusCode, String)> {
    let record = {
        let db = state.db.lock().expect("db mutex");
        session::get_session(&db, &id).map_err(db_error)?
    };
    match record {
        Some(r) => Ok(Json(session_item(&r, state.registry.is_active(&r.session_id)))),
        None => Err((StatusCode::NOT_FOUND, format!("Session not found: {id}"))),
    }
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionListItem>, (StatusCode, String)> {
    let Some(agent) = parse_agent(&body.agent) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Unknown agent: {}", body.agent),
        ));
    };
    let db = state.db.lock().expect("db mutex");
    let ws = workspace::get_workspace(&db, &body.workspace_id)
        .map_err(db_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Workspace not found: {}", body.workspace_id),
            )
        })?;
    let friendly_name = body
        .friendly_name
        .unwrap_or_else(|| format!("{} in {}", agent, ws.name));
    let record = session::create_session(
        &db,
        agent,
        &ws.workspace_id,
        &ws.path,
        &friendly_name,
        body.branch_name.as_deref(),
        body.interactive,
    )
    .map_err(db_error)?;
    Ok(Json(session_item(&record, false)))
}

async fn start_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartSessionBody>>,
) -> Result<Json<SessionListItem>, (StatusCode, String)> {
    let Json(body) = body.unwrap_or_default();
    let record = {
        let db = state.db.lock().expect("db mutex");
        session::get_session(&db, &id).map_err(db_error)?
    };
    let Some(record) = record else {
        return Err((StatusCode::NOT_FOUND, format!("Session not found: {id}")));
    };
    match state
        .registry
        .start(record.clone(), body.prompt, body.resume)
        .await
    {
        Ok(_) => {
            let db = state.db.lock().expect("db mutex");
            let _ = session::touch_session(&db, &id);
            Ok(Json(session_item(&record, true)))
        }
        Err(e @ StartError::WorkspaceMissing(_)) => {
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e @ StartError::SpawnFailed(_)) => {
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn stop_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = state.registry.stop(&id);
    Json(serde_json::json!({ "stopped": stopped }))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.registry.stop(&id);
    let db = state.db.lock().expect("db mutex");
    session::delete_session(&db, &id).map_err(db_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- terminal websocket --

async fn ws_terminal_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, id, registry))
}

/// One attached client: JSON envelopes in both directions, engine events fanned
/// in through an unbounded channel. Malformed and oversize frames are dropped
/// without closing the socket.
async fn handle_terminal_socket(
    mut socket: WebSocket,
    session_id: String,
    registry: Arc<PtyRegistry>,
) {
    if !registry.is_active(&session_id) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NO_SESSION,
                reason: "No active PTY session".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let client = ClientHandle::new(tx);
    let client_id = client.id;
    if !registry.attach(&session_id, client) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ATTACH_FAILED,
                reason: "Failed to attach".into(),
            })))
            .await;
        return;
    }
    debug!(%session_id, client_id, "terminal client attached");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let engine_to_ws = async {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        // Channel gone: the session exited (pty-exit already queued above).
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "".into(),
            })))
            .await;
    };

    let ws_to_engine = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                // Binary and ping/pong frames are not part of the protocol.
                _ => continue,
            };
            if text.len() > MAX_FRAME_BYTES {
                debug!(%session_id, len = text.len(), "oversize frame dropped");
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                debug!(%session_id, "malformed frame dropped");
                continue;
            };
            if !parsed.is_valid() {
                debug!(%session_id, "out-of-bounds frame dropped");
                continue;
            }
            match parsed {
                ClientMessage::PtyInput { data, .. } => {
                    registry.input(&session_id, data).await;
                }
                ClientMessage::PtyResize { cols, rows, .. } => {
                    registry.resize(&session_id, cols, rows);
                }
                ClientMessage::PtyAck { bytes, .. } => {
                    registry.ack(&session_id, client_id, bytes);
                }
            }
        }
    };

    tokio::select! {
        _ = engine_to_ws => {}
        _ = ws_to_engine => {}
    }
    registry.detach(&session_id, client_id);
    debug!(%session_id, client_id, "terminal client detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use common::notify::NoopNotifier;
    use tower::util::ServiceExt;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(common::db::open_db_in_memory().unwrap()));
        let registry = PtyRegistry::new(
            Arc::new(SqliteSink { db: db.clone() }),
            Arc::new(NoopNotifier),
        );
        let state = AppState {
            registry,
            db,
            working_dir: dir.path().to_path_buf(),
            dist: None,
        };
        (state, dir)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn workspace_create_then_list() {
        let (state, _dir) = test_state();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/workspaces")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"demo"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["name"], "demo");

        let resp = app
            .oneshot(Request::get("/api/workspaces").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_create_requires_known_agent_and_workspace() {
        let (state, _dir) = test_state();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"agent":"hal9000","workspace_id":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::post("/api/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"agent":"claude","workspace_id":"missing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_lifecycle_records_inactive_until_started() {
        let (state, _dir) = test_state();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/workspaces")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"demo"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let ws = body_json(resp).await;
        let ws_id = ws["workspace_id"].as_str().unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"agent":"claude","workspace_id":"{ws_id}"}}"#
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["active"], false);
        let sid = created["session_id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/sessions/{sid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/sessions/{sid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(resp).await;
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_unknown_session_is_404() {
        let (state, _dir) = test_state();
        let app = app(state);
        let resp = app
            .oneshot(
                Request::post("/api/sessions/nope/start")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
