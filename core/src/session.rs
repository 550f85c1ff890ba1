//! Persistent session records: CRUD for the `sessions` table.
//! A session is one logical conversation with an agent CLI, identified by our
//! UUID. The CLI's own conversation id is written back here once discovered
//! (distinct from our session id for agents that invent their own).

use rusqlite::Connection;

use crate::pty::AgentKind;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent: AgentKind,
    pub workspace_id: String,
    /// Absolute directory the PTY runs in. Denormalized from the workspace so
    /// the engine never touches the workspaces table.
    pub workspace_path: String,
    pub friendly_name: String,
    pub branch_name: Option<String>,
    pub interactive: bool,
    pub conversation_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Create a new session record under a workspace.
pub fn create_session(
    conn: &Connection,
    agent: AgentKind,
    workspace_id: &str,
    workspace_path: &str,
    friendly_name: &str,
    branch_name: Option<&str>,
    interactive: bool,
) -> rusqlite::Result<SessionRecord> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sessions (session_id, agent, workspace_id, workspace_path, friendly_name,
                               branch_name, interactive, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            session_id,
            agent.as_str(),
            workspace_id,
            workspace_path,
            friendly_name,
            branch_name,
            interactive,
            now,
            now
        ],
    )?;
    Ok(SessionRecord {
        session_id,
        agent,
        workspace_id: workspace_id.to_string(),
        workspace_path: workspace_path.to_string(),
        friendly_name: friendly_name.to_string(),
        branch_name: branch_name.map(String::from),
        interactive,
        conversation_id: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Get a session by ID.
pub fn get_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<SessionRecord>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLS} WHERE session_id = ?1"))?;
    let mut rows = stmt.query(rusqlite::params![session_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

/// List all sessions, most recently updated first.
pub fn list_sessions(conn: &Connection) -> rusqlite::Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLS} ORDER BY updated_at DESC"))?;
    let rows = stmt.query_map([], |row| row_to_session(row))?;
    rows.collect()
}

/// List sessions belonging to a workspace, most recently updated first.
pub fn list_sessions_by_workspace(
    conn: &Connection,
    workspace_id: &str,
) -> rusqlite::Result<Vec<SessionRecord>> {
    let mut stmt =
        conn.prepare(&format!("{SELECT_COLS} WHERE workspace_id = ?1 ORDER BY updated_at DESC"))?;
    let rows = stmt.query_map(rusqlite::params![workspace_id], |row| row_to_session(row))?;
    rows.collect()
}

/// Set the CLI's conversation id (e.g. claude's session UUID) and touch updated_at.
pub fn set_conversation_id(
    conn: &Connection,
    session_id: &str,
    conversation_id: &str,
) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE sessions SET conversation_id = ?1, updated_at = ?2 WHERE session_id = ?3",
        rusqlite::params![conversation_id, now, session_id],
    )?;
    Ok(())
}

/// Update updated_at to now.
pub fn touch_session(conn: &Connection, session_id: &str) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
        rusqlite::params![now, session_id],
    )?;
    Ok(())
}

/// Delete a session record.
pub fn delete_session(conn: &Connection, session_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM sessions WHERE session_id = ?1",
        rusqlite::params![session_id],
    )?;
    Ok(())
}

const SELECT_COLS: &str = "SELECT session_id, agent, workspace_id, workspace_path, friendly_name,
                                  branch_name, interactive, conversation_id, created_at, updated_at
                           FROM sessions";

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let agent: String = row.get(1)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        agent: AgentKind::from_str_or_default(&agent),
        workspace_id: row.get(2)?,
        workspace_path: row.get(3)?,
        friendly_name: row.get(4)?,
        branch_name: row.get(5)?,
        interactive: row.get(6)?,
        conversation_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;
    use crate::workspace::create_workspace;

    fn seeded() -> (Connection, String, tempfile::TempDir) {
        let conn = open_db_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ws = create_workspace(&conn, dir.path(), "ws".into(), None).unwrap();
        (conn, ws.workspace_id, dir)
    }

    #[test]
    fn create_get_roundtrip() {
        let (conn, ws_id, _dir) = seeded();
        let s = create_session(&conn, AgentKind::Claude, &ws_id, "/tmp/ws", "fix bug", None, true)
            .unwrap();
        let got = get_session(&conn, &s.session_id).unwrap().unwrap();
        assert_eq!(got.agent, AgentKind::Claude);
        assert_eq!(got.workspace_path, "/tmp/ws");
        assert!(got.conversation_id.is_none());
        assert!(got.interactive);
    }

    #[test]
    fn conversation_id_update_touches_timestamp() {
        let (conn, ws_id, _dir) = seeded();
        let s = create_session(&conn, AgentKind::Copilot, &ws_id, "/tmp/ws", "x", None, true)
            .unwrap();
        set_conversation_id(&conn, &s.session_id, "conv-42").unwrap();
        let got = get_session(&conn, &s.session_id).unwrap().unwrap();
        assert_eq!(got.conversation_id.as_deref(), Some("conv-42"));
        assert!(got.updated_at >= got.created_at);
    }

    #[test]
    fn list_and_delete() {
        let (conn, ws_id, _dir) = seeded();
        let a = create_session(&conn, AgentKind::Claude, &ws_id, "/a", "a", None, true).unwrap();
        let _b = create_session(&conn, AgentKind::Claude, &ws_id, "/b", "b", None, false).unwrap();
        assert_eq!(list_sessions(&conn).unwrap().len(), 2);
        assert_eq!(list_sessions_by_workspace(&conn, &ws_id).unwrap().len(), 2);
        delete_session(&conn, &a.session_id).unwrap();
        assert_eq!(list_sessions(&conn).unwrap().len(), 1);
    }
}
