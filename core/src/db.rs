//! SQLite database: single connection, WAL mode, all tables created on open.
//! DB file lives at {working_dir}/agentdeck.db.

use rusqlite::Connection;
use std::path::Path;

const DB_FILE: &str = "agentdeck.db";

/// Open (or create) the SQLite database and ensure all tables exist.
pub fn open_db(working_dir: &Path) -> rusqlite::Result<Connection> {
    let db_path = working_dir.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    create_tables(&conn)?;
    Ok(conn)
}

/// In-memory database with the same schema, for tests.
pub fn open_db_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    create_tables(&conn)?;
    Ok(conn)
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS workspaces (
            workspace_id  TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            path          TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            session_id       TEXT PRIMARY KEY,
            agent            TEXT NOT NULL,
            workspace_id     TEXT NOT NULL REFERENCES workspaces(workspace_id),
            workspace_path   TEXT NOT NULL,
            friendly_name    TEXT NOT NULL,
            branch_name      TEXT,
            interactive      INTEGER NOT NULL DEFAULT 1,
            conversation_id  TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        ",
    )
}
