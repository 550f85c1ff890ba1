//! Workspace management: CRUD backed by the SQLite `workspaces` table.
//! A workspace is a directory the agent CLI runs in. Created workspaces live
//! under {working_dir}/workspaces/{workspace_id}/; registering an existing
//! directory stores its absolute path instead.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

const WORKSPACES_DIR: &str = "workspaces";

#[derive(Debug, Clone, serde::Serialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub name: String,
    /// Absolute path of the workspace directory.
    pub path: String,
    pub created_at: String,
}

/// Create a new workspace. When `path` is None a fresh directory is created
/// under {working_dir}/workspaces/{id}; otherwise the given directory is
/// registered as-is (it must already exist).
pub fn create_workspace(
    conn: &Connection,
    working_dir: &Path,
    name: String,
    path: Option<PathBuf>,
) -> anyhow::Result<Workspace> {
    let workspace_id = uuid::Uuid::new_v4().to_string();
    let abs_path = match path {
        Some(p) => {
            if !p.is_dir() {
                anyhow::bail!("workspace path is not a directory: {}", p.display());
            }
            p
        }
        None => {
            let p = working_dir.join(WORKSPACES_DIR).join(&workspace_id);
            std::fs::create_dir_all(&p)?;
            p
        }
    };
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO workspaces (workspace_id, name, path, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![workspace_id, name, abs_path.to_string_lossy(), now],
    )?;

    Ok(Workspace {
        workspace_id,
        name,
        path: abs_path.to_string_lossy().into_owned(),
        created_at: now,
    })
}

/// Get a workspace by ID.
pub fn get_workspace(conn: &Connection, workspace_id: &str) -> rusqlite::Result<Option<Workspace>> {
    let mut stmt = conn.prepare(
        "SELECT workspace_id, name, path, created_at FROM workspaces WHERE workspace_id = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![workspace_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_workspace(row)?)),
        None => Ok(None),
    }
}

/// List all workspaces, most recent first.
pub fn list_workspaces(conn: &Connection) -> rusqlite::Result<Vec<Workspace>> {
    let mut stmt = conn.prepare(
        "SELECT workspace_id, name, path, created_at FROM workspaces ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([], |row| row_to_workspace(row))?;
    rows.collect()
}

/// Delete a workspace record. The directory is removed only when it was
/// created by us (lives under {working_dir}/workspaces/).
pub fn delete_workspace(
    conn: &Connection,
    working_dir: &Path,
    workspace_id: &str,
) -> rusqlite::Result<()> {
    let ws = get_workspace(conn, workspace_id)?;
    conn.execute(
        "DELETE FROM workspaces WHERE workspace_id = ?1",
        rusqlite::params![workspace_id],
    )?;
    if let Some(ws) = ws {
        let managed_root = working_dir.join(WORKSPACES_DIR);
        let path = PathBuf::from(&ws.path);
        if path.starts_with(&managed_root) {
            let _ = std::fs::remove_dir_all(&path);
        }
    }
    Ok(())
}

fn row_to_workspace(row: &rusqlite::Row) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        workspace_id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;

    #[test]
    fn create_makes_directory_and_record() {
        let conn = open_db_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ws = create_workspace(&conn, dir.path(), "demo".into(), None).unwrap();
        assert!(Path::new(&ws.path).is_dir());
        let listed = list_workspaces(&conn).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].workspace_id, ws.workspace_id);
    }

    #[test]
    fn register_existing_directory() {
        let conn = open_db_in_memory().unwrap();
        let working = tempfile::tempdir().unwrap();
        let external = tempfile::tempdir().unwrap();
        let ws = create_workspace(
            &conn,
            working.path(),
            "ext".into(),
            Some(external.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(ws.path, external.path().to_string_lossy());
    }

    #[test]
    fn register_missing_directory_fails() {
        let conn = open_db_in_memory().unwrap();
        let working = tempfile::tempdir().unwrap();
        let err = create_workspace(
            &conn,
            working.path(),
            "bad".into(),
            Some(PathBuf::from("/definitely/not/here")),
        );
        assert!(err.is_err());
    }

    #[test]
    fn delete_removes_managed_directory_only() {
        let conn = open_db_in_memory().unwrap();
        let working = tempfile::tempdir().unwrap();
        let managed = create_workspace(&conn, working.path(), "m".into(), None).unwrap();
        let external_dir = tempfile::tempdir().unwrap();
        let external = create_workspace(
            &conn,
            working.path(),
            "e".into(),
            Some(external_dir.path().to_path_buf()),
        )
        .unwrap();

        delete_workspace(&conn, working.path(), &managed.workspace_id).unwrap();
        delete_workspace(&conn, working.path(), &external.workspace_id).unwrap();

        assert!(!Path::new(&managed.path).exists());
        assert!(external_dir.path().exists());
        assert!(list_workspaces(&conn).unwrap().is_empty());
    }
}
