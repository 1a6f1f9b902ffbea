//! Task record CRUD, session registration, and auto-resume flags.

use super::{Store, now_ms};
use crate::types::{SessionFlags, TaskRecord, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

pub(crate) fn parse_task_row(row: &Row) -> rusqlite::Result<TaskRecord> {
    let status_str: String = row.get("status")?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown task status '{}'", status_str).into(),
        )
    })?;

    Ok(TaskRecord {
        id: row.get("id")?,
        parent_session_id: row.get("parent_session_id")?,
        agent_id: row.get("agent_id")?,
        title: row.get("title")?,
        prompt: row.get("prompt")?,
        model: row.get("model")?,
        thinking_level: row.get("thinking_level")?,
        status,
        session_path: row.get("session_path")?,
        trunk_branch: row.get("trunk_branch")?,
        base_commit_sha: row.get("base_commit_sha")?,
        reminder_count: row.get("reminder_count")?,
        artifact_pending: row.get::<_, i64>("artifact_pending")? != 0,
        created_at: row.get("created_at")?,
        reported_at: row.get("reported_at")?,
    })
}

fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<TaskRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
    match stmt.query_row(params![task_id], parse_task_row) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_task_internal(conn: &Connection, task: &TaskRecord) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET
            parent_session_id = ?1, agent_id = ?2, title = ?3, prompt = ?4,
            model = ?5, thinking_level = ?6, status = ?7, session_path = ?8,
            trunk_branch = ?9, base_commit_sha = ?10, reminder_count = ?11,
            artifact_pending = ?12, reported_at = ?13
         WHERE id = ?14",
        params![
            task.parent_session_id,
            task.agent_id,
            task.title,
            task.prompt,
            task.model,
            task.thinking_level,
            task.status.as_str(),
            task.session_path,
            task.trunk_branch,
            task.base_commit_sha,
            task.reminder_count,
            task.artifact_pending as i64,
            task.reported_at,
            task.id,
        ],
    )?;
    Ok(())
}

impl Store {
    /// Insert a new task record.
    pub fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (
                    id, parent_session_id, agent_id, title, prompt, model,
                    thinking_level, status, session_path, trunk_branch,
                    base_commit_sha, reminder_count, artifact_pending,
                    created_at, reported_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    task.id,
                    task.parent_session_id,
                    task.agent_id,
                    task.title,
                    task.prompt,
                    task.model,
                    task.thinking_level,
                    task.status.as_str(),
                    task.session_path,
                    task.trunk_branch,
                    task.base_commit_sha,
                    task.reminder_count,
                    task.artifact_pending as i64,
                    task.created_at,
                    task.reported_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a task record by id.
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Atomic read-modify-write of one task record against its latest
    /// snapshot. Returns the updated record, or `None` if the row is gone
    /// (delete race; callers treat this as success, not failure).
    pub fn edit_task<F>(&self, task_id: &str, f: F) -> Result<Option<TaskRecord>>
    where
        F: FnOnce(&mut TaskRecord),
    {
        self.with_tx(|tx| {
            let Some(mut task) = get_task_internal(tx, task_id)? else {
                return Ok(None);
            };
            f(&mut task);
            write_task_internal(tx, &task)?;
            Ok(Some(task))
        })
    }

    /// Delete a task record. Missing rows are fine (delete race).
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            Ok(())
        })
    }

    /// All task records in `created_at` order. Malformed rows are logged and
    /// skipped rather than failing the whole scan; recovery leaves them in
    /// their last persisted state.
    pub fn all_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at, id")?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .filter_map(|r| match r {
                    Ok(task) => Some(task),
                    Err(e) => {
                        tracing::warn!("skipping malformed task row: {}", e);
                        None
                    }
                })
                .collect();
            Ok(tasks)
        })
    }

    /// Queued tasks, oldest first.
    pub fn queued_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM tasks WHERE status = 'queued' ORDER BY created_at, id")?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(tasks)
        })
    }

    /// Register a root (non-task) session so parent resolution can tell
    /// "root session" apart from "missing".
    pub fn register_session(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?1, ?2)",
                params![session_id, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Whether a session id resolves to a registered root session or an
    /// existing task record.
    pub fn session_known(&self, session_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let known: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)
                 OR EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(known)
        })
    }

    /// Read a session's auto-resume flags (defaults if never written).
    pub fn session_flags(&self, session_id: &str) -> Result<SessionFlags> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT auto_resume_count, hard_interrupted FROM session_flags
                 WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionFlags {
                        auto_resume_count: row.get(0)?,
                        hard_interrupted: row.get::<_, i64>(1)? != 0,
                    })
                },
            );
            match result {
                Ok(flags) => Ok(flags),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SessionFlags::default()),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Increment a session's consecutive auto-resume counter; returns the new
    /// value.
    pub fn bump_auto_resume(&self, session_id: &str) -> Result<i32> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_flags (session_id, auto_resume_count) VALUES (?1, 1)
                 ON CONFLICT(session_id)
                 DO UPDATE SET auto_resume_count = auto_resume_count + 1",
                params![session_id],
            )?;
            let count: i32 = conn.query_row(
                "SELECT auto_resume_count FROM session_flags WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Set or clear the hard-interrupted flag. Setting it also clears the
    /// auto-resume counter.
    pub fn set_hard_interrupted(&self, session_id: &str, interrupted: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_flags (session_id, auto_resume_count, hard_interrupted)
                 VALUES (?1, 0, ?2)
                 ON CONFLICT(session_id)
                 DO UPDATE SET hard_interrupted = ?2,
                               auto_resume_count = CASE WHEN ?2 THEN 0 ELSE auto_resume_count END",
                params![session_id, interrupted as i64],
            )?;
            Ok(())
        })
    }

    /// Reset the auto-resume counter and clear the hard-interrupted flag
    /// (genuine user message or explicit acknowledgment only).
    pub fn reset_session_flags(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_flags (session_id, auto_resume_count, hard_interrupted)
                 VALUES (?1, 0, 0)
                 ON CONFLICT(session_id)
                 DO UPDATE SET auto_resume_count = 0, hard_interrupted = 0",
                params![session_id],
            )?;
            Ok(())
        })
    }

    /// Drop a session's durable bookkeeping (flags and root registration).
    pub fn delete_session_data(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_flags WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            Ok(())
        })
    }
}

/// Build a fresh task record in the initial shape used by admission.
#[allow(clippy::too_many_arguments)]
pub fn new_task_record(
    id: String,
    parent_session_id: String,
    agent_id: String,
    title: String,
    prompt: String,
    model: Option<String>,
    thinking_level: Option<String>,
    status: TaskStatus,
) -> TaskRecord {
    TaskRecord {
        id,
        parent_session_id,
        agent_id,
        title,
        prompt: Some(prompt),
        model,
        thinking_level,
        status,
        session_path: None,
        trunk_branch: None,
        base_commit_sha: None,
        reminder_count: 0,
        artifact_pending: false,
        created_at: now_ms(),
        reported_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_store() -> Store {
        Store::open_in_memory().expect("Failed to create in-memory store")
    }

    fn sample_task(id: &str, parent: &str) -> TaskRecord {
        new_task_record(
            id.into(),
            parent.into(),
            "explore".into(),
            "investigate".into(),
            "look into it".into(),
            None,
            None,
            TaskStatus::Queued,
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = setup_store();
        let task = sample_task("t1", "root");
        store.insert_task(&task).unwrap();

        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.id, "t1");
        assert_eq!(loaded.parent_session_id, "root");
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.prompt.as_deref(), Some("look into it"));
        assert_eq!(loaded.reminder_count, 0);
        assert!(!loaded.artifact_pending);
    }

    #[test]
    fn edit_task_read_modify_write() {
        let store = setup_store();
        store.insert_task(&sample_task("t1", "root")).unwrap();

        let updated = store
            .edit_task("t1", |t| {
                t.status = TaskStatus::Running;
                t.prompt = None;
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Running);
        assert!(updated.prompt.is_none());

        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.prompt.is_none());
    }

    #[test]
    fn edit_missing_task_returns_none() {
        let store = setup_store();
        let result = store.edit_task("ghost", |t| t.reminder_count += 1).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = setup_store();
        store.insert_task(&sample_task("t1", "root")).unwrap();
        store.delete_task("t1").unwrap();
        // Second delete of the same row is success, not failure.
        store.delete_task("t1").unwrap();
        assert!(store.get_task("t1").unwrap().is_none());
    }

    #[test]
    fn queued_tasks_in_created_order() {
        let store = setup_store();
        let mut a = sample_task("a", "root");
        a.created_at = 100;
        let mut b = sample_task("b", "root");
        b.created_at = 50;
        store.insert_task(&a).unwrap();
        store.insert_task(&b).unwrap();

        let queued = store.queued_tasks().unwrap();
        let ids: Vec<&str> = queued.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn session_resolution() {
        let store = setup_store();
        assert!(!store.session_known("root").unwrap());

        store.register_session("root").unwrap();
        assert!(store.session_known("root").unwrap());

        // Tasks count as sessions too.
        store.insert_task(&sample_task("t1", "root")).unwrap();
        assert!(store.session_known("t1").unwrap());
    }

    #[test]
    fn session_flags_lifecycle() {
        let store = setup_store();
        let flags = store.session_flags("s1").unwrap();
        assert_eq!(flags.auto_resume_count, 0);
        assert!(!flags.hard_interrupted);

        assert_eq!(store.bump_auto_resume("s1").unwrap(), 1);
        assert_eq!(store.bump_auto_resume("s1").unwrap(), 2);

        store.set_hard_interrupted("s1", true).unwrap();
        let flags = store.session_flags("s1").unwrap();
        assert!(flags.hard_interrupted);
        assert_eq!(flags.auto_resume_count, 0); // cleared by the hard interrupt

        store.reset_session_flags("s1").unwrap();
        let flags = store.session_flags("s1").unwrap();
        assert!(!flags.hard_interrupted);
        assert_eq!(flags.auto_resume_count, 0);
    }

    #[test]
    fn reopened_store_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let store = Store::open(&path).unwrap();
            store.insert_task(&sample_task("t1", "root")).unwrap();
            store.register_session("root").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.get_task("t1").unwrap().is_some());
        assert!(store.session_known("root").unwrap());
    }

    #[test]
    fn malformed_status_rows_are_skipped() {
        let store = setup_store();
        store.insert_task(&sample_task("good", "root")).unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, parent_session_id, agent_id, title, status, created_at)
                     VALUES ('bad', 'root', 'explore', 'broken', 'no_such_status', 1)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let tasks = store.all_tasks().unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
    }
}
