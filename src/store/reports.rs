//! Durable report artifacts, one copy per (ancestor session, task).
//!
//! The artifact is the restart-safe source of truth for completed reports;
//! the in-memory cache in the report protocol is purely an optimization.
//! Artifacts outlive the task record itself.

use super::Store;
use crate::types::TaskReport;
use anyhow::Result;
use rusqlite::{Row, params};

fn parse_report_row(row: &Row) -> rusqlite::Result<TaskReport> {
    let ancestor_ids_json: String = row.get("ancestor_ids")?;
    let ancestor_ids: Vec<String> = serde_json::from_str(&ancestor_ids_json).unwrap_or_default();

    Ok(TaskReport {
        task_id: row.get("task_id")?,
        report: row.get("report")?,
        title: row.get("title")?,
        model: row.get("model")?,
        thinking_level: row.get("thinking_level")?,
        ancestor_ids,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Persist a report under every ancestor's durable area, in a single
    /// transaction. Idempotent: re-writing the same (ancestor, task) pair
    /// replaces the row rather than duplicating it.
    pub fn put_report(&self, report: &TaskReport) -> Result<()> {
        let ancestor_ids_json = serde_json::to_string(&report.ancestor_ids)?;

        self.with_tx(|tx| {
            for ancestor in &report.ancestor_ids {
                tx.execute(
                    "INSERT OR REPLACE INTO report_artifacts (
                        ancestor_session_id, task_id, report, title, model,
                        thinking_level, ancestor_ids, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        ancestor,
                        report.task_id,
                        report.report,
                        report.title,
                        report.model,
                        report.thinking_level,
                        ancestor_ids_json,
                        report.created_at,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Fetch a task's report as persisted under one ancestor's scope.
    pub fn get_report_for_ancestor(
        &self,
        ancestor_session_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskReport>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM report_artifacts
                 WHERE ancestor_session_id = ?1 AND task_id = ?2",
            )?;
            match stmt.query_row(params![ancestor_session_id, task_id], parse_report_row) {
                Ok(report) => Ok(Some(report)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Fetch a task's report regardless of scope (any persisted copy).
    pub fn get_report(&self, task_id: &str) -> Result<Option<TaskReport>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM report_artifacts WHERE task_id = ?1 LIMIT 1")?;
            match stmt.query_row(params![task_id], parse_report_row) {
                Ok(report) => Ok(Some(report)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// All reports persisted under one ancestor, oldest first.
    pub fn reports_for_ancestor(&self, ancestor_session_id: &str) -> Result<Vec<TaskReport>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM report_artifacts
                 WHERE ancestor_session_id = ?1 ORDER BY created_at, task_id",
            )?;
            let reports = stmt
                .query_map(params![ancestor_session_id], parse_report_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(reports)
        })
    }

    /// Count of persisted artifact rows for a task (one per ancestor).
    pub fn report_copy_count(&self, task_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM report_artifacts WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(task_id: &str, ancestors: &[&str]) -> TaskReport {
        TaskReport {
            task_id: task_id.into(),
            report: "all done".into(),
            title: Some("result".into()),
            model: None,
            thinking_level: None,
            ancestor_ids: ancestors.iter().map(|s| s.to_string()).collect(),
            created_at: 42,
        }
    }

    #[test]
    fn persists_one_copy_per_ancestor() {
        let store = Store::open_in_memory().unwrap();
        store
            .put_report(&sample_report("t1", &["parent", "grand", "root"]))
            .unwrap();

        assert_eq!(store.report_copy_count("t1").unwrap(), 3);
        for ancestor in ["parent", "grand", "root"] {
            let report = store.get_report_for_ancestor(ancestor, "t1").unwrap();
            assert!(report.is_some(), "missing copy under {}", ancestor);
        }
        assert!(
            store
                .get_report_for_ancestor("stranger", "t1")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let report = sample_report("t1", &["parent", "root"]);
        store.put_report(&report).unwrap();
        store.put_report(&report).unwrap();
        assert_eq!(store.report_copy_count("t1").unwrap(), 2);
    }

    #[test]
    fn ancestor_list_survives_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.put_report(&sample_report("t1", &["p", "r"])).unwrap();
        let loaded = store.get_report("t1").unwrap().unwrap();
        assert_eq!(loaded.ancestor_ids, vec!["p", "r"]);
        assert_eq!(loaded.report, "all done");
        assert_eq!(loaded.title.as_deref(), Some("result"));
    }

    #[test]
    fn reports_for_ancestor_lists_all() {
        let store = Store::open_in_memory().unwrap();
        store.put_report(&sample_report("t1", &["root"])).unwrap();
        store.put_report(&sample_report("t2", &["root"])).unwrap();
        let reports = store.reports_for_ancestor("root").unwrap();
        assert_eq!(reports.len(), 2);
    }
}
