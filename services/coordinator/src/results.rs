//! Bounded FIFO of operation results.
//!
//! SQLite-backed so history survives coordinator failover. Append and trim
//! run inside one transaction; after every enqueue the store holds at most
//! `max_results` rows, oldest evicted first.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use pos_model::{OperationResult, OperationType};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::debug;

/// Errors from result store operations.
#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored result does not parse: {0}")]
    Corrupt(String),
}

/// SQLite-backed result store.
pub struct ResultStore {
    conn: Mutex<Connection>,
    max_results: u32,
}

impl ResultStore {
    /// Open or create a result store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, max_results: u32) -> Result<Self, ResultStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
            max_results,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(max_results: u32) -> Result<Self, ResultStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            max_results,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), ResultStoreError> {
        let conn = self.conn.lock().expect("result store lock");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operation_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_name TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_node ON operation_results(node_name);
            "#,
        )?;
        debug!("Result store schema initialized");
        Ok(())
    }

    /// Append a result and evict beyond the FIFO bound, atomically.
    pub fn enqueue(&self, result: &OperationResult) -> Result<(), ResultStoreError> {
        let payload = serde_json::to_string(result)
            .map_err(|e| ResultStoreError::Corrupt(e.to_string()))?;

        let mut conn = self.conn.lock().expect("result store lock");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO operation_results (node_name, operation_type, payload) VALUES (?1, ?2, ?3)",
            params![
                result.node_name,
                result.operation_type.to_string(),
                payload
            ],
        )?;
        tx.execute(
            "DELETE FROM operation_results WHERE id NOT IN (
                SELECT id FROM operation_results ORDER BY id DESC LIMIT ?1
            )",
            params![self.max_results],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Trim to the FIFO bound without appending. Run once per coordinator tick
    /// so a lowered bound takes effect.
    pub fn trim(&self) -> Result<usize, ResultStoreError> {
        let conn = self.conn.lock().expect("result store lock");
        let removed = conn.execute(
            "DELETE FROM operation_results WHERE id NOT IN (
                SELECT id FROM operation_results ORDER BY id DESC LIMIT ?1
            )",
            params![self.max_results],
        )?;
        Ok(removed)
    }

    /// Number of stored results.
    pub fn len(&self) -> Result<u64, ResultStoreError> {
        let conn = self.conn.lock().expect("result store lock");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM operation_results", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, ResultStoreError> {
        Ok(self.len()? == 0)
    }

    /// Results of one operation type grouped by node, oldest first per node.
    pub fn grouped_by_node(
        &self,
        operation_type: OperationType,
    ) -> Result<BTreeMap<String, Vec<OperationResult>>, ResultStoreError> {
        let conn = self.conn.lock().expect("result store lock");
        let mut stmt = conn.prepare(
            "SELECT payload FROM operation_results WHERE operation_type = ?1 ORDER BY id",
        )?;

        let payloads = stmt
            .query_map(params![operation_type.to_string()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut grouped: BTreeMap<String, Vec<OperationResult>> = BTreeMap::new();
        for payload in payloads {
            let result: OperationResult = serde_json::from_str(&payload)
                .map_err(|e| ResultStoreError::Corrupt(e.to_string()))?;
            grouped.entry(result.node_name.clone()).or_default().push(result);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pos_model::UpdateOperationOutcome;

    fn result(node: &str, op: OperationType) -> OperationResult {
        OperationResult {
            node_name: node.to_string(),
            operation_time: Utc::now(),
            operation_start_time: Utc::now(),
            operation_type: op,
            operation_result: UpdateOperationOutcome::Succeeded,
            update_details: Vec::new(),
            windows_update_query: "IsInstalled=0".to_string(),
            windows_update_frequency: "Weekly,Wednesday,7:00:00".to_string(),
            reboot_required: false,
        }
    }

    #[test]
    fn test_enqueue_and_group() {
        let store = ResultStore::open_in_memory(100).unwrap();
        store.enqueue(&result("n1", OperationType::SearchAndDownload)).unwrap();
        store.enqueue(&result("n1", OperationType::Installation)).unwrap();
        store.enqueue(&result("n2", OperationType::Installation)).unwrap();

        assert_eq!(store.len().unwrap(), 3);

        let installs = store.grouped_by_node(OperationType::Installation).unwrap();
        assert_eq!(installs.len(), 2);
        assert_eq!(installs["n1"].len(), 1);
        assert_eq!(installs["n2"].len(), 1);

        let searches = store.grouped_by_node(OperationType::SearchAndDownload).unwrap();
        assert_eq!(searches.len(), 1);
    }

    #[test]
    fn test_fifo_bound_enforced() {
        let store = ResultStore::open_in_memory(3).unwrap();
        for i in 0..5 {
            store.enqueue(&result(&format!("n{i}"), OperationType::Installation)).unwrap();
        }

        assert_eq!(store.len().unwrap(), 3);

        // Oldest two evicted.
        let grouped = store.grouped_by_node(OperationType::Installation).unwrap();
        assert!(!grouped.contains_key("n0"));
        assert!(!grouped.contains_key("n1"));
        assert!(grouped.contains_key("n4"));
    }

    #[test]
    fn test_trim_without_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");

        {
            let store = ResultStore::open(&path, 10).unwrap();
            for i in 0..5 {
                store.enqueue(&result(&format!("n{i}"), OperationType::Installation)).unwrap();
            }
            assert_eq!(store.trim().unwrap(), 0);
        }

        // A lowered bound takes effect on the next trim pass.
        let store = ResultStore::open(&path, 2).unwrap();
        assert_eq!(store.trim().unwrap(), 3);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");

        {
            let store = ResultStore::open(&path, 10).unwrap();
            store.enqueue(&result("n1", OperationType::Installation)).unwrap();
        }

        let reopened = ResultStore::open(&path, 10).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }
}
