//! Persistent mutation queue.
//!
//! Durable, ordered record of writes that could not be sent immediately.
//! The queue exclusively owns `QueuedMutation` lifecycle: rows are created
//! by `enqueue`, move through `pending -> in_flight -> pending(retry)`,
//! and leave the table on terminal success or abandonment. Enqueue order
//! is the replay order; nothing here reorders or coalesces.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::StoreError;

/// Transport-level verb of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationVerb {
    Create,
    Update,
    Delete,
}

impl MutationVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn http_method(&self) -> reqwest::Method {
        match self {
            Self::Create => reqwest::Method::POST,
            Self::Update => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Lifecycle state of a queued mutation.
///
/// `Done` and abandoned `Failed` rows are not retained; they appear only
/// transiently while the sync engine finishes a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    InFlight,
    Failed,
    Done,
}

impl MutationState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "failed" => Self::Failed,
            "done" => Self::Done,
            _ => Self::Pending,
        }
    }
}

/// A pending write awaiting transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub resource: String,
    pub verb: MutationVerb,
    pub payload: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: MutationState,
}

/// Pending/in-flight row counts for the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepths {
    pub pending: i64,
    pub in_flight: i64,
}

const SELECT_COLUMNS: &str =
    "id, resource, verb, payload, enqueued_at, attempts, last_error, status";

pub struct QueueStore {
    db: Arc<DbState>,
}

impl QueueStore {
    /// Wrap the database handle and recover rows interrupted mid-flight by
    /// a crash: an `in_flight` row at startup was never confirmed, so it
    /// goes back to `pending` and is replayed on the next drain.
    pub fn new(db: Arc<DbState>) -> Self {
        let store = Self { db };
        match store.recover_interrupted() {
            Ok(0) => {}
            Ok(n) => info!("Recovered {n} interrupted mutations to pending"),
            Err(e) => warn!("Queue recovery failed: {e}"),
        }
        store
    }

    fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(n)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.db
            .conn
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Append a mutation. The row is persisted before this returns, so a
    /// crash immediately after enqueue does not lose the write.
    pub fn enqueue(
        &self,
        resource: &str,
        verb: MutationVerb,
        payload: Option<Value>,
    ) -> Result<QueuedMutation, StoreError> {
        let mutation = QueuedMutation {
            id: Uuid::new_v4().to_string(),
            resource: resource.to_string(),
            verb,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            state: MutationState::Pending,
        };

        let payload_text = mutation
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_queue (id, resource, verb, payload, enqueued_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                mutation.id,
                mutation.resource,
                mutation.verb.as_str(),
                payload_text,
                mutation.enqueued_at.to_rfc3339(),
            ],
        )?;

        debug!(id = %mutation.id, resource = %mutation.resource, verb = mutation.verb.as_str(), "mutation enqueued");
        Ok(mutation)
    }

    /// Snapshot of all pending mutations whose retry delay has elapsed, in
    /// original enqueue order. Mutations enqueued after this call are not
    /// part of the snapshot; they are picked up on the next drain pass.
    pub fn peek_due(&self) -> Result<Vec<QueuedMutation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_queue
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map([], row_to_mutation)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Fetch a single mutation by id.
    pub fn get(&self, id: &str) -> Result<Option<QueuedMutation>, StoreError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![id],
                row_to_mutation,
            )
            .optional()?;
        found.transpose().map_err(StoreError::from)
    }

    /// Mark a mutation as currently being transmitted.
    pub fn mark_in_flight(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_queue SET status = 'in_flight' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record a failed attempt: bump the attempt counter, store the error,
    /// and return the row to `pending`, not eligible again until
    /// `next_retry_at`.
    pub fn mark_retry(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_queue
             SET status = 'pending',
                 attempts = attempts + 1,
                 last_error = ?2,
                 next_retry_at = ?3
             WHERE id = ?1",
            params![id, error, next_retry_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a terminal state before removal, for the benefit of anything
    /// observing the table mid-pass.
    pub fn mark_state(&self, id: &str, state: MutationState, error: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_queue
             SET status = ?2,
                 last_error = COALESCE(?3, last_error)
             WHERE id = ?1",
            params![id, state.as_str(), error],
        )?;
        Ok(())
    }

    /// Delete a mutation on terminal success or abandonment.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Status-filtered row counts.
    pub fn depths(&self) -> QueueDepths {
        let conn = match self.conn() {
            Ok(c) => c,
            Err(_) => return QueueDepths::default(),
        };
        let count = |status: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
            .unwrap_or(0)
        };
        QueueDepths {
            pending: count("pending"),
            in_flight: count("in_flight"),
        }
    }

    /// Drop every queued mutation (explicit user action).
    pub fn clear(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM sync_queue", [])?;
        if n > 0 {
            info!("Cleared {n} queued mutations");
        }
        Ok(n)
    }
}

fn row_to_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<QueuedMutation, serde_json::Error>> {
    let id: String = row.get(0)?;
    let resource: String = row.get(1)?;
    let verb_text: String = row.get(2)?;
    let payload_text: Option<String> = row.get(3)?;
    let enqueued_at_text: String = row.get(4)?;
    let attempts: i64 = row.get(5)?;
    let last_error: Option<String> = row.get(6)?;
    let status_text: String = row.get(7)?;

    let payload = match payload_text {
        Some(text) => match serde_json::from_str(&text) {
            Ok(v) => Some(v),
            Err(e) => return Ok(Err(e)),
        },
        None => None,
    };

    Ok(Ok(QueuedMutation {
        id,
        resource,
        // Unknown verbs cannot be inserted through `enqueue`; treat a
        // hand-edited row as a create so it still maps to a method.
        verb: MutationVerb::parse(&verb_text).unwrap_or(MutationVerb::Create),
        payload,
        enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at_text)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        attempts: attempts.max(0) as u32,
        last_error,
        state: MutationState::parse(&status_text),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_store() -> QueueStore {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        QueueStore::new(Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }))
    }

    #[test]
    fn test_enqueue_then_peek_preserves_fields_and_order() {
        let store = test_store();
        let a = store
            .enqueue(
                "/api/transactions",
                MutationVerb::Create,
                Some(serde_json::json!({ "customerName": "A", "amount": 100 })),
            )
            .unwrap();
        let b = store
            .enqueue("/api/transactions/42", MutationVerb::Delete, None)
            .unwrap();

        let due = store.peek_due().unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, a.id);
        assert_eq!(due[1].id, b.id);
        assert_eq!(due[0].verb, MutationVerb::Create);
        assert_eq!(
            due[0].payload.as_ref().unwrap()["customerName"],
            serde_json::json!("A")
        );
        assert_eq!(due[1].payload, None);
        assert_eq!(due[0].attempts, 0);
        assert_eq!(due[0].state, MutationState::Pending);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let state = db::init(dir.path()).unwrap();
            let store = QueueStore::new(Arc::new(state));
            store
                .enqueue(
                    "/api/bills",
                    MutationVerb::Update,
                    Some(serde_json::json!({ "id": 7, "amount": 12.5 })),
                )
                .unwrap()
                .id
        };

        // Simulated process restart: reload the store from the same file.
        let state = db::init(dir.path()).unwrap();
        let store = QueueStore::new(Arc::new(state));
        let revived = store.get(&id).unwrap().expect("mutation survives restart");
        assert_eq!(revived.resource, "/api/bills");
        assert_eq!(revived.verb, MutationVerb::Update);
        assert_eq!(revived.payload.as_ref().unwrap()["amount"], serde_json::json!(12.5));
        assert_eq!(revived.attempts, 0);
    }

    #[test]
    fn test_mark_retry_defers_until_due() {
        let store = test_store();
        let m = store
            .enqueue("/api/suppliers", MutationVerb::Create, Some(serde_json::json!({})))
            .unwrap();

        store
            .mark_retry(&m.id, "Backend server error (HTTP 503)", Utc::now() + chrono::Duration::hours(1))
            .unwrap();

        assert!(store.peek_due().unwrap().is_empty());
        let row = store.get(&m.id).unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("Backend server error (HTTP 503)"));
        assert_eq!(row.state, MutationState::Pending);

        // A past retry time makes it due again.
        store
            .mark_retry(&m.id, "still down", Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(store.peek_due().unwrap().len(), 1);
    }

    #[test]
    fn test_in_flight_rows_recover_to_pending_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let state = db::init(dir.path()).unwrap();
            let store = QueueStore::new(Arc::new(state));
            let m = store
                .enqueue("/api/expenditures", MutationVerb::Create, Some(serde_json::json!({})))
                .unwrap();
            store.mark_in_flight(&m.id).unwrap();
            m.id
        };

        let state = db::init(dir.path()).unwrap();
        let store = QueueStore::new(Arc::new(state));
        let row = store.get(&id).unwrap().unwrap();
        assert_eq!(row.state, MutationState::Pending);
    }

    #[test]
    fn test_remove_and_depths() {
        let store = test_store();
        let a = store
            .enqueue("/api/bills", MutationVerb::Create, Some(serde_json::json!({})))
            .unwrap();
        let _b = store
            .enqueue("/api/bills", MutationVerb::Create, Some(serde_json::json!({})))
            .unwrap();

        store.mark_in_flight(&a.id).unwrap();
        let depths = store.depths();
        assert_eq!(depths.pending, 1);
        assert_eq!(depths.in_flight, 1);

        store.remove(&a.id).unwrap();
        assert!(store.get(&a.id).unwrap().is_none());
        assert_eq!(store.depths().in_flight, 0);
    }
}
