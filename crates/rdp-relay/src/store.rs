//! SQLite-backed claim and static-assignment tables

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Database connection lock poisoned")]
    Poisoned,
    #[error("Blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One row of the claim table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRow {
    pub address: String,
    pub weight: i64,
    /// Claiming client identity, empty when the backend is free.
    pub client: String,
    /// Unix seconds at which the claim was marked for release.
    pub pending_since: Option<i64>,
}

impl BackendRow {
    pub fn is_free(&self) -> bool {
        self.client.is_empty() && self.pending_since.is_none()
    }
}

/// Row counts touched by one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub marked: usize,
    pub freed: usize,
}

/// Transactional primitives the pool is built on.
///
/// Every method is one short, self-contained transaction. Implementations
/// must not cache claim state between calls.
///
/// Rows may be written by other tools: a NULL or blank `client` means free
/// and a NULL or blank `wait_start` means no pending release.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Administrator-provisioned backend for `client`, if any.
    async fn static_backend(&self, client: &str) -> Result<Option<String>, StoreError>;

    /// Backend currently claimed by `client`, if any.
    async fn claimed_backend(&self, client: &str) -> Result<Option<String>, StoreError>;

    /// Highest-weight free backend with non-zero weight, ties broken by
    /// ascending address.
    async fn best_free_backend(&self) -> Result<Option<String>, StoreError>;

    /// Conditionally claim `backend` for `client`.
    ///
    /// Returns `true` when the claim is held by `client` afterwards.
    async fn try_claim(&self, backend: &str, client: &str) -> Result<bool, StoreError>;

    /// Free `backend` and drop any pending-release mark.
    async fn clear_claim(&self, backend: &str) -> Result<(), StoreError>;

    /// Free `backend` only while `client` holds it. Returns whether it did.
    async fn clear_claim_of(&self, backend: &str, client: &str) -> Result<bool, StoreError>;

    /// Mark claims whose owner is not in `live`, then free claims that have
    /// been pending for longer than `grace_secs`.
    async fn reconcile(
        &self,
        live: &HashSet<String>,
        now: i64,
        grace_secs: i64,
    ) -> Result<ReconcileOutcome, StoreError>;

    /// Snapshot of the whole claim table, ordered by address.
    async fn backends(&self) -> Result<Vec<BackendRow>, StoreError>;
}

/// SQLite-based pool store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(path)).await??;
        Self::from_connection(conn).await
    }

    /// Non-persistent store, used by tests and dry runs
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn).map_err(StoreError::from)
        })
        .await?
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS pool (
                    server TEXT PRIMARY KEY,
                    weight INTEGER NOT NULL DEFAULT 0,
                    client TEXT NOT NULL DEFAULT '',
                    wait_start INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_pool_client ON pool (client);

                CREATE TABLE IF NOT EXISTS assignments (
                    client TEXT PRIMARY KEY,
                    server TEXT NOT NULL
                );
                "#,
            )
        })
        .await
    }

    /// Insert a backend or update its weight. An existing claim is kept.
    pub async fn upsert_backend(&self, address: &str, weight: i64) -> Result<(), StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO pool (server, weight) VALUES (?1, ?2)
                ON CONFLICT(server) DO UPDATE SET weight = excluded.weight
                "#,
                params![address, weight],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove a backend row. Returns whether a row existed.
    pub async fn remove_backend(&self, address: &str) -> Result<bool, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM pool WHERE server = ?1", params![address])?;
            Ok(n > 0)
        })
        .await
    }

    /// Pin `client` to `backend`, replacing any previous assignment.
    pub async fn assign_static(&self, client: &str, backend: &str) -> Result<(), StoreError> {
        let client = client.to_string();
        let backend = backend.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO assignments (client, server) VALUES (?1, ?2)
                ON CONFLICT(client) DO UPDATE SET server = excluded.server
                "#,
                params![client, backend],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_static(&self, client: &str) -> Result<bool, StoreError> {
        let client = client.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM assignments WHERE client = ?1", params![client])?;
            Ok(n > 0)
        })
        .await
    }
}

#[async_trait]
impl PoolStore for SqliteStore {
    async fn static_backend(&self, client: &str) -> Result<Option<String>, StoreError> {
        let client = client.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT server FROM assignments WHERE client = ?1",
                params![client],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn claimed_backend(&self, client: &str) -> Result<Option<String>, StoreError> {
        if client.is_empty() {
            return Ok(None);
        }
        let client = client.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT server FROM pool WHERE client = ?1 ORDER BY server ASC LIMIT 1",
                params![client],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn best_free_backend(&self) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT server FROM pool
                WHERE weight <> 0
                  AND COALESCE(client, '') = ''
                  AND NULLIF(TRIM(wait_start), '') IS NULL
                ORDER BY weight DESC, server ASC
                LIMIT 1
                "#,
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn try_claim(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
        let backend = backend.to_string();
        let client = client.to_string();
        self.with_conn(move |conn| {
            // Single statement, so the free-check and the write share one
            // SQLite write lock.
            let changed = conn.execute(
                r#"
                UPDATE pool SET client = ?2, wait_start = NULL
                WHERE server = ?1
                  AND ((COALESCE(client, '') = '' AND NULLIF(TRIM(wait_start), '') IS NULL)
                       OR client = ?2)
                "#,
                params![backend, client],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn clear_claim(&self, backend: &str) -> Result<(), StoreError> {
        let backend = backend.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE pool SET client = '', wait_start = NULL WHERE server = ?1",
                params![backend],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_claim_of(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
        let backend = backend.to_string();
        let client = client.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE pool SET client = '', wait_start = NULL WHERE server = ?1 AND client = ?2",
                params![backend, client],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reconcile(
        &self,
        live: &HashSet<String>,
        now: i64,
        grace_secs: i64,
    ) -> Result<ReconcileOutcome, StoreError> {
        let live = live.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut outcome = ReconcileOutcome::default();

            let unmarked: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT server, client FROM pool
                    WHERE COALESCE(client, '') <> '' AND NULLIF(TRIM(wait_start), '') IS NULL
                    "#,
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let claimed = rows.collect::<Result<Vec<_>, _>>()?;
                claimed
            };

            for (server, client) in unmarked {
                if live.contains(&client) {
                    continue;
                }
                outcome.marked += tx.execute(
                    r#"
                    UPDATE pool SET wait_start = ?2
                    WHERE server = ?1 AND NULLIF(TRIM(wait_start), '') IS NULL
                    "#,
                    params![server, now],
                )?;
            }

            outcome.freed = tx.execute(
                r#"
                UPDATE pool SET client = '', wait_start = NULL
                WHERE NULLIF(TRIM(wait_start), '') IS NOT NULL
                  AND CAST(wait_start AS INTEGER) < ?1
                "#,
                params![now - grace_secs],
            )?;

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn backends(&self) -> Result<Vec<BackendRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT server, COALESCE(weight, 0), COALESCE(client, ''),
                       CAST(NULLIF(TRIM(wait_start), '') AS INTEGER)
                FROM pool ORDER BY server ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(BackendRow {
                    address: row.get(0)?,
                    weight: row.get(1)?,
                    client: row.get(2)?,
                    pending_since: row.get(3)?,
                })
            })?;
            let backends = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(backends)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn row(store: &SqliteStore, address: &str) -> BackendRow {
        store
            .backends()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.address == address)
            .expect("backend row present")
    }

    #[tokio::test]
    async fn test_claims_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pool.sqlite3");

        {
            let store = SqliteStore::new(&db_path).await.unwrap();
            store.upsert_backend("10.0.0.1", 5).await.unwrap();
            store.assign_static("192.168.1.7", "10.0.0.9").await.unwrap();
            assert!(store.try_claim("10.0.0.1", "192.168.1.20").await.unwrap());
        }

        let store = SqliteStore::new(&db_path).await.unwrap();
        let r = row(&store, "10.0.0.1").await;
        assert_eq!(r.weight, 5);
        assert_eq!(r.client, "192.168.1.20");
        assert_eq!(
            store.static_backend("192.168.1.7").await.unwrap().as_deref(),
            Some("10.0.0.9")
        );
    }

    #[tokio::test]
    async fn test_try_claim_is_conditional() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();

        assert!(store.try_claim("10.0.0.1", "a").await.unwrap());
        // Same owner again is fine
        assert!(store.try_claim("10.0.0.1", "a").await.unwrap());
        // Someone else is refused and the row is untouched
        assert!(!store.try_claim("10.0.0.1", "b").await.unwrap());
        assert_eq!(row(&store, "10.0.0.1").await.client, "a");
        // Unknown backend
        assert!(!store.try_claim("10.9.9.9", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing_claim() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.try_claim("10.0.0.1", "a").await.unwrap();

        store.upsert_backend("10.0.0.1", 7).await.unwrap();

        let r = row(&store, "10.0.0.1").await;
        assert_eq!(r.weight, 7);
        assert_eq!(r.client, "a");
    }

    #[tokio::test]
    async fn test_reconcile_marks_then_frees() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.upsert_backend("10.0.0.2", 1).await.unwrap();
        store.try_claim("10.0.0.1", "alive").await.unwrap();
        store.try_claim("10.0.0.2", "gone").await.unwrap();

        let live: HashSet<String> = ["alive".to_string()].into_iter().collect();

        let outcome = store.reconcile(&live, 1_000, 10).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { marked: 1, freed: 0 });
        assert_eq!(row(&store, "10.0.0.2").await.pending_since, Some(1_000));
        assert_eq!(row(&store, "10.0.0.1").await.pending_since, None);

        // Inside the grace window nothing is freed and the mark is not moved
        let outcome = store.reconcile(&live, 1_010, 10).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(row(&store, "10.0.0.2").await.pending_since, Some(1_000));

        let outcome = store.reconcile(&live, 1_011, 10).await.unwrap();
        assert_eq!(outcome.freed, 1);
        let freed = row(&store, "10.0.0.2").await;
        assert!(freed.is_free());
        assert_eq!(row(&store, "10.0.0.1").await.client, "alive");
    }

    #[tokio::test]
    async fn test_pending_row_is_not_claimable_by_others() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.try_claim("10.0.0.1", "a").await.unwrap();
        store.reconcile(&HashSet::new(), 100, 10).await.unwrap();

        assert!(store.best_free_backend().await.unwrap().is_none());
        assert!(!store.try_claim("10.0.0.1", "b").await.unwrap());

        // The original owner coming back clears the mark
        assert!(store.try_claim("10.0.0.1", "a").await.unwrap());
        assert_eq!(row(&store, "10.0.0.1").await.pending_since, None);
    }

    #[tokio::test]
    async fn test_remove_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.assign_static("c", "10.0.0.1").await.unwrap();

        assert!(store.remove_static("c").await.unwrap());
        assert!(!store.remove_static("c").await.unwrap());
        assert!(store.remove_backend("10.0.0.1").await.unwrap());
        assert!(store.backends().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_claim_of_checks_owner() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.try_claim("10.0.0.1", "a").await.unwrap();

        assert!(!store.clear_claim_of("10.0.0.1", "b").await.unwrap());
        assert_eq!(row(&store, "10.0.0.1").await.client, "a");

        assert!(store.clear_claim_of("10.0.0.1", "a").await.unwrap());
        assert!(row(&store, "10.0.0.1").await.is_free());
    }

    #[tokio::test]
    async fn test_rows_with_blank_markers_are_usable() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pool.sqlite3");
        let store = SqliteStore::new(&db_path).await.unwrap();

        // Provisioning tools write '' rather than NULL for "no pending release"
        {
            let raw = Connection::open(&db_path).unwrap();
            raw.execute("INSERT INTO pool VALUES ('10.0.0.5', 1, '', '')", [])
                .unwrap();
            raw.execute("INSERT INTO pool VALUES ('10.0.0.6', 1, 'departed', ' ')", [])
                .unwrap();
        }

        let rows = store.backends().await.unwrap();
        assert!(rows[0].is_free());
        assert_eq!(rows[1].client, "departed");
        assert_eq!(rows[1].pending_since, None);

        assert_eq!(store.best_free_backend().await.unwrap().as_deref(), Some("10.0.0.5"));
        assert!(store.try_claim("10.0.0.5", "a").await.unwrap());
        assert!(!store.try_claim("10.0.0.6", "a").await.unwrap());

        let live: HashSet<String> = ["a".to_string()].into_iter().collect();
        let outcome = store.reconcile(&live, 1_000, 10).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { marked: 1, freed: 0 });
        assert_eq!(row(&store, "10.0.0.6").await.pending_since, Some(1_000));

        let outcome = store.reconcile(&live, 1_011, 10).await.unwrap();
        assert_eq!(outcome.freed, 1);
        assert!(row(&store, "10.0.0.6").await.is_free());
        assert_eq!(row(&store, "10.0.0.5").await.client, "a");
    }
}
