//! SQLite database layer for the relational execution store.
//!
//! Uses rusqlite with WAL mode for concurrent read performance. All
//! database operations run via `tokio::task::spawn_blocking` so they never
//! block the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to set pragmas: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("sqlite database opened at {db_path}");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to open in-memory db: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to set pragmas: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::StoreUnavailable(format!("lock poisoned: {e}")))?;
        f(&conn).map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    /// Execute a closure with access to the database connection off the
    /// async runtime.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::StoreUnavailable(format!("task join error: {e}")))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    execution_id    TEXT PRIMARY KEY,
                    flow_id         TEXT NOT NULL,
                    tenant_id       TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    input_data      TEXT NOT NULL DEFAULT '{}',
                    output_data     TEXT,
                    error           TEXT,
                    created_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_tenant_status
                    ON executions(tenant_id, status);

                CREATE TABLE IF NOT EXISTS node_results (
                    execution_id    TEXT NOT NULL,
                    node_id         TEXT NOT NULL,
                    iteration       INTEGER NOT NULL DEFAULT 0,
                    status          TEXT NOT NULL,
                    input           TEXT NOT NULL DEFAULT '{}',
                    output          TEXT,
                    error           TEXT,
                    started_at      INTEGER NOT NULL,
                    completed_at    INTEGER,
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    cost_usd        REAL,
                    PRIMARY KEY (execution_id, node_id, iteration)
                );
                CREATE INDEX IF NOT EXISTS idx_node_results_execution
                    ON node_results(execution_id, node_id);

                CREATE TABLE IF NOT EXISTS agent_messages (
                    message_id      TEXT PRIMARY KEY,
                    execution_id    TEXT NOT NULL,
                    from_node       TEXT NOT NULL,
                    to_node         TEXT NOT NULL,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_agent_messages_execution
                    ON agent_messages(execution_id, created_at);

                CREATE TABLE IF NOT EXISTS agents (
                    agent_id        TEXT NOT NULL,
                    owner_tenant_id TEXT NOT NULL DEFAULT '',
                    name            TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    endpoint        TEXT NOT NULL,
                    capabilities    TEXT NOT NULL DEFAULT '[]',
                    agent_type      TEXT NOT NULL,
                    version         TEXT NOT NULL DEFAULT '1.0.0',
                    auth_token      TEXT,
                    health          TEXT NOT NULL DEFAULT 'unknown',
                    last_probe_at   INTEGER,
                    PRIMARY KEY (agent_id, owner_tenant_id)
                );
                CREATE INDEX IF NOT EXISTS idx_agents_agent ON agents(agent_id);

                CREATE TABLE IF NOT EXISTS flows (
                    flow_id         TEXT NOT NULL,
                    owner_tenant_id TEXT NOT NULL DEFAULT '',
                    definition      TEXT NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    PRIMARY KEY (flow_id, owner_tenant_id)
                );
                ",
            )
        })
    }
}
