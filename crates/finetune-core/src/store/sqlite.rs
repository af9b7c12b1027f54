//! SQLite-backed run store.

use super::RunStore;
use super::error::{StoreError, StoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use finetune_training::{
    Checkpoint, HardwareSnapshot, Metric, MetricValues, Run, RunConfig, RunError, RunId, RunState,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const RUN_COLUMNS: &str = "id, name, base_model, state, note, error_json, config_json, \
                           device_used, hardware_json, created_at, updated_at";

/// Run store over a single SQLite connection.
///
/// Writers are serialized by the connection mutex, so read-modify-write
/// sequences on one run never interleave.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRunStore").finish_non_exhaustive()
    }
}

impl SqliteRunStore {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    /// * `StoreError::Io` - If the parent directory cannot be created
    /// * `StoreError::Connection` - If the database connection fails
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened run database");
        Self::init(conn)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    info!("Initializing run store schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_model TEXT NOT NULL,
            backend TEXT NOT NULL,
            state TEXT NOT NULL,
            note TEXT,
            error_json TEXT,
            config_json TEXT NOT NULL,
            device_used TEXT,
            hardware_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            step INTEGER NOT NULL,
            loss REAL NOT NULL,
            learning_rate REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            step INTEGER NOT NULL,
            storage_path TEXT NOT NULL,
            metrics_json TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id, id);
        CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, id);
        "#,
    )?;
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_sql_step(step: u64) -> StoreResult<i64> {
    i64::try_from(step).map_err(|_| StoreError::InvalidData(format!("step out of range: {step}")))
}

fn not_found(run_id: &RunId) -> StoreError {
    StoreError::NotFound(run_id.to_string())
}

fn ensure_run(conn: &Connection, run_id: &RunId) -> StoreResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM runs WHERE id = ?1", params![run_id.as_str()], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| not_found(run_id))
}

fn invalid_column(idx: usize, column_name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
}

fn parse_json_field<T>(row: &Row<'_>, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| invalid_column(idx, column_name))
}

fn parse_optional_json_field<T>(
    row: &Row<'_>,
    idx: usize,
    column_name: &str,
) -> rusqlite::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: Option<String> = row.get(idx)?;
    json_str
        .map(|s| serde_json::from_str(&s).map_err(|_| invalid_column(idx, column_name)))
        .transpose()
}

fn parse_timestamp(row: &Row<'_>, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, column_name))
}

fn parse_step(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let step: i64 = row.get(idx)?;
    u64::try_from(step).map_err(|_| invalid_column(idx, "step"))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let state: String = row.get(3)?;
    Ok(Run {
        id: RunId(row.get(0)?),
        name: row.get(1)?,
        base_model: row.get(2)?,
        state: state.parse::<RunState>().map_err(|_| invalid_column(3, "state"))?,
        note: row.get(4)?,
        error: parse_optional_json_field(row, 5, "error_json")?,
        config: parse_json_field(row, 6, "config_json")?,
        device_used: row.get(7)?,
        hardware_snapshot: parse_optional_json_field(row, 8, "hardware_json")?,
        created_at: parse_timestamp(row, 9, "created_at")?,
        updated_at: parse_timestamp(row, 10, "updated_at")?,
    })
}

impl RunStore for SqliteRunStore {
    fn create(&self, config: &RunConfig) -> StoreResult<RunId> {
        let run_id = RunId::new();
        let config_json = serde_json::to_string(config)?;
        let ts = now();

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO runs (id, name, base_model, backend, state, config_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                run_id.as_str(),
                config.run_name,
                config.base_model,
                config.backend.as_str(),
                RunState::Created.as_str(),
                config_json,
                ts,
            ],
        )?;
        debug!(run_id = %run_id, backend = config.backend.as_str(), "Created run");
        Ok(run_id)
    }

    fn update_state(&self, run_id: &RunId, state: RunState, error: Option<&RunError>) -> StoreResult<()> {
        let note = error.map(RunError::note);
        let error_json = error.map(serde_json::to_string).transpose()?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET state = ?1, note = ?2, error_json = ?3, updated_at = ?4 WHERE id = ?5",
            params![state.as_str(), note, error_json, now(), run_id.as_str()],
        )?;
        if updated == 0 {
            return Err(not_found(run_id));
        }
        debug!(run_id = %run_id, state = %state, "Updated run state");
        Ok(())
    }

    fn record_execution(
        &self,
        run_id: &RunId,
        device_used: &str,
        hardware: &HardwareSnapshot,
    ) -> StoreResult<()> {
        let hardware_json = serde_json::to_string(hardware)?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET device_used = ?1, hardware_json = ?2, updated_at = ?3 WHERE id = ?4",
            params![device_used, hardware_json, now(), run_id.as_str()],
        )?;
        if updated == 0 {
            return Err(not_found(run_id));
        }
        Ok(())
    }

    fn append_metric(&self, run_id: &RunId, step: u64, values: MetricValues) -> StoreResult<()> {
        let step = to_sql_step(step)?;

        let conn = self.conn()?;
        ensure_run(&conn, run_id)?;
        conn.execute(
            "INSERT INTO metrics (run_id, step, loss, learning_rate, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id.as_str(), step, values.loss, values.learning_rate, now()],
        )?;
        Ok(())
    }

    fn register_checkpoint(
        &self,
        run_id: &RunId,
        step: u64,
        path: &Path,
        metrics: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        let step = to_sql_step(step)?;
        let metrics_json = metrics.map(serde_json::to_string).transpose()?;

        let conn = self.conn()?;
        ensure_run(&conn, run_id)?;
        conn.execute(
            r#"
            INSERT INTO checkpoints (run_id, step, storage_path, metrics_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![run_id.as_str(), step, path.to_string_lossy().into_owned(), metrics_json, now()],
        )?;
        debug!(run_id = %run_id, step, path = %path.display(), "Registered checkpoint");
        Ok(())
    }

    fn get(&self, run_id: &RunId) -> StoreResult<Run> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![run_id.as_str()],
            run_from_row,
        )
        .optional()?
        .ok_or_else(|| not_found(run_id))
    }

    fn list(&self) -> StoreResult<Vec<Run>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, rowid DESC"))?;
        let runs = stmt.query_map([], run_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn metrics(&self, run_id: &RunId) -> StoreResult<Vec<Metric>> {
        let conn = self.conn()?;
        ensure_run(&conn, run_id)?;
        let mut stmt = conn.prepare(
            "SELECT run_id, step, loss, learning_rate, recorded_at FROM metrics WHERE run_id = ?1 ORDER BY id",
        )?;
        let metrics = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(Metric {
                    run_id: RunId(row.get(0)?),
                    step: parse_step(row, 1)?,
                    loss: row.get(2)?,
                    learning_rate: row.get(3)?,
                    recorded_at: parse_timestamp(row, 4, "recorded_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    fn checkpoints(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>> {
        let conn = self.conn()?;
        ensure_run(&conn, run_id)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, step, storage_path, metrics_json, created_at
            FROM checkpoints WHERE run_id = ?1 ORDER BY id
            "#,
        )?;
        let checkpoints = stmt
            .query_map(params![run_id.as_str()], |row| {
                let storage_path: String = row.get(2)?;
                Ok(Checkpoint {
                    run_id: RunId(row.get(0)?),
                    step: parse_step(row, 1)?,
                    storage_path: PathBuf::from(storage_path),
                    metrics_at_checkpoint: parse_optional_json_field(row, 3, "metrics_json")?
                        .unwrap_or_else(|| serde_json::json!({})),
                    created_at: parse_timestamp(row, 4, "created_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }
}
