//! `SQLite` metadata store: schema, pragmas, and migrations.
//!
//! Holds the small, queryable part of the cache: one row per model, per fit
//! and per persisted operation. Large payloads live on disk next to it (see
//! [`super::cache`]); rows only carry their digests and sizes.

use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

use super::CacheError;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS models (
    id TEXT PRIMARY KEY,
    source_text TEXT NOT NULL,
    compiler_output TEXT NOT NULL,
    warnings TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fits (
    model_id TEXT NOT NULL REFERENCES models(id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    function TEXT NOT NULL,
    argument_fingerprint TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (model_id, id)
);

CREATE TABLE IF NOT EXISTS operations (
    name TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    record_json TEXT NOT NULL,
    done INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operations_model ON operations(model_id);
CREATE INDEX IF NOT EXISTS idx_operations_pending ON operations(done) WHERE done = 0;
";

/// Row of the `models` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRow {
    pub id: String,
    pub source_text: String,
    pub compiler_output: String,
    pub warnings: String,
    /// Hex SHA-256 of the uncompressed module bytes.
    pub sha256: String,
    pub created_at: i64,
}

/// Row of the `fits` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitRow {
    pub id: String,
    pub model_id: String,
    pub function: String,
    pub argument_fingerprint: String,
    /// Uncompressed stream length in bytes.
    pub size: i64,
    pub created_at: i64,
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let started = Instant::now();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        info!(
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Opened metadata store"
        );
        Ok(Self { conn })
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64, CacheError> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()?
            .ok_or_else(|| CacheError::Corruption("schema_version missing".into()))
    }

    /// Get current time as milliseconds since epoch.
    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Models
    // -------------------------------------------------------------------------

    /// Insert or refresh a model row.
    ///
    /// Deliberately not `INSERT OR REPLACE`: replacing would delete the row
    /// and cascade to its fits.
    pub fn upsert_model(&self, row: &ModelRow) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO models(id, source_text, compiler_output, warnings, sha256, created_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                source_text = excluded.source_text,
                compiler_output = excluded.compiler_output,
                warnings = excluded.warnings,
                sha256 = excluded.sha256",
            params![
                row.id,
                row.source_text,
                row.compiler_output,
                row.warnings,
                row.sha256,
                row.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_model(&self, id: &str) -> Result<Option<ModelRow>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, source_text, compiler_output, warnings, sha256, created_at
                 FROM models WHERE id = ?",
                params![id],
                |row| {
                    Ok(ModelRow {
                        id: row.get(0)?,
                        source_text: row.get(1)?,
                        compiler_output: row.get(2)?,
                        warnings: row.get(3)?,
                        sha256: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete a model row; its fit rows go with it.
    pub fn delete_model(&self, id: &str) -> Result<bool, CacheError> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM models WHERE id = ?", params![id])?;
        Ok(rows_affected > 0)
    }

    // -------------------------------------------------------------------------
    // Fits
    // -------------------------------------------------------------------------

    pub fn insert_fit(&self, row: &FitRow) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO fits(id, model_id, function, argument_fingerprint, size, created_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(model_id, id) DO UPDATE SET
                function = excluded.function,
                argument_fingerprint = excluded.argument_fingerprint,
                size = excluded.size",
            params![
                row.id,
                row.model_id,
                row.function,
                row.argument_fingerprint,
                row.size,
                row.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_fit(&self, model_id: &str, fit_id: &str) -> Result<Option<FitRow>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, model_id, function, argument_fingerprint, size, created_at
                 FROM fits WHERE id = ? AND model_id = ?",
                params![fit_id, model_id],
                |row| {
                    Ok(FitRow {
                        id: row.get(0)?,
                        model_id: row.get(1)?,
                        function: row.get(2)?,
                        argument_fingerprint: row.get(3)?,
                        size: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_fit(&self, model_id: &str, fit_id: &str) -> Result<bool, CacheError> {
        let rows_affected = self.conn.execute(
            "DELETE FROM fits WHERE id = ? AND model_id = ?",
            params![fit_id, model_id],
        )?;
        Ok(rows_affected > 0)
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    pub fn put_operation(
        &self,
        name: &str,
        model_id: &str,
        record_json: &str,
        done: bool,
    ) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO operations(name, model_id, record_json, done, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                model_id = excluded.model_id,
                record_json = excluded.record_json,
                done = excluded.done,
                updated_at = excluded.updated_at",
            params![name, model_id, record_json, done, Self::now_millis()],
        )?;
        Ok(())
    }

    pub fn delete_operation(&self, name: &str, model_id: &str) -> Result<bool, CacheError> {
        let rows_affected = self.conn.execute(
            "DELETE FROM operations WHERE name = ? AND model_id = ?",
            params![name, model_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Drop every operation record that refers to `model_id`.
    pub fn delete_model_operations(&self, model_id: &str) -> Result<usize, CacheError> {
        Ok(self
            .conn
            .execute("DELETE FROM operations WHERE model_id = ?", params![model_id])?)
    }

    pub fn get_operation(&self, name: &str) -> Result<Option<String>, CacheError> {
        let json = self
            .conn
            .query_row(
                "SELECT record_json FROM operations WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    /// Records persisted while not yet done.
    pub fn pending_operations(&self) -> Result<Vec<String>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM operations WHERE done = 0 ORDER BY updated_at, name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn apply_pragmas(conn: &mut Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA temp_store = MEMORY;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

fn init_meta(conn: &mut Connection) -> Result<(), CacheError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?;

    if existing.is_none() {
        // Start at version 0 so migrate() applies full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', '0')",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<(), CacheError> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);

    if current == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    match current {
        0 => tx.execute_batch(SCHEMA_V1)?,
        v => {
            return Err(CacheError::Corruption(format!(
                "unsupported schema version {v}"
            )));
        }
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;

    Ok(())
}
