//! Durable named-relation store backing every pipeline stage.
//!
//! Each relation is a SQLite table. Writes always replace the whole table
//! inside a transaction, and every write refreshes the relation's catalog row
//! (owner stage, row count, content fingerprint).

use chrono::Utc;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::pipeline::STATUS_RUNNING;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
}

impl Column {
    pub const fn integer(name: &'static str) -> Self {
        Self { name, sql_type: SqlType::Integer }
    }

    pub const fn real(name: &'static str) -> Self {
        Self { name, sql_type: SqlType::Real }
    }

    pub const fn text(name: &'static str) -> Self {
        Self { name, sql_type: SqlType::Text }
    }
}

/// A row type that can be stored as a named relation.
///
/// `COLUMNS` is both the table layout used on write and the set of columns
/// required on read; `from_row` receives the columns in that order.
pub trait Relation: Sized {
    const COLUMNS: &'static [Column];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn to_values(&self) -> Vec<Value>;
}

/// Catalog entry for one stored relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationInfo {
    pub name: String,
    pub owner: String,
    pub row_count: usize,
    pub fingerprint: String,
    pub written_at: String,
}

/// Ledger entry for one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRun {
    pub run_id: String,
    pub stage: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub message: Option<String>,
}

/// Untyped view of a relation, used by exports.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Quote a relation or column name after checking it is a plain identifier.
pub fn quote_ident(name: &str) -> Result<String> {
    if IDENTIFIER.is_match(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(PipelineError::Config(format!(
            "'{}' is not a valid relation or column identifier",
            name
        )))
    }
}

pub struct PipelineStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl PipelineStore {
    /// Open (or create) the store file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!("Opened pipeline store at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS _relations (
                name         TEXT PRIMARY KEY,
                owner        TEXT NOT NULL,
                row_count    INTEGER NOT NULL,
                fingerprint  TEXT NOT NULL,
                written_at   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _stage_runs (
                run_id       TEXT PRIMARY KEY,
                stage        TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                finished_at  TEXT,
                status       TEXT NOT NULL,
                message      TEXT
            );
            "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read-only access for invariant queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.conn, name)
    }

    /// Column names of a relation, in table order.
    pub fn columns(&self, name: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(name)?);
        let mut stmt = self.conn.prepare(&sql)?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cols)
    }

    pub fn count(&self, name: &str) -> Result<usize> {
        self.require(name)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(name)?);
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Fail unless the relation exists.
    pub fn require(&self, name: &str) -> Result<()> {
        if self.exists(name)? {
            Ok(())
        } else {
            Err(PipelineError::ingestion(
                name,
                "relation not found in store (has the upstream stage run?)",
            ))
        }
    }

    /// Fail unless the relation exists and carries every column of `R`.
    pub fn require_columns<R: Relation>(&self, name: &str) -> Result<()> {
        self.require(name)?;
        let present = self.columns(name)?;
        for column in R::COLUMNS {
            if !present.iter().any(|c| c == column.name) {
                return Err(PipelineError::schema(name, column.name));
            }
        }
        Ok(())
    }

    /// Read a whole relation as typed rows, in insertion order.
    pub fn read<R: Relation>(&self, name: &str) -> Result<Vec<R>> {
        self.require_columns::<R>(name)?;
        let select = R::COLUMNS
            .iter()
            .map(|c| quote_ident(c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!("SELECT {} FROM {} ORDER BY rowid", select, quote_ident(name)?);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| R::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(relation = name, rows = rows.len(), "Read relation");
        Ok(rows)
    }

    /// Read a relation without a row type.
    pub fn read_table(&self, name: &str) -> Result<Table> {
        self.require(name)?;
        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(name)?);
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Table { columns, rows })
    }

    /// Replace a single relation owned by `owner`.
    pub fn replace<R: Relation>(
        &mut self,
        owner: &str,
        name: &str,
        rows: &[R],
    ) -> Result<usize> {
        let mut writer = self.writer(owner)?;
        let n = writer.replace(name, rows)?;
        writer.commit()?;
        Ok(n)
    }

    /// Start an atomic write of one or more relations owned by `owner`.
    pub fn writer(&mut self, owner: &str) -> Result<StoreWriter<'_>> {
        let tx = self.conn.transaction()?;
        Ok(StoreWriter {
            tx,
            owner: owner.to_string(),
            written: Vec::new(),
        })
    }

    pub fn relation_info(&self, name: &str) -> Result<Option<RelationInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT name, owner, row_count, fingerprint, written_at
                 FROM _relations WHERE name = ?1",
                params![name],
                relation_info_from_row,
            )
            .optional()?;
        Ok(info)
    }

    /// Every cataloged relation, ordered by name.
    pub fn relations(&self) -> Result<Vec<RelationInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, owner, row_count, fingerprint, written_at FROM _relations ORDER BY name",
        )?;
        let infos = stmt
            .query_map([], relation_info_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(infos)
    }

    /// Recompute the content fingerprint of a relation as it is stored now.
    pub fn fingerprint(&self, name: &str) -> Result<String> {
        self.require(name)?;
        table_fingerprint(&self.conn, name)
    }

    // Stage run ledger

    pub fn begin_stage_run(&self, stage: &str) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO _stage_runs (run_id, stage, started_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, stage, Utc::now().to_rfc3339(), STATUS_RUNNING],
        )?;
        Ok(run_id)
    }

    pub fn finish_stage_run(
        &self,
        run_id: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE _stage_runs SET finished_at = ?2, status = ?3, message = ?4
             WHERE run_id = ?1",
            params![run_id, Utc::now().to_rfc3339(), status, message],
        )?;
        Ok(())
    }

    /// Most recent stage runs first.
    pub fn stage_runs(&self, limit: usize) -> Result<Vec<StageRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, stage, started_at, finished_at, status, message
             FROM _stage_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], stage_run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Latest recorded run of `stage`, if it ever ran.
    pub fn last_stage_run(&self, stage: &str) -> Result<Option<StageRun>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id, stage, started_at, finished_at, status, message
                 FROM _stage_runs WHERE stage = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![stage],
                stage_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Write a consistent copy of the whole store to `target`.
    pub fn snapshot_to(&self, target: &Path) -> Result<()> {
        if target.exists() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("snapshot target '{}' already exists", target.display()),
            )));
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.conn
            .execute("VACUUM INTO ?1", params![target.to_string_lossy().to_string()])?;
        match self.path() {
            Some(source) => info!(
                "Snapshot of {} written to {}",
                source.display(),
                target.display()
            ),
            None => info!("Snapshot of in-memory store written to {}", target.display()),
        }
        Ok(())
    }
}

/// Pending replacement of one or more relations; nothing is visible until `commit`.
pub struct StoreWriter<'a> {
    tx: Transaction<'a>,
    owner: String,
    written: Vec<(String, usize)>,
}

impl<'a> StoreWriter<'a> {
    /// Replace `name` wholesale. A relation already cataloged under another
    /// owner is refused.
    pub fn replace<R: Relation>(&mut self, name: &str, rows: &[R]) -> Result<usize> {
        let table = quote_ident(name)?;
        let owner: Option<String> = self
            .tx
            .query_row(
                "SELECT owner FROM _relations WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = owner.filter(|o| *o != self.owner) {
            return Err(PipelineError::ownership(name, &owner, &self.owner));
        }

        let column_defs = R::COLUMNS
            .iter()
            .map(|c| -> Result<String> {
                Ok(format!("{} {}", quote_ident(c.name)?, c.sql_type.as_sql()))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        self.tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_defs});"
        ))?;

        let placeholders = (1..=R::COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        {
            let mut stmt = self
                .tx
                .prepare(&format!("INSERT INTO {} VALUES ({})", table, placeholders))?;
            for row in rows {
                stmt.execute(params_from_iter(row.to_values()))?;
            }
        }

        let fingerprint = table_fingerprint(&self.tx, name)?;
        self.tx.execute(
            "INSERT INTO _relations (name, owner, row_count, fingerprint, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET row_count=excluded.row_count,
                 fingerprint=excluded.fingerprint, written_at=excluded.written_at",
            params![
                name,
                self.owner,
                rows.len() as i64,
                fingerprint,
                Utc::now().to_rfc3339()
            ],
        )?;

        self.written.push((name.to_string(), rows.len()));
        Ok(rows.len())
    }

    /// Commit every replacement made through this writer.
    pub fn commit(self) -> Result<Vec<(String, usize)>> {
        self.tx.commit()?;
        for (name, n) in &self.written {
            counter!("pipeline_rows_written_total", "relation" => name.clone())
                .increment(*n as u64);
            info!(relation = %name, rows = n, owner = %self.owner, "Relation replaced");
        }
        Ok(self.written)
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn relation_info_from_row(row: &Row<'_>) -> rusqlite::Result<RelationInfo> {
    Ok(RelationInfo {
        name: row.get(0)?,
        owner: row.get(1)?,
        row_count: row.get::<_, i64>(2)? as usize,
        fingerprint: row.get(3)?,
        written_at: row.get(4)?,
    })
}

fn stage_run_from_row(row: &Row<'_>) -> rusqlite::Result<StageRun> {
    Ok(StageRun {
        run_id: row.get(0)?,
        stage: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: row.get(4)?,
        message: row.get(5)?,
    })
}

/// SHA-256 over the column names and every stored value, in row order.
fn table_fingerprint(conn: &Connection, name: &str) -> Result<String> {
    let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(name)?);
    let mut stmt = conn.prepare(&sql)?;
    let width = stmt.column_count();

    let mut hasher = Sha256::new();
    for column in stmt.column_names() {
        hasher.update(column.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"\n");

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for i in 0..width {
            match row.get::<_, Value>(i)? {
                Value::Null => hasher.update(b"N;"),
                Value::Integer(v) => hasher.update(format!("I{};", v).as_bytes()),
                Value::Real(v) => hasher.update(format!("R{:016x};", v.to_bits()).as_bytes()),
                Value::Text(s) => {
                    hasher.update(format!("T{}:", s.len()).as_bytes());
                    hasher.update(s.as_bytes());
                    hasher.update(b";");
                }
                Value::Blob(b) => {
                    hasher.update(format!("B{}:", b.len()).as_bytes());
                    hasher.update(&b);
                    hasher.update(b";");
                }
            }
        }
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LiaisonRecord;

    fn liaison(product_id: i64, id_web: &str) -> LiaisonRecord {
        LiaisonRecord {
            product_id,
            id_web: id_web.to_string(),
        }
    }

    #[test]
    fn test_replace_then_read_preserves_order() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        let rows = vec![liaison(3, "c"), liaison(1, "a"), liaison(2, "b")];
        store.replace("test", "liaison_clean", &rows).unwrap();

        let back: Vec<LiaisonRecord> = store.read("liaison_clean").unwrap();
        assert_eq!(back, rows);
        assert_eq!(store.count("liaison_clean").unwrap(), 3);
    }

    #[test]
    fn test_replace_overwrites_instead_of_appending() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        store
            .replace("test", "liaison_clean", &[liaison(1, "a"), liaison(2, "b")])
            .unwrap();
        store.replace("test", "liaison_clean", &[liaison(9, "z")]).unwrap();

        let back: Vec<LiaisonRecord> = store.read("liaison_clean").unwrap();
        assert_eq!(back, vec![liaison(9, "z")]);
        let info = store.relation_info("liaison_clean").unwrap().unwrap();
        assert_eq!(info.row_count, 1);
        assert_eq!(info.owner, "test");
    }

    #[test]
    fn test_relation_owned_by_another_stage_is_not_replaced() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        store.replace("clean", "liaison_clean", &[liaison(1, "a")]).unwrap();
        let before = store.relation_info("liaison_clean").unwrap().unwrap();

        let err = store
            .replace("dedup", "liaison_clean", &[liaison(9, "z")])
            .unwrap_err();
        match err {
            PipelineError::Ownership {
                relation,
                owner,
                writer,
            } => {
                assert_eq!(relation, "liaison_clean");
                assert_eq!(owner, "clean");
                assert_eq!(writer, "dedup");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The refused write leaves content and catalog untouched
        let back: Vec<LiaisonRecord> = store.read("liaison_clean").unwrap();
        assert_eq!(back, vec![liaison(1, "a")]);
        assert_eq!(store.relation_info("liaison_clean").unwrap().unwrap(), before);
    }

    #[test]
    fn test_refused_relation_rolls_back_whole_writer() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        store.replace("clean", "liaison_clean", &[liaison(1, "a")]).unwrap();

        let mut writer = store.writer("dedup").unwrap();
        writer.replace("liaison_dedup", &[liaison(1, "a")]).unwrap();
        assert!(writer.replace("liaison_clean", &[liaison(2, "b")]).is_err());
        drop(writer);

        assert!(!store.exists("liaison_dedup").unwrap());
    }

    #[test]
    fn test_store_remembers_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("pipeline.sqlite");
        let store = PipelineStore::open(&file).unwrap();
        assert_eq!(store.path(), Some(file.as_path()));
        assert!(file.exists());

        let snapshot = dir.path().join("copy.sqlite");
        store.snapshot_to(&snapshot).unwrap();
        assert!(snapshot.exists());
        assert_eq!(PipelineStore::open_in_memory().unwrap().path(), None);
    }

    #[test]
    fn test_fingerprint_is_stable_for_identical_content() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        let rows = vec![liaison(1, "a"), liaison(2, "b")];
        store.replace("test", "liaison_dedup", &rows).unwrap();
        let first = store.relation_info("liaison_dedup").unwrap().unwrap().fingerprint;
        store.replace("test", "liaison_dedup", &rows).unwrap();
        let second = store.relation_info("liaison_dedup").unwrap().unwrap().fingerprint;
        assert_eq!(first, second);
        assert_eq!(first, store.fingerprint("liaison_dedup").unwrap());

        store.replace("test", "liaison_dedup", &[liaison(1, "a")]).unwrap();
        let third = store.relation_info("liaison_dedup").unwrap().unwrap().fingerprint;
        assert_ne!(first, third);
    }

    #[test]
    fn test_missing_relation_is_ingestion_error() {
        let store = PipelineStore::open_in_memory().unwrap();
        let err = store.read::<LiaisonRecord>("liaison_raw").unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion { .. }));
    }

    #[test]
    fn test_missing_column_is_schema_violation() {
        let store = PipelineStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE liaison_raw (product_id INTEGER);")
            .unwrap();
        let err = store.read::<LiaisonRecord>("liaison_raw").unwrap_err();
        match err {
            PipelineError::SchemaViolation { relation, column } => {
                assert_eq!(relation, "liaison_raw");
                assert_eq!(column, "id_web");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_writer_rolls_back_when_not_committed() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        {
            let mut writer = store.writer("test").unwrap();
            writer.replace("liaison_clean", &[liaison(1, "a")]).unwrap();
        }
        assert!(!store.exists("liaison_clean").unwrap());
        assert!(store.relation_info("liaison_clean").unwrap().is_none());
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        assert!(quote_ident("erp_clean").is_ok());
        assert!(quote_ident("erp; DROP TABLE x").is_err());
        assert!(quote_ident("_relations").is_err());
    }

    #[test]
    fn test_stage_run_ledger() {
        let store = PipelineStore::open_in_memory().unwrap();
        let run_id = store.begin_stage_run("clean").unwrap();
        store.finish_stage_run(&run_id, "failed", Some("boom")).unwrap();
        let runs = store.stage_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run_id);
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].message.as_deref(), Some("boom"));
        assert!(runs[0].finished_at.is_some());

        let retry = store.begin_stage_run("clean").unwrap();
        store.finish_stage_run(&retry, "succeeded", None).unwrap();
        let last = store.last_stage_run("clean").unwrap().unwrap();
        assert_eq!(last.run_id, retry);
        assert_eq!(last.status, "succeeded");
        assert!(store.last_stage_run("dedup").unwrap().is_none());
    }
}
