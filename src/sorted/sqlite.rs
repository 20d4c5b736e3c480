//! SQLite dialect of the SQL KeyValue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, OptionalExtension};
use tracing::{error, info, warn};

use super::sqlkv::{check_schema_version, stamp_schema_version, SqlDb, SqlKeyValue, SqlTx};
use super::{KeyValue, KvConfig};

/// Version of the `rows`/`meta` layout written by [`init_db`].
pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_SIZE: u32 = 4;

pub fn sql_create_tables() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS rows (k VARCHAR({}) NOT NULL PRIMARY KEY, v VARCHAR({}))",
            super::MAX_KEY_SIZE,
            super::MAX_VALUE_SIZE
        ),
        "CREATE TABLE IF NOT EXISTS meta (metakey VARCHAR(255) NOT NULL PRIMARY KEY, value VARCHAR(255) NOT NULL)"
            .to_owned(),
    ]
}

/// Creates the tables in `path`, creating the file if needed, and records
/// the schema version unless one is already there.
///
/// An existing version is never overwritten, so a stale database keeps
/// failing the version check on open until it is re-initialized.
pub fn init_db(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    info!("initializing sqlite kv schema in {:?}", path);
    let db = open_db(path, 1)?;
    for stmt in sql_create_tables() {
        db.execute(&stmt, &[])?;
    }
    stamp_schema_version(&db, "", None, SCHEMA_VERSION)
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

/// Pooled connections to one SQLite file.
pub struct SqliteDb {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

/// Opens a connection pool on `path` without touching the schema.
pub fn open_db(path: impl AsRef<Path>, pool_size: u32) -> Result<SqliteDb> {
    let path = path.as_ref();
    let manager = SqliteConnectionManager::file(path)
        .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));
    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(|e| {
            error!("failed to open sqlite kv at {:?}, err: {e}", path);
            anyhow!(e)
        })?;
    Ok(SqliteDb {
        pool,
        path: path.to_path_buf(),
    })
}

impl SqliteDb {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl SqlDb for SqliteDb {
    fn query_value(&self, sql: &str, args: &[&str]) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let v = stmt
            .query_row(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .optional()?;
        Ok(v)
    }

    fn query_pairs(&self, sql: &str, args: &[&str]) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn execute(&self, sql: &str, args: &[&str]) -> Result<u64> {
        let conn = self.conn()?;
        let n = conn.execute(sql, params_from_iter(args.iter()))?;
        Ok(n as u64)
    }

    fn begin(&self) -> Result<Box<dyn SqlTx + '_>> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        Ok(Box::new(SqliteTx { conn, done: false }))
    }
}

struct SqliteTx {
    conn: PooledConnection<SqliteConnectionManager>,
    done: bool,
}

impl SqlTx for SqliteTx {
    fn execute(&mut self, sql: &str, args: &[&str]) -> Result<u64> {
        let n = self.conn.execute(sql, params_from_iter(args.iter()))?;
        Ok(n as u64)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("sqlite rollback failed, err: {e}");
            }
        }
    }
}

/// Opens the SQLite KeyValue at `path`, creating and initializing the file
/// if it does not exist yet.
///
/// SQLite reports "database is locked" under concurrent writers more often
/// than it should, so every operation is serialized.
pub fn new_key_value(path: impl AsRef<Path>) -> Result<SqlKeyValue> {
    let path = path.as_ref();
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        init_db(path)?;
    }

    let db = open_db(path, DEFAULT_POOL_SIZE)?;
    check_schema_version(&db, "", None, SCHEMA_VERSION)?;
    info!("opened sqlite kv at {:?}", path);

    Ok(SqlKeyValue::builder()
        .db(Arc::new(db))
        .serial(true)
        .build())
}

pub(super) fn new_from_config(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let file = cfg.required_string("file");
    cfg.validate()?;
    Ok(Box::new(new_key_value(file)?))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::sorted::{is_not_found, kvtest, new_key_value as new_kv, SortedError};

    #[test]
    pub fn test_sqlite_kv() {
        let dir = tempdir().unwrap();
        let kv = new_key_value(dir.path().join("index.sqlite")).unwrap();
        kvtest::test_sorted(&kv);
        kv.close().unwrap();
    }

    #[test]
    pub fn test_sqlite_batches() {
        let dir = tempdir().unwrap();
        let kv = new_key_value(dir.path().join("batch.sqlite")).unwrap();
        kvtest::test_batches(&kv);
    }

    #[test]
    pub fn test_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("reopen.sqlite");
        {
            let kv = new_key_value(&path).unwrap();
            kv.set("k", "v").unwrap();
            kv.close().unwrap();
        }
        let kv = new_key_value(&path).unwrap();
        assert_eq!(kv.get("k").unwrap(), "v");
    }

    #[test]
    pub fn test_schema_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.sqlite");
        init_db(&path).unwrap();
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE meta SET value = '0' WHERE metakey = 'version'", [])
            .unwrap();
        drop(conn);

        let err = new_key_value(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortedError>(),
            Some(SortedError::SchemaVersion { got: 0, want: SCHEMA_VERSION })
        ));
        assert!(err.to_string().contains("re-init/upgrade database"));
    }

    #[test]
    pub fn test_init_keeps_stale_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sqlite");
        init_db(&path).unwrap();
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE meta SET value = '0' WHERE metakey = 'version'", [])
            .unwrap();
        drop(conn);

        init_db(&path).unwrap();
        let err = new_key_value(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortedError>(),
            Some(SortedError::SchemaVersion { got: 0, .. })
        ));
    }

    #[test]
    pub fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.sqlite");
        init_db(&path).unwrap();
        init_db(&path).unwrap();
        let kv = new_key_value(&path).unwrap();
        kv.set("k", "v").unwrap();
        assert_eq!(kv.get("k").unwrap(), "v");
    }

    #[test]
    pub fn test_legacy_rows_not_stamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.sqlite");
        let conn = rusqlite::Connection::open(&path).unwrap();
        for stmt in sql_create_tables() {
            conn.execute(&stmt, []).unwrap();
        }
        conn.execute("INSERT INTO rows (k, v) VALUES ('old', 'data')", [])
            .unwrap();
        drop(conn);

        init_db(&path).unwrap();
        let db = open_db(&path, 1).unwrap();
        assert_eq!(
            db.query_value("SELECT value FROM meta WHERE metakey = 'version'", &[])
                .unwrap(),
            None
        );
        drop(db);
        assert!(new_key_value(&path).is_err());
    }

    #[test]
    pub fn test_wipe() {
        let dir = tempdir().unwrap();
        let kv = new_key_value(dir.path().join("wipe.sqlite")).unwrap();
        kv.set("a", "1").unwrap();
        kv.wipe().unwrap();
        assert!(is_not_found(&kv.get("a").unwrap_err()));
    }

    #[test]
    pub fn test_unique_violation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uniq.sqlite");
        init_db(&path).unwrap();
        let db = open_db(&path, 1).unwrap();
        db.execute("INSERT INTO rows (k, v) VALUES (?, ?)", &["k", "1"])
            .unwrap();
        let err = db
            .execute("INSERT INTO rows (k, v) VALUES (?, ?)", &["k", "2"])
            .unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&anyhow!("other")));
    }

    #[test]
    pub fn test_from_config() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cfg.sqlite");
        let cfg = KvConfig::default()
            .with("type", "sqlite")
            .with("file", file.to_str().unwrap());
        let kv = new_kv(cfg).unwrap();
        kv.set("x", "y").unwrap();
        assert_eq!(kv.get("x").unwrap(), "y");
    }

    #[test]
    pub fn test_concurrent_writers() {
        let dir = tempdir().unwrap();
        let kv = Arc::new(new_key_value(dir.path().join("threads.sqlite")).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let kv = kv.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        kv.set(&format!("t{t}-{i:02}"), "v").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut n = 0;
        crate::sorted::foreach(kv.as_ref(), |_, _| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 100);
    }
}
