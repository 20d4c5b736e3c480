//! KeyValue over a two-column `rows(k, v)` SQL table.
//!
//! The dialect modules ([`super::sqlite`], [`super::postgres`]) provide a
//! [`SqlDb`] driver and fill in whatever the dialect lacks: upsert emulation
//! through [`SetFunc`]/[`BatchSetFunc`], placeholder syntax through
//! [`PlaceHolderFunc`], and [`SqlKeyValue::serial`] for drivers that do not
//! cope with concurrent use.

mod iter;
pub mod upsert;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use derivative::Derivative;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use super::{
    check_batch_sizes, check_sizes, downcast_batch, BatchMutation, KeyValue, KvIterator,
    SortedError,
};

pub use iter::SqlIter;
pub use upsert::Upsert;

/// Rows fetched per query by [`SqlKeyValue::find`] unless configured.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Replaced by [`SqlKeyValue::table_prefix`] in every statement.
const TABLE_PREFIX_MARKER: &str = "/*TPRE*/";

static WORD_THEN_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+\.$").unwrap());

/// Minimal driver interface the SQL KeyValue runs on. All statement
/// arguments are strings and all selected columns are read as strings.
pub trait SqlDb: Send + Sync {
    /// First column of the first row, or `None` when no row matched.
    fn query_value(&self, sql: &str, args: &[&str]) -> Result<Option<String>>;

    /// `(first column, second column)` of every row.
    fn query_pairs(&self, sql: &str, args: &[&str]) -> Result<Vec<(String, String)>>;

    /// Runs a statement and returns the number of affected rows.
    fn execute(&self, sql: &str, args: &[&str]) -> Result<u64>;

    fn begin(&self) -> Result<Box<dyn SqlTx + '_>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open transaction. Dropping it without `commit` rolls it back.
pub trait SqlTx {
    fn execute(&mut self, sql: &str, args: &[&str]) -> Result<u64>;
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Replaces the default `REPLACE INTO` for dialects without it.
pub type SetFunc = Box<dyn Fn(&dyn SqlDb, &str, &str) -> Result<()> + Send + Sync>;
/// Like [`SetFunc`], but runs inside a batch's transaction.
pub type BatchSetFunc = Box<dyn Fn(&mut dyn SqlTx, &str, &str) -> Result<()> + Send + Sync>;
/// Rewrites `?` placeholders into the dialect's own syntax.
pub type PlaceHolderFunc = fn(&str) -> String;

/// Applies the table prefix and placeholder rewriting to a statement. The
/// prefix goes in first so that placeholder numbering sees the final text.
pub fn rewrite(stmt: &str, table_prefix: &str, placeholders: Option<PlaceHolderFunc>) -> String {
    let stmt = stmt.replace(TABLE_PREFIX_MARKER, table_prefix);
    match placeholders {
        Some(f) => f(&stmt),
        None => stmt,
    }
}

/// A table prefix must be a single word followed by a dot, typically
/// `"dbname."`. The empty prefix is always valid.
pub fn validate_table_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || WORD_THEN_DOT.is_match(prefix) {
        return Ok(());
    }
    bail!(SortedError::InvalidConfig(format!(
        "invalid table prefix {prefix:?}"
    )))
}

/// Reads the schema version stored in the `meta` table.
pub fn schema_version(
    db: &dyn SqlDb,
    table_prefix: &str,
    placeholders: Option<PlaceHolderFunc>,
) -> Result<Option<i64>> {
    let sql = rewrite(
        "SELECT value FROM /*TPRE*/meta WHERE metakey = ?",
        table_prefix,
        placeholders,
    );
    match db.query_value(&sql, &["version"])? {
        Some(v) => Ok(Some(v.trim().parse()?)),
        None => Ok(None),
    }
}

/// Fails unless the stored schema version is exactly `want`.
pub fn check_schema_version(
    db: &dyn SqlDb,
    table_prefix: &str,
    placeholders: Option<PlaceHolderFunc>,
    want: i64,
) -> Result<()> {
    let got = schema_version(db, table_prefix, placeholders)?.unwrap_or(0);
    if got != want {
        error!("sql schema version mismatch, got {got}, want {want}");
        bail!(SortedError::SchemaVersion { got, want });
    }
    Ok(())
}

/// Records `version` in the `meta` table of a freshly created database.
///
/// An existing version row is left alone, so a stale database still fails
/// [`check_schema_version`]. A `rows` table that already holds data but has
/// no version row predates versioning and is not stamped either.
pub fn stamp_schema_version(
    db: &dyn SqlDb,
    table_prefix: &str,
    placeholders: Option<PlaceHolderFunc>,
    version: i64,
) -> Result<()> {
    if let Some(got) = schema_version(db, table_prefix, placeholders)? {
        debug!("sql schema version already set to {got}");
        return Ok(());
    }

    let any_row = rewrite("SELECT k FROM /*TPRE*/rows LIMIT 1", table_prefix, placeholders);
    if db.query_value(&any_row, &[])?.is_some() {
        warn!("rows table holds data but no schema version, not stamping version {version}");
        return Ok(());
    }

    let insert = rewrite(
        "INSERT INTO /*TPRE*/meta (metakey, value) VALUES (?, ?)",
        table_prefix,
        placeholders,
    );
    let version = version.to_string();
    db.execute(&insert, &["version", version.as_str()])?;
    Ok(())
}

#[derive(Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct SqlKeyValue {
    #[derivative(Debug = "ignore")]
    db: Arc<dyn SqlDb>,

    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    set_func: Option<SetFunc>,
    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    batch_set_func: Option<BatchSetFunc>,
    #[builder(default, setter(strip_option))]
    #[derivative(Debug = "ignore")]
    place_holder_func: Option<PlaceHolderFunc>,

    /// Serializes every operation behind one lock.
    #[builder(default)]
    serial: bool,

    #[builder(default, setter(into))]
    table_prefix: String,

    #[builder(default = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    #[builder(default, setter(skip))]
    #[derivative(Debug = "ignore")]
    mu: Arc<Mutex<()>>,

    #[builder(default, setter(skip))]
    #[derivative(Debug = "ignore")]
    queries: RwLock<HashMap<String, Arc<str>>>,
}

impl SqlKeyValue {
    pub fn db(&self) -> &Arc<dyn SqlDb> {
        &self.db
    }

    /// Returns `stmt` with placeholders and table prefix rewritten, caching
    /// the result.
    fn sql(&self, stmt: &str) -> Arc<str> {
        if let Some(q) = self.queries.read().get(stmt) {
            return q.clone();
        }
        let mut queries = self.queries.write();
        queries
            .entry(stmt.to_owned())
            .or_insert_with(|| {
                rewrite(stmt, &self.table_prefix, self.place_holder_func).into()
            })
            .clone()
    }

    fn serial_guard(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
        self.serial.then(|| self.mu.lock())
    }
}

impl KeyValue for SqlKeyValue {
    fn get(&self, key: &str) -> Result<String> {
        let _guard = self.serial_guard();
        let sql = self.sql("SELECT v FROM /*TPRE*/rows WHERE k = ?");
        match self.db.query_value(&sql, &[key])? {
            Some(v) => Ok(v),
            None => bail!(SortedError::NotFound),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        let _guard = self.serial_guard();
        if let Some(f) = &self.set_func {
            return f(self.db.as_ref(), key, value);
        }
        let sql = self.sql("REPLACE INTO /*TPRE*/rows (k, v) VALUES (?, ?)");
        self.db.execute(&sql, &[key, value])?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.serial_guard();
        let sql = self.sql("DELETE FROM /*TPRE*/rows WHERE k = ?");
        self.db.execute(&sql, &[key])?;
        Ok(())
    }

    fn begin_batch(&self) -> Box<dyn BatchMutation> {
        Box::new(SqlBatch::default())
    }

    /// Replays the staged mutations inside one transaction. Nothing is
    /// visible to other readers until the transaction commits, and any
    /// failing statement rolls the whole batch back.
    fn commit_batch(&self, batch: Box<dyn BatchMutation>) -> Result<()> {
        let batch = downcast_batch::<SqlBatch>(batch)?;
        if let Some(err) = batch.err {
            return Err(err);
        }

        let _guard = self.serial_guard();
        let replace = self.sql("REPLACE INTO /*TPRE*/rows (k, v) VALUES (?, ?)");
        let delete = self.sql("DELETE FROM /*TPRE*/rows WHERE k = ?");

        let mut tx = self.db.begin().map_err(|e| {
            error!("sql begin batch failed, err: {e}");
            e
        })?;
        for m in &batch.mods {
            match m {
                Mod::Set(k, v) => match &self.batch_set_func {
                    Some(f) => f(tx.as_mut(), k.as_str(), v.as_str())?,
                    None => {
                        tx.execute(&replace, &[k.as_str(), v.as_str()])?;
                    }
                },
                Mod::Delete(k) => {
                    tx.execute(&delete, &[k.as_str()])?;
                }
            }
        }
        debug!("committing sql batch of {} mutations", batch.mods.len());
        tx.commit()
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn KvIterator> {
        let limit = self.page_size.max(1);
        let (first, rest) = if end.is_empty() {
            (
                self.sql(&format!(
                    "SELECT k, v FROM /*TPRE*/rows WHERE k >= ? ORDER BY k LIMIT {limit}"
                )),
                self.sql(&format!(
                    "SELECT k, v FROM /*TPRE*/rows WHERE k > ? ORDER BY k LIMIT {limit}"
                )),
            )
        } else {
            (
                self.sql(&format!(
                    "SELECT k, v FROM /*TPRE*/rows WHERE k >= ? AND k < ? ORDER BY k LIMIT {limit}"
                )),
                self.sql(&format!(
                    "SELECT k, v FROM /*TPRE*/rows WHERE k > ? AND k < ? ORDER BY k LIMIT {limit}"
                )),
            )
        };

        Box::new(SqlIter::new(
            self.db.clone(),
            self.serial.then(|| self.mu.clone()),
            first,
            rest,
            start,
            end,
            limit,
        ))
    }

    fn wipe(&self) -> Result<()> {
        let _guard = self.serial_guard();
        info!("wiping sql rows table {:?}", self.table_prefix);
        let sql = self.sql("DELETE FROM /*TPRE*/rows");
        self.db.execute(&sql, &[])?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db.close()
    }
}

enum Mod {
    Set(String, String),
    Delete(String),
}

#[derive(Default)]
struct SqlBatch {
    mods: Vec<Mod>,
    err: Option<anyhow::Error>, // sticky
}

impl BatchMutation for SqlBatch {
    fn set(&mut self, key: &str, value: &str) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = check_batch_sizes(key, value) {
            self.err = Some(e);
            return;
        }
        self.mods.push(Mod::Set(key.to_owned(), value.to_owned()));
    }

    fn delete(&mut self, key: &str) {
        if self.err.is_some() {
            return;
        }
        self.mods.push(Mod::Delete(key.to_owned()));
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
