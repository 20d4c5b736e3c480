//! PostgreSQL dialect of the SQL KeyValue.
//!
//! Postgres has no `REPLACE INTO`, so sets go through the emulated
//! [`Upsert`]. Keys must compare byte-wise, so the `k` column is declared
//! with the `C` collation.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use derivative::Derivative;
use postgres::config::SslMode;
use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::NoTls;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use super::sqlkv::{
    check_schema_version, rewrite, stamp_schema_version, validate_table_prefix, SqlDb,
    SqlKeyValue, SqlTx, Upsert,
};
use super::{KeyValue, KvConfig, SortedError};

/// Version of the `rows`/`meta` layout written by [`init_db`].
pub const SCHEMA_VERSION: i64 = 2;

#[derive(Derivative, TypedBuilder, Clone)]
#[derivative(Debug)]
pub struct PostgresConfig {
    #[builder(default = "localhost".to_owned(), setter(into))]
    pub host: String,
    #[builder(default = 5432)]
    pub port: u16,
    #[builder(setter(into))]
    pub database: String,
    #[builder(setter(into))]
    pub user: String,
    #[builder(default, setter(into))]
    #[derivative(Debug = "ignore")]
    pub password: String,
    /// Only `disable` and `prefer` are supported.
    #[builder(default = "prefer".to_owned(), setter(into))]
    pub sslmode: String,
    /// Optional schema holding the tables, used as the table prefix.
    #[builder(default, setter(into))]
    pub schema: String,
    #[builder(default = 8)]
    pub pool_size: u32,
}

impl PostgresConfig {
    fn table_prefix(&self) -> String {
        if self.schema.is_empty() {
            String::new()
        } else {
            format!("{}.", self.schema)
        }
    }

    fn pg_config(&self) -> Result<postgres::Config> {
        let ssl_mode = match self.sslmode.as_str() {
            "disable" => SslMode::Disable,
            "" | "prefer" => SslMode::Prefer,
            other => bail!(SortedError::InvalidConfig(format!(
                "unsupported postgres sslmode {other:?}, want \"disable\" or \"prefer\""
            ))),
        };
        let mut pg = postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .ssl_mode(ssl_mode);
        if !self.password.is_empty() {
            pg.password(&self.password);
        }
        Ok(pg)
    }
}

/// Rewrites `?` placeholders to `$1, $2, ...`, numbered left to right.
pub fn dollar_placeholders(stmt: &str) -> String {
    let mut out = String::with_capacity(stmt.len() + 8);
    let mut n = 0;
    for c in stmt.chars() {
        if c == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<postgres::Error>()
        .and_then(|e| e.code())
        .map_or(false, |code| *code == SqlState::UNIQUE_VIOLATION)
}

pub fn sql_create_tables() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS /*TPRE*/rows (k VARCHAR({}) COLLATE \"C\" NOT NULL PRIMARY KEY, v VARCHAR({}))",
            super::MAX_KEY_SIZE,
            super::MAX_VALUE_SIZE
        ),
        "CREATE TABLE IF NOT EXISTS /*TPRE*/meta (metakey VARCHAR(255) NOT NULL PRIMARY KEY, value VARCHAR(255) NOT NULL)"
            .to_owned(),
    ]
}

/// Pooled connections to one Postgres database.
pub struct PostgresDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

type Conn = PooledConnection<PostgresConnectionManager<NoTls>>;

fn params<'a>(args: &'a [&'a str]) -> Vec<&'a (dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

impl PostgresDb {
    pub fn open(cfg: &PostgresConfig) -> Result<Self> {
        let manager = PostgresConnectionManager::new(cfg.pg_config()?, NoTls);
        let pool = Pool::builder()
            .max_size(cfg.pool_size.max(1))
            .build(manager)
            .map_err(|e| {
                error!(
                    "failed to connect to postgres {}:{}/{}, err: {e}",
                    cfg.host, cfg.port, cfg.database
                );
                anyhow!(e)
            })?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get()?)
    }
}

impl SqlDb for PostgresDb {
    fn query_value(&self, sql: &str, args: &[&str]) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(sql, &params(args))?;
        Ok(match row {
            Some(row) => Some(row.try_get::<_, String>(0)?),
            None => None,
        })
    }

    fn query_pairs(&self, sql: &str, args: &[&str]) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn()?;
        let rows = conn.query(sql, &params(args))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?));
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, args: &[&str]) -> Result<u64> {
        let mut conn = self.conn()?;
        Ok(conn.execute(sql, &params(args))?)
    }

    fn begin(&self) -> Result<Box<dyn SqlTx + '_>> {
        let mut conn = self.conn()?;
        conn.batch_execute("BEGIN")?;
        Ok(Box::new(PostgresTx { conn, done: false }))
    }
}

struct PostgresTx {
    conn: Conn,
    done: bool,
}

impl SqlTx for PostgresTx {
    fn execute(&mut self, sql: &str, args: &[&str]) -> Result<u64> {
        Ok(self.conn.execute(sql, &params(args))?)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.batch_execute("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for PostgresTx {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.batch_execute("ROLLBACK") {
                warn!("postgres rollback failed, err: {e}");
            }
        }
    }
}

/// Creates the tables (and schema, if configured) and records the schema
/// version unless one is already present or the rows table predates it.
pub fn init_db(db: &PostgresDb, cfg: &PostgresConfig) -> Result<()> {
    let prefix = cfg.table_prefix();
    validate_table_prefix(&prefix)?;
    info!("initializing postgres kv schema in {:?}", cfg.database);

    if !cfg.schema.is_empty() {
        db.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", cfg.schema), &[])?;
    }
    for stmt in sql_create_tables() {
        db.execute(&rewrite(&stmt, &prefix, None), &[])?;
    }
    stamp_schema_version(db, &prefix, Some(dollar_placeholders), SCHEMA_VERSION)
}

/// Connects to the configured database, creating the tables if missing, and
/// verifies the schema version before handing out the KeyValue.
pub fn new_key_value(cfg: &PostgresConfig) -> Result<SqlKeyValue> {
    let prefix = cfg.table_prefix();
    validate_table_prefix(&prefix)?;

    let db = PostgresDb::open(cfg)?;
    init_db(&db, cfg)?;
    check_schema_version(&db, &prefix, Some(dollar_placeholders), SCHEMA_VERSION)?;
    info!(
        "opened postgres kv at {}:{}/{}",
        cfg.host, cfg.port, cfg.database
    );

    let upsert = Arc::new(
        Upsert::builder()
            .update_sql(rewrite(
                "UPDATE /*TPRE*/rows SET v = ? WHERE k = ?",
                &prefix,
                Some(dollar_placeholders),
            ))
            .insert_sql(rewrite(
                "INSERT INTO /*TPRE*/rows (k, v) VALUES (?, ?)",
                &prefix,
                Some(dollar_placeholders),
            ))
            .is_unique_violation(is_unique_violation)
            .savepoints(true)
            .build(),
    );
    let batch_upsert = upsert.clone();

    Ok(SqlKeyValue::builder()
        .db(Arc::new(db))
        .set_func(Box::new(move |db: &dyn SqlDb, k: &str, v: &str| upsert.run(db, k, v)))
        .batch_set_func(Box::new(move |tx: &mut dyn SqlTx, k: &str, v: &str| {
            batch_upsert.run_in_tx(tx, k, v)
        }))
        .place_holder_func(dollar_placeholders)
        .table_prefix(prefix)
        .build())
}

fn config_from(cfg: &mut KvConfig) -> Result<PostgresConfig> {
    let pg = PostgresConfig::builder()
        .host(cfg.optional_string("host", "localhost"))
        .port(cfg.optional_int("port", 5432u16))
        .database(cfg.required_string("database"))
        .user(cfg.required_string("user"))
        .password(cfg.optional_string("password", ""))
        .sslmode(cfg.optional_string("sslmode", "prefer"))
        .schema(cfg.optional_string("schema", ""))
        .pool_size(cfg.optional_int("poolSize", 8u32))
        .build();
    cfg.validate()?;
    Ok(pg)
}

pub(super) fn new_from_config(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let pg = config_from(&mut cfg)?;
    Ok(Box::new(new_key_value(&pg)?))
}
