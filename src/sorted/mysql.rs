//! MySQL dialect of the SQL KeyValue.
//!
//! MySQL speaks `?` placeholders and `REPLACE INTO` natively, so the generic
//! statements are used as-is. Tables live in the configured database, which
//! becomes the table prefix, and are declared with the binary character set
//! so keys compare byte-wise.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use derivative::Derivative;
use mysql::prelude::Queryable;
use mysql::{Opts, OptsBuilder, Params, Pool, PooledConn, Value};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use super::sqlkv::{
    check_schema_version, rewrite, stamp_schema_version, validate_table_prefix, SqlDb,
    SqlKeyValue, SqlTx,
};
use super::{KeyValue, KvConfig, SortedError};

/// Version of the `rows`/`meta` layout written by [`init_db`].
pub const SCHEMA_VERSION: i64 = 21;

const DEFAULT_PORT: u16 = 3306;
const ER_DUP_ENTRY: u16 = 1062;

#[derive(Derivative, TypedBuilder, Clone)]
#[derivative(Debug)]
pub struct MysqlConfig {
    /// `host` or `host:port`.
    #[builder(default = "localhost".to_owned(), setter(into))]
    pub host: String,
    #[builder(setter(into))]
    pub database: String,
    #[builder(setter(into))]
    pub user: String,
    #[builder(default, setter(into))]
    #[derivative(Debug = "ignore")]
    pub password: String,
}

impl MysqlConfig {
    fn table_prefix(&self) -> String {
        format!("{}.", self.database)
    }

    /// Splits `host` into a hostname and port, defaulting the port to 3306.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let host = if self.host.is_empty() {
            "localhost"
        } else {
            self.host.as_str()
        };
        match host.rsplit_once(':') {
            None => Ok((host.to_owned(), DEFAULT_PORT)),
            Some((name, port)) => match port.parse() {
                Ok(port) if !name.is_empty() => Ok((name.to_owned(), port)),
                _ => bail!(SortedError::InvalidConfig(format!(
                    "invalid mysql host {host:?}, want host or host:port"
                ))),
            },
        }
    }

    /// The connection settings, without the database name so that one pool
    /// can be shared by every database on the same server.
    fn opts(&self) -> Result<Opts> {
        let (host, port) = self.host_port()?;
        let mut builder = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(self.user.clone()));
        if !self.password.is_empty() {
            builder = builder.pass(Some(self.password.clone()));
        }
        Ok(Opts::from(builder))
    }

    fn pool_key(&self) -> String {
        format!("{}:{}@{}", self.user, self.password, self.host)
    }
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<mysql::Error>(),
        Some(mysql::Error::MySqlError(e)) if e.code == ER_DUP_ENTRY
    )
}

pub fn sql_create_tables() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS /*TPRE*/rows (k VARCHAR({}) NOT NULL PRIMARY KEY, v VARCHAR({})) DEFAULT CHARACTER SET binary",
            super::MAX_KEY_SIZE,
            super::MAX_VALUE_SIZE
        ),
        "CREATE TABLE IF NOT EXISTS /*TPRE*/meta (metakey VARCHAR(255) NOT NULL PRIMARY KEY, value VARCHAR(255) NOT NULL) DEFAULT CHARACTER SET binary"
            .to_owned(),
    ]
}

// Pools keyed by server and credentials, shared by every KeyValue opened on
// the same server.
static POOLS: Lazy<Mutex<HashMap<String, Pool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn open_or_cached_pool(cfg: &MysqlConfig) -> Result<Pool> {
    let mut pools = POOLS.lock();
    if let Some(pool) = pools.get(&cfg.pool_key()) {
        debug!("reusing mysql pool for {}", cfg.host);
        return Ok(pool.clone());
    }
    let pool = Pool::new(cfg.opts()?).map_err(|e| {
        error!("failed to connect to mysql {}, err: {e}", cfg.host);
        anyhow!(e)
    })?;
    pools.insert(cfg.pool_key(), pool.clone());
    Ok(pool)
}

fn params(args: &[&str]) -> Params {
    if args.is_empty() {
        return Params::Empty;
    }
    Params::Positional(
        args.iter()
            .map(|a| Value::Bytes(a.as_bytes().to_vec()))
            .collect(),
    )
}

fn exec(conn: &mut PooledConn, sql: &str, args: &[&str]) -> Result<u64> {
    if args.is_empty() {
        conn.query_drop(sql)?;
    } else {
        conn.exec_drop(sql, params(args))?;
    }
    Ok(conn.affected_rows())
}

/// Pooled connections to one MySQL server.
pub struct MysqlDb {
    pool: Pool,
}

impl MysqlDb {
    pub fn open(cfg: &MysqlConfig) -> Result<Self> {
        Ok(Self {
            pool: open_or_cached_pool(cfg)?,
        })
    }

    fn conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get_conn()?)
    }
}

impl SqlDb for MysqlDb {
    fn query_value(&self, sql: &str, args: &[&str]) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        Ok(conn.exec_first::<String, _, _>(sql, params(args))?)
    }

    fn query_pairs(&self, sql: &str, args: &[&str]) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn()?;
        Ok(conn.exec::<(String, String), _, _>(sql, params(args))?)
    }

    fn execute(&self, sql: &str, args: &[&str]) -> Result<u64> {
        let mut conn = self.conn()?;
        exec(&mut conn, sql, args)
    }

    fn begin(&self) -> Result<Box<dyn SqlTx + '_>> {
        let mut conn = self.conn()?;
        conn.query_drop("BEGIN")?;
        Ok(Box::new(MysqlTx { conn, done: false }))
    }
}

struct MysqlTx {
    conn: PooledConn,
    done: bool,
}

impl SqlTx for MysqlTx {
    fn execute(&mut self, sql: &str, args: &[&str]) -> Result<u64> {
        exec(&mut self.conn, sql, args)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.query_drop("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for MysqlTx {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.query_drop("ROLLBACK") {
                warn!("mysql rollback failed, err: {e}");
            }
        }
    }
}

/// Creates the database and tables if missing and records the schema
/// version unless one is already present or the rows table predates it.
pub fn init_db(db: &MysqlDb, cfg: &MysqlConfig) -> Result<()> {
    let prefix = cfg.table_prefix();
    validate_table_prefix(&prefix)?;
    info!("initializing mysql kv schema in {:?}", cfg.database);

    db.execute(
        &format!("CREATE DATABASE IF NOT EXISTS {}", cfg.database),
        &[],
    )?;
    for stmt in sql_create_tables() {
        db.execute(&rewrite(&stmt, &prefix, None), &[])?;
    }
    stamp_schema_version(db, &prefix, None, SCHEMA_VERSION)
}

/// Connects to the configured server, creating the database and tables if
/// missing, and verifies the schema version before handing out the KeyValue.
pub fn new_key_value(cfg: &MysqlConfig) -> Result<SqlKeyValue> {
    let prefix = cfg.table_prefix();
    validate_table_prefix(&prefix)?;

    let db = MysqlDb::open(cfg)?;
    init_db(&db, cfg)?;
    check_schema_version(&db, &prefix, None, SCHEMA_VERSION)?;
    info!("opened mysql kv at {}/{}", cfg.host, cfg.database);

    Ok(SqlKeyValue::builder()
        .db(Arc::new(db))
        .table_prefix(prefix)
        .build())
}

fn config_from(cfg: &mut KvConfig) -> Result<MysqlConfig> {
    let my = MysqlConfig::builder()
        .user(cfg.required_string("user"))
        .database(cfg.required_string("database"))
        .host(cfg.optional_string("host", "localhost"))
        .password(cfg.optional_string("password", ""))
        .build();
    cfg.validate()?;
    Ok(my)
}

pub(super) fn new_from_config(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let my = config_from(&mut cfg)?;
    Ok(Box::new(new_key_value(&my)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorted::kvtest;

    /// Connection settings for a throwaway database, taken from
    /// `SORTEDKV_TEST_MYSQL` as `host:port/database/user/password`.
    fn test_config() -> Option<MysqlConfig> {
        let conn_str = std::env::var("SORTEDKV_TEST_MYSQL").ok()?;
        let mut parts = conn_str.splitn(4, '/');
        Some(
            MysqlConfig::builder()
                .host(parts.next()?)
                .database(parts.next()?)
                .user(parts.next()?)
                .password(parts.next().unwrap_or(""))
                .build(),
        )
    }

    fn new_wiped_kv() -> Option<SqlKeyValue> {
        let Some(cfg) = test_config() else {
            eprintln!("SORTEDKV_TEST_MYSQL not set, skipping");
            return None;
        };
        let kv = new_key_value(&cfg).unwrap();
        kv.wipe().unwrap();
        Some(kv)
    }

    fn host_config(host: &str) -> MysqlConfig {
        MysqlConfig::builder()
            .host(host)
            .database("camli")
            .user("u")
            .build()
    }

    #[test]
    pub fn test_host_port() {
        assert_eq!(
            host_config("db.example").host_port().unwrap(),
            ("db.example".to_owned(), 3306)
        );
        assert_eq!(
            host_config("db.example:3307").host_port().unwrap(),
            ("db.example".to_owned(), 3307)
        );
        assert_eq!(
            host_config("").host_port().unwrap(),
            ("localhost".to_owned(), 3306)
        );
        assert!(host_config("db.example:port").host_port().is_err());
        assert!(host_config(":3306").host_port().is_err());
    }

    #[test]
    pub fn test_config_debug_hides_password() {
        let cfg = MysqlConfig::builder()
            .database("camli")
            .user("u")
            .password("hunter2")
            .build();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    pub fn test_from_config_requires_database() {
        let cfg = KvConfig::default().with("type", "mysql").with("user", "u");
        let err = crate::sorted::new_key_value(cfg).err().unwrap();
        assert!(err.to_string().contains("database"), "{err}");
    }

    #[test]
    pub fn test_from_config_fields() {
        let mut cfg = KvConfig::default()
            .with("user", "u")
            .with("database", "camli")
            .with("host", "db.example:3307");
        let my = config_from(&mut cfg).unwrap();
        assert_eq!(my.table_prefix(), "camli.");
        assert_eq!(my.host_port().unwrap(), ("db.example".to_owned(), 3307));
        assert_eq!(my.password, "");
    }

    #[test]
    pub fn test_bad_database_name_is_rejected() {
        let cfg = MysqlConfig::builder()
            .database("camli; DROP DATABASE x")
            .user("u")
            .build();
        assert!(new_key_value(&cfg).is_err());
    }

    #[test]
    pub fn test_create_tables_use_binary_keys() {
        for stmt in sql_create_tables() {
            assert!(stmt.contains("/*TPRE*/"), "{stmt}");
            assert!(stmt.ends_with("DEFAULT CHARACTER SET binary"), "{stmt}");
        }
    }

    #[test]
    pub fn test_mysql_kv() {
        let Some(kv) = new_wiped_kv() else { return };
        kvtest::test_sorted(&kv);
    }

    #[test]
    pub fn test_mysql_batches() {
        let Some(kv) = new_wiped_kv() else { return };
        kvtest::test_batches(&kv);
    }

    #[test]
    pub fn test_mysql_unique_violation() {
        let Some(kv) = new_wiped_kv() else { return };
        let Some(cfg) = test_config() else { return };
        let sql = rewrite(
            "INSERT INTO /*TPRE*/rows (k, v) VALUES (?, ?)",
            &cfg.table_prefix(),
            None,
        );
        kv.db().execute(&sql, &["k", "1"]).unwrap();
        let err = kv.db().execute(&sql, &["k", "2"]).unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&anyhow!("other")));
    }
}
