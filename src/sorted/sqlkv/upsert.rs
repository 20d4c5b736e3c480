//! Emulated upsert for dialects without `REPLACE INTO`.
//!
//! `UPDATE` first; if no row was touched, `INSERT`. A concurrent writer can
//! insert the same key between the two statements, in which case the insert
//! fails with a unique violation and the pair is retried.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use derivative::Derivative;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use super::{SqlDb, SqlTx};
use crate::sorted::SortedError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Classifies a driver error as a unique-constraint violation.
pub type UniqueViolation = fn(&anyhow::Error) -> bool;

#[derive(Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct Upsert {
    /// Binds `(value, key)`.
    #[builder(setter(into))]
    update_sql: String,
    /// Binds `(key, value)`.
    #[builder(setter(into))]
    insert_sql: String,

    #[derivative(Debug = "ignore")]
    is_unique_violation: UniqueViolation,

    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    #[builder(default = Duration::from_millis(1))]
    initial_backoff: Duration,

    /// Wrap the insert in a savepoint when running inside a transaction, so
    /// that a failed insert does not abort the whole transaction.
    #[builder(default)]
    savepoints: bool,
}

impl Upsert {
    pub fn run(&self, db: &dyn SqlDb, key: &str, value: &str) -> Result<()> {
        self.retry(key, |_| {
            if db.execute(&self.update_sql, &[value, key])? > 0 {
                return Ok(true);
            }
            match db.execute(&self.insert_sql, &[key, value]) {
                Ok(_) => Ok(true),
                Err(e) if (self.is_unique_violation)(&e) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    pub fn run_in_tx(&self, tx: &mut dyn SqlTx, key: &str, value: &str) -> Result<()> {
        self.retry(key, |_| {
            if tx.execute(&self.update_sql, &[value, key])? > 0 {
                return Ok(true);
            }
            if self.savepoints {
                tx.execute("SAVEPOINT sortedkv_upsert", &[])?;
            }
            match tx.execute(&self.insert_sql, &[key, value]) {
                Ok(_) => {
                    if self.savepoints {
                        tx.execute("RELEASE SAVEPOINT sortedkv_upsert", &[])?;
                    }
                    Ok(true)
                }
                Err(e) if (self.is_unique_violation)(&e) => {
                    if self.savepoints {
                        tx.execute("ROLLBACK TO SAVEPOINT sortedkv_upsert", &[])?;
                    }
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Calls `attempt` until it reports success, sleeping with doubling
    /// backoff in between.
    fn retry<F>(&self, key: &str, mut attempt: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut backoff = self.initial_backoff;
        for n in 1..=self.max_attempts {
            if attempt(n)? {
                return Ok(());
            }
            debug!("upsert of {key:?} lost an insert race, attempt {n}");
            if n < self.max_attempts {
                thread::sleep(backoff);
                backoff *= 2;
            }
        }
        warn!("upsert of {key:?} gave up after {} attempts", self.max_attempts);
        bail!(SortedError::UpsertRetriesExhausted {
            key: key.to_owned(),
            attempts: self.max_attempts,
        })
    }
}
