use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, error};

use super::SqlDb;
use crate::sorted::{KvIterator, SortedError};

/// Iterates over a key range one `LIMIT`ed page at a time.
///
/// The first page is read with an inclusive lower bound on `start`; every
/// later page continues strictly after the last key already returned. A
/// page shorter than the limit ends the scan without another round trip.
pub struct SqlIter {
    db: Arc<dyn SqlDb>,
    serial: Option<Arc<Mutex<()>>>,

    first_page_sql: Arc<str>,
    next_page_sql: Arc<str>,
    start: String,
    end: String, // empty means unbounded
    page_size: usize,

    page: VecDeque<(String, String)>,
    cur: Option<(String, String)>,
    last_key: Option<String>,
    exhausted: bool,

    closed: bool,
    err: Option<anyhow::Error>, // returned from close
}

impl SqlIter {
    pub(super) fn new(
        db: Arc<dyn SqlDb>,
        serial: Option<Arc<Mutex<()>>>,
        first_page_sql: Arc<str>,
        next_page_sql: Arc<str>,
        start: &str,
        end: &str,
        page_size: usize,
    ) -> Self {
        Self {
            db,
            serial,
            first_page_sql,
            next_page_sql,
            start: start.to_owned(),
            end: end.to_owned(),
            page_size,
            page: VecDeque::new(),
            cur: None,
            last_key: None,
            exhausted: false,
            closed: false,
            err: None,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let (sql, lower) = match &self.last_key {
            Some(last) => (&self.next_page_sql, last.as_str()),
            None => (&self.first_page_sql, self.start.as_str()),
        };
        let mut args = vec![lower];
        if !self.end.is_empty() {
            args.push(self.end.as_str());
        }

        let rows = {
            let _guard = self.serial.as_ref().map(|mu| mu.lock());
            self.db.query_pairs(sql, &args)?
        };
        debug!("sql iterator fetched {} rows after {lower:?}", rows.len());

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((k, _)) = rows.last() {
            self.last_key = Some(k.clone());
        }
        self.page = rows.into();
        Ok(())
    }
}

impl KvIterator for SqlIter {
    fn next(&mut self) -> bool {
        self.cur = None;
        if self.closed || self.err.is_some() {
            return false;
        }

        if self.page.is_empty() {
            if self.exhausted {
                return false;
            }
            if let Err(e) = self.fetch_page() {
                error!("sql iterator query failed, err: {e}");
                self.err = Some(e);
                return false;
            }
        }

        match self.page.pop_front() {
            Some(row) => {
                self.cur = Some(row);
                true
            }
            None => false,
        }
    }

    fn key(&self) -> &str {
        self.cur.as_ref().map(|(k, _)| k.as_str()).unwrap_or("")
    }

    fn key_bytes(&self) -> &[u8] {
        self.key().as_bytes()
    }

    fn value(&self) -> &str {
        self.cur.as_ref().map(|(_, v)| v.as_str()).unwrap_or("")
    }

    fn value_bytes(&self) -> &[u8] {
        self.value().as_bytes()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            bail!(SortedError::IteratorClosed);
        }
        self.closed = true;
        self.cur = None;
        self.page.clear();
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
