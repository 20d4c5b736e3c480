//! In-memory KeyValue, for tests and throwaway indexes.

use std::any::Any;
use std::ops::Bound;
use std::sync::Arc;

use anyhow::{bail, Result};
use im::OrdMap;
use parking_lot::Mutex;

use super::{
    check_batch_sizes, check_sizes, downcast_batch, BatchMutation, KeyValue, KvConfig,
    KvIterator, SortedError,
};

/// A KeyValue held in an ordered map behind a single mutex.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryKv {
    data: Arc<Mutex<OrdMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

pub(super) fn new_from_config(cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    cfg.validate()?;
    Ok(Box::new(MemoryKv::new()))
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &str) -> Result<String> {
        match self.data.lock().get(key) {
            Some(v) => Ok(v.clone()),
            None => bail!(SortedError::NotFound),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.data.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn begin_batch(&self) -> Box<dyn BatchMutation> {
        Box::new(MemBatch::default())
    }

    fn commit_batch(&self, batch: Box<dyn BatchMutation>) -> Result<()> {
        let batch = downcast_batch::<MemBatch>(batch)?;
        if let Some(err) = batch.err {
            return Err(err);
        }

        let mut data = self.data.lock();
        for m in batch.mods {
            match m {
                Mutation::Set(k, v) => {
                    data.insert(k, v);
                }
                Mutation::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn KvIterator> {
        // OrdMap clones are O(1) and share structure, so the iterator reads
        // a stable snapshot without holding the lock.
        let snapshot = self.data.lock().clone();
        Box::new(MemIter {
            data: snapshot,
            start: start.to_owned(),
            end: end.to_owned(),
            cur: None,
            done: false,
        })
    }

    fn wipe(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

enum Mutation {
    Set(String, String),
    Delete(String),
}

#[derive(Default)]
struct MemBatch {
    mods: Vec<Mutation>,
    err: Option<anyhow::Error>, // sticky
}

impl BatchMutation for MemBatch {
    fn set(&mut self, key: &str, value: &str) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = check_batch_sizes(key, value) {
            self.err = Some(e);
            return;
        }
        self.mods.push(Mutation::Set(key.to_owned(), value.to_owned()));
    }

    fn delete(&mut self, key: &str) {
        self.mods.push(Mutation::Delete(key.to_owned()));
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

struct MemIter {
    data: OrdMap<String, String>,
    start: String,
    end: String, // empty means unbounded
    cur: Option<(String, String)>,
    done: bool,
}

impl KvIterator for MemIter {
    fn next(&mut self) -> bool {
        if self.done {
            return false;
        }
        let lower = match &self.cur {
            Some((k, _)) => Bound::Excluded(k.as_str()),
            None => Bound::Included(self.start.as_str()),
        };
        let next = self
            .data
            .range::<_, str>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));

        match next {
            Some((k, v)) if self.end.is_empty() || k < self.end => {
                self.cur = Some((k, v));
                true
            }
            _ => {
                self.cur = None;
                self.done = true;
                false
            }
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
        self.cur = None;
        self.done = true;
        self.data = OrdMap::new();
        Ok(())
    }
}
