//! KeyValue stored in a sled database on local disk.

use std::any::Any;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use tracing::{debug, error, info};

use super::{
    check_batch_sizes, check_sizes, downcast_batch, BatchMutation, KeyValue, KvConfig,
    KvIterator, MemoStr, SortedError,
};

/// Durable single-process KeyValue.
///
/// Clones share the underlying database handle.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    path: Option<PathBuf>,
}

impl SledStore {
    /// Opens or creates the database directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("open sled kv at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(path).map_err(|e| {
            error!("failed to open sled kv at {:?}, err: {e}", path);
            anyhow!(e)
        })?;

        Ok(Self {
            db,
            path: Some(path.to_path_buf()),
        })
    }

    /// A database that lives in a private temporary directory and is removed
    /// when the last handle is dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

pub(super) fn new_from_config(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let file = cfg.required_string("file");
    cfg.validate()?;
    Ok(Box::new(SledStore::open(file)?))
}

impl KeyValue for SledStore {
    fn get(&self, key: &str) -> Result<String> {
        match self.db.get(key)? {
            Some(v) => Ok(String::from_utf8_lossy(&v).into_owned()),
            None => bail!(SortedError::NotFound),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.db.insert(key, value.as_bytes())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn begin_batch(&self) -> Box<dyn BatchMutation> {
        Box::new(SledBatch::default())
    }

    fn commit_batch(&self, batch: Box<dyn BatchMutation>) -> Result<()> {
        let batch = downcast_batch::<SledBatch>(batch)?;
        if let Some(err) = batch.err {
            return Err(err);
        }
        debug!("apply sled batch of {} mutations", batch.len);
        self.db.apply_batch(batch.batch)?;
        Ok(())
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn KvIterator> {
        if !end.is_empty() && start >= end {
            return Box::new(StoreIter::empty());
        }

        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.as_bytes().to_vec())
        };
        let range = (Bound::Included(start.as_bytes().to_vec()), upper);

        Box::new(StoreIter {
            iter: Some(self.db.range(range)),
            cur: None,
            skey: MemoStr::default(),
            sval: MemoStr::default(),
            err: None,
        })
    }

    fn wipe(&self) -> Result<()> {
        info!("wipe sled kv {:?}", self.path);
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let n = self.db.flush()?;
        debug!("flushed {n} bytes on close of sled kv {:?}", self.path);
        Ok(())
    }
}

#[derive(Default)]
struct SledBatch {
    batch: sled::Batch,
    len: usize,
    err: Option<anyhow::Error>, // sticky
}

impl BatchMutation for SledBatch {
    fn set(&mut self, key: &str, value: &str) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = check_batch_sizes(key, value) {
            self.err = Some(e);
            return;
        }
        self.batch.insert(key.as_bytes(), value.as_bytes());
        self.len += 1;
    }

    fn delete(&mut self, key: &str) {
        self.batch.remove(key.as_bytes());
        self.len += 1;
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub struct StoreIter {
    iter: Option<sled::Iter>, // None once exhausted or closed
    cur: Option<(sled::IVec, sled::IVec)>,
    skey: MemoStr,
    sval: MemoStr,
    err: Option<anyhow::Error>,
}

impl StoreIter {
    fn empty() -> Self {
        Self {
            iter: None,
            cur: None,
            skey: MemoStr::default(),
            sval: MemoStr::default(),
            err: None,
        }
    }
}

impl KvIterator for StoreIter {
    fn next(&mut self) -> bool {
        self.skey.reset();
        self.sval.reset();
        self.cur = None;

        let Some(iter) = self.iter.as_mut() else {
            return false;
        };
        match iter.next() {
            Some(Ok(kv)) => {
                self.cur = Some(kv);
                true
            }
            Some(Err(e)) => {
                error!("sled iterator failed, err: {e}");
                self.err = Some(anyhow!(e));
                self.iter = None;
                false
            }
            None => {
                self.iter = None;
                false
            }
        }
    }

    fn key(&self) -> &str {
        self.skey.get_or_init(self.key_bytes())
    }

    fn key_bytes(&self) -> &[u8] {
        self.cur.as_ref().map(|(k, _)| k.as_ref()).unwrap_or(&[])
    }

    fn value(&self) -> &str {
        self.sval.get_or_init(self.value_bytes())
    }

    fn value_bytes(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v)| v.as_ref()).unwrap_or(&[])
    }

    fn close(&mut self) -> Result<()> {
        self.iter = None;
        self.cur = None;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::sorted::{kvtest, new_key_value};

    #[test]
    pub fn test_sled_kv() {
        let dir = tempdir().unwrap();
        let kv = SledStore::open(dir.path().join("index.sled")).unwrap();
        kvtest::test_sorted(&kv);
        kv.close().unwrap();
    }

    #[test]
    pub fn test_sled_batches() {
        kvtest::test_batches(&SledStore::temporary().unwrap());
    }

    #[test]
    pub fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("index.sled");
        {
            let kv = SledStore::open(&path).unwrap();
            kv.set("k", "v").unwrap();
            kv.close().unwrap();
        }
        let kv = SledStore::open(&path).unwrap();
        assert_eq!(kv.get("k").unwrap(), "v");
    }

    #[test]
    pub fn test_wipe() {
        let kv = SledStore::temporary().unwrap();
        kv.set("a", "1").unwrap();
        kv.set("b", "2").unwrap();
        kv.wipe().unwrap();
        let mut it = kv.find("", "");
        assert!(!it.next());
        it.close().unwrap();
    }

    #[test]
    pub fn test_from_config() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cfg.sled");
        let cfg = KvConfig::default()
            .with("type", "file")
            .with("file", file.to_str().unwrap());
        let kv = new_key_value(cfg).unwrap();
        kv.set("x", "y").unwrap();
        assert_eq!(kv.get("x").unwrap(), "y");
        kv.close().unwrap();

        let missing = KvConfig::default().with("type", "file");
        assert!(new_key_value(missing).is_err());
    }

    #[test]
    pub fn test_many_instances() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let dir = tempdir().unwrap();
                    let kv = SledStore::open(dir.path().join("kv")).unwrap();
                    kv.set("n", &i.to_string()).unwrap();
                    assert_eq!(kv.get("n").unwrap(), i.to_string());
                    kv.close().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
