//! A KeyValue that buffers writes in one store in front of another.
//!
//! Used for bulk work such as reindexing, where the index only has to be
//! consistent on the backing store once everything has been flushed.

use std::any::Any;
use std::cmp::Ordering;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{
    check_sizes, downcast_batch, is_not_found, new_key_value, BatchMutation, KeyValue, KvConfig,
    KvIterator,
};

/// Buffers `Set`s in `buf` and moves them to `back` on [`BufferedKv::flush`],
/// or automatically once more than `max_buffer` bytes are buffered.
pub struct BufferedKv {
    buf: Box<dyn KeyValue>,
    back: Box<dyn KeyValue>,
    max_buffer: i64,

    buffered: Mutex<i64>,

    // Read side held by Set/Get/Delete/CommitBatch, write side by Flush.
    mu: RwLock<()>,
}

impl BufferedKv {
    /// A `max_buffer_bytes` of zero or less flushes after every write.
    pub fn new(buf: Box<dyn KeyValue>, back: Box<dyn KeyValue>, max_buffer_bytes: i64) -> Self {
        Self {
            buf,
            back,
            max_buffer: max_buffer_bytes,
            buffered: Mutex::new(0),
            mu: RwLock::new(()),
        }
    }

    pub fn buffered_bytes(&self) -> i64 {
        *self.buffered.lock()
    }

    /// Moves every buffered entry to the backing store.
    ///
    /// The backing batch is committed before anything is removed from the
    /// buffer, so a failed flush leaves the buffer intact and can be retried.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.mu.write();

        let mut bmback = self.back.begin_batch();
        let mut bmbuf = self.buf.begin_batch();
        let mut n = 0;

        let mut it = self.buf.find("", "");
        while it.next() {
            bmback.set(it.key(), it.value());
            bmbuf.delete(it.key());
            n += 1;
        }
        it.close()?;

        if n == 0 {
            return Ok(());
        }
        debug!("flushing {n} buffered entries");
        self.back.commit_batch(bmback)?;
        self.buf.commit_batch(bmbuf)?;

        *self.buffered.lock() = 0;
        Ok(())
    }
}

pub(super) fn new_from_config(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let buf_cfg = cfg.required_object("buffer");
    let back_cfg = cfg.required_object("backing");
    let max = cfg.optional_i64("maxBufferBytes", 32 << 20);
    cfg.validate()?;

    let buf = new_key_value(buf_cfg)?;
    let back = new_key_value(back_cfg)?;
    Ok(Box::new(BufferedKv::new(buf, back, max)))
}

impl KeyValue for BufferedKv {
    fn get(&self, key: &str) -> Result<String> {
        let _guard = self.mu.read();
        match self.buf.get(key) {
            Ok(v) => Ok(v),
            Err(e) if is_not_found(&e) => self.back.get(key),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        {
            let _guard = self.mu.read();
            self.buf.set(key, value)?;
        }

        let do_flush = {
            let mut buffered = self.buffered.lock();
            *buffered += (key.len() + value.len()) as i64;
            *buffered > self.max_buffer
        };
        if do_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.mu.read();
        // Deletes are rare, so they skip the buffer and go straight to both
        // stores.
        let buf_res = self.buf.delete(key);
        let back_res = self.back.delete(key);
        buf_res?;
        back_res
    }

    fn begin_batch(&self) -> Box<dyn BatchMutation> {
        Box::new(BufferBatch::default())
    }

    fn commit_batch(&self, batch: Box<dyn BatchMutation>) -> Result<()> {
        let _guard = self.mu.read();
        let batch = downcast_batch::<BufferBatch>(batch)?;

        let mut bmbuf = self.buf.begin_batch();
        // Only created if the batch deletes something.
        let mut bmback: Option<Box<dyn BatchMutation>> = None;
        let mut added = 0i64;

        for m in &batch.mods {
            match m {
                Mod::Delete(key) => {
                    bmbuf.delete(key);
                    bmback
                        .get_or_insert_with(|| self.back.begin_batch())
                        .delete(key);
                }
                Mod::Set(key, value) => {
                    check_sizes(key, value)?;
                    bmbuf.set(key, value);
                    added += (key.len() + value.len()) as i64;
                }
            }
        }

        self.buf.commit_batch(bmbuf)?;
        *self.buffered.lock() += added;
        if let Some(bmback) = bmback {
            self.back.commit_batch(bmback)?;
        }
        Ok(())
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn KvIterator> {
        Box::new(MergeIter {
            buf: SubIter::new(self.buf.find(start, end)),
            back: SubIter::new(self.back.find(start, end)),
            started: false,
        })
    }

    fn wipe(&self) -> Result<()> {
        let _guard = self.mu.write();
        self.buf.wipe()?;
        self.back.wipe()?;
        *self.buffered.lock() = 0;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush()?;
        info!("closing buffered kv backing store");
        self.back.close()
    }
}

enum Mod {
    Set(String, String),
    Delete(String),
}

#[derive(Default)]
struct BufferBatch {
    mods: Vec<Mod>,
}

impl BatchMutation for BufferBatch {
    fn set(&mut self, key: &str, value: &str) {
        self.mods.push(Mod::Set(key.to_owned(), value.to_owned()));
    }

    fn delete(&mut self, key: &str) {
        self.mods.push(Mod::Delete(key.to_owned()));
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// One side of a merge, remembering whether it has run out.
struct SubIter {
    it: Box<dyn KvIterator>,
    eof: bool,
}

impl SubIter {
    fn new(it: Box<dyn KvIterator>) -> Self {
        Self { it, eof: false }
    }

    fn advance(&mut self) -> bool {
        if self.eof {
            return false;
        }
        if !self.it.next() {
            self.eof = true;
        }
        !self.eof
    }
}

/// Merges the buffer and backing iterators in key order. When both hold the
/// same key, the buffer's row is the one surfaced.
struct MergeIter {
    buf: SubIter,
    back: SubIter,
    started: bool,
}

impl MergeIter {
    fn current(&self) -> Option<&SubIter> {
        match (self.buf.eof, self.back.eof) {
            (true, true) => None,
            (false, true) => Some(&self.buf),
            (true, false) => Some(&self.back),
            (false, false) => {
                if self.buf.it.key_bytes() <= self.back.it.key_bytes() {
                    Some(&self.buf)
                } else {
                    Some(&self.back)
                }
            }
        }
    }
}

impl KvIterator for MergeIter {
    fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            self.buf.advance();
            self.back.advance();
            return !(self.buf.eof && self.back.eof);
        }

        match (self.buf.eof, self.back.eof) {
            (true, true) => return false,
            (true, false) => return self.back.advance(),
            (false, true) => return self.buf.advance(),
            (false, false) => {}
        }

        // Advance whichever side is behind, or both when they sit on the
        // same key.
        match self.buf.it.key_bytes().cmp(self.back.it.key_bytes()) {
            Ordering::Less => {
                self.buf.advance();
            }
            Ordering::Greater => {
                self.back.advance();
            }
            Ordering::Equal => {
                self.buf.advance();
                self.back.advance();
            }
        }
        !(self.buf.eof && self.back.eof)
    }

    fn key(&self) -> &str {
        self.current().map(|s| s.it.key()).unwrap_or("")
    }

    fn key_bytes(&self) -> &[u8] {
        self.current().map(|s| s.it.key_bytes()).unwrap_or(&[])
    }

    fn value(&self) -> &str {
        self.current().map(|s| s.it.value()).unwrap_or("")
    }

    fn value_bytes(&self) -> &[u8] {
        self.current().map(|s| s.it.value_bytes()).unwrap_or(&[])
    }

    fn close(&mut self) -> Result<()> {
        self.buf.eof = true;
        self.back.eof = true;
        let buf_res = self.buf.it.close();
        let back_res = self.back.it.close();
        buf_res?;
        back_res
    }
}
