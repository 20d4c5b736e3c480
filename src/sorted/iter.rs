use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use once_cell::unsync::OnceCell;

use super::{KvIterator, SortedError};

/// A string materialized from raw bytes on first access and cached until the
/// iterator moves.
#[derive(Default, Debug)]
pub struct MemoStr(OnceCell<String>);

impl MemoStr {
    pub fn get_or_init(&self, bytes: &[u8]) -> &str {
        self.0
            .get_or_init(|| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn reset(&mut self) {
        self.0 = OnceCell::new();
    }
}

#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Wraps an iterator so a long scan can be abandoned from another thread.
/// Once the token fires, `next` returns false and `close` reports
/// [`SortedError::Cancelled`].
pub struct Cancellable {
    inner: Box<dyn KvIterator>,
    token: CancelToken,
    cancelled: bool,
}

impl Cancellable {
    pub fn new(inner: Box<dyn KvIterator>, token: CancelToken) -> Self {
        Self {
            inner,
            token,
            cancelled: false,
        }
    }
}

impl KvIterator for Cancellable {
    fn next(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        if self.token.is_cancelled() {
            self.cancelled = true;
            return false;
        }
        self.inner.next()
    }

    fn key(&self) -> &str {
        if self.cancelled {
            return "";
        }
        self.inner.key()
    }

    fn key_bytes(&self) -> &[u8] {
        if self.cancelled {
            return &[];
        }
        self.inner.key_bytes()
    }

    fn value(&self) -> &str {
        if self.cancelled {
            return "";
        }
        self.inner.value()
    }

    fn value_bytes(&self) -> &[u8] {
        if self.cancelled {
            return &[];
        }
        self.inner.value_bytes()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()?;
        if self.cancelled {
            bail!(SortedError::Cancelled);
        }
        Ok(())
    }
}
