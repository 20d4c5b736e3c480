//! Sorted, enumerable key-value storage.
//!
//! [`KeyValue`] is the contract every index backend implements: point
//! lookups, upserts, idempotent deletes, batched mutations and ordered range
//! scans through a closeable [`KvIterator`]. Backends are constructed by name
//! through the registry ([`new_key_value`]).

use std::any::Any;

use anyhow::{anyhow, bail, Result};
use tracing::warn;

pub mod buffer;
mod error;
mod iter;
mod kv_config;
pub mod mem;
pub mod mysql;
pub mod postgres;
mod registry;
pub mod sledkv;
pub mod sqlite;
pub mod sqlkv;

#[cfg(test)]
pub(crate) mod kvtest;

pub use error::{is_not_found, SortedError};
pub use iter::{CancelToken, Cancellable, MemoStr};
pub use kv_config::KvConfig;
pub use registry::{new_key_value, register_key_value, Constructor};

/// Largest key, in bytes, any backend accepts.
pub const MAX_KEY_SIZE: usize = 767;
/// Largest value, in bytes, any backend accepts.
pub const MAX_VALUE_SIZE: usize = 63000;

/// A sorted, enumerable key-value store.
///
/// Keys and values are strings. Lookups of absent keys must fail with
/// [`SortedError::NotFound`], whatever the backend reports natively.
pub trait KeyValue: Send + Sync {
    fn get(&self, key: &str) -> Result<String>;

    /// Inserts or replaces `key`. Fails with `KeyTooLarge`/`ValueTooLarge`
    /// before touching storage when a size limit is exceeded.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn begin_batch(&self) -> Box<dyn BatchMutation>;

    /// Applies a batch obtained from this store's `begin_batch`. A batch of
    /// any other concrete type is rejected with `WrongBatchType`.
    fn commit_batch(&self, batch: Box<dyn BatchMutation>) -> Result<()>;

    /// Iterates over keys in `[start, end)`; an empty `end` means no upper
    /// bound. Setup errors are deferred: the iterator yields nothing and
    /// reports the error from `close`.
    fn find(&self, start: &str, end: &str) -> Box<dyn KvIterator>;

    /// Deletes every row.
    fn wipe(&self) -> Result<()> {
        bail!(SortedError::WipeUnsupported)
    }

    fn close(&self) -> Result<()>;
}

/// Accumulates mutations to be applied together by `commit_batch`.
///
/// Errors detected while staging (oversized keys or values, driver failures)
/// are sticky and reported at commit time.
pub trait BatchMutation: Send {
    fn set(&mut self, key: &str, value: &str);
    fn delete(&mut self, key: &str);

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// A cursor over a key range.
///
/// `next` must be called before the first access. Accessors return empty
/// data when the iterator is not positioned on a row. Every iterator must be
/// closed; `close` returns any error hit while iterating.
pub trait KvIterator: Send {
    fn next(&mut self) -> bool;

    fn key(&self) -> &str;
    fn key_bytes(&self) -> &[u8];
    fn value(&self) -> &str;
    fn value_bytes(&self) -> &[u8];

    fn close(&mut self) -> Result<()>;
}

/// Recovers the concrete batch type a backend handed out.
pub fn downcast_batch<T: BatchMutation + 'static>(batch: Box<dyn BatchMutation>) -> Result<Box<T>> {
    let name = batch.type_name();
    batch
        .into_any()
        .downcast::<T>()
        .map_err(|_| anyhow!(SortedError::WrongBatchType(name)))
}

pub fn check_sizes(key: &str, value: &str) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        bail!(SortedError::KeyTooLarge);
    }
    if value.len() > MAX_VALUE_SIZE {
        bail!(SortedError::ValueTooLarge);
    }
    Ok(())
}

/// Like [`check_sizes`], but names the offending key or value the way batch
/// errors are reported.
pub(crate) fn check_batch_sizes(key: &str, value: &str) -> Result<()> {
    check_sizes(key, value).map_err(|e| match e.downcast_ref::<SortedError>() {
        Some(SortedError::KeyTooLarge) => e.context(format!("batch set: key of {} bytes", key.len())),
        _ => e.context(format!("batch set: value of {} bytes", value.len())),
    })
}

/// Calls `f` for every row of `kv`, in key order.
pub fn foreach<F>(kv: &dyn KeyValue, f: F) -> Result<()>
where
    F: FnMut(&str, &str) -> Result<()>,
{
    foreach_in_range(kv, "", "", f)
}

/// Calls `f` for every row in `[start, end)`. The first error returned by
/// `f` stops the scan.
pub fn foreach_in_range<F>(kv: &dyn KeyValue, start: &str, end: &str, mut f: F) -> Result<()>
where
    F: FnMut(&str, &str) -> Result<()>,
{
    let mut it = kv.find(start, end);
    while it.next() {
        if let Err(e) = f(it.key(), it.value()) {
            if let Err(close_err) = it.close() {
                warn!("failed to close iterator after callback error, err: {close_err}");
            }
            return Err(e);
        }
    }
    it.close()
}
