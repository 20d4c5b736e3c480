//! Sorted key-value storage for a blob index: the [`sorted::KeyValue`]
//! contract with its backends, and the [`index`] key schema stored in it.

pub mod blob;
pub mod config;
pub mod error;
pub mod index;
pub mod sorted;
