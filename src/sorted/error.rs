use thiserror::Error;

use super::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

#[derive(Error, Debug)]
pub enum SortedError {
    #[error("index: key not found")]
    NotFound,

    #[error("sorted: key size is over {}", MAX_KEY_SIZE)]
    KeyTooLarge,
    #[error("sorted: value size is over {}", MAX_VALUE_SIZE)]
    ValueTooLarge,

    #[error("wrong BatchMutation type {0}")]
    WrongBatchType(&'static str),

    #[error("sorted: iterator already closed")]
    IteratorClosed,
    #[error("sorted: iteration cancelled")]
    Cancelled,

    #[error("sorted: unknown KeyValue type {0:?}")]
    UnknownType(String),
    #[error("sorted: KeyValue type {0:?} already registered")]
    DuplicateType(String),
    #[error("sorted: invalid config: {0}")]
    InvalidConfig(String),

    #[error("sorted: wipe not supported")]
    WipeUnsupported,

    #[error("database schema version is {got}; expect {want} (need to re-init/upgrade database?)")]
    SchemaVersion { got: i64, want: i64 },

    #[error("sorted: upsert of {key:?} still contended after {attempts} attempts")]
    UpsertRetriesExhausted { key: String, attempts: u32 },
}

/// Reports whether `err` is, or wraps, [`SortedError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SortedError>(), Some(SortedError::NotFound))
}
