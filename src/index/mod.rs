//! Key schema of the blob index, and the index's own schema version row.

pub mod keys;

use anyhow::{bail, Result};
use thiserror::Error;
use tracing::{error, info};

use crate::sorted::{is_not_found, KeyValue};

pub use keys::{
    contains_unsafe_raw_str_byte, format_time, reverse_time_string, type_of_key,
    unreverse_time_string, Arg, KeyType, Part, PartType, REQUIRED_SCHEMA_VERSION,
};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index: bogus {typ} key {key:?}")]
    BogusKey { typ: &'static str, key: String },
    #[error("index: bogus {typ} value {val:?}")]
    BogusValue { typ: &'static str, val: String },
    #[error("index: bogus escaping {0}")]
    BogusEscape(String),
    #[error("index: {0:?} is not a reverse time")]
    BogusReverseTime(String),

    #[error("index: bogus index schema version {0:?}")]
    BogusSchemaVersion(String),
    #[error("index schema version is {got}; required one is {want}. You need to reindex.")]
    SchemaVersion { got: i64, want: i64 },
    /// Version 4 indexes lack the wholeRef of fileinfo rows; they can be
    /// upgraded in place instead of reindexed.
    #[error("index: missing wholeRef field in fileInfo rows")]
    MissingWholeRef,
}

/// The index schema version stored in `kv`, or 0 if none is.
pub fn schema_version(kv: &dyn KeyValue) -> Result<i64> {
    match kv.get(keys::KEY_SCHEMA_VERSION.name) {
        Ok(v) => match v.parse() {
            Ok(n) => Ok(n),
            Err(_) => bail!(IndexError::BogusSchemaVersion(v)),
        },
        Err(e) if is_not_found(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

fn is_empty(kv: &dyn KeyValue) -> Result<bool> {
    let mut it = kv.find("", "");
    let has_row = it.next();
    it.close()?;
    Ok(!has_row)
}

/// Fails unless `kv` holds an index of the current schema version.
pub fn check_schema_version(kv: &dyn KeyValue) -> Result<()> {
    let got = schema_version(kv)?;
    if got == REQUIRED_SCHEMA_VERSION {
        return Ok(());
    }
    error!("index schema version is {got}, want {REQUIRED_SCHEMA_VERSION}");
    if got == 4 && REQUIRED_SCHEMA_VERSION == 5 {
        bail!(IndexError::MissingWholeRef);
    }
    bail!(IndexError::SchemaVersion {
        got,
        want: REQUIRED_SCHEMA_VERSION,
    })
}

/// Stamps an empty store with the current schema version, or checks the
/// version of a store that already holds an index.
pub fn init_schema_version(kv: &dyn KeyValue) -> Result<()> {
    if schema_version(kv)? == 0 && is_empty(kv)? {
        info!("new index, writing schema version {REQUIRED_SCHEMA_VERSION}");
        let val = keys::KEY_SCHEMA_VERSION.val(&[REQUIRED_SCHEMA_VERSION.into()]);
        return kv.set(keys::KEY_SCHEMA_VERSION.name, &val);
    }
    check_schema_version(kv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorted::mem::MemoryKv;

    #[test]
    pub fn test_init_new_index() {
        let kv = MemoryKv::new();
        init_schema_version(&kv).unwrap();
        assert_eq!(kv.get("schemaversion").unwrap(), "5");
        assert_eq!(schema_version(&kv).unwrap(), REQUIRED_SCHEMA_VERSION);
        // idempotent
        init_schema_version(&kv).unwrap();
    }

    #[test]
    pub fn test_unversioned_non_empty_index() {
        let kv = MemoryKv::new();
        kv.set("recpn|x|rt7978-98-97T96:95:94Z|sha1-abc", "").unwrap();
        let err = init_schema_version(&kv).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::SchemaVersion { got: 0, .. })
        ));
        assert!(err.to_string().contains("reindex"));
    }

    #[test]
    pub fn test_old_versions() {
        let kv = MemoryKv::new();
        kv.set("schemaversion", "4").unwrap();
        let err = check_schema_version(&kv).unwrap_err();
        assert!(matches!(err.downcast_ref::<IndexError>(), Some(IndexError::MissingWholeRef)));

        kv.set("schemaversion", "3").unwrap();
        let err = check_schema_version(&kv).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::SchemaVersion { got: 3, want: 5 })
        ));

        kv.set("schemaversion", "five").unwrap();
        assert!(schema_version(&kv).is_err());
    }
}
