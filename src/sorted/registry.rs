use std::collections::HashMap;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{buffer, mem, mysql, postgres, sledkv, sqlite, KeyValue, KvConfig, SortedError};

/// Builds a KeyValue from its configuration. The `"type"` key has already
/// been consumed when the constructor runs.
pub type Constructor = fn(KvConfig) -> Result<Box<dyn KeyValue>>;

static CTORS: Lazy<RwLock<HashMap<String, Constructor>>> = Lazy::new(|| {
    let builtin: [(&str, Constructor); 6] = [
        ("memory", mem::new_from_config),
        ("file", sledkv::new_from_config),
        ("sqlite", sqlite::new_from_config),
        ("postgres", postgres::new_from_config),
        ("mysql", mysql::new_from_config),
        ("buffer", buffer::new_from_config),
    ];
    RwLock::new(
        builtin
            .into_iter()
            .map(|(name, ctor)| (name.to_owned(), ctor))
            .collect(),
    )
});

/// Registers a constructor under `typ`. Meant to be called once per type
/// during program start-up; registering a name twice panics.
pub fn register_key_value(typ: &str, ctor: Constructor) {
    let mut ctors = CTORS.write();
    if ctors.contains_key(typ) {
        panic!("{}", SortedError::DuplicateType(typ.to_owned()));
    }
    info!("registered KeyValue type {typ:?}");
    ctors.insert(typ.to_owned(), ctor);
}

/// Constructs the KeyValue selected by the config's `"type"` key.
pub fn new_key_value(mut cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
    let typ = cfg.required_string("type");
    if typ.is_empty() {
        cfg.validate()?;
        bail!(SortedError::InvalidConfig("empty KeyValue type".to_owned()));
    }

    let ctor = match CTORS.read().get(&typ) {
        Some(ctor) => *ctor,
        None => bail!(SortedError::UnknownType(typ)),
    };
    debug!("constructing KeyValue of type {typ:?}");
    ctor(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_kv(cfg: KvConfig) -> Result<Box<dyn KeyValue>> {
        cfg.validate()?;
        Ok(Box::new(mem::MemoryKv::new()))
    }

    #[test]
    pub fn test_unknown_type() {
        let cfg = KvConfig::default().with("type", "no-such-backend");
        let err = new_key_value(cfg).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SortedError>(),
            Some(SortedError::UnknownType(t)) if t == "no-such-backend"
        ));
    }

    #[test]
    pub fn test_missing_type() {
        assert!(new_key_value(KvConfig::default()).is_err());
    }

    #[test]
    pub fn test_memory_builtin() {
        let kv = new_key_value(KvConfig::default().with("type", "memory")).unwrap();
        kv.set("a", "b").unwrap();
        assert_eq!(kv.get("a").unwrap(), "b");
    }

    #[test]
    pub fn test_sql_dialects_registered() {
        let ctors = CTORS.read();
        for typ in ["sqlite", "postgres", "mysql"] {
            assert!(ctors.contains_key(typ), "{typ} not registered");
        }
    }

    #[test]
    pub fn test_register_custom() {
        register_key_value("registry-test", new_test_kv);
        let kv = new_key_value(KvConfig::default().with("type", "registry-test")).unwrap();
        assert!(is_not_found_ok(kv.get("x")));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    pub fn test_register_duplicate_panics() {
        register_key_value("memory", new_test_kv);
    }

    fn is_not_found_ok(res: Result<String>) -> bool {
        match res {
            Err(e) => crate::sorted::is_not_found(&e),
            Ok(_) => false,
        }
    }
}
