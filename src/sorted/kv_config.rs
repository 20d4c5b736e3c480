use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};

use super::SortedError;

/// Configuration object handed to a KeyValue constructor.
///
/// Accessors remember which keys were read so that [`KvConfig::validate`]
/// can reject keys nobody asked for, and report required keys that were
/// missing or of the wrong type.
#[derive(Debug, Clone, Default)]
pub struct KvConfig {
    obj: Map<String, Value>,
    used: BTreeSet<String>,
    errors: Vec<String>,
}

impl KvConfig {
    pub fn new(obj: Map<String, Value>) -> Self {
        Self {
            obj,
            used: BTreeSet::new(),
            errors: vec![],
        }
    }

    pub fn from_value(v: Value) -> Result<Self> {
        match v {
            Value::Object(obj) => Ok(Self::new(obj)),
            other => bail!(SortedError::InvalidConfig(format!(
                "expected an object, got {other}"
            ))),
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }

    /// Adds or replaces a key; handy when building configs in code.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.obj.insert(key.to_owned(), value.into());
        self
    }

    fn lookup(&mut self, key: &str) -> Option<&Value> {
        self.used.insert(key.to_owned());
        self.obj.get(key)
    }

    pub fn required_string(&mut self, key: &str) -> String {
        match self.lookup(key).cloned() {
            Some(Value::String(s)) => s,
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be a string"));
                String::new()
            }
            None => {
                self.errors.push(format!("missing required config key {key:?}"));
                String::new()
            }
        }
    }

    pub fn optional_string(&mut self, key: &str, default: &str) -> String {
        match self.lookup(key).cloned() {
            Some(Value::String(s)) => s,
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be a string"));
                default.to_owned()
            }
            None => default.to_owned(),
        }
    }

    pub fn optional_bool(&mut self, key: &str, default: bool) -> bool {
        match self.lookup(key).cloned() {
            Some(Value::Bool(b)) => b,
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be a boolean"));
                default
            }
            None => default,
        }
    }

    pub fn optional_i64(&mut self, key: &str, default: i64) -> i64 {
        match self.lookup(key).cloned() {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => i,
                None => {
                    self.errors.push(format!("expected config key {key:?} to be an integer"));
                    default
                }
            },
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be an integer"));
                default
            }
            None => default,
        }
    }

    /// Like [`KvConfig::optional_i64`], but also rejects values that do not
    /// fit in `T`.
    pub fn optional_int<T: TryFrom<i64>>(&mut self, key: &str, default: T) -> T {
        if !self.obj.contains_key(key) {
            self.used.insert(key.to_owned());
            return default;
        }
        let errors = self.errors.len();
        let i = self.optional_i64(key, 0);
        if self.errors.len() > errors {
            return default;
        }
        match T::try_from(i) {
            Ok(v) => v,
            Err(_) => {
                self.errors
                    .push(format!("config key {key:?} is out of range: {i}"));
                default
            }
        }
    }

    pub fn required_object(&mut self, key: &str) -> KvConfig {
        match self.lookup(key).cloned() {
            Some(Value::Object(obj)) => KvConfig::new(obj),
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be an object"));
                KvConfig::default()
            }
            None => {
                self.errors.push(format!("missing required config key {key:?}"));
                KvConfig::default()
            }
        }
    }

    pub fn optional_object(&mut self, key: &str) -> Option<KvConfig> {
        match self.lookup(key).cloned() {
            Some(Value::Object(obj)) => Some(KvConfig::new(obj)),
            Some(_) => {
                self.errors.push(format!("expected config key {key:?} to be an object"));
                None
            }
            None => None,
        }
    }

    /// Fails if any accessor recorded an error or if the object holds keys
    /// that were never read.
    pub fn validate(&self) -> Result<()> {
        let mut errors = self.errors.clone();
        for key in self.obj.keys() {
            if !self.used.contains(key) {
                errors.push(format!("unknown config key {key:?}"));
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!(SortedError::InvalidConfig(errors.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    pub fn test_accessors() {
        let mut cfg = KvConfig::from_value(json!({
            "type": "postgres",
            "host": "db.example",
            "port": 6543,
            "serial": true,
        }))
        .unwrap();

        assert_eq!(cfg.required_string("type"), "postgres");
        assert_eq!(cfg.required_string("host"), "db.example");
        assert_eq!(cfg.optional_string("sslmode", "prefer"), "prefer");
        assert_eq!(cfg.optional_i64("port", 5432), 6543);
        assert!(cfg.optional_bool("serial", false));
        cfg.validate().unwrap();
    }

    #[test]
    pub fn test_validate_reports_unknown_and_missing() {
        let mut cfg = KvConfig::from_json(r#"{"type": "file", "bogus": 1}"#).unwrap();
        cfg.required_string("type");
        cfg.required_string("file");

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("missing required config key \"file\""), "{err}");
        assert!(err.contains("unknown config key \"bogus\""), "{err}");
    }

    #[test]
    pub fn test_wrong_type() {
        let mut cfg = KvConfig::default().with("maxBufferBytes", "lots");
        assert_eq!(cfg.optional_i64("maxBufferBytes", 7), 7);
        assert!(cfg.validate().is_err());
    }

    #[test]
    pub fn test_optional_int_range() {
        let mut cfg = KvConfig::from_value(json!({"port": 70000, "poolSize": -1, "ok": 12})).unwrap();
        assert_eq!(cfg.optional_int::<u16>("port", 5432), 5432);
        assert_eq!(cfg.optional_int::<u32>("poolSize", 8), 8);
        assert_eq!(cfg.optional_int::<u32>("ok", 8), 12);
        assert_eq!(cfg.optional_int::<u32>("absent", 8), 8);

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("\"port\" is out of range: 70000"), "{err}");
        assert!(err.contains("\"poolSize\" is out of range: -1"), "{err}");
    }

    #[test]
    pub fn test_optional_object() {
        let mut cfg = KvConfig::from_value(json!({"inner": {"type": "memory"}, "flat": 3})).unwrap();
        let mut inner = cfg.optional_object("inner").unwrap();
        assert_eq!(inner.required_string("type"), "memory");
        assert!(cfg.optional_object("absent").is_none());
        assert!(cfg.optional_object("flat").is_none());

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("\"flat\" to be an object"), "{err}");
    }

    #[test]
    pub fn test_not_an_object() {
        assert!(KvConfig::from_json("[1, 2]").is_err());
    }
}
