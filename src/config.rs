use std::fs::read_to_string;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{self, Deserialize};
use tracing::{debug, error, info};

use crate::error::ToolError;
use crate::sorted::KvConfig;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/sortedkv/config.toml";

pub static CONFIG: Lazy<RwLock<Configuration>> = Lazy::new(Default::default);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Configuration {
    /// Overrides `RUST_LOG` when set, e.g. "debug" or "sortedkv=trace".
    pub log_level: Option<String>,

    /// The KeyValue to open, in the same shape `new_key_value` takes.
    pub index: Option<toml::Value>,
}

impl Configuration {
    pub fn parse_config_file(file: &str) -> Result<Configuration> {
        info!("parsing configuration file: {}", file);

        let file_contents = read_to_string(file).map_err(|e| {
            error!("failed to read configuration file {file}, err: {e}");
            anyhow!(ToolError::FailedToRead(file.to_owned()))
        })?;

        let ret: Configuration = toml::from_str(&file_contents).map_err(|e| {
            error!("failed to parse configuration file {file}, err: {e}");
            anyhow!(ToolError::InvalidToml {
                file: file.to_owned(),
                msg: e.to_string(),
            })
        })?;

        debug!("configuration: {:?}", ret);
        Ok(ret)
    }

    /// The `[index]` table as a KeyValue config.
    pub fn index_config(&self) -> Result<KvConfig> {
        let index = self.index.as_ref().ok_or(ToolError::MissingIndex)?;
        KvConfig::from_value(serde_json::to_value(index)?)
    }

    /// The `type` of the configured KeyValue, if any.
    pub fn index_type(&self) -> Option<&str> {
        self.index.as_ref()?.get("type")?.as_str()
    }
}

pub fn init_config(config_file: &str) -> Result<()> {
    let conf = Configuration::parse_config_file(config_file)
        .inspect_err(|e| error!("failed to initialize config module, err: {e}"))?;

    *CONFIG.write() = conf;
    info!("successfully initialized config module");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorted::new_key_value;

    #[test]
    pub fn test_config_parse() {
        let config1 = Configuration::parse_config_file("tests/test_config/config1.toml").unwrap();
        assert_eq!(config1.log_level.as_deref(), Some("info"));
        assert_eq!(config1.index_type(), Some("buffer"));

        let mut kv_cfg = config1.index_config().unwrap();
        assert_eq!(kv_cfg.required_string("type"), "buffer");
        assert_eq!(kv_cfg.optional_i64("maxBufferBytes", 0), 1 << 20);
        let mut backing = kv_cfg.required_object("backing");
        assert_eq!(backing.required_string("type"), "file");
    }

    #[test]
    pub fn test_config_builds_kv() {
        let config2 = Configuration::parse_config_file("tests/test_config/config2.toml").unwrap();
        assert!(config2.log_level.is_none());
        let kv = new_key_value(config2.index_config().unwrap()).unwrap();
        kv.set("k", "v").unwrap();
        assert_eq!(kv.get("k").unwrap(), "v");
    }

    #[test]
    pub fn test_config_errors() {
        let err = Configuration::parse_config_file("tests/test_config/no-such.toml").unwrap_err();
        assert!(matches!(err.downcast_ref::<ToolError>(), Some(ToolError::FailedToRead(_))));

        let err = Configuration::default().index_config().unwrap_err();
        assert!(matches!(err.downcast_ref::<ToolError>(), Some(ToolError::MissingIndex)));
    }

    #[test]
    pub fn test_init_config() {
        init_config("tests/test_config/config2.toml").unwrap();
        assert_eq!(CONFIG.read().index_type(), Some("buffer"));
    }
}
