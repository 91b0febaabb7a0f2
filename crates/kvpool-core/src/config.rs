//! Configuration for opening a pool
//!
//! A [`Config`] is a loosely built bag of named options whose values are
//! either strings or unsigned 64-bit integers. Type mismatches are rejected
//! when the config is built, not deep inside `open()`. [`PoolOptions`] is the
//! validated, typed view an engine factory consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::{KvError, KvResult};

/// Smallest pool an engine will create (8 MiB)
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Largest pool an engine will create (1 TiB)
pub const MAX_POOL_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// A typed config value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    String(String),
    UInt64(u64),
}

impl ConfigValue {
    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::String(_) => "string",
            ConfigValue::UInt64(_) => "unsigned integer",
        }
    }
}

/// Named engine options.
///
/// Keys are unique; putting an existing key replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    entries: BTreeMap<String, ConfigValue>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object such as `{"path": "/dev/shm/pool", "size": 1073741824}`.
    ///
    /// Invalid JSON or a non-object document is a parsing error. Members that
    /// are neither strings nor integers in `0..=u64::MAX` are type errors.
    pub fn from_json(text: &str) -> KvResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| KvError::ConfigParsing(format!("invalid JSON: {}", e)))?;
        Self::from_json_value(&value)
    }

    /// Build a config from an already parsed JSON value.
    pub fn from_json_value(value: &Value) -> KvResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| KvError::ConfigParsing("config must be a JSON object".into()))?;

        let mut config = Config::new();
        for (key, member) in object {
            match member {
                Value::String(s) => config.put_string(key, s.as_str()),
                Value::Number(n) => match n.as_u64() {
                    Some(n) => config.put_uint64(key, n),
                    None => {
                        return Err(KvError::ConfigType {
                            key: key.clone(),
                            expected: "string or unsigned integer",
                        })
                    }
                },
                _ => {
                    return Err(KvError::ConfigType {
                        key: key.clone(),
                        expected: "string or unsigned integer",
                    })
                }
            };
        }
        Ok(config)
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), ConfigValue::String(value.into()));
        self
    }

    pub fn put_uint64(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.entries.insert(key.into(), ConfigValue::UInt64(value));
        self
    }

    /// Builder-style [`Config::put_string`].
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_string(key, value);
        self
    }

    /// Builder-style [`Config::put_uint64`].
    pub fn with_uint64(mut self, key: impl Into<String>, value: u64) -> Self {
        self.put_uint64(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    /// String option, `None` if absent, a type error if it holds a number.
    pub fn get_string(&self, key: &str) -> KvResult<Option<&str>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(ConfigValue::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(KvError::ConfigType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Integer option, `None` if absent, a type error if it holds a string.
    pub fn get_uint64(&self, key: &str) -> KvResult<Option<u64>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(ConfigValue::UInt64(n)) => Ok(Some(*n)),
            Some(_) => Err(KvError::ConfigType {
                key: key.to_string(),
                expected: "unsigned integer",
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// When WAL appends reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Every put/remove is synced before it returns.
    Sync,
    /// Appends land in the OS cache; synced on checkpoint, `sync()` and stop.
    Buffered,
}

/// Validated options an engine factory consumes.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Pool directory (persistent engines) or scratch directory (volatile)
    pub path: Option<PathBuf>,
    /// Requested capacity in bytes; 0 means "use what the pool already has"
    pub size: u64,
    pub durability: Durability,
    pub max_key_size: usize,
    pub max_value_size: usize,
    /// WAL segment rotation threshold (bytes)
    pub wal_segment_size: u64,
    /// Background checkpoint cadence in milliseconds; 0 disables it
    pub checkpoint_interval_ms: u64,
}

const KNOWN_KEYS: &[&str] = &[
    "path",
    "size",
    "durability",
    "max_key_size",
    "max_value_size",
    "wal_segment_size",
    "checkpoint_interval_ms",
];

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            path: None,
            size: 0,
            durability: Durability::Sync,
            max_key_size: 64 * 1024,
            max_value_size: 64 * 1024 * 1024,
            wal_segment_size: 64 * 1024 * 1024,
            checkpoint_interval_ms: 0,
        }
    }
}

impl PoolOptions {
    /// Extract and validate options from a config.
    ///
    /// Unknown keys are ignored. Type mismatches on known keys are errors.
    pub fn from_config(config: &Config) -> KvResult<Self> {
        let mut opts = PoolOptions::default();

        for (key, value) in config.iter() {
            if !KNOWN_KEYS.contains(&key) {
                tracing::warn!(option = key, kind = value.kind(), "ignoring unknown config option");
            }
        }

        opts.path = config.get_string("path")?.map(PathBuf::from);
        if let Some(size) = config.get_uint64("size")? {
            opts.size = size;
        }
        if let Some(mode) = config.get_string("durability")? {
            opts.durability = match mode {
                "sync" => Durability::Sync,
                "buffered" => Durability::Buffered,
                other => {
                    return Err(KvError::InvalidArgument(format!(
                        "durability must be \"sync\" or \"buffered\", got {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(n) = config.get_uint64("max_key_size")? {
            opts.max_key_size = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(n) = config.get_uint64("max_value_size")? {
            opts.max_value_size = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(n) = config.get_uint64("wal_segment_size")? {
            opts.wal_segment_size = n;
        }
        if let Some(n) = config.get_uint64("checkpoint_interval_ms")? {
            opts.checkpoint_interval_ms = n;
        }

        opts.validate()?;
        Ok(opts)
    }

    /// Validate all tunables. `path` and `size` are checked by the pool manager.
    pub fn validate(&self) -> KvResult<()> {
        if self.size != 0 && !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&self.size) {
            return Err(KvError::InvalidArgument(format!(
                "size must be in [{}, {}] bytes, got {}",
                MIN_POOL_SIZE, MAX_POOL_SIZE, self.size
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > 16 * 1024 * 1024 {
            return Err(KvError::InvalidArgument("max_key_size must be in [1, 16MB]".into()));
        }
        if self.max_value_size == 0 || self.max_value_size > 1024 * 1024 * 1024 {
            return Err(KvError::InvalidArgument("max_value_size must be in [1, 1GB]".into()));
        }
        if self.wal_segment_size < 1024 * 1024 {
            return Err(KvError::InvalidArgument("wal_segment_size must be >= 1MB".into()));
        }
        Ok(())
    }

    /// The configured path, or a parsing error naming the missing option.
    pub fn require_path(&self) -> KvResult<&PathBuf> {
        self.path
            .as_ref()
            .ok_or_else(|| KvError::ConfigParsing("config does not include a valid \"path\" string".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn test_from_json() {
        let config = Config::from_json(r#"{"path": "/dev/shm", "size": 1073741824}"#).unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.get_string("path").unwrap(), Some("/dev/shm"));
        assert_eq!(config.get_uint64("size").unwrap(), Some(1073741824));
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        let err = Config::from_json("[1, 2, 3]").unwrap_err();
        assert_eq!(err.status(), Status::ConfigParsingError);
        let err = Config::from_json("{not json").unwrap_err();
        assert_eq!(err.status(), Status::ConfigParsingError);
    }

    #[test]
    fn test_from_json_rejects_other_value_kinds() {
        for text in [
            r#"{"size": -1}"#,
            r#"{"size": 1.5}"#,
            r#"{"flag": true}"#,
            r#"{"nested": {"a": 1}}"#,
            r#"{"path": null}"#,
        ] {
            let err = Config::from_json(text).unwrap_err();
            assert_eq!(err.status(), Status::ConfigTypeError, "{}", text);
        }
    }

    #[test]
    fn test_typed_getters() {
        let config = Config::new().with_uint64("path", 1234).with_string("size", "big");
        assert_eq!(config.get_string("path").unwrap_err().status(), Status::ConfigTypeError);
        assert_eq!(config.get_uint64("size").unwrap_err().status(), Status::ConfigTypeError);
        assert_eq!(config.get_string("missing").unwrap(), None);
    }

    #[test]
    fn test_put_replaces() {
        let mut config = Config::new();
        config.put_string("path", "/a").put_string("path", "/b");
        assert_eq!(config.len(), 1);
        assert_eq!(config.get_string("path").unwrap(), Some("/b"));
    }

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::from_config(&Config::new().with_string("path", "/tmp")).unwrap();
        assert_eq!(opts.durability, Durability::Sync);
        assert_eq!(opts.size, 0);
        assert_eq!(opts.checkpoint_interval_ms, 0);
        assert!(PoolOptions::default().validate().is_ok());
    }

    #[test]
    fn test_pool_options_wrong_path_type() {
        let err = PoolOptions::from_config(&Config::new().with_uint64("path", 1234)).unwrap_err();
        assert_eq!(err.status(), Status::ConfigTypeError);
    }

    #[test]
    fn test_pool_options_size_bounds() {
        let tiny = Config::new().with_uint64("size", MIN_POOL_SIZE - 1);
        assert_eq!(PoolOptions::from_config(&tiny).unwrap_err().status(), Status::InvalidArgument);
        let huge = Config::new().with_uint64("size", 9_223_372_036_854_775_807);
        assert_eq!(PoolOptions::from_config(&huge).unwrap_err().status(), Status::InvalidArgument);
        let ok = Config::new().with_uint64("size", MIN_POOL_SIZE);
        assert_eq!(PoolOptions::from_config(&ok).unwrap().size, MIN_POOL_SIZE);
    }

    #[test]
    fn test_pool_options_durability() {
        let cfg = Config::new().with_string("durability", "buffered");
        assert_eq!(PoolOptions::from_config(&cfg).unwrap().durability, Durability::Buffered);
        let cfg = Config::new().with_string("durability", "sometimes");
        assert_eq!(PoolOptions::from_config(&cfg).unwrap_err().status(), Status::InvalidArgument);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg = Config::new().with_string("path", "/tmp").with_uint64("colour", 3);
        assert!(PoolOptions::from_config(&cfg).is_ok());
    }

    #[test]
    fn test_require_path() {
        let opts = PoolOptions::default();
        assert_eq!(opts.require_path().unwrap_err().status(), Status::ConfigParsingError);
    }
}
