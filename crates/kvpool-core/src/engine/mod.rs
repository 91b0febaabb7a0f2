//! Storage engines and the registry that selects them by name
//!
//! Every backend implements [`Engine`]. Capabilities a backend lacks keep
//! the default bodies, which report `NotSupported`.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;

use crate::config::{Config, PoolOptions};
use crate::error::{KvError, KvResult};
use crate::index::{Cursor, HashIndex, KeyRange, OrderedIndex};
use crate::pool::PoolInfo;

mod blackhole;
mod store;

pub use blackhole::Blackhole;
pub use store::Store;

/// A storage backend bound to one pool.
///
/// All methods take `&self`; implementations do their own locking.
pub trait Engine: Send + Sync {
    /// Registry name of the backend.
    fn name(&self) -> &str;

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Run `f` on the stored value. Returns false if the key is absent.
    fn get_with(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> KvResult<bool>;

    /// Returns whether a record was removed.
    fn remove(&self, key: &[u8]) -> KvResult<bool>;

    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let mut value = None;
        self.get_with(key, &mut |v| value = Some(v.to_vec()))?;
        Ok(value)
    }

    fn exists(&self, key: &[u8]) -> KvResult<bool> {
        self.get_with(key, &mut |_| {})
    }

    fn count(&self, range: &KeyRange) -> KvResult<usize> {
        Err(KvError::not_supported(range.count_operation(), self.name()))
    }

    /// Ascending cursor over `range`.
    fn cursor(&self, range: KeyRange) -> KvResult<Box<dyn Cursor>> {
        Err(KvError::not_supported(range.scan_operation(), self.name()))
    }

    /// Force buffered writes to stable storage.
    fn sync(&self) -> KvResult<()> {
        Ok(())
    }

    fn checkpoint(&self) -> KvResult<()> {
        Err(KvError::not_supported("checkpoint", self.name()))
    }

    fn info(&self) -> PoolInfo;

    /// Flush and release the pool. Called once by the owner.
    fn close(&self) -> KvResult<()>;
}

/// Builds an engine from the caller's config.
pub type EngineFactory = Box<dyn Fn(&Config) -> KvResult<Box<dyn Engine>> + Send + Sync>;

/// Maps engine names to factories.
///
/// ```
/// use kvpool_core::{Config, Engine, EngineRegistry};
///
/// let registry = EngineRegistry::with_builtin();
/// let engine = registry.open("blackhole", &Config::new()).unwrap();
/// assert_eq!(engine.name(), "blackhole");
/// ```
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// A registry with no engines.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding `blackhole`, `vsmap`, `vcmap`, `stree` and `cmap`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("blackhole", |_| Ok(Box::new(Blackhole::new()) as Box<dyn Engine>));
        registry.register("vsmap", |config| {
            let opts = PoolOptions::from_config(config)?;
            Ok(Box::new(Store::<OrderedIndex>::volatile("vsmap", &opts)?) as Box<dyn Engine>)
        });
        registry.register("vcmap", |config| {
            let opts = PoolOptions::from_config(config)?;
            Ok(Box::new(Store::<HashIndex>::volatile("vcmap", &opts)?) as Box<dyn Engine>)
        });
        registry.register("stree", |config| {
            let opts = PoolOptions::from_config(config)?;
            Ok(Box::new(Store::<OrderedIndex>::persistent("stree", &opts)?) as Box<dyn Engine>)
        });
        registry.register("cmap", |config| {
            let opts = PoolOptions::from_config(config)?;
            Ok(Box::new(Store::<HashIndex>::persistent("cmap", &opts)?) as Box<dyn Engine>)
        });
        registry
    }

    /// Process-wide registry of the built-in engines.
    pub fn global() -> &'static EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::with_builtin)
    }

    /// Add or replace the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Config) -> KvResult<Box<dyn Engine>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the engine registered under `name`.
    pub fn open(&self, name: &str, config: &Config) -> KvResult<Arc<dyn Engine>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| KvError::WrongEngineName(name.to_string()))?;
        tracing::debug!(engine = name, options = config.len(), "opening engine");
        Ok(Arc::from(factory(config)?))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
