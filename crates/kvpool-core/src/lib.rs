//! kvpool core, an embedded persistent key-value storage engine
//!
//! Records are byte-string pairs held in pools. Each pool is bound to one
//! engine, chosen by name from an [`EngineRegistry`]:
//!
//! - `blackhole` stores nothing
//! - `vsmap` / `vcmap` are volatile sorted / hashed maps
//! - `stree` / `cmap` are their persistent counterparts, backed by a
//!   CRC32C-checked write-ahead log and periodic checkpoints
//!
//! # Architecture
//!
//! - **Read path**: served from the in-memory index
//! - **Write path**: WAL append (synced per the pool's durability mode),
//!   then index update, under one journal lock
//! - **Recovery**: checkpoint load, WAL replay, torn-tail truncation
//!
//! Every operation resolves to one [`Status`]; failures carry a
//! [`KvError`] with a diagnostic message.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
pub mod journal;
pub mod platform_durability;
pub mod pool;
pub mod wal;

// Re-export key types for convenience
pub use config::{Config, ConfigValue, Durability, PoolOptions};
pub use db::{Database, Keys, Records};
pub use engine::{Blackhole, Engine, EngineFactory, EngineRegistry, Store};
pub use error::{KvError, KvResult, Status};
pub use index::{Cursor, HashIndex, KeyIndex, KeyRange, OrderedIndex};
pub use pool::{PoolInfo, PoolState};

pub use std::ops::ControlFlow;
