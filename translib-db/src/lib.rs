//! # Translib DB
//!
//! The key-value store boundary of translib. The subscription engine only
//! needs a handful of primitives from the store: point reads, cursor scans,
//! keyspace notifications and a per-connection cache of last seen values.
//! They are expressed here as traits so the engine can run against any
//! store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ open  ┌──────────────┐ subscribe ┌─────────────┐
//! │ DbConnector │──────>│   Database   │──────────>│    Watch    │
//! └─────────────┘       │ get / scan   │           │ (SEvent cb) │
//!                       │ on-change $  │           └─────────────┘
//!                       └──────────────┘
//! ```
//!
//! [`MemoryStore`] implements all of it in process and is what the tests
//! and demos run against.

pub mod cache;
pub mod database;
pub mod error;
pub mod event;
pub mod key;
pub mod memory;

pub use cache::OnChangeCache;
pub use database::{Database, DbConnector, DbOptions, DbSet, ScanCursor, ScanOptions, ScanType, Watch};
pub use error::{DbError, Result};
pub use event::{Opaque, SEvent, SKey, WatchHandler, WatchId};
pub use key::{glob_match, DbNum, Key, TableSpec, Value};
pub use memory::{MemoryConnector, MemoryDb, MemoryStore};
