//! Store connection traits
//!
//! The subscription engine talks to the backing store only through these
//! traits, so any store with get/scan/keyspace-notification primitives can
//! be plugged in. [`crate::MemoryStore`] is the in-process implementation.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::event::{SKey, WatchHandler, WatchId};
use crate::key::{DbNum, Key, TableSpec, Value};

/// Options used when opening a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbOptions {
    pub db_num: DbNum,
    /// Reject writes through this connection
    pub write_disabled: bool,
    /// Enable the per-connection on-change cache
    pub on_change_enabled: bool,
}

impl DbOptions {
    pub fn new(db_num: DbNum) -> Self {
        Self {
            db_num,
            write_disabled: false,
            on_change_enabled: false,
        }
    }

    pub fn with_write_disabled(mut self) -> Self {
        self.write_disabled = true;
        self
    }

    pub fn with_on_change(mut self) -> Self {
        self.on_change_enabled = true;
        self
    }
}

/// How a scan cursor walks a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanType {
    /// Iterate keys matching the key pattern
    #[default]
    Key,
    /// Iterate field names of the matched entries
    Field,
}

/// Scan cursor options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub scan_type: ScanType,
    /// Glob over field names, used by field scans
    pub field_pattern: Option<String>,
}

impl ScanOptions {
    pub fn keys() -> Self {
        Self::default()
    }

    pub fn fields(pattern: impl Into<String>) -> Self {
        Self {
            scan_type: ScanType::Field,
            field_pattern: Some(pattern.into()),
        }
    }
}

/// Batched iteration over a table
pub trait ScanCursor: Send {
    /// Next batch of keys. The flag is `true` when the scan is complete.
    fn next_keys(&mut self, count_hint: usize) -> Result<(Vec<Key>, bool)>;

    /// Next batch of fields, as one value. The flag is `true` when the scan is complete.
    fn next_fields(&mut self, count_hint: usize) -> Result<(Value, bool)>;
}

/// A live keyspace subscription
pub trait Watch: Send + Sync {
    fn id(&self) -> WatchId;

    /// Stop delivering notifications. The handler receives one
    /// [`crate::SEvent::Close`] afterwards. Calling twice is a no-op.
    fn unsubscribe(&self);
}

/// One open connection to a logical database
pub trait Database: Send + Sync {
    fn db_num(&self) -> DbNum;

    fn is_open(&self) -> bool;

    /// Close the connection; later calls fail with `ConnectionClosed`
    fn close(&self);

    /// Read one entry. Fills the on-change cache when the table is registered.
    fn get_entry(&self, ts: &TableSpec, key: &Key) -> Result<Value>;

    /// Open a cursor over entries matching `pattern`
    fn new_scan_cursor(
        &self,
        ts: &TableSpec,
        pattern: &Key,
        opts: &ScanOptions,
    ) -> Result<Box<dyn ScanCursor>>;

    /// Enable on-change caching for a table on this connection
    fn register_table_for_on_change_caching(&self, ts: &TableSpec) -> Result<()>;

    /// Re-read an entry and refresh its cache slot.
    ///
    /// Returns `(previously cached, current)`. The previous value is empty
    /// when there was no cache slot.
    fn on_change_cache_update(&self, ts: &TableSpec, key: &Key) -> Result<(Value, Value)>;

    /// Drop an entry's cache slot and return the previously cached value
    fn on_change_cache_delete(&self, ts: &TableSpec, key: &Key) -> Result<Value>;

    /// Register a keyspace watch for the given subscription keys
    fn subscribe(&self, skeys: Vec<SKey>, handler: WatchHandler) -> Result<Box<dyn Watch>>;
}

/// Opens connections to the store
pub trait DbConnector: Send + Sync {
    fn open(&self, opts: DbOptions) -> Result<Arc<dyn Database>>;
}

/// One connection per logical database, indexed by [`DbNum`]
#[derive(Clone, Default)]
pub struct DbSet {
    dbs: Vec<Option<Arc<dyn Database>>>,
}

impl DbSet {
    /// Open every database with the same options template
    pub fn open_all(
        connector: &dyn DbConnector,
        write_disabled: bool,
        on_change_enabled: bool,
    ) -> Result<Self> {
        let mut dbs = Vec::with_capacity(DbNum::COUNT);
        for db_num in DbNum::ALL {
            let opts = DbOptions {
                db_num,
                write_disabled,
                on_change_enabled,
            };
            match connector.open(opts) {
                Ok(d) => dbs.push(Some(d)),
                Err(e) => {
                    DbSet { dbs }.close_all();
                    return Err(e);
                }
            }
        }
        Ok(Self { dbs })
    }

    pub fn get(&self, db_num: DbNum) -> Option<&Arc<dyn Database>> {
        self.dbs.get(db_num.index()).and_then(Option::as_ref)
    }

    pub fn close_all(&self) {
        for d in self.dbs.iter().flatten() {
            d.close();
        }
    }
}

impl fmt::Debug for DbSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSet")
            .field("open", &self.dbs.iter().flatten().filter(|d| d.is_open()).count())
            .finish()
    }
}
