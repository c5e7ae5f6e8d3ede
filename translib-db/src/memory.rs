//! In-process store with keyspace notifications
//!
//! [`MemoryStore`] keeps every logical database in memory and implements the
//! connection traits of this crate. Writes go through the store handle and
//! fire keyspace notifications to matching watches on the writer's thread,
//! after all internal locks are released.
//!
//! # Example
//!
//! ```rust
//! use translib_db::{Database, DbConnector, DbNum, DbOptions, Key, MemoryStore, TableSpec, Value};
//!
//! let store = MemoryStore::new();
//! let port = TableSpec::new("PORT");
//! store.set_entry(DbNum::ConfigDb, &port, &Key::new(["Ethernet0"]),
//!     Value::from_pairs([("mtu", "9100")]));
//!
//! let db = store.connector().open(DbOptions::new(DbNum::ConfigDb)).unwrap();
//! let v = db.get_entry(&port, &Key::new(["Ethernet0"])).unwrap();
//! assert_eq!(v.get("mtu"), Some("9100"));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::OnChangeCache;
use crate::database::{Database, DbConnector, DbOptions, ScanCursor, ScanOptions, ScanType, Watch};
use crate::error::{DbError, Result};
use crate::event::{SEvent, SKey, WatchHandler, WatchId};
use crate::key::{glob_match, DbNum, Key, TableSpec, Value};

type Table = BTreeMap<Key, Value>;

struct WatchEntry {
    id: WatchId,
    db: DbNum,
    skeys: Vec<SKey>,
    handler: WatchHandler,
    active: AtomicBool,
}

#[derive(Default)]
struct StoreInner {
    data: RwLock<HashMap<(DbNum, String), Table>>,
    watches: Mutex<Vec<Arc<WatchEntry>>>,
    next_watch_id: AtomicU64,
    failing_subscribe: Mutex<HashSet<DbNum>>,
}

impl StoreInner {
    fn read(&self, db: DbNum, table: &str, key: &Key) -> Option<Value> {
        self.data
            .read()
            .get(&(db, table.to_string()))
            .and_then(|t| t.get(key))
            .cloned()
    }

    fn remove_watch(&self, id: WatchId) {
        self.watches.lock().retain(|w| w.id != id);
    }

    /// Deliver one event to every active watch whose patterns match
    fn notify(&self, db: DbNum, table: &str, key: &Key, event: SEvent) {
        let targets: Vec<(WatchId, WatchHandler, SKey)> = {
            let watches = self.watches.lock();
            watches
                .iter()
                .filter(|w| w.db == db && w.active.load(Ordering::SeqCst))
                .flat_map(|w| {
                    w.skeys
                        .iter()
                        .filter(|sk| sk.ts.name == table && key.matches(&sk.key))
                        .map(|sk| (w.id, w.handler.clone(), sk.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        tracing::trace!(
            db = %db, table, key = %key, event = %event, watches = targets.len(),
            "keyspace notification"
        );

        for (id, handler, skey) in targets {
            handler(id, &skey, key, event);
        }
    }
}

/// In-memory store shared by all connections opened from it
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening connections to this store
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.inner.clone(),
        }
    }

    /// Replace an entry. An empty value deletes it.
    pub fn set_entry(&self, db: DbNum, ts: &TableSpec, key: &Key, value: Value) {
        if !value.is_populated() {
            self.delete_entry(db, ts, key);
            return;
        }
        self.inner
            .data
            .write()
            .entry((db, ts.name.clone()))
            .or_default()
            .insert(key.clone(), value);
        self.inner.notify(db, &ts.name, key, SEvent::HSet);
    }

    /// Merge fields into an entry, creating it if needed
    pub fn mod_entry(&self, db: DbNum, ts: &TableSpec, key: &Key, value: Value) {
        if !value.is_populated() {
            return;
        }
        {
            let mut data = self.inner.data.write();
            let entry = data
                .entry((db, ts.name.clone()))
                .or_default()
                .entry(key.clone())
                .or_default();
            entry.fields.extend(value.fields);
        }
        self.inner.notify(db, &ts.name, key, SEvent::HSet);
    }

    /// Remove fields from an entry. Removing the last field deletes the entry.
    pub fn delete_fields(&self, db: DbNum, ts: &TableSpec, key: &Key, fields: &[&str]) {
        let (removed, emptied) = {
            let mut data = self.inner.data.write();
            let Some(table) = data.get_mut(&(db, ts.name.clone())) else {
                return;
            };
            let Some(entry) = table.get_mut(key) else {
                return;
            };
            let removed = fields.iter().filter(|f| entry.remove(f).is_some()).count();
            let emptied = !entry.is_populated();
            if emptied {
                table.remove(key);
            }
            (removed, emptied)
        };

        if removed > 0 {
            self.inner.notify(db, &ts.name, key, SEvent::HDel);
        }
        if emptied {
            self.inner.notify(db, &ts.name, key, SEvent::Del);
        }
    }

    /// Delete an entry
    pub fn delete_entry(&self, db: DbNum, ts: &TableSpec, key: &Key) {
        let existed = self
            .inner
            .data
            .write()
            .get_mut(&(db, ts.name.clone()))
            .and_then(|t| t.remove(key))
            .is_some();
        if existed {
            self.inner.notify(db, &ts.name, key, SEvent::Del);
        }
    }

    /// Current value of an entry
    pub fn get(&self, db: DbNum, ts: &TableSpec, key: &Key) -> Option<Value> {
        self.inner.read(db, &ts.name, key)
    }

    /// Fail every watch covering `ts`: each receives one [`SEvent::Err`] and
    /// no further notifications.
    pub fn inject_error(&self, db: DbNum, ts: &TableSpec) {
        let failed: Vec<Arc<WatchEntry>> = {
            let mut watches = self.inner.watches.lock();
            let (failed, kept): (Vec<_>, Vec<_>) = watches.drain(..).partition(|w| {
                w.db == db && w.skeys.iter().any(|sk| sk.ts.name == ts.name)
            });
            *watches = kept;
            failed
        };

        for w in failed {
            if !w.active.swap(false, Ordering::SeqCst) {
                continue;
            }
            tracing::debug!(watch = %w.id, db = %db, table = %ts.name, "injecting watch error");
            if let Some(sk) = w.skeys.iter().find(|sk| sk.ts.name == ts.name) {
                (w.handler)(w.id, sk, &sk.key, SEvent::Err);
            }
        }
    }

    /// Make subsequent `subscribe` calls on `db` fail (or succeed again)
    pub fn set_subscribe_failure(&self, db: DbNum, fail: bool) {
        let mut failing = self.inner.failing_subscribe.lock();
        if fail {
            failing.insert(db);
        } else {
            failing.remove(&db);
        }
    }

    /// Number of live watches
    pub fn watch_count(&self) -> usize {
        self.inner.watches.lock().len()
    }
}

/// [`DbConnector`] for a [`MemoryStore`]
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<StoreInner>,
}

impl DbConnector for MemoryConnector {
    fn open(&self, opts: DbOptions) -> Result<Arc<dyn Database>> {
        Ok(Arc::new(MemoryDb {
            store: self.store.clone(),
            opts,
            open: AtomicBool::new(true),
            cache: Mutex::new(OnChangeCache::new()),
        }))
    }
}

/// Connection to one logical database of a [`MemoryStore`]
pub struct MemoryDb {
    store: Arc<StoreInner>,
    opts: DbOptions,
    open: AtomicBool,
    cache: Mutex<OnChangeCache>,
}

impl MemoryDb {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DbError::ConnectionClosed)
        }
    }

    fn ensure_on_change(&self) -> Result<()> {
        self.ensure_open()?;
        if self.opts.on_change_enabled {
            Ok(())
        } else {
            Err(DbError::OnChangeDisabled)
        }
    }

    fn read(&self, ts: &TableSpec, key: &Key) -> Result<Value> {
        self.store
            .read(self.opts.db_num, &ts.name, key)
            .ok_or_else(|| DbError::NotFound {
                table: ts.name.clone(),
                key: key.clone(),
            })
    }
}

impl Database for MemoryDb {
    fn db_num(&self) -> DbNum {
        self.opts.db_num
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::trace!(db = %self.opts.db_num, "connection closed");
        }
    }

    fn get_entry(&self, ts: &TableSpec, key: &Key) -> Result<Value> {
        self.ensure_open()?;
        let value = self.read(ts, key)?;
        if self.opts.on_change_enabled {
            self.cache.lock().put(&ts.name, key, value.clone());
        }
        Ok(value)
    }

    fn new_scan_cursor(
        &self,
        ts: &TableSpec,
        pattern: &Key,
        opts: &ScanOptions,
    ) -> Result<Box<dyn ScanCursor>> {
        self.ensure_open()?;
        let data = self.store.data.read();
        let table = data.get(&(self.opts.db_num, ts.name.clone()));
        let matching = table
            .into_iter()
            .flat_map(|t| t.iter())
            .filter(|(k, _)| k.matches(pattern));

        let cursor = match opts.scan_type {
            ScanType::Key => MemoryCursor {
                keys: matching.map(|(k, _)| k.clone()).collect(),
                fields: VecDeque::new(),
            },
            ScanType::Field => {
                let field_pattern = opts.field_pattern.as_deref().unwrap_or("*");
                MemoryCursor {
                    keys: VecDeque::new(),
                    fields: matching
                        .flat_map(|(_, v)| v.fields.iter())
                        .filter(|(f, _)| glob_match(field_pattern, f))
                        .map(|(f, v)| (f.clone(), v.clone()))
                        .collect(),
                }
            }
        };
        Ok(Box::new(cursor))
    }

    fn register_table_for_on_change_caching(&self, ts: &TableSpec) -> Result<()> {
        self.ensure_on_change()?;
        tracing::trace!(db = %self.opts.db_num, table = %ts.name, "caching table");
        self.cache.lock().register(&ts.name);
        Ok(())
    }

    fn on_change_cache_update(&self, ts: &TableSpec, key: &Key) -> Result<(Value, Value)> {
        self.ensure_on_change()?;
        let current = self.read(ts, key)?;
        let previous = self.cache.lock().put(&ts.name, key, current.clone());
        Ok((previous, current))
    }

    fn on_change_cache_delete(&self, ts: &TableSpec, key: &Key) -> Result<Value> {
        self.ensure_on_change()?;
        Ok(self.cache.lock().remove(&ts.name, key))
    }

    fn subscribe(&self, skeys: Vec<SKey>, handler: WatchHandler) -> Result<Box<dyn Watch>> {
        self.ensure_open()?;
        let db = self.opts.db_num;
        if self.store.failing_subscribe.lock().contains(&db) {
            return Err(DbError::SubscribeFailed {
                db,
                reason: "keyspace subscription rejected".to_string(),
            });
        }

        let id = WatchId::new(self.store.next_watch_id.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = Arc::new(WatchEntry {
            id,
            db,
            skeys,
            handler,
            active: AtomicBool::new(true),
        });
        self.store.watches.lock().push(entry.clone());
        tracing::debug!(watch = %id, db = %db, patterns = entry.skeys.len(), "watch registered");

        Ok(Box::new(MemoryWatch {
            entry,
            store: self.store.clone(),
        }))
    }
}

struct MemoryWatch {
    entry: Arc<WatchEntry>,
    store: Arc<StoreInner>,
}

impl Watch for MemoryWatch {
    fn id(&self) -> WatchId {
        self.entry.id
    }

    fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.store.remove_watch(self.entry.id);
        tracing::debug!(watch = %self.entry.id, "watch closed");
        if let Some(sk) = self.entry.skeys.first() {
            (self.entry.handler)(self.entry.id, sk, &sk.key, SEvent::Close);
        }
    }
}

struct MemoryCursor {
    keys: VecDeque<Key>,
    fields: VecDeque<(String, String)>,
}

impl ScanCursor for MemoryCursor {
    fn next_keys(&mut self, count_hint: usize) -> Result<(Vec<Key>, bool)> {
        let n = count_hint.max(1).min(self.keys.len());
        let batch: Vec<Key> = self.keys.drain(..n).collect();
        Ok((batch, self.keys.is_empty()))
    }

    fn next_fields(&mut self, count_hint: usize) -> Result<(Value, bool)> {
        let n = count_hint.max(1).min(self.fields.len());
        let batch = Value::from_pairs(self.fields.drain(..n));
        Ok((batch, self.fields.is_empty()))
    }
}
