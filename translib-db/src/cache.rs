//! Per-connection on-change cache
//!
//! Holds the last value seen for every entry of the tables registered for
//! caching, so a keyspace notification can be turned into an old/new pair.

use std::collections::HashMap;

use crate::key::{Key, Value};

/// Last seen values per (table, key)
#[derive(Debug, Default)]
pub struct OnChangeCache {
    tables: HashMap<String, HashMap<Key, Value>>,
}

impl OnChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start caching a table. Re-registering keeps existing slots.
    pub fn register(&mut self, table: &str) {
        self.tables.entry(table.to_string()).or_default();
    }

    pub fn is_cached(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Cached value, or an empty value when there is no slot
    pub fn get(&self, table: &str, key: &Key) -> Value {
        self.tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Store a value if the table is registered. Returns the previous value.
    pub fn put(&mut self, table: &str, key: &Key, value: Value) -> Value {
        match self.tables.get_mut(table) {
            Some(t) => t.insert(key.clone(), value).unwrap_or_default(),
            None => Value::default(),
        }
    }

    /// Drop a slot, returning the previous value or an empty one
    pub fn remove(&mut self, table: &str, key: &Key) -> Value {
        self.tables
            .get_mut(table)
            .and_then(|t| t.remove(key))
            .unwrap_or_default()
    }

    /// Number of cached entries for a table
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map(HashMap::len).unwrap_or(0)
    }
}
