//! Watch grouping
//!
//! Targets that share a database and table are watched through one set of
//! subscription keys. Each [`NotificationGroup`] collects the infos of one
//! table keyed by key pattern and becomes the opaque context of its keys, so
//! a keyspace notification leads straight back to the infos it affects.

use std::collections::BTreeMap;
use std::sync::Arc;

use translib_db::{DbNum, Key, Opaque, SKey, TableSpec};

use crate::info::NotificationInfo;

/// Notification infos of one table, by key pattern
#[derive(Debug)]
pub(crate) struct NotificationGroup {
    pub db: DbNum,
    pub table: TableSpec,
    pub infos: BTreeMap<Key, Vec<Arc<NotificationInfo>>>,
}

impl NotificationGroup {
    fn new(db: DbNum, table: TableSpec) -> Self {
        Self {
            db,
            table,
            infos: BTreeMap::new(),
        }
    }

    fn add(&mut self, key: Key, info: Arc<NotificationInfo>) {
        self.infos.entry(key).or_default().push(info);
    }

    /// One subscription key per key pattern, carrying this group as opaque
    pub fn to_skeys(self: &Arc<Self>) -> Vec<SKey> {
        let opaque: Opaque = self.clone();
        self.infos
            .keys()
            .map(|key| SKey::new(self.table.clone(), key.clone()).with_opaque(opaque.clone()))
            .collect()
    }
}

/// Groups being built for one subscribe call
#[derive(Debug, Default)]
pub(crate) struct GroupSet {
    groups: BTreeMap<DbNum, BTreeMap<TableSpec, NotificationGroup>>,
}

impl GroupSet {
    /// Add a store-backed info; others are skipped
    pub fn add(&mut self, info: Arc<NotificationInfo>) {
        let (Some(db), Some(table), Some(key)) = (info.db, info.table.clone(), info.key.clone()) else {
            tracing::trace!(path = %info.path, "not grouping non-db target");
            return;
        };
        self.groups
            .entry(db)
            .or_default()
            .entry(table.clone())
            .or_insert_with(|| NotificationGroup::new(db, table))
            .add(key, info);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Finished groups per database, in database order
    pub fn into_db_groups(self) -> Vec<(DbNum, Vec<Arc<NotificationGroup>>)> {
        self.groups
            .into_iter()
            .map(|(db, tables)| (db, tables.into_values().map(Arc::new).collect()))
            .collect()
    }
}
