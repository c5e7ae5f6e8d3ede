//! Per-path notification policy
//!
//! A [`NotificationInfo`] is a validated [`PathTarget`] bound to the app
//! module that produced it, plus a [`NotificationFlags`] decision table
//! computed once from the target's shape. Change processing only ever
//! branches on these flags.

use std::fmt;
use std::sync::Arc;

use translib_db::{DbNum, Key, Opaque, TableSpec};
use translib_path::{str_has_wildcard_key, Path};

use crate::app::{AppModule, DeleteAction, FieldMapping, OnChangeHandler, PathTarget};

/// Behavioral flags of one notification target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationFlags {
    /// Path addresses a leaf
    pub leaf_path: bool,
    /// Path has wildcard keys
    pub wildcard_path: bool,
    /// Some field mapping prefix has wildcard keys
    pub wildcard_subpath: bool,
    /// An entry delete is not a path delete
    pub delete_as_update: bool,
    /// The entry backs only part of the path's subtree
    pub partial: bool,
    /// Some fields hold list keys
    pub key_fields: bool,
    /// Path is served by a dynamic (partly computed) source
    pub dynamic: bool,
}

impl NotificationFlags {
    fn for_target(target: &PathTarget, path: &Path) -> Self {
        let mut flags = NotificationFlags {
            leaf_path: target.is_leaf_path(),
            wildcard_path: path.has_wildcard_key(),
            dynamic: target.dynamic,
            ..Default::default()
        };

        for m in &target.field_mappings {
            if str_has_wildcard_key(&m.rel_path) {
                flags.wildcard_subpath = true;
            }
            if m.fields.values().any(|leaf| leaf.starts_with('{')) {
                flags.key_fields = true;
            }
        }

        match target.delete_action {
            Some(DeleteAction::InspectPath) => flags.delete_as_update = true,
            Some(DeleteAction::InspectLeaf) => {
                flags.delete_as_update = true;
                flags.partial = true;
            }
            None => {}
        }
        flags
    }
}

impl fmt::Display for NotificationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.leaf_path, "leaf"),
            (self.wildcard_path, "wildcard"),
            (self.wildcard_subpath, "wildcard-subpath"),
            (self.delete_as_update, "delete-as-update"),
            (self.partial, "partial"),
            (self.key_fields, "key-fields"),
            (self.dynamic, "dynamic"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        write!(f, "[{}]", set.join("|"))
    }
}

/// A translated target ready for initial sync and change processing
#[derive(Clone)]
pub(crate) struct NotificationInfo {
    pub flags: NotificationFlags,
    pub path: Path,
    pub db: Option<DbNum>,
    pub table: Option<TableSpec>,
    pub key: Option<Key>,
    /// Field mappings with relative paths normalized to start with `/`
    pub fields: Vec<FieldMapping>,
    pub handler: Option<OnChangeHandler>,
    pub app: Arc<dyn AppModule>,
    pub opaque: Option<Opaque>,
    pub field_scan_pattern: Option<String>,
    pub key_group: Vec<usize>,
}

impl NotificationInfo {
    /// Returns `None` for a target without a path
    pub fn new(target: &PathTarget, app: Arc<dyn AppModule>) -> Option<Self> {
        let path = target.path.clone()?;
        let flags = NotificationFlags::for_target(target, &path);
        let fields = target
            .field_mappings
            .iter()
            .map(|m| {
                let mut m = m.clone();
                if !m.rel_path.is_empty() && !m.rel_path.starts_with('/') {
                    m.rel_path.insert(0, '/');
                }
                m
            })
            .collect();

        Some(Self {
            flags,
            path,
            db: target.db,
            table: target.table.clone(),
            key: target.key.clone(),
            fields,
            handler: target.handler.clone(),
            app,
            opaque: target.opaque.clone(),
            field_scan_pattern: target.field_scan_pattern.clone(),
            key_group: target.key_group.clone(),
        })
    }

    pub fn is_non_db(&self) -> bool {
        self.db.is_none() || self.table.is_none() || self.key.is_none()
    }

    /// Store fields mapped to list keys
    pub fn key_field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().flat_map(|m| {
            m.fields
                .iter()
                .filter(|(_, leaf)| leaf.starts_with('{'))
                .map(|(field, _)| field.as_str())
        })
    }

    /// Copy usable for a direct fetch of a dynamic source: a wildcard last
    /// element is dropped and the wildcard flag cleared
    pub fn for_dynamic_fetch(&self) -> NotificationInfo {
        let mut info = self.clone();
        if !self.flags.wildcard_path {
            return info;
        }
        let n = self.path.len();
        if n > 1 && self.path.has_wildcard_at(n - 1) {
            info.path = self.path.sub_path(0, n - 1);
        }
        info.flags.wildcard_path = false;
        info
    }
}

impl fmt::Debug for NotificationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationInfo")
            .field("path", &self.path.to_string())
            .field("db", &self.db)
            .field("table", &self.table.as_ref().map(|t| t.name.as_str()))
            .field("key", &self.key.as_ref().map(|k| &k.comps))
            .field("flags", &self.flags.to_string())
            .finish()
    }
}
