//! App module contract
//!
//! App modules own the mapping between structured paths and store tables.
//! The engine asks them three things:
//!
//! - `translate_subscribe`: which tables and keys back a requested path
//!   ([`PathTarget`] lists for the path itself and for dependent tables)
//! - `process_subscribe`: which concrete path a changed store key maps to,
//!   given a wildcard path template
//! - `get`: the current value at a concrete path
//!
//! Modules are looked up through an [`AppRegistry`] built once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use translib_db::{Database, DbNum, DbSet, Key, Opaque, TableSpec, Value};
use translib_path::Path;

use crate::diff::EntryDiff;
use crate::error::{AppError, Result, SubscribeError};
use crate::message::NotificationType;
use crate::tree::{DataNode, DataTree};

/// How an entry delete is interpreted for a [`PathTarget`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// The entry backs only part of the path; a delete is sent as an
    /// update of the whole path
    InspectPath,
    /// Like `InspectPath`, but only the leaves the entry carried are updated
    InspectLeaf,
}

/// Store fields to leaf names, under one path relative to the target path.
///
/// A leaf name starting with `{` marks a field holding a list key. A leaf
/// value may name several leaves separated by commas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    pub rel_path: String,
    pub fields: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new(rel_path: impl Into<String>) -> Self {
        Self {
            rel_path: rel_path.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, leaf: impl Into<String>) -> Self {
        self.fields.insert(field.into(), leaf.into());
        self
    }
}

/// Custom on-change handler supplied by an app module
pub type OnChangeHandler = Arc<dyn Fn(&NotificationContext<'_>, &dyn NotificationSender) + Send + Sync>;

/// Declaration that a path maps to one table and key pattern (or to a
/// non-store data source when table or key is absent)
#[derive(Clone, Default)]
pub struct PathTarget {
    pub path: Option<Path>,
    pub db: Option<DbNum>,
    pub table: Option<TableSpec>,
    pub key: Option<Key>,
    /// Key component indices identifying one leaf-list instance
    pub key_group: Vec<usize>,
    pub field_mappings: Vec<FieldMapping>,
    pub delete_action: Option<DeleteAction>,
    /// Initial sync walks field names matching this glob instead of keys
    pub field_scan_pattern: Option<String>,
    pub on_change_supported: bool,
    /// Seconds; 0 means system default
    pub min_interval: u32,
    pub preferred: NotificationType,
    pub handler: Option<OnChangeHandler>,
    pub opaque: Option<Opaque>,
    /// Backed partly or fully by computed data
    pub dynamic: bool,
}

impl PathTarget {
    /// Target backed by a store table
    pub fn new(path: Path, db: DbNum, table: TableSpec, key: Key) -> Self {
        Self {
            path: Some(path),
            db: Some(db),
            table: Some(table),
            key: Some(key),
            ..Default::default()
        }
    }

    /// Target not backed by the store
    pub fn non_db(path: Path) -> Self {
        Self {
            path: Some(path),
            ..Default::default()
        }
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.field_mappings.push(mapping);
        self
    }

    pub fn with_on_change(mut self, supported: bool) -> Self {
        self.on_change_supported = supported;
        self
    }

    pub fn with_preferred(mut self, preferred: NotificationType) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn with_min_interval(mut self, seconds: u32) -> Self {
        self.min_interval = seconds;
        self
    }

    pub fn with_key_group(mut self, comps: Vec<usize>) -> Self {
        self.key_group = comps;
        self
    }

    pub fn with_delete_action(mut self, action: DeleteAction) -> Self {
        self.delete_action = Some(action);
        self
    }

    pub fn with_field_scan(mut self, pattern: impl Into<String>) -> Self {
        self.field_scan_pattern = Some(pattern.into());
        self
    }

    pub fn with_handler(mut self, handler: OnChangeHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_opaque(mut self, opaque: Opaque) -> Self {
        self.opaque = Some(opaque);
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn is_non_db(&self) -> bool {
        self.db.is_none() || self.table.is_none() || self.key.is_none()
    }

    /// Whether the path addresses a leaf: no relative prefixes and every
    /// mapped leaf name empty or a list key marker
    pub fn is_leaf_path(&self) -> bool {
        self.field_mappings.iter().all(|m| {
            m.rel_path.is_empty()
                && m.fields.values().all(|leaf| leaf.is_empty() || leaf.starts_with('{'))
        })
    }

    pub(crate) fn prefers_sample(&self) -> bool {
        !self.on_change_supported || self.preferred == NotificationType::Sample
    }
}

impl fmt::Display for PathTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{{path='{}'", p)?,
            None => f.write_str("{path=<nil>")?,
        }
        match (&self.db, &self.table, &self.key) {
            (Some(db), Some(ts), Some(key)) => write!(f, ", db={}, ts={}, key={:?}", db, ts, key.comps)?,
            _ => f.write_str(", non-db")?,
        }
        if !self.key_group.is_empty() {
            write!(f, ", keyGrp={:?}", self.key_group)?;
        }
        if let Some(pattern) = &self.field_scan_pattern {
            write!(f, ", fieldScanPattern={}", pattern)?;
        }
        write!(f, ", dynamic={}, fields={{", self.dynamic)?;
        for (i, m) in self.field_mappings.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", m.rel_path, m.fields)?;
        }
        write!(f, "}}, delAction={:?}", self.delete_action)?;
        if self.handler.is_some() {
            f.write_str(", handler=custom")?;
        }
        write!(
            f,
            ", onchange={}, preferred={}, m_int={}}}",
            self.on_change_supported, self.preferred, self.min_interval
        )
    }
}

impl fmt::Debug for PathTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Input of [`AppModule::translate_subscribe`]
pub struct TranslateSubscribeRequest<'a> {
    /// Request id for logging
    pub ctx_id: &'a str,
    pub path: &'a str,
    pub mode: NotificationType,
    /// Whether mappings for child tables are wanted
    pub recurse: bool,
    pub dbs: &'a DbSet,
}

/// Output of [`AppModule::translate_subscribe`]
#[derive(Debug, Clone, Default)]
pub struct TranslateSubscribeResponse {
    /// Tables backing the requested path itself; at least one is required
    pub targets: Vec<PathTarget>,
    /// Dependent tables of the targets
    pub children: Vec<PathTarget>,
}

/// Input of [`AppModule::process_subscribe`]
pub struct ProcessSubscribeRequest<'a> {
    pub ctx_id: &'a str,
    /// Template to fill; contains wildcards
    pub path: &'a Path,
    pub db: Option<DbNum>,
    pub table: Option<&'a TableSpec>,
    pub key: Option<&'a Key>,
    /// Changed (or deleted) entry. Do not rely on it for deletes of other keys.
    pub entry: Option<&'a Value>,
    pub dbs: &'a DbSet,
    pub opaque: Option<&'a Opaque>,
}

/// A path-mapping provider for one part of the schema tree
pub trait AppModule: Send + Sync {
    /// Map a requested path to store targets
    fn translate_subscribe(
        &self,
        req: &TranslateSubscribeRequest<'_>,
    ) -> std::result::Result<TranslateSubscribeResponse, AppError>;

    /// Resolve the wildcards of `req.path` for one store key. The returned
    /// path must match the template.
    fn process_subscribe(&self, req: &ProcessSubscribeRequest<'_>) -> std::result::Result<Path, AppError>;

    /// Current value at a concrete path: a subtree for containers and list
    /// instances, a leaf value for leaves. Missing data is `AppError::NotFound`.
    fn get(&self, path: &Path, dbs: &DbSet) -> std::result::Result<DataNode, AppError>;
}

/// Everything a custom on-change handler knows about one change
pub struct NotificationContext<'a> {
    pub path: &'a Path,
    pub db: Option<&'a Arc<dyn Database>>,
    pub table: Option<&'a TableSpec>,
    pub key: Option<&'a Key>,
    pub diff: &'a EntryDiff,
    pub dbs: &'a DbSet,
    pub opaque: Option<&'a Opaque>,
}

/// Message produced by a custom on-change handler.
///
/// `update` and `delete` go out as one message. Each `update_paths` entry
/// (relative to `path`) is fetched and sent on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notification {
    pub path: String,
    pub delete: Vec<String>,
    pub update: Option<DataTree>,
    pub update_paths: Vec<String>,
}

/// Send capability handed to custom on-change handlers
pub trait NotificationSender {
    fn send(&self, notification: Notification);
}

/// Response for a path served entirely outside the store, with on-change
/// unsupported
pub fn empty_subscribe_response(path: &str) -> Result<TranslateSubscribeResponse> {
    let p = Path::parse(path)?;
    Ok(TranslateSubscribeResponse {
        targets: vec![PathTarget::non_db(p)],
        children: Vec::new(),
    })
}

/// App modules keyed by the path prefix they serve
#[derive(Clone, Default)]
pub struct AppRegistry {
    modules: Vec<(Path, Arc<dyn AppModule>)>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module for every path under `prefix`
    pub fn register(&mut self, prefix: &str, module: Arc<dyn AppModule>) -> Result<()> {
        let p = Path::parse(prefix)?;
        tracing::debug!(prefix = %p, "registering app module");
        self.modules.push((p, module));
        Ok(())
    }

    pub fn with_module(mut self, prefix: &str, module: Arc<dyn AppModule>) -> Result<Self> {
        self.register(prefix, module)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Module with the longest prefix covering `path`. Keys and module
    /// prefixes are ignored when comparing.
    pub fn lookup(&self, path: &str) -> Result<Arc<dyn AppModule>> {
        let req = Path::parse(path)?;
        self.modules
            .iter()
            .filter(|(prefix, _)| req.starts_with_names(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, module)| module.clone())
            .ok_or_else(|| SubscribeError::NotSupported(format!("no app module for path {}", path)))
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|(p, _)| p.to_string()))
            .finish()
    }
}
