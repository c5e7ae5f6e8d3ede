//! Notification dispatcher
//!
//! Turns changed nodes into [`SubscribeResponse`] messages: resolves
//! wildcards through the app module's `process_subscribe`, fetches current
//! values through its `get`, and builds one message per resolved prefix.
//! Also runs the initial sync scan of a target.

use std::collections::{BTreeMap, HashSet};

use translib_db::{DbError, Key, ScanOptions, ScanType, Value};
use translib_path::{split_last_elem, Path};

use crate::app::{
    Notification, NotificationContext, NotificationSender, OnChangeHandler, ProcessSubscribeRequest,
};
use crate::config::SubscribeConfig;
use crate::diff::EntryDiff;
use crate::error::{AppError, Result, SubscribeError};
use crate::info::NotificationInfo;
use crate::lifecycle::SubscriptionSession;
use crate::message::SubscribeResponse;
use crate::processor::{dedup_key, NodeChange};
use crate::tree::{DataNode, DataTree};

/// One store change (or one scanned entry) being turned into messages for a
/// session
pub(crate) struct NotificationEvent<'a> {
    pub id: String,
    pub session: &'a SubscriptionSession,
    pub key: Option<Key>,
    pub entry: Option<Value>,
    /// Resolve the target path through `process_subscribe` even without
    /// wildcards
    pub force_process_sub: bool,
}

impl<'a> NotificationEvent<'a> {
    pub fn new(id: impl Into<String>, session: &'a SubscriptionSession) -> Self {
        Self {
            id: id.into(),
            session,
            key: None,
            entry: None,
            force_process_sub: false,
        }
    }

    /// Send the changes of one target. With wildcard sub-paths the changes
    /// are grouped by relative prefix and each group resolved on its own.
    pub fn send_notifications(&self, info: &NotificationInfo, changes: Vec<NodeChange>) {
        if !info.flags.wildcard_subpath {
            self.send_notification(info, "", changes);
            return;
        }

        let mut groups: BTreeMap<String, Vec<NodeChange>> = BTreeMap::new();
        for mut change in changes {
            let prefix = std::mem::take(&mut change.parent_prefix);
            groups.entry(prefix).or_default().push(change);
        }
        for (prefix, group) in groups {
            self.send_notification(info, &prefix, group);
        }
    }

    /// Build and send one message for changes sharing `rel_prefix`
    pub fn send_notification(&self, info: &NotificationInfo, rel_prefix: &str, changes: Vec<NodeChange>) {
        let prefix = if !rel_prefix.is_empty() {
            self.process_subscribe(info, rel_prefix)
        } else if info.flags.wildcard_path || self.force_process_sub {
            self.process_subscribe(info, "")
        } else {
            Some(info.path.clone())
        };
        let Some(prefix) = prefix else {
            tracing::warn!(id = %self.id, path = %info.path, "skip notification; process_subscribe failed");
            return;
        };

        let mut resp = SubscribeResponse::new(prefix.to_string());
        tracing::debug!(id = %self.id, path = %resp.path, "preparing notification");

        let mut updates: Vec<(NodeChange, DataNode)> = Vec::new();
        for change in changes {
            let leaf_path = change.path();
            if change.deleted {
                tracing::debug!(id = %self.id, leaf = %leaf_path, "deleted");
                resp.delete.push(leaf_path);
                continue;
            }

            let fetched = prefix
                .join_str(&leaf_path)
                .map_err(|e| AppError::InvalidArgument(e.to_string()))
                .and_then(|p| self.fetch(info, &p));
            match fetched {
                Ok(node) => {
                    tracing::debug!(id = %self.id, leaf = %leaf_path, "updated");
                    updates.push((change, node));
                }
                Err(e) if e.is_not_found() && self.session.is_sync_done() => {
                    tracing::debug!(id = %self.id, leaf = %leaf_path, "not found");
                    resp.delete.push(leaf_path);
                }
                Err(e) => {
                    tracing::debug!(id = %self.id, leaf = %leaf_path, error = %e, "skipped");
                }
            }
        }

        if updates.is_empty() && resp.delete.is_empty() {
            tracing::warn!(id = %self.id, path = %resp.path, "skip notification; no data");
            return;
        }

        let (num_update, num_delete) = (updates.len(), resp.delete.len());
        let built = match (num_update, num_delete) {
            (0, _) => Ok(()),
            (1, 0) => match updates.pop() {
                Some((change, node)) => single_update(info, &prefix, &change, node, &mut resp),
                None => Ok(()),
            },
            _ => coalesce(&prefix, updates).map(|tree| resp.update = Some(tree)),
        };
        if let Err(e) = built {
            tracing::warn!(id = %self.id, path = %resp.path, error = %e, "skip notification");
            return;
        }

        tracing::info!(
            id = %self.id, path = %resp.path, updates = num_update, deletes = num_delete,
            "sending notification"
        );
        self.send(resp);
    }

    /// Ask the app module for the concrete path of the current key.
    ///
    /// The result must match the template; it is cut to the template length
    /// and must be free of wildcards.
    fn process_subscribe(&self, info: &NotificationInfo, sub_path: &str) -> Option<Path> {
        let template = if sub_path.is_empty() {
            info.path.clone()
        } else {
            match info.path.join_str(sub_path) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(id = %self.id, suffix = sub_path, error = %e, "invalid path suffix");
                    return None;
                }
            }
        };

        tracing::debug!(
            id = %self.id, db = ?info.db, table = ?info.table.as_ref().map(|t| &t.name),
            key = ?self.key.as_ref().map(|k| &k.comps), sub_path,
            "calling process_subscribe"
        );

        let req = ProcessSubscribeRequest {
            ctx_id: &self.id,
            path: &template,
            db: info.db,
            table: info.table.as_ref(),
            key: self.key.as_ref(),
            entry: self.entry.as_ref(),
            dbs: &self.session.dbs,
            opaque: info.opaque.as_ref(),
        };
        let out = match info.app.process_subscribe(&req) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "process_subscribe failed");
                return None;
            }
        };

        if !out.matches(&template) {
            tracing::warn!(
                id = %self.id, returned = %out, expected = %template,
                "process_subscribe returned a path not matching the template"
            );
            return None;
        }
        let out = if out.len() > template.len() {
            out.sub_path(0, template.len())
        } else {
            out
        };
        if out.has_wildcard_key() {
            tracing::warn!(id = %self.id, path = %out, "process_subscribe did not resolve all wildcards");
            return None;
        }
        Some(out)
    }

    /// Current value at `path`; an empty subtree counts as not found
    fn fetch(&self, info: &NotificationInfo, path: &Path) -> std::result::Result<DataNode, AppError> {
        let node = info.app.get(path, &self.session.dbs)?;
        if node.is_empty() {
            return Err(AppError::NotFound(format!("no data at {}", path)));
        }
        Ok(node)
    }

    pub fn send(&self, resp: SubscribeResponse) {
        tracing::trace!(id = %self.id, ?resp, "queueing response");
        if let Err(e) = self.session.queue.send(resp) {
            tracing::warn!(id = %self.id, error = %e, "response queue error");
        }
    }

    /// Run a custom on-change handler for the current key
    pub fn invoke_app_handler(&self, info: &NotificationInfo, handler: &OnChangeHandler, diff: &EntryDiff) {
        tracing::debug!(id = %self.id, path = %info.path, "invoking custom handler");
        let ctx = NotificationContext {
            path: &info.path,
            db: info.db.and_then(|d| self.session.dbs.get(d)),
            table: info.table.as_ref(),
            key: self.key.as_ref(),
            diff,
            dbs: &self.session.dbs,
            opaque: info.opaque.as_ref(),
        };
        let sender = HandlerSender { event: self, info };
        handler(&ctx, &sender);
    }
}

fn single_update(
    info: &NotificationInfo,
    prefix: &Path,
    change: &NodeChange,
    node: DataNode,
    resp: &mut SubscribeResponse,
) -> Result<()> {
    if info.flags.leaf_path {
        let n = prefix.len();
        resp.path = split_last_elem(&resp.path).0.to_string();
        resp.update = Some(DataTree::wrap(&prefix.sub_path(n.saturating_sub(1), n), node)?);
    } else if !change.is_target_node() {
        if !prefix.is_empty() {
            resp.path.push_str(&change.parent_prefix);
        } else {
            resp.path = change.parent_prefix.clone();
        }
        let leaf = Path::parse(&change.leaf_name)?;
        resp.update = Some(DataTree::wrap(&leaf, node)?);
    } else {
        resp.update = Some(DataTree::wrap(&Path::root(), node)?);
    }
    Ok(())
}

/// Merge every fetched node under one root at the common prefix
fn coalesce(prefix: &Path, updates: Vec<(NodeChange, DataNode)>) -> Result<DataTree> {
    let mut root = DataTree::new();
    for (change, node) in updates {
        let rel = Path::parse(&change.path())?;
        root.merge_at(&rel, node)?;
    }
    if let Some(last) = prefix.last() {
        root.remove_leaves(last.keys().keys().map(String::as_str));
    }
    Ok(root)
}

/// [`NotificationSender`] handed to custom on-change handlers
struct HandlerSender<'e, 'a> {
    event: &'e NotificationEvent<'a>,
    info: &'e NotificationInfo,
}

impl HandlerSender<'_, '_> {
    fn fetch_update(&self, full: &str) -> Option<SubscribeResponse> {
        let fetched = Path::parse(full)
            .map_err(|e| AppError::InvalidArgument(e.to_string()))
            .and_then(|p| self.event.fetch(self.info, &p));

        match fetched {
            Ok(node) => {
                let (parent, last) = split_last_elem(full);
                let wrapped = Path::parse(last)
                    .map_err(SubscribeError::from)
                    .and_then(|rel| DataTree::wrap(&rel, node));
                match wrapped {
                    Ok(tree) => {
                        let mut resp = SubscribeResponse::new(parent);
                        resp.update = Some(tree);
                        Some(resp)
                    }
                    Err(e) => {
                        tracing::warn!(id = %self.event.id, path = full, error = %e, "skip handler update path");
                        None
                    }
                }
            }
            Err(e) if e.is_not_found() && self.event.session.is_sync_done() => {
                tracing::debug!(id = %self.event.id, path = full, "handler update path not found");
                let mut resp = SubscribeResponse::new("");
                resp.delete.push(full.to_string());
                Some(resp)
            }
            Err(e) => {
                tracing::warn!(id = %self.event.id, path = full, error = %e, "skip handler update path");
                None
            }
        }
    }
}

impl NotificationSender for HandlerSender<'_, '_> {
    fn send(&self, notification: Notification) {
        let Notification {
            path,
            delete,
            update,
            update_paths,
        } = notification;

        if update.is_some() || !delete.is_empty() {
            tracing::info!(
                id = %self.event.id, path = %path, updates = usize::from(update.is_some()),
                deletes = delete.len(), "sending handler notification"
            );
            let mut resp = SubscribeResponse::new(path.clone());
            resp.update = update;
            resp.delete = delete;
            self.event.send(resp);
        }

        for p in update_paths {
            if let Some(resp) = self.fetch_update(&format!("{}{}", path, p)) {
                self.event.send(resp);
            }
        }
    }
}

/// Send the current state of one target: a direct fetch for non-store and
/// dynamic targets, otherwise one message per scanned key.
pub(crate) fn send_initial_update(
    session: &SubscriptionSession,
    info: &NotificationInfo,
    config: &SubscribeConfig,
) -> Result<()> {
    let mut ne = NotificationEvent::new(session.id.clone(), session);
    tracing::debug!(id = %ne.id, path = %info.path, "initial update");

    let (Some(db_num), Some(table), Some(pattern)) = (info.db, info.table.as_ref(), info.key.as_ref()) else {
        tracing::debug!(id = %ne.id, "non-db target; notifying with direct get");
        ne.send_notification(info, "", vec![NodeChange::target()]);
        return Ok(());
    };

    if info.flags.dynamic {
        tracing::debug!(id = %ne.id, "dynamic target; notifying with direct get");
        let fetch_info = info.for_dynamic_fetch();
        ne.send_notification(&fetch_info, "", vec![NodeChange::target()]);
        return Ok(());
    }

    let db = session.dbs.get(db_num).ok_or(DbError::ConnectionClosed)?;
    let opts = match &info.field_scan_pattern {
        Some(p) => ScanOptions::fields(p.clone()),
        None => ScanOptions::keys(),
    };
    let mut cursor = db.new_scan_cursor(table, pattern, &opts).map_err(|e| {
        tracing::warn!(id = %ne.id, db = %db_num, table = %table, key = %pattern, error = %e, "failed to open cursor");
        e
    })?;

    if pattern.is_pattern() && !info.flags.wildcard_path {
        tracing::trace!(id = %ne.id, "key is a glob pattern; forcing process_subscribe");
        ne.force_process_sub = true;
    }
    let mut seen: Option<HashSet<String>> = (!info.key_group.is_empty()).then(HashSet::new);

    let mut done = false;
    while !done {
        let batch: Vec<(Key, Option<Value>)> = match opts.scan_type {
            ScanType::Field => {
                let (fields, d) = cursor.next_fields(config.field_scan_count_hint)?;
                done = d;
                fields
                    .fields
                    .into_iter()
                    .map(|(name, v)| (Key::new([name.clone()]), Some(Value::from_pairs([(name, v)]))))
                    .collect()
            }
            ScanType::Key => {
                let (keys, d) = cursor.next_keys(config.key_scan_count_hint)?;
                done = d;
                keys.into_iter().map(|k| (k, None)).collect()
            }
        };

        for (key, value) in batch {
            if let Some(seen) = seen.as_mut() {
                let dk = dedup_key(&ne.id, &key, &info.key_group);
                if !dk.is_empty() && !seen.insert(dk) {
                    tracing::trace!(id = %ne.id, key = %key, "skip initial sync; key group already sent");
                    continue;
                }
            }

            let entry = match value {
                Some(v) => v,
                None => match db.get_entry(table, &key) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(id = %ne.id, table = %table, key = %key, error = %e, "skip initial sync");
                        continue;
                    }
                },
            };
            let created = info.handler.as_ref().map(|_| EntryDiff::created(entry.clone()));
            ne.key = Some(key);
            ne.entry = Some(entry);

            match (&info.handler, created) {
                (Some(handler), Some(diff)) => ne.invoke_app_handler(info, handler, &diff),
                _ => ne.send_notification(info, "", vec![NodeChange::target()]),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppModule, FieldMapping, PathTarget, TranslateSubscribeRequest, TranslateSubscribeResponse};
    use crate::info::NotificationInfo;
    use crossbeam::channel::{unbounded, Receiver};
    use serde_json::json;
    use std::sync::Arc;
    use translib_db::{DbNum, DbSet, MemoryStore, TableSpec};

    /// Serves `/sys/item[id=*]/{a,b}` from table ITEM of CONFIG_DB
    struct ItemApp;

    fn item_key(path: &Path) -> Option<Key> {
        path.elem(1).and_then(|e| e.key("id")).map(|id| Key::new([id]))
    }

    impl AppModule for ItemApp {
        fn translate_subscribe(
            &self,
            _req: &TranslateSubscribeRequest<'_>,
        ) -> std::result::Result<TranslateSubscribeResponse, AppError> {
            Ok(TranslateSubscribeResponse::default())
        }

        fn process_subscribe(&self, req: &ProcessSubscribeRequest<'_>) -> std::result::Result<Path, AppError> {
            let mut p = req.path.clone();
            let id = req.key.and_then(|k| k.get(0)).unwrap_or("*").to_string();
            if let Some(e) = p.elem_mut(1) {
                e.set_key("id", id);
            }
            Ok(p)
        }

        fn get(&self, path: &Path, dbs: &DbSet) -> std::result::Result<DataNode, AppError> {
            let key = item_key(path).ok_or_else(|| AppError::InvalidArgument(path.to_string()))?;
            let db = dbs.get(DbNum::ConfigDb).ok_or_else(|| AppError::Internal("no db".into()))?;
            let v = db
                .get_entry(&TableSpec::new("ITEM"), &key)
                .map_err(|_| AppError::NotFound(path.to_string()))?;
            let leaf = |name: &str| v.get(name).map(|s| DataNode::leaf(s));
            match path.len() {
                2 => {
                    let mut t = DataTree::new().with_leaf("id", key.comps[0].clone());
                    for f in ["a", "b"] {
                        if let Some(n) = leaf(f) {
                            t.insert(f, n);
                        }
                    }
                    Ok(t.into())
                }
                3 => leaf(path.elem_name(2)).ok_or_else(|| AppError::NotFound(path.to_string())),
                _ => Err(AppError::NotFound(path.to_string())),
            }
        }
    }

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn item_info(path: &str) -> NotificationInfo {
        let t = PathTarget::new(p(path), DbNum::ConfigDb, TableSpec::new("ITEM"), Key::new(["*"]))
            .with_mapping(FieldMapping::new("").with_field("a", "a").with_field("b", "b"));
        NotificationInfo::new(&t, Arc::new(ItemApp)).unwrap()
    }

    fn setup() -> (MemoryStore, SubscriptionSession, Receiver<SubscribeResponse>) {
        let store = MemoryStore::new();
        let ts = TableSpec::new("ITEM");
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["1"]), Value::from_pairs([("a", "x"), ("b", "y")]));
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["2"]), Value::from_pairs([("a", "z")]));
        let dbs = DbSet::open_all(&store.connector(), true, true).unwrap();
        let (tx, rx) = unbounded();
        (store, SubscriptionSession::new("t.0", tx, dbs), rx)
    }

    #[test]
    fn test_initial_update_scans_keys() {
        let (_store, session, rx) = setup();
        let info = item_info("/sys/item[id=*]");
        send_initial_update(&session, &info, &SubscribeConfig::default()).unwrap();

        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].path, "/sys/item[id=1]");
        assert_eq!(
            serde_json::to_value(&msgs[0].update).unwrap(),
            json!({"id": "1", "a": "x", "b": "y"})
        );
        assert_eq!(msgs[1].path, "/sys/item[id=2]");
    }

    #[test]
    fn test_coalesced_update_strips_keys() {
        let (_store, session, rx) = setup();
        let info = item_info("/sys/item[id=*]");
        let mut ne = NotificationEvent::new("n1-t.0", &session);
        ne.key = Some(Key::new(["1"]));

        let changes = vec![NodeChange::target(), NodeChange::leaf("", "a", false)];
        ne.send_notification(&info, "", changes);

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.path, "/sys/item[id=1]");
        assert_eq!(serde_json::to_value(&msg.update).unwrap(), json!({"a": "x", "b": "y"}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_single_leaf_update_uses_parent() {
        let (_store, session, rx) = setup();
        let info = item_info("/sys/item[id=*]");
        let mut ne = NotificationEvent::new("n2-t.0", &session);
        ne.key = Some(Key::new(["2"]));
        ne.send_notification(&info, "", vec![NodeChange::leaf("", "a", false)]);

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.path, "/sys/item[id=2]");
        assert_eq!(serde_json::to_value(&msg.update).unwrap(), json!({"a": "z"}));
    }

    #[test]
    fn test_not_found_is_delete_only_after_sync() {
        let (_store, session, rx) = setup();
        let info = item_info("/sys/item[id=*]");
        let mut ne = NotificationEvent::new("n3-t.0", &session);
        ne.key = Some(Key::new(["2"]));

        ne.send_notification(&info, "", vec![NodeChange::leaf("", "b", false)]);
        assert!(rx.try_recv().is_err());

        session.set_sync_done();
        ne.send_notification(&info, "", vec![NodeChange::leaf("", "b", false)]);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.path, "/sys/item[id=2]");
        assert_eq!(msg.delete, vec!["/b".to_string()]);
        assert!(msg.update.is_none());
    }

    #[test]
    fn test_unresolved_wildcard_is_dropped() {
        let (_store, session, rx) = setup();
        let info = item_info("/sys/item[id=*]");
        let ne = NotificationEvent::new("n4-t.0", &session);
        ne.send_notification(&info, "", vec![NodeChange::target()]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_key_group_dedup() {
        let (store, session, rx) = setup();
        let ts = TableSpec::new("ITEM");
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["1", "p"]), Value::from_pairs([("a", "1")]));
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["1", "q"]), Value::from_pairs([("a", "2")]));
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["3", "p"]), Value::from_pairs([("a", "3")]));
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["3"]), Value::from_pairs([("a", "3")]));

        let t = PathTarget::new(p("/sys/item[id=*]"), DbNum::ConfigDb, ts, Key::new(["*", "*"]))
            .with_key_group(vec![0]);
        let info = NotificationInfo::new(&t, Arc::new(ItemApp)).unwrap();
        send_initial_update(&session, &info, &SubscribeConfig::default()).unwrap();

        let paths: Vec<String> = rx.try_iter().map(|m| m.path).collect();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], "/sys/item[id=1]");
        assert_eq!(paths[1], "/sys/item[id=3]");
    }

    #[test]
    fn test_field_scan_initial_update() {
        let (store, session, rx) = setup();
        let map = TableSpec::new("ITEM_NAME_MAP");
        store.set_entry(
            DbNum::ConfigDb,
            &map,
            &Key::new(["all"]),
            Value::from_pairs([("1", "oid:1"), ("2", "oid:2"), ("extra", "oid:9")]),
        );
        let t = PathTarget::new(p("/sys/item[id=*]"), DbNum::ConfigDb, map, Key::new(["all"]))
            .with_field_scan("?");
        let info = NotificationInfo::new(&t, Arc::new(ItemApp)).unwrap();
        send_initial_update(&session, &info, &SubscribeConfig::default().with_scan_count_hints(10, 1))
            .unwrap();

        let paths: Vec<String> = rx.try_iter().map(|m| m.path).collect();
        assert_eq!(paths, vec!["/sys/item[id=1]".to_string(), "/sys/item[id=2]".to_string()]);
    }

    #[test]
    fn test_handler_update_paths() {
        let (_store, session, rx) = setup();
        session.set_sync_done();
        let handler: OnChangeHandler = Arc::new(|ctx: &NotificationContext<'_>, sender: &dyn NotificationSender| {
            let id = ctx.key.and_then(|k| k.get(0)).unwrap_or_default();
            sender.send(Notification {
                path: format!("/sys/item[id={}]", id),
                update_paths: vec!["/a".to_string(), "/b".to_string()],
                ..Default::default()
            });
        });
        let t = PathTarget::new(p("/sys/item[id=*]"), DbNum::ConfigDb, TableSpec::new("ITEM"), Key::new(["*"]))
            .with_handler(handler);
        let info = NotificationInfo::new(&t, Arc::new(ItemApp)).unwrap();
        send_initial_update(&session, &info, &SubscribeConfig::default()).unwrap();

        let msgs: Vec<_> = rx.try_iter().collect();
        // item 1: a and b; item 2: a, and b reported deleted
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].path, "/sys/item[id=1]");
        assert_eq!(serde_json::to_value(&msgs[0].update).unwrap(), json!({"a": "x"}));
        assert_eq!(msgs[3].path, "");
        assert_eq!(msgs[3].delete, vec!["/sys/item[id=2]/b".to_string()]);
    }
}
