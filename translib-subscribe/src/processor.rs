//! Change event processor
//!
//! Runs on a session worker for every keyspace notification the session's
//! watches deliver. Diffs the changed entry against the connection's
//! on-change cache, maps changed fields to leaves through each interested
//! target's field mappings and hands the result to the dispatcher.
//!
//! Edge-case policy is driven only by [`crate::info::NotificationFlags`].

use translib_db::{DbError, Key, SEvent, Value};

use crate::diff::{entry_compare, entry_fields, EntryDiff};
use crate::dispatch::NotificationEvent;
use crate::group::NotificationGroup;
use crate::info::NotificationInfo;
use crate::lifecycle::{ChangeMsg, SubscriptionSession};

/// One changed node, relative to a target path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NodeChange {
    /// Relative path of the parent container, empty or starting with `/`
    pub parent_prefix: String,
    /// Leaf name under the parent; empty for the parent itself
    pub leaf_name: String,
    pub deleted: bool,
}

impl NodeChange {
    /// The target node itself
    pub fn target() -> Self {
        Self::default()
    }

    pub fn leaf(parent_prefix: impl Into<String>, leaf_name: impl Into<String>, deleted: bool) -> Self {
        Self {
            parent_prefix: parent_prefix.into(),
            leaf_name: leaf_name.into(),
            deleted,
        }
    }

    /// Path relative to the target
    pub fn path(&self) -> String {
        if self.leaf_name.is_empty() {
            self.parent_prefix.clone()
        } else {
            format!("{}/{}", self.parent_prefix, self.leaf_name)
        }
    }

    pub fn is_target_node(&self) -> bool {
        self.parent_prefix.is_empty() && self.leaf_name.is_empty()
    }
}

/// Changed nodes of one target. `old` ones are resolved against the
/// previous entry, `new` ones against the current entry.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ModifiedNodes {
    pub old: Vec<NodeChange>,
    pub new: Vec<NodeChange>,
}

/// Process one keyspace notification for a session
pub(crate) fn process_change(session: &SubscriptionSession, msg: ChangeMsg) {
    let ChangeMsg { nid, skey, key, event } = msg;
    let Some(group) = skey.opaque_as::<NotificationGroup>() else {
        tracing::warn!(id = %nid, table = %skey.ts, key = %skey.key, "subscription key without notification group; ignored");
        return;
    };

    let Some(diff) = diff_and_merge(session, &nid, &group, &key, event) else {
        return;
    };
    if diff.is_empty() {
        tracing::debug!(id = %nid, key = %key, "empty diff");
        return;
    }

    let id = format!("{}-{}", nid, session.id);
    for (pattern, infos) in &group.infos {
        if !key.matches(pattern) {
            continue;
        }
        tracing::debug!(
            id = %id, key = %key, pattern = %pattern, infos = infos.len(),
            "key matches registered pattern"
        );

        for info in infos {
            tracing::debug!(id = %id, path = %info.path, "processing path");
            let mut ne = NotificationEvent::new(id.clone(), session);
            ne.key = Some(key.clone());

            if let Some(handler) = &info.handler {
                ne.invoke_app_handler(info, handler, &diff);
                continue;
            }

            let nodes = find_modified_fields(&id, info, &diff);
            if nodes.old.is_empty() && nodes.new.is_empty() {
                tracing::debug!(id = %id, "no mapped fields changed");
                continue;
            }
            if !nodes.old.is_empty() {
                ne.entry = Some(diff.old_value.clone());
                ne.send_notifications(info, nodes.old);
            }
            if !nodes.new.is_empty() {
                ne.entry = Some(diff.new_value.clone());
                ne.send_notifications(info, nodes.new);
            }
        }
    }
}

/// Diff the changed entry against the cache and refresh the cache.
///
/// Returns `None` when the session's connection is gone or the entry could
/// not be read.
fn diff_and_merge(
    session: &SubscriptionSession,
    nid: &str,
    group: &NotificationGroup,
    key: &Key,
    event: SEvent,
) -> Option<EntryDiff> {
    let Some(db) = session.dbs.get(group.db).filter(|d| d.is_open()) else {
        tracing::debug!(id = %nid, session = %session.id, "defunct subscription");
        return None;
    };

    let cached = if event == SEvent::Del {
        db.on_change_cache_delete(&group.table, key)
            .map(|old| (old, Value::new()))
    } else {
        db.on_change_cache_update(&group.table, key)
    };

    match cached {
        Ok((old, new)) => {
            let diff = entry_compare(&old, &new);
            tracing::trace!(id = %nid, ?diff, "entry diff");
            Some(diff)
        }
        Err(DbError::ConnectionClosed) => {
            tracing::debug!(id = %nid, session = %session.id, "defunct subscription");
            None
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(id = %nid, key = %key, "entry gone before it was read");
            None
        }
        Err(e) => {
            tracing::warn!(id = %nid, key = %key, error = %e, "error finding modified fields");
            None
        }
    }
}

/// Map an entry diff to changed nodes of one target
pub(crate) fn find_modified_fields(id: &str, info: &NotificationInfo, diff: &EntryDiff) -> ModifiedNodes {
    let mut nodes = ModifiedNodes::default();
    let (mut path_create, mut path_delete) = (diff.entry_created, diff.entry_deleted);

    if info.flags.key_fields && !path_create && !path_delete {
        (path_create, path_delete) = process_key_fields(id, info, diff);
    }

    if path_create {
        tracing::debug!(id, "entry created");
        nodes.new.push(NodeChange::target());
    }

    if diff.entry_deleted && info.flags.delete_as_update {
        tracing::debug!(id, "entry deleted; treating it as update");
        if info.flags.partial {
            nodes.old = create_path_infos(id, info, &entry_fields(&diff.old_value), false);
        }
        if nodes.old.is_empty() {
            nodes.old.push(NodeChange::target());
        }
        return nodes;
    }

    if path_delete {
        tracing::debug!(id, "entry deleted");
        nodes.old.push(NodeChange {
            deleted: true,
            ..NodeChange::target()
        });
    }
    if path_create || path_delete {
        return nodes;
    }

    nodes.new.extend(create_path_infos(id, info, &diff.updated_fields, false));
    nodes.new.extend(create_path_infos(id, info, &diff.created_fields, false));

    let mut deleted = create_path_infos(id, info, &diff.deleted_fields, true);
    if info.flags.leaf_path && info.flags.delete_as_update {
        tracing::debug!(id, "treating field delete as target leaf update");
        for d in &mut deleted {
            d.deleted = false;
        }
    }
    nodes.new.extend(deleted);

    tracing::trace!(id, ?nodes, "modified fields");
    nodes
}

/// Changes to fields that hold list keys turn into a delete and/or create
/// of the whole target
fn process_key_fields(id: &str, info: &NotificationInfo, diff: &EntryDiff) -> (bool, bool) {
    let key_fields: Vec<&str> = info.key_field_names().collect();
    let touches = |fields: &[String]| fields.iter().find(|f| key_fields.contains(&f.as_str())).cloned();

    let (mut create, mut delete) = (false, false);
    if let Some(f) = touches(&diff.deleted_fields) {
        tracing::debug!(id, field = %f, "deleted key field; treating as path delete");
        delete = true;
    }
    if let Some(f) = touches(&diff.created_fields) {
        tracing::debug!(id, field = %f, "created key field; treating as path create");
        create = true;
    }
    if let Some(f) = touches(&diff.updated_fields) {
        tracing::debug!(id, field = %f, "updated key field; treating as path delete and create");
        create = true;
        delete = true;
    }
    (create, delete)
}

/// Leaves mapped from store fields. One field may map to several
/// comma separated leaves.
fn create_path_infos(id: &str, info: &NotificationInfo, fields: &[String], deleted: bool) -> Vec<NodeChange> {
    let mut changes = Vec::new();
    for field in fields {
        for mapping in &info.fields {
            let Some(leaves) = mapping.fields.get(field) else {
                continue;
            };
            for leaf in leaves.split(',').map(str::trim) {
                // List key leaves are reported by process_key_fields
                if leaf.starts_with('{') {
                    tracing::trace!(id, field = %field, "skipping key field");
                    continue;
                }
                tracing::debug!(id, field = %field, path = %format!("{}/{}", mapping.rel_path, leaf), deleted, "field changed");
                changes.push(NodeChange::leaf(mapping.rel_path.clone(), leaf, deleted));
            }
        }
    }
    changes
}

/// Key components selected by `key_group`, joined by `|`. Empty when an
/// index is out of range.
pub(crate) fn dedup_key(id: &str, key: &Key, key_group: &[usize]) -> String {
    let mut comps = Vec::with_capacity(key_group.len());
    for &i in key_group {
        match key.get(i) {
            Some(c) => comps.push(c),
            None => {
                tracing::warn!(id, index = i, key = %key, "invalid key group index");
                return String::new();
            }
        }
    }
    comps.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{DeleteAction, FieldMapping, PathTarget};
    use crate::info::tests::info;
    use rstest::rstest;
    use translib_db::{DbNum, TableSpec};
    use translib_path::Path;

    fn intf_info(extra: impl FnOnce(PathTarget) -> PathTarget) -> NotificationInfo {
        let t = PathTarget::new(
            Path::parse("/interfaces/interface[name=*]").unwrap(),
            DbNum::ConfigDb,
            TableSpec::new("PORT"),
            Key::new(["*"]),
        )
        .with_mapping(
            FieldMapping::new("config")
                .with_field("mtu", "mtu")
                .with_field("speed", "speed, port-speed")
                .with_field("admin_status", "enabled"),
        )
        .with_mapping(FieldMapping::new("").with_field("alias", "{name}"));
        info(&extra(t))
    }

    fn v(pairs: &[(&str, &str)]) -> Value {
        Value::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_entry_created_is_target_update() {
        let ni = intf_info(|t| t);
        let diff = entry_compare(&Value::new(), &v(&[("mtu", "9100")]));
        let nodes = find_modified_fields("t", &ni, &diff);
        assert_eq!(nodes.new, vec![NodeChange::target()]);
        assert!(nodes.old.is_empty());
    }

    #[test]
    fn test_entry_deleted_is_target_delete() {
        let ni = intf_info(|t| t);
        let diff = entry_compare(&v(&[("mtu", "9100")]), &Value::new());
        let nodes = find_modified_fields("t", &ni, &diff);
        assert_eq!(nodes.old.len(), 1);
        assert!(nodes.old[0].deleted && nodes.old[0].is_target_node());
        assert!(nodes.new.is_empty());
    }

    #[test]
    fn test_field_changes_map_to_leaves() {
        let ni = intf_info(|t| t);
        let diff = entry_compare(
            &v(&[("mtu", "1500"), ("admin_status", "up")]),
            &v(&[("mtu", "9100"), ("speed", "100000")]),
        );
        let nodes = find_modified_fields("t", &ni, &diff);
        let paths: Vec<(String, bool)> = nodes.new.iter().map(|n| (n.path(), n.deleted)).collect();
        assert_eq!(
            paths,
            vec![
                ("/config/mtu".to_string(), false),
                ("/config/speed".to_string(), false),
                ("/config/port-speed".to_string(), false),
                ("/config/enabled".to_string(), true),
            ]
        );
    }

    #[rstest]
    #[case::created(&[("mtu", "1")], &[("mtu", "1"), ("alias", "e0")], true, false)]
    #[case::deleted(&[("mtu", "1"), ("alias", "e0")], &[("mtu", "1")], false, true)]
    #[case::updated(&[("alias", "e0")], &[("alias", "e1")], true, true)]
    fn test_key_field_changes(
        #[case] old: &[(&str, &str)],
        #[case] new: &[(&str, &str)],
        #[case] create: bool,
        #[case] delete: bool,
    ) {
        let ni = intf_info(|t| t);
        assert!(ni.flags.key_fields);
        let nodes = find_modified_fields("t", &ni, &entry_compare(&v(old), &v(new)));
        assert_eq!(nodes.new == vec![NodeChange::target()], create);
        assert_eq!(nodes.old.iter().any(|n| n.deleted && n.is_target_node()), delete);
    }

    #[test]
    fn test_delete_as_update() {
        let ni = intf_info(|t| t.with_delete_action(DeleteAction::InspectPath));
        let diff = entry_compare(&v(&[("mtu", "1500")]), &Value::new());
        let nodes = find_modified_fields("t", &ni, &diff);
        assert_eq!(nodes.old, vec![NodeChange::target()]);

        let ni = intf_info(|t| t.with_delete_action(DeleteAction::InspectLeaf));
        let diff = entry_compare(&v(&[("mtu", "1500"), ("NULL", "NULL"), ("alias", "e0")]), &Value::new());
        let nodes = find_modified_fields("t", &ni, &diff);
        assert_eq!(nodes.old, vec![NodeChange::leaf("/config", "mtu", false)]);
    }

    #[test]
    fn test_leaf_field_delete_becomes_update() {
        let t = PathTarget::new(
            Path::parse("/interfaces/interface[name=*]/config/mtu").unwrap(),
            DbNum::ConfigDb,
            TableSpec::new("PORT"),
            Key::new(["*"]),
        )
        .with_mapping(FieldMapping::new("").with_field("mtu", ""))
        .with_delete_action(DeleteAction::InspectPath);
        let ni = info(&t);
        assert!(ni.flags.leaf_path);

        let diff = entry_compare(&v(&[("mtu", "9100"), ("speed", "1")]), &v(&[("speed", "1")]));
        let nodes = find_modified_fields("t", &ni, &diff);
        assert_eq!(nodes.new, vec![NodeChange::target()]);
        assert!(!nodes.new[0].deleted);
    }

    #[test]
    fn test_unmapped_fields_ignored() {
        let ni = intf_info(|t| t);
        let diff = entry_compare(&v(&[("fec", "rs")]), &v(&[("fec", "none")]));
        assert_eq!(find_modified_fields("t", &ni, &diff), ModifiedNodes::default());
    }

    #[rstest]
    #[case(&["Vlan10", "Ethernet0"], &[0], "Vlan10")]
    #[case(&["Vlan10", "Ethernet0"], &[1, 0], "Ethernet0|Vlan10")]
    #[case(&["Vlan10"], &[1], "")]
    fn test_dedup_key(#[case] comps: &[&str], #[case] group: &[usize], #[case] expected: &str) {
        assert_eq!(dedup_key("t", &Key::new(comps.iter().copied()), group), expected);
    }

    #[test]
    fn test_node_change_paths() {
        assert_eq!(NodeChange::target().path(), "");
        assert_eq!(NodeChange::leaf("/state", "", false).path(), "/state");
        assert_eq!(NodeChange::leaf("", "mtu", false).path(), "/mtu");
        assert!(!NodeChange::leaf("", "mtu", false).is_target_node());
    }
}
