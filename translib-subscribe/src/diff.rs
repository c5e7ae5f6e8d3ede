//! Entry diff engine
//!
//! Compares two versions of a store entry and reports what changed at the
//! entry level (created / deleted) or at the field level. The placeholder
//! field `NULL` is invisible, and the `@` marker that array valued field
//! names carry is stripped from reported names.

use translib_db::Value;

/// Placeholder field used by the store to keep otherwise empty entries alive
pub const NULL_FIELD: &str = "NULL";

/// Marker suffix of array valued field names
const ARRAY_MARKER: char = '@';

/// Difference between two versions of one store entry.
///
/// When `entry_created` or `entry_deleted` is set, the field lists are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryDiff {
    pub old_value: Value,
    pub new_value: Value,
    pub entry_created: bool,
    pub entry_deleted: bool,
    pub created_fields: Vec<String>,
    pub updated_fields: Vec<String>,
    pub deleted_fields: Vec<String>,
}

impl EntryDiff {
    /// Diff describing a freshly created entry, as used by initial sync
    pub fn created(new_value: Value) -> Self {
        Self {
            new_value,
            entry_created: true,
            ..Default::default()
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        !self.entry_created
            && !self.entry_deleted
            && self.created_fields.is_empty()
            && self.updated_fields.is_empty()
            && self.deleted_fields.is_empty()
    }
}

/// Compare an old and a new version of an entry.
///
/// Field lists come out sorted by raw field name.
pub fn entry_compare(old: &Value, new: &Value) -> EntryDiff {
    let mut diff = EntryDiff {
        old_value: old.clone(),
        new_value: new.clone(),
        ..Default::default()
    };

    if !old.is_populated() {
        diff.entry_created = new.is_populated();
        return diff;
    }
    if !new.is_populated() {
        diff.entry_deleted = true;
        return diff;
    }

    for (name, old_val) in &old.fields {
        if name == NULL_FIELD {
            continue;
        }
        match new.fields.get(name) {
            None => diff.deleted_fields.push(field_name(name)),
            Some(new_val) if new_val != old_val => diff.updated_fields.push(field_name(name)),
            Some(_) => {}
        }
    }

    for name in new.fields.keys() {
        if name != NULL_FIELD && !old.fields.contains_key(name) {
            diff.created_fields.push(field_name(name));
        }
    }

    diff
}

/// Reportable field names of an entry: `NULL` skipped, array markers stripped
pub fn entry_fields(value: &Value) -> Vec<String> {
    value
        .fields
        .keys()
        .filter(|name| name.as_str() != NULL_FIELD)
        .map(|name| field_name(name))
        .collect()
}

fn field_name(raw: &str) -> String {
    raw.strip_suffix(ARRAY_MARKER).unwrap_or(raw).to_string()
}
