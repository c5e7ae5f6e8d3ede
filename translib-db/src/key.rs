//! Store addressing and entry types
//!
//! - [`DbNum`]: which logical database a table lives in
//! - [`TableSpec`]: a table within a database
//! - [`Key`]: the key components of one row, possibly a glob pattern
//! - [`Value`]: the field map stored in one row

use std::collections::BTreeMap;
use std::fmt;

/// Logical databases of the switch store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbNum {
    ApplDb,
    AsicDb,
    CountersDb,
    LogLevelDb,
    ConfigDb,
    FlexCounterDb,
    StateDb,
    SnmpOverlayDb,
    ErrorDb,
}

impl DbNum {
    /// Every database, in index order
    pub const ALL: [DbNum; 9] = [
        DbNum::ApplDb,
        DbNum::AsicDb,
        DbNum::CountersDb,
        DbNum::LogLevelDb,
        DbNum::ConfigDb,
        DbNum::FlexCounterDb,
        DbNum::StateDb,
        DbNum::SnmpOverlayDb,
        DbNum::ErrorDb,
    ];

    /// Number of databases
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            DbNum::ApplDb => "APPL_DB",
            DbNum::AsicDb => "ASIC_DB",
            DbNum::CountersDb => "COUNTERS_DB",
            DbNum::LogLevelDb => "LOGLEVEL_DB",
            DbNum::ConfigDb => "CONFIG_DB",
            DbNum::FlexCounterDb => "FLEX_COUNTER_DB",
            DbNum::StateDb => "STATE_DB",
            DbNum::SnmpOverlayDb => "SNMP_OVERLAY_DB",
            DbNum::ErrorDb => "ERROR_DB",
        }
    }
}

impl fmt::Display for DbNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies a table in a database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableSpec {
    pub name: String,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Key of a table row, one string per component.
///
/// Components may carry redis style glob characters, in which case the key
/// is a pattern covering many rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub comps: Vec<String>,
}

impl Key {
    pub fn new<I, S>(comps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            comps: comps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    /// Component at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.comps.get(index).map(String::as_str)
    }

    /// Whether any component has an unescaped `*` or `?`
    pub fn is_pattern(&self) -> bool {
        self.comps.iter().any(|c| {
            let mut chars = c.chars();
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => {
                        chars.next();
                    }
                    '*' | '?' => return true,
                    _ => {}
                }
            }
            false
        })
    }

    /// Whether this key matches a key pattern, component by component.
    ///
    /// A `*` component matches anything; other components use glob rules.
    pub fn matches(&self, pattern: &Key) -> bool {
        self.comps.len() == pattern.comps.len()
            && self
                .comps
                .iter()
                .zip(&pattern.comps)
                .all(|(c, p)| p == "*" || glob_match(p, c))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.comps.join("|"))
    }
}

/// Glob match in the style of the redis key matcher.
///
/// `*` matches any sequence (including `/` and `|`), `?` exactly one
/// character, `\` escapes the next character. A trailing `\` is literal.
/// Character classes are not supported.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    glob_match_at(&p, 0, &v, 0)
}

fn glob_match_at(p: &[char], mut pi: usize, v: &[char], mut vi: usize) -> bool {
    while pi < p.len() {
        match p[pi] {
            '*' => {
                while pi < p.len() && p[pi] == '*' {
                    pi += 1;
                }
                if pi == p.len() {
                    return true;
                }
                return (vi..v.len()).any(|start| glob_match_at(p, pi, v, start));
            }
            '?' => {
                if vi >= v.len() {
                    return false;
                }
                pi += 1;
                vi += 1;
            }
            '\\' if pi + 1 < p.len() => {
                if vi >= v.len() || v[vi] != p[pi + 1] {
                    return false;
                }
                pi += 2;
                vi += 1;
            }
            c => {
                if vi >= v.len() || v[vi] != c {
                    return false;
                }
                pi += 1;
                vi += 1;
            }
        }
    }
    vi == v.len()
}

/// Field map of one table row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    pub fields: BTreeMap<String, String>,
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a value from `(field, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether the row carries at least one field
    pub fn is_populated(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.remove(field)
    }
}
