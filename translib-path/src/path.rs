//! Structured path type and helpers
//!
//! A [`Path`] is a sequence of [`PathElem`]s, each carrying a name and an
//! optional set of key predicates. The string form is the usual gNMI one:
//!
//! ```text
//! /openconfig-interfaces:interfaces/interface[name=Ethernet0]/state
//! ```
//!
//! Inside key values `\` escapes the next character, so `]` and `\` can be
//! carried in a value. The value `*` is a wildcard.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PathError, Result};

/// Wildcard key value
pub const WILDCARD: &str = "*";

/// One element of a structured path
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElem {
    name: String,
    keys: BTreeMap<String, String>,
}

impl PathElem {
    /// Create an element without keys
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: BTreeMap::new(),
        }
    }

    /// Builder style key setter
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    /// Value of one key predicate
    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(String::as_str)
    }

    pub fn set_key(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(name.into(), value.into());
    }

    /// Whether any key value is the wildcard
    pub fn has_wildcard_key(&self) -> bool {
        self.keys.values().any(|v| v == WILDCARD)
    }

    /// Element name without its `module:` prefix
    pub fn local_name(&self) -> &str {
        match self.name.find(':') {
            Some(i) => &self.name[i + 1..],
            None => &self.name,
        }
    }
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.keys {
            write!(f, "[{}=", k)?;
            for c in v.chars() {
                if c == ']' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{}", c)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// A structured path
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    elems: Vec<PathElem>,
}

impl Path {
    /// The empty (root) path
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_elems(elems: Vec<PathElem>) -> Self {
        Self { elems }
    }

    /// Parse a path string. Empty string and `/` both yield the root path.
    pub fn parse(s: &str) -> Result<Self> {
        let mut elems = Vec::new();
        let mut chars = s.char_indices().peekable();

        if let Some((_, '/')) = chars.peek() {
            chars.next();
        }

        while let Some(&(offset, _)) = chars.peek() {
            let mut elem = PathElem::default();

            while let Some(&(_, c)) = chars.peek() {
                if c == '/' || c == '[' {
                    break;
                }
                elem.name.push(c);
                chars.next();
            }

            while let Some((_, '[')) = chars.peek() {
                chars.next();
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some((_, '=')) => break,
                        Some((_, ']')) => return Err(PathError::MalformedKey(s.to_string())),
                        Some((_, c)) => key.push(c),
                        None => return Err(PathError::UnterminatedKey(s.to_string())),
                    }
                }
                if key.is_empty() {
                    return Err(PathError::MalformedKey(s.to_string()));
                }

                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\\')) => match chars.next() {
                            Some((_, c)) => value.push(c),
                            None => return Err(PathError::UnterminatedKey(s.to_string())),
                        },
                        Some((_, ']')) => break,
                        Some((_, c)) => value.push(c),
                        None => return Err(PathError::UnterminatedKey(s.to_string())),
                    }
                }
                elem.keys.insert(key, value);
            }

            if elem.name.is_empty() {
                return Err(PathError::EmptyElement {
                    path: s.to_string(),
                    offset,
                });
            }
            elems.push(elem);

            match chars.next() {
                Some((_, '/')) | None => {}
                Some((_, ch)) => {
                    return Err(PathError::UnexpectedChar {
                        path: s.to_string(),
                        ch,
                    })
                }
            }
        }

        Ok(Self { elems })
    }

    pub fn elems(&self) -> &[PathElem] {
        &self.elems
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn elem(&self, index: usize) -> Option<&PathElem> {
        self.elems.get(index)
    }

    pub fn elem_mut(&mut self, index: usize) -> Option<&mut PathElem> {
        self.elems.get_mut(index)
    }

    /// Name of the element at `index`, or `""` when out of range
    pub fn elem_name(&self, index: usize) -> &str {
        self.elems.get(index).map(|e| e.name()).unwrap_or("")
    }

    pub fn last(&self) -> Option<&PathElem> {
        self.elems.last()
    }

    pub fn push(&mut self, elem: PathElem) {
        self.elems.push(elem);
    }

    /// Append the elements of a relative path string
    pub fn append_str(&mut self, suffix: &str) -> Result<()> {
        let tail = Path::parse(suffix)?;
        self.elems.extend(tail.elems);
        Ok(())
    }

    /// Copy of this path extended by a relative path string
    pub fn join_str(&self, suffix: &str) -> Result<Path> {
        let mut p = self.clone();
        p.append_str(suffix)?;
        Ok(p)
    }

    /// Copy of this path extended by another path
    pub fn join(&self, suffix: &Path) -> Path {
        let mut p = self.clone();
        p.elems.extend(suffix.elems.iter().cloned());
        p
    }

    /// Elements `[start, end)`, clamped to the path length
    pub fn sub_path(&self, start: usize, end: usize) -> Path {
        let end = end.min(self.elems.len());
        let start = start.min(end);
        Path {
            elems: self.elems[start..end].to_vec(),
        }
    }

    /// Path without its last element
    pub fn parent(&self) -> Path {
        self.sub_path(0, self.elems.len().saturating_sub(1))
    }

    /// Whether any element has a wildcard key value
    pub fn has_wildcard_key(&self) -> bool {
        self.elems.iter().any(PathElem::has_wildcard_key)
    }

    /// Whether the element at `index` has a wildcard key value
    pub fn has_wildcard_at(&self, index: usize) -> bool {
        self.elems
            .get(index)
            .map(PathElem::has_wildcard_key)
            .unwrap_or(false)
    }

    /// Checks whether this path matches a template path.
    ///
    /// The path must be at least as long as the template. Element names and
    /// key name sets must be equal for the template's length. A wildcard
    /// value in the template matches any value; a wildcard in this path only
    /// matches a wildcard in the template.
    ///
    /// ```text
    /// "AA/BB/CC"        matches         "AA/BB"
    /// "AA/BB[x=1][y=1]" matches         "AA/BB[x=1][y=*]"
    /// "AA/BB[x=1]"      does not match  "AA/BB[x=1][y=*]"
    /// "AA/BB[x=*]"      does not match  "AA/BB[x=1]"
    /// ```
    pub fn matches(&self, template: &Path) -> bool {
        if self.elems.is_empty() || self.elems.len() < template.elems.len() {
            return false;
        }

        template.elems.iter().zip(&self.elems).all(|(t, p)| {
            t.name == p.name
                && t.keys.len() == p.keys.len()
                && t.keys.iter().all(|(k, tv)| match p.keys.get(k) {
                    Some(pv) => tv == WILDCARD || tv == pv,
                    None => false,
                })
        })
    }

    /// Strip `module:` prefixes from every element name
    pub fn remove_module_prefix(&mut self) {
        for e in &mut self.elems {
            if let Some(i) = e.name.find(':') {
                e.name = e.name[i + 1..].to_string();
            }
        }
    }

    /// Whether `prefix` element names are a prefix of this path's names,
    /// ignoring keys and module prefixes
    pub fn starts_with_names(&self, prefix: &Path) -> bool {
        prefix.elems.len() <= self.elems.len()
            && prefix
                .elems
                .iter()
                .zip(&self.elems)
                .all(|(a, b)| a.local_name() == b.local_name())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elems.is_empty() {
            return f.write_str("/");
        }
        for e in &self.elems {
            write!(f, "/{}", e)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self> {
        Path::parse(s)
    }
}

/// Checks a path string for wildcard key values without parsing it.
///
/// Equivalent to `Path::parse(p)?.has_wildcard_key()` for well formed input.
pub fn str_has_wildcard_key(p: &str) -> bool {
    let bytes = p.as_bytes();
    let (mut in_key, mut in_value, mut in_escape) = (false, false, false);

    for (i, &c) in bytes.iter().enumerate() {
        if in_escape {
            in_escape = false;
            continue;
        }
        match c {
            b'\\' => in_escape = true,
            b'[' if !in_value => in_key = true,
            b'=' if in_key => {
                if wildcard_value_at(bytes, i + 1) {
                    return true;
                }
                in_value = true;
                in_key = false;
            }
            b']' if in_value => in_value = false,
            _ => {}
        }
    }
    false
}

fn wildcard_value_at(bytes: &[u8], mut index: usize) -> bool {
    let mut remaining = bytes.len() - index;
    // `\*` parses to the same value as `*`
    if remaining > 2 && bytes[index] == b'\\' {
        remaining -= 1;
        index += 1;
    }
    remaining > 1 && bytes[index] == b'*' && bytes[index + 1] == b']'
}

/// Split a path string into its parent prefix and last element.
///
/// Slashes inside key predicates are ignored and a trailing slash is dropped.
/// The last element keeps its leading `/`.
pub fn split_last_elem(p: &str) -> (&str, &str) {
    let p = p.strip_suffix('/').unwrap_or(p);
    let mut last_slash = 0;
    let (mut in_escape, mut in_key) = (false, false);

    for (i, c) in p.char_indices() {
        match c {
            _ if in_escape => in_escape = false,
            '/' if !in_key => last_slash = i,
            '[' => in_key = true,
            ']' => in_key = false,
            '\\' => in_escape = true,
            _ => {}
        }
    }
    p.split_at(last_slash)
}
