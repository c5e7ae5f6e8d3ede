//! Keyspace notification types

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::key::{Key, TableSpec};

/// Kind of keyspace notification delivered to a watch handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SEvent {
    /// One or more fields were set
    HSet,
    /// One or more fields were removed
    HDel,
    /// The entry was deleted
    Del,
    /// The watch was closed by `unsubscribe`
    Close,
    /// The watch failed and will deliver nothing more
    Err,
}

impl fmt::Display for SEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SEvent::HSet => "hset",
            SEvent::HDel => "hdel",
            SEvent::Del => "del",
            SEvent::Close => "close",
            SEvent::Err => "err",
        };
        f.write_str(s)
    }
}

/// Opaque context attached to a subscription key
pub type Opaque = Arc<dyn Any + Send + Sync>;

/// A subscription key: table plus key pattern, with caller context that is
/// handed back on every notification for it.
#[derive(Clone)]
pub struct SKey {
    pub ts: TableSpec,
    pub key: Key,
    pub opaque: Option<Opaque>,
}

impl SKey {
    pub fn new(ts: TableSpec, key: Key) -> Self {
        Self {
            ts,
            key,
            opaque: None,
        }
    }

    pub fn with_opaque(mut self, opaque: Opaque) -> Self {
        self.opaque = Some(opaque);
        self
    }

    /// Downcast the opaque context
    pub fn opaque_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.opaque.clone().and_then(|o| o.downcast::<T>().ok())
    }
}

impl fmt::Debug for SKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SKey")
            .field("ts", &self.ts.name)
            .field("key", &self.key.comps)
            .field("has_opaque", &self.opaque.is_some())
            .finish()
    }
}

/// Unique identifier for one keyspace watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// Callback invoked for every keyspace notification of a watch.
///
/// Arguments are the watch that fired, the subscription key whose pattern
/// matched, the concrete key that changed and the event kind.
pub type WatchHandler = Arc<dyn Fn(WatchId, &SKey, &Key, SEvent) + Send + Sync>;
