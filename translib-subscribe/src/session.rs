//! Client sessions shared across subscribe API calls
//!
//! A [`SubscribeSession`] lets a client run `is_subscribe_supported` and
//! then `subscribe`/`stream` for the same paths without translating them
//! twice. The session also scopes request ids: calls made with a session
//! are numbered `s<N>.0`, `s<N>.1`, ...

use std::sync::Arc;

use dashmap::DashMap;

use crate::counter::{Counter, SUBSCRIBE_COUNTER};
use crate::translate::TranslatedSubData;

/// Cache of translated paths for one logical client session.
///
/// Created by the caller and closed by the caller; a closed session drops
/// its cache and must not be reused.
#[derive(Debug)]
pub struct SubscribeSession {
    id: String,
    call_counter: Counter,
    cache: DashMap<String, Arc<TranslatedSubData>>,
}

impl SubscribeSession {
    pub fn new() -> Self {
        Self {
            id: format!("s{}", SUBSCRIBE_COUNTER.next()),
            call_counter: Counter::new(),
            cache: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Release the cached translations
    pub fn close(&self) {
        tracing::debug!(session = %self.id, paths = self.cache.len(), "closing subscribe session");
        self.cache.clear();
    }

    /// Number of request paths with cached translations
    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn get(&self, path: &str) -> Option<Arc<TranslatedSubData>> {
        self.cache.get(path).map(|e| e.value().clone())
    }

    pub(crate) fn put(&self, path: &str, data: Arc<TranslatedSubData>) {
        self.cache.insert(path.to_string(), data);
    }

    fn next_call_id(&self) -> String {
        format!("{}.{}", self.id, self.call_counter.next() - 1)
    }
}

impl Default for SubscribeSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Request id for one API call
pub(crate) fn context_id(session: Option<&SubscribeSession>) -> String {
    match session {
        Some(s) => s.next_call_id(),
        None => format!("s{}.0", SUBSCRIBE_COUNTER.next()),
    }
}
