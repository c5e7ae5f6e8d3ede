//! Path translation adapter
//!
//! Wraps the app modules' `translate_subscribe` callback: validates every
//! returned [`PathTarget`], turns them into [`NotificationInfo`]s, caches the
//! result in the caller's [`SubscribeSession`] and, for target-defined
//! requests, splits sample-preferring targets into their own sub-paths.

use std::sync::Arc;

use translib_db::DbSet;
use translib_path::{str_has_wildcard_key, Path};

use crate::app::{AppModule, AppRegistry, PathTarget, TranslateSubscribeRequest, TranslateSubscribeResponse};
use crate::config::SubscribeConfig;
use crate::error::{Result, SubscribeError};
use crate::group::GroupSet;
use crate::info::NotificationInfo;
use crate::message::{IsSubscribeResponse, NotificationType};
use crate::session::SubscribeSession;

/// Notification infos derived from one translated path
#[derive(Debug, Default)]
pub(crate) struct TranslatedSubData {
    pub targets: Vec<Arc<NotificationInfo>>,
    pub children: Vec<Arc<NotificationInfo>>,
}

/// App module response for one path, with the module that produced it
pub(crate) struct TranslatedPathInfo {
    pub path: String,
    pub response: TranslateSubscribeResponse,
    app: Arc<dyn AppModule>,
    data: Option<Arc<TranslatedSubData>>,
}

impl TranslatedPathInfo {
    pub fn new(path: impl Into<String>, app: Arc<dyn AppModule>, response: TranslateSubscribeResponse) -> Self {
        Self {
            path: path.into(),
            response,
            app,
            data: None,
        }
    }

    /// Notification infos for the response, built once
    pub fn sub_data(&mut self) -> Arc<TranslatedSubData> {
        if let Some(data) = &self.data {
            return data.clone();
        }
        let build = |targets: &[PathTarget]| -> Vec<Arc<NotificationInfo>> {
            targets
                .iter()
                .filter_map(|t| NotificationInfo::new(t, self.app.clone()))
                .map(Arc::new)
                .collect()
        };
        let data = Arc::new(TranslatedSubData {
            targets: build(&self.response.targets),
            children: build(&self.response.children),
        });
        self.data = Some(data.clone());
        data
    }

    pub fn save_to_session(&mut self, ctx_id: &str, session: Option<&SubscribeSession>) {
        let Some(session) = session else {
            return;
        };
        tracing::debug!(id = ctx_id, path = %self.path, "caching translation in session");
        let data = self.sub_data();
        session.put(&self.path, data);
    }

    fn clone_for_sub_path(&self, target: PathTarget) -> Self {
        let path = target
            .path
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        TranslatedPathInfo::new(
            path,
            self.app.clone(),
            TranslateSubscribeResponse {
                targets: vec![target],
                children: Vec::new(),
            },
        )
    }

    /// Split sample-preferring targets and children out of a target-defined
    /// translation.
    ///
    /// Returns nothing when the path prefers only one notification kind.
    /// Otherwise this info keeps the on-change targets and children, and one
    /// new info is returned per sample subtree. Sample mappings under an
    /// already split subtree join it instead of creating another.
    pub fn segregate_sample_subpaths(&mut self, ctx_id: &str) -> Vec<TranslatedPathInfo> {
        let (sample, on_change): (Vec<PathTarget>, Vec<PathTarget>) =
            std::mem::take(&mut self.response.targets)
                .into_iter()
                .partition(PathTarget::prefers_sample);

        if on_change.is_empty() {
            tracing::debug!(id = ctx_id, path = %self.path, "path prefers sample only");
            self.response.targets = sample;
            return Vec::new();
        }
        self.response.targets = on_change;

        let mut subs: Vec<TranslatedPathInfo> = Vec::new();
        for t in sample {
            match find_parent_info(&subs, t.path.as_ref()) {
                Some(i) => subs[i].response.targets.push(t),
                None => subs.push(self.clone_for_sub_path(t)),
            }
        }

        let mut kept = Vec::new();
        for c in std::mem::take(&mut self.response.children) {
            if !c.prefers_sample() {
                kept.push(c);
                continue;
            }
            match find_parent_info(&subs, c.path.as_ref()) {
                Some(i) => subs[i].response.children.push(c),
                None => subs.push(self.clone_for_sub_path(c)),
            }
        }
        self.response.children = kept;
        self.data = None;

        tracing::debug!(
            id = ctx_id,
            on_change = %self.path,
            sample = ?subs.iter().map(|s| s.path.as_str()).collect::<Vec<_>>(),
            "segregated target-defined path"
        );
        subs
    }
}

fn find_parent_info(infos: &[TranslatedPathInfo], path: Option<&Path>) -> Option<usize> {
    let path = path?;
    infos.iter().position(|info| {
        info.response
            .targets
            .iter()
            .any(|t| t.path.as_ref().is_some_and(|tp| path.matches(tp)))
    })
}

/// Fold the preferences of translated targets into a capability response
pub(crate) fn collect_preferences(targets: &[PathTarget], resp: &mut IsSubscribeResponse) {
    for t in targets {
        if !t.on_change_supported {
            resp.on_change_supported = false;
        }
        if t.is_non_db() {
            resp.wildcard_supported = false;
            resp.on_change_supported = false;
            resp.preferred = NotificationType::Sample;
        }
        if t.preferred == NotificationType::Sample {
            resp.preferred = NotificationType::Sample;
        }
        if t.min_interval > resp.min_interval {
            resp.min_interval = t.min_interval;
        }
    }
}

/// State of one subscribe API call while its paths are translated
pub(crate) struct SubscribeContext<'a> {
    pub id: String,
    pub dbs: &'a DbSet,
    pub apps: &'a AppRegistry,
    pub config: &'a SubscribeConfig,
    pub session: Option<&'a SubscribeSession>,
    /// Collect child mappings even for sample requests
    pub recurse: bool,
    pub targets: Vec<Arc<NotificationInfo>>,
    pub groups: GroupSet,
}

impl<'a> SubscribeContext<'a> {
    pub fn new(
        id: String,
        dbs: &'a DbSet,
        apps: &'a AppRegistry,
        config: &'a SubscribeConfig,
        session: Option<&'a SubscribeSession>,
    ) -> Self {
        Self {
            id,
            dbs,
            apps,
            config,
            session,
            recurse: false,
            targets: Vec::new(),
            groups: GroupSet::default(),
        }
    }

    pub fn with_recurse(mut self) -> Self {
        self.recurse = true;
        self
    }

    /// Ask the owning app module to translate `path` and validate the result
    pub fn translate_subscribe(&self, path: &str, mode: NotificationType) -> Result<TranslatedPathInfo> {
        let app = self.apps.lookup(path)?;
        let recurse = self.recurse || mode != NotificationType::Sample;
        tracing::debug!(id = %self.id, path, mode = %mode, recurse, "calling translate_subscribe");

        let req = TranslateSubscribeRequest {
            ctx_id: &self.id,
            path,
            mode,
            recurse,
            dbs: self.dbs,
        };
        let mut response = app.translate_subscribe(&req).map_err(|source| {
            tracing::warn!(id = %self.id, path, error = %source, "translate_subscribe failed");
            SubscribeError::Translation {
                path: path.to_string(),
                source,
            }
        })?;

        if response.targets.is_empty() {
            tracing::warn!(id = %self.id, path, "translate_subscribe returned no targets");
            let kind = if str_has_wildcard_key(path) { "wildcard " } else { "" };
            return Err(SubscribeError::NotSupported(format!("{}path not supported: {}", kind, path)));
        }

        tracing::debug!(
            id = %self.id, path,
            targets = response.targets.len(), children = response.children.len(),
            "path translated"
        );

        response.targets = self.validate_all(std::mem::take(&mut response.targets), "target")?;
        response.children = self.validate_all(std::mem::take(&mut response.children), "child")?;
        if response.targets.is_empty() {
            return Err(SubscribeError::Internal(format!("no valid target mapping for {}", path)));
        }

        Ok(TranslatedPathInfo::new(path, app, response))
    }

    fn validate_all(&self, targets: Vec<PathTarget>, kind: &str) -> Result<Vec<PathTarget>> {
        let mut valid = Vec::with_capacity(targets.len());
        for (i, mut t) in targets.into_iter().enumerate() {
            tracing::trace!(id = %self.id, "{}[{}] = {}", kind, i, t);
            if self.validate(&mut t)? {
                valid.push(t);
            }
        }
        Ok(valid)
    }

    /// Check one target. `Ok(false)` drops a target that breaks the app
    /// contract; unsupported shapes fail the request.
    fn validate(&self, t: &mut PathTarget) -> Result<bool> {
        let Some(path) = t.path.clone() else {
            tracing::warn!(id = %self.id, "app returned a target without path; dropped");
            return Ok(false);
        };

        if t.is_non_db() {
            if t.on_change_supported {
                t.on_change_supported = false;
                t.preferred = NotificationType::Sample;
            }
            if path.has_wildcard_key() {
                tracing::debug!(id = %self.id, path = %path, "wildcard keys in non-db path");
                return Err(SubscribeError::NotSupported(format!(
                    "Wildcard keys not supported: {}",
                    path
                )));
            }
        }

        if t.dynamic {
            if !self.config.is_dynamic_source_allowed(path.elem_name(0)) {
                tracing::warn!(id = %self.id, path = %path, "dynamic source outside allowed namespaces");
                return Err(SubscribeError::NotSupported(format!("Subscribe not supported: {}", path)));
            }
            if path.sub_path(0, path.len().saturating_sub(1)).has_wildcard_key() {
                tracing::debug!(id = %self.id, path = %path, "wildcard before last element of dynamic path");
                return Err(SubscribeError::NotSupported(format!(
                    "Wildcard keys not supported: {}",
                    path
                )));
            }
        }

        if !t.key_group.is_empty() {
            let key_len = match (&t.key, t.is_non_db()) {
                (Some(key), false) => key.len(),
                _ => {
                    tracing::warn!(id = %self.id, path = %path, "key group on non-db path; dropped");
                    return Ok(false);
                }
            };
            if t.key_group.iter().any(|&k| k >= key_len) {
                tracing::warn!(
                    id = %self.id, path = %path, key_group = ?t.key_group, key_len,
                    "key group index out of range; dropped"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Translate a path (or reuse the session's translation) and record its
    /// targets. On-change requests also group targets and children for
    /// watch registration.
    pub fn translate_and_add_path(&mut self, path: &str, mode: NotificationType) -> Result<()> {
        let cached = self.session.and_then(|s| s.get(path));
        let data = match cached {
            Some(data) => {
                tracing::debug!(id = %self.id, path, "using translation cached in session");
                data
            }
            None => self.translate_subscribe(path, mode)?.sub_data(),
        };

        self.targets.extend(data.targets.iter().cloned());

        if mode == NotificationType::OnChange {
            for info in data.targets.iter().chain(&data.children) {
                self.groups.add(info.clone());
            }
        }
        Ok(())
    }
}
