//! Public subscribe APIs.
//!
//! [`Translib`] ties the app registry, a store connector and the
//! subscription registry together and exposes the three client calls:
//!
//! - `subscribe`: register on-change watches for a set of paths, send their
//!   current state followed by a sync marker, then stream changes until the
//!   request's stop signal fires
//! - `stream`: one-shot dump of the paths followed by a sync marker
//! - `is_subscribe_supported`: capability probe, no watches registered
//!
//! # Example
//!
//! ```rust,ignore
//! use crossbeam::channel::unbounded;
//! use translib_subscribe::{stop_channel, SubscribeRequest, Translib};
//!
//! let translib = Translib::new(apps, Arc::new(store.connector()));
//! let (tx, rx) = unbounded();
//! let (handle, signal) = stop_channel();
//!
//! translib.subscribe(
//!     SubscribeRequest::new(["/openconfig-interfaces:interfaces/interface[name=*]"], tx)
//!         .with_stop(signal),
//! )?;
//!
//! for msg in rx.iter() {
//!     if msg.sync_complete {
//!         break;
//!     }
//! }
//!
//! handle.stop();
//! ```

use std::sync::Arc;

use crossbeam::channel::{self, Sender};
use translib_db::{DbConnector, DbError, DbSet};

use crate::app::AppRegistry;
use crate::config::SubscribeConfig;
use crate::dispatch::send_initial_update;
use crate::error::{Result, SubscribeError};
use crate::group::GroupSet;
use crate::lifecycle::{spawn_worker, watch_handler, ChangeMsg, SubscriptionRegistry, SubscriptionSession};
use crate::message::{IsSubscribeRequest, IsSubscribeResponse, NotificationType, SubscribeRequest};
use crate::session::context_id;
use crate::translate::{collect_preferences, SubscribeContext};

/// Entry point of the subscription engine.
///
/// One instance serves any number of concurrent requests. Active
/// on-change subscriptions are tracked in the shared
/// [`SubscriptionRegistry`] until their stop signal fires.
pub struct Translib {
    apps: AppRegistry,
    connector: Arc<dyn DbConnector>,
    registry: Arc<SubscriptionRegistry>,
    config: SubscribeConfig,
}

impl Translib {
    /// Create an engine with the default configuration
    pub fn new(apps: AppRegistry, connector: Arc<dyn DbConnector>) -> Self {
        Self {
            apps,
            connector,
            registry: Arc::new(SubscriptionRegistry::new()),
            config: SubscribeConfig::default(),
        }
    }

    /// Replace the configuration after validating it
    pub fn with_config(mut self, config: SubscribeConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &SubscribeConfig {
        &self.config
    }

    /// Registry of the active on-change subscriptions
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribe to on-change notifications for `req.paths`.
    ///
    /// Returns once the initial state of every path and the sync marker have
    /// been queued. Changes are delivered afterwards from a worker thread
    /// until `req.stop` fires, at which point all watches and connections of
    /// the request are released.
    ///
    /// Translation and watch registration failures are returned; nothing is
    /// left registered in that case. A store watch that fails during the
    /// initial sync replaces the sync marker with the terminate marker.
    pub fn subscribe(&self, req: SubscribeRequest) -> Result<()> {
        let stop = req
            .stop
            .clone()
            .ok_or_else(|| SubscribeError::InvalidRequest("subscribe requires a stop signal".to_string()))?;
        let id = context_id(req.session.as_deref());
        tracing::info!(id = %id, paths = ?req.paths, stop = %stop.id(), "subscribe");

        let dbs = DbSet::open_all(self.connector.as_ref(), true, true)?;

        let mut ctx = SubscribeContext::new(id.clone(), &dbs, &self.apps, &self.config, req.session.as_deref())
            .with_recurse();
        if let Err(e) = translate_paths(&mut ctx, &req.paths, NotificationType::OnChange) {
            dbs.close_all();
            return Err(e);
        }
        let SubscribeContext { targets, groups, .. } = ctx;

        let session = Arc::new(SubscriptionSession::new(id, req.queue, dbs));
        self.registry.register(stop.id(), session.clone());

        let (changes_tx, changes_rx) = channel::bounded(self.config.change_buffer_size);
        if let Err(e) = self.start_watches(&session, groups, &changes_tx) {
            tracing::warn!(id = %session.id, error = %e, "db subscribe failed");
            self.registry.cleanup(stop.id());
            return Err(e);
        }

        for info in &targets {
            if let Err(e) = send_initial_update(&session, info, &self.config) {
                tracing::warn!(id = %session.id, path = %info.path, error = %e, "initial sync failed");
                self.registry.cleanup(stop.id());
                return Err(e);
            }
        }

        if session.complete_sync() {
            tracing::debug!(id = %session.id, "subscription terminated during initial sync");
        }

        if let Err(e) = spawn_worker(session.clone(), self.registry.clone(), changes_rx, stop.clone()) {
            self.registry.cleanup(stop.id());
            return Err(e);
        }
        tracing::debug!(id = %session.id, targets = targets.len(), "subscription active");
        Ok(())
    }

    /// Register one watch per database covering every grouped table
    fn start_watches(
        &self,
        session: &Arc<SubscriptionSession>,
        groups: GroupSet,
        changes: &Sender<ChangeMsg>,
    ) -> Result<()> {
        for (db_num, groups) in groups.into_db_groups() {
            let db = session
                .dbs
                .get(db_num)
                .ok_or(SubscribeError::Registration(DbError::ConnectionClosed))?;

            let mut skeys = Vec::new();
            for group in &groups {
                tracing::debug!(
                    id = %session.id, db = %db_num, table = %group.table, patterns = group.infos.len(),
                    "registering notification group"
                );
                skeys.extend(group.to_skeys());
                db.register_table_for_on_change_caching(&group.table)
                    .map_err(SubscribeError::Registration)?;
            }
            if skeys.is_empty() {
                continue;
            }

            let handler = watch_handler(Arc::downgrade(&self.registry), changes.clone());
            let watch = db.subscribe(skeys, handler).map_err(SubscribeError::Registration)?;
            self.registry.track_watch(watch.id(), session.clone());
            session.add_watch(watch);
        }
        Ok(())
    }

    /// Send the current values of `req.paths` followed by a sync marker.
    ///
    /// Blocks until everything is queued. `req.stop` is ignored.
    pub fn stream(&self, req: SubscribeRequest) -> Result<()> {
        let id = context_id(req.session.as_deref());
        tracing::info!(id = %id, paths = ?req.paths, "stream");

        let dbs = DbSet::open_all(self.connector.as_ref(), true, false)?;

        let mut ctx = SubscribeContext::new(id.clone(), &dbs, &self.apps, &self.config, req.session.as_deref());
        if let Err(e) = translate_paths(&mut ctx, &req.paths, NotificationType::Sample) {
            dbs.close_all();
            return Err(e);
        }
        let targets = ctx.targets;

        let session = SubscriptionSession::new(id, req.queue, dbs);
        let result = targets
            .iter()
            .try_for_each(|info| send_initial_update(&session, info, &self.config));

        if result.is_ok() {
            session.complete_sync();
        }
        session.dbs.close_all();
        result
    }

    /// Report how each requested path can be subscribed.
    ///
    /// Returns one response per request path, in order, followed by one
    /// response per sample sub-path split out of target-defined requests.
    /// Per-path failures are reported in the response's `error`. Translations
    /// are saved to `req.session` for a following `subscribe` or `stream`.
    pub fn is_subscribe_supported(&self, req: &IsSubscribeRequest) -> Result<Vec<IsSubscribeResponse>> {
        let id = context_id(req.session.as_deref());
        tracing::info!(id = %id, paths = req.paths.len(), "is_subscribe_supported");

        let min_interval = self.config.min_sample_interval;
        let mut responses: Vec<IsSubscribeResponse> = req
            .paths
            .iter()
            .map(|p| IsSubscribeResponse::new(p.id, p.path.clone(), min_interval))
            .collect();

        let dbs = DbSet::open_all(self.connector.as_ref(), true, false)?;
        let ctx = SubscribeContext::new(id.clone(), &dbs, &self.apps, &self.config, req.session.as_deref())
            .with_recurse();

        let mut sub_responses = Vec::new();
        for (resp, p) in responses.iter_mut().zip(&req.paths) {
            let mut info = match ctx.translate_subscribe(&p.path, p.mode) {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!(id = %id, path = %p.path, error = %e, "path not subscribable");
                    resp.error = Some(e);
                    continue;
                }
            };

            if p.mode == NotificationType::TargetDefined {
                for mut sub in info.segregate_sample_subpaths(&id) {
                    let mut sub_resp = IsSubscribeResponse::new(p.id, sub.path.clone(), min_interval);
                    sub_resp.is_sub_path = true;
                    collect_preferences(&sub.response.targets, &mut sub_resp);
                    collect_preferences(&sub.response.children, &mut sub_resp);
                    sub.save_to_session(&id, req.session.as_deref());
                    sub_responses.push(sub_resp);
                }
            }

            collect_preferences(&info.response.targets, resp);
            collect_preferences(&info.response.children, resp);
            info.save_to_session(&id, req.session.as_deref());
        }
        dbs.close_all();

        responses.extend(sub_responses);
        for (i, r) in responses.iter().enumerate() {
            tracing::debug!(
                id = %id, index = i, path = %r.path, on_change = r.on_change_supported,
                preferred = %r.preferred, min_interval = r.min_interval, error = ?r.error,
                "is_subscribe response"
            );
        }
        Ok(responses)
    }
}

fn translate_paths(ctx: &mut SubscribeContext<'_>, paths: &[String], mode: NotificationType) -> Result<()> {
    for path in paths {
        ctx.translate_and_add_path(path, mode)?;
    }
    Ok(())
}

impl std::fmt::Debug for Translib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translib")
            .field("apps", &self.apps)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
