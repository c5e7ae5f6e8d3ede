//! Subscription lifecycle
//!
//! A [`SubscriptionRegistry`] tracks every live on-change subscription by
//! its stop signal and every store watch by id. Store callbacks only enqueue
//! changes; each subscription has one worker thread that processes them and
//! that tears the subscription down once its stop signal fires.
//!
//! ```text
//!  store writer ──(WatchHandler)──> change channel ──> session worker ──> queue
//!                                                          │
//!  StopHandle::stop ───────────────> StopSignal ───────────┘──> cleanup
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use translib_db::{DbSet, Key, SEvent, SKey, Watch, WatchHandler, WatchId};

use crate::counter::{Counter, NOTIFICATION_COUNTER};
use crate::error::{Result, SubscribeError};
use crate::message::SubscribeResponse;
use crate::processor;

static STOP_COUNTER: Counter = Counter::new();

/// Identifier of one stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StopId(u64);

impl StopId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stop-{}", self.0)
    }
}

/// Caller side of a stop signal. Stopping or dropping it ends the
/// subscription.
#[derive(Debug)]
pub struct StopHandle {
    _tx: Sender<()>,
    id: StopId,
}

impl StopHandle {
    pub fn id(&self) -> StopId {
        self.id
    }

    /// End the subscription
    pub fn stop(self) {
        tracing::debug!(stop = %self.id, "stop requested");
    }
}

/// Engine side of a stop signal
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
    id: StopId,
}

impl StopSignal {
    pub fn id(&self) -> StopId {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Block until the signal fires
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

/// Create a connected stop handle and signal
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = channel::bounded(0);
    let id = StopId(STOP_COUNTER.next());
    (StopHandle { _tx: tx, id }, StopSignal { rx, id })
}

/// One keyspace notification queued for a session worker
pub(crate) struct ChangeMsg {
    pub nid: String,
    pub skey: SKey,
    pub key: Key,
    pub event: SEvent,
}

/// Sync and terminate markers of one session
#[derive(Debug, Default)]
struct SyncState {
    sync_done: bool,
    /// A watch failed before the initial sync completed
    term_pending: bool,
    term_done: bool,
}

/// State of one `subscribe` or `stream` call
pub(crate) struct SubscriptionSession {
    pub id: String,
    pub queue: Sender<SubscribeResponse>,
    pub dbs: DbSet,
    sync: Mutex<SyncState>,
    watches: Mutex<Vec<Box<dyn Watch>>>,
}

impl SubscriptionSession {
    pub fn new(id: impl Into<String>, queue: Sender<SubscribeResponse>, dbs: DbSet) -> Self {
        Self {
            id: id.into(),
            queue,
            dbs,
            sync: Mutex::new(SyncState::default()),
            watches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_sync_done(&self) {
        self.sync.lock().sync_done = true;
    }

    pub fn is_sync_done(&self) -> bool {
        self.sync.lock().sync_done
    }

    /// Mark the initial sync complete and queue the sync marker.
    ///
    /// When a watch failed during the initial sync the terminate marker is
    /// queued instead, and `true` is returned.
    pub fn complete_sync(&self) -> bool {
        let mut state = self.sync.lock();
        state.sync_done = true;
        let terminated = state.term_pending && !state.term_done;
        if terminated {
            tracing::warn!(id = %self.id, "store watch failed during initial sync; terminating subscription");
            state.term_done = true;
        }
        self.queue_sync(true, terminated);
        terminated
    }

    /// Queue the terminate marker, at most once. Before the initial sync
    /// completes the marker is deferred to [`Self::complete_sync`].
    pub fn send_terminated(&self) {
        let mut state = self.sync.lock();
        if state.term_done {
            return;
        }
        if !state.sync_done {
            tracing::warn!(id = %self.id, "store watch failed during initial sync");
            state.term_pending = true;
            return;
        }
        state.term_done = true;
        tracing::warn!(id = %self.id, "store watch failed; terminating subscription");
        self.queue_sync(true, true);
    }

    fn queue_sync(&self, sync_done: bool, is_terminated: bool) {
        tracing::info!(id = %self.id, sync_done, is_terminated, "sending sync notification");
        if let Err(e) = self.queue.send(SubscribeResponse::sync(sync_done, is_terminated)) {
            tracing::warn!(id = %self.id, error = %e, "response queue error");
        }
    }

    pub fn add_watch(&self, watch: Box<dyn Watch>) {
        self.watches.lock().push(watch);
    }

    /// Unsubscribe every watch and close the connections
    fn release(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        tracing::debug!(id = %self.id, watches = watches.len(), "releasing subscription");
        for w in watches {
            w.unsubscribe();
        }
        self.dbs.close_all();
    }
}

impl fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("id", &self.id)
            .field("sync_done", &self.is_sync_done())
            .field("watches", &self.watches.lock().len())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<StopId, Arc<SubscriptionSession>>,
    watches: HashMap<WatchId, Arc<SubscriptionSession>>,
}

/// Live subscriptions by stop signal, and their watches by id.
///
/// All bookkeeping happens under one mutex; store calls never do.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, stop: StopId, session: Arc<SubscriptionSession>) {
        tracing::debug!(id = %session.id, stop = %stop, "registering subscription");
        self.inner.lock().sessions.insert(stop, session);
    }

    pub(crate) fn track_watch(&self, watch: WatchId, session: Arc<SubscriptionSession>) {
        self.inner.lock().watches.insert(watch, session);
    }

    /// Stop tracking a watch, returning its session if it was tracked
    pub(crate) fn forget_watch(&self, watch: WatchId) -> Option<Arc<SubscriptionSession>> {
        self.inner.lock().watches.remove(&watch)
    }

    /// Release the subscription registered under `stop`.
    ///
    /// Returns `false` when there is nothing to release, so calling it twice
    /// is harmless.
    pub fn cleanup(&self, stop: StopId) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.remove(&stop) else {
                return false;
            };
            inner.watches.retain(|_, s| !Arc::ptr_eq(s, &session));
            session
        };
        tracing::info!(id = %session.id, stop = %stop, "cleaning up subscription");
        session.release();
        true
    }

    /// Number of live subscriptions
    pub fn active_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Number of watches tracked for cleanup
    pub fn tracked_watches(&self) -> usize {
        self.inner.lock().watches.len()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("sessions", &inner.sessions.len())
            .field("watches", &inner.watches.len())
            .finish()
    }
}

/// Store callback for the watches of one subscription
pub(crate) fn watch_handler(registry: Weak<SubscriptionRegistry>, changes: Sender<ChangeMsg>) -> WatchHandler {
    Arc::new(move |watch: WatchId, skey: &SKey, key: &Key, event: SEvent| match event {
        SEvent::HSet | SEvent::HDel | SEvent::Del => {
            let nid = format!("n{}", NOTIFICATION_COUNTER.next());
            tracing::debug!(
                id = %nid, watch = %watch, table = %skey.ts, pattern = %skey.key, key = %key, event = %event,
                "store notification"
            );
            let msg = ChangeMsg {
                nid,
                skey: skey.clone(),
                key: key.clone(),
                event,
            };
            if changes.send(msg).is_err() {
                tracing::debug!(watch = %watch, "subscription worker gone; change dropped");
            }
        }
        SEvent::Close => {
            if let Some(registry) = registry.upgrade() {
                registry.forget_watch(watch);
            }
        }
        SEvent::Err => {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if let Some(session) = registry.forget_watch(watch) {
                session.send_terminated();
            }
        }
    })
}

/// Start the worker that processes changes until the stop signal fires,
/// then cleans up.
pub(crate) fn spawn_worker(
    session: Arc<SubscriptionSession>,
    registry: Arc<SubscriptionRegistry>,
    changes: Receiver<ChangeMsg>,
    stop: StopSignal,
) -> Result<JoinHandle<()>> {
    let name = format!("translib-sub-{}", session.id);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            tracing::debug!(id = %session.id, stop = %stop.id, "subscription worker started");
            loop {
                crossbeam::select! {
                    recv(changes) -> msg => match msg {
                        // select! picks randomly when both are ready
                        Ok(_) if stop.is_stopped() => break,
                        Ok(msg) => processor::process_change(&session, msg),
                        Err(_) => {
                            stop.wait();
                            break;
                        }
                    },
                    recv(stop.rx) -> _ => break,
                }
            }
            registry.cleanup(stop.id);
            tracing::debug!(id = %session.id, "subscription worker exited");
        })
        .map_err(|e| SubscribeError::Internal(format!("failed to start subscription worker: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crossbeam::channel::unbounded;
    use translib_db::{Database, DbConnector, DbNum, DbOptions, MemoryStore, TableSpec, Value};
    use translib_path::Path;

    use crate::app::PathTarget;
    use crate::group::{GroupSet, NotificationGroup};
    use crate::info::tests::info;

    fn session(store: &MemoryStore) -> (Arc<SubscriptionSession>, Receiver<SubscribeResponse>) {
        let dbs = DbSet::open_all(&store.connector(), true, true).unwrap();
        let (tx, rx) = unbounded();
        (Arc::new(SubscriptionSession::new("s1.0", tx, dbs)), rx)
    }

    #[test]
    fn test_stop_signal() {
        let (handle, signal) = stop_channel();
        assert_eq!(handle.id(), signal.id());
        assert!(!signal.is_stopped());
        handle.stop();
        assert!(signal.is_stopped());
        assert!(signal.clone().is_stopped());
    }

    #[test]
    fn test_stop_on_drop() {
        let (handle, signal) = stop_channel();
        drop(handle);
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, _rx) = session(&store);
        let (handle, _signal) = stop_channel();

        let (tx, _changes) = unbounded();
        let db = session.dbs.get(DbNum::ConfigDb).unwrap().clone();
        let watch = db
            .subscribe(
                vec![SKey::new(TableSpec::new("PORT"), Key::new(["*"]))],
                watch_handler(Arc::downgrade(&registry), tx),
            )
            .unwrap();
        registry.register(handle.id(), session.clone());
        registry.track_watch(watch.id(), session.clone());
        session.add_watch(watch);
        assert_eq!(store.watch_count(), 1);

        assert!(registry.cleanup(handle.id()));
        assert_eq!(registry.active_sessions(), 0);
        assert_eq!(registry.tracked_watches(), 0);
        assert_eq!(store.watch_count(), 0);
        assert!(!db.is_open());

        assert!(!registry.cleanup(handle.id()));
    }

    #[test]
    fn test_watch_error_terminates_once() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, rx) = session(&store);
        let ts = TableSpec::new("PORT");

        for _ in 0..2 {
            let (tx, _changes) = unbounded();
            let db = session.dbs.get(DbNum::ConfigDb).unwrap();
            let watch = db
                .subscribe(
                    vec![SKey::new(ts.clone(), Key::new(["*"]))],
                    watch_handler(Arc::downgrade(&registry), tx),
                )
                .unwrap();
            registry.track_watch(watch.id(), session.clone());
            session.add_watch(watch);
        }
        session.set_sync_done();

        store.inject_error(DbNum::ConfigDb, &ts);
        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_terminated && msgs[0].sync_complete);
        assert_eq!(registry.tracked_watches(), 0);
    }

    fn watch_port(store: &MemoryStore, registry: &Arc<SubscriptionRegistry>, session: &Arc<SubscriptionSession>) {
        let (tx, _changes) = unbounded();
        let db = session.dbs.get(DbNum::ConfigDb).unwrap();
        let watch = db
            .subscribe(
                vec![SKey::new(TableSpec::new("PORT"), Key::new(["*"]))],
                watch_handler(Arc::downgrade(registry), tx),
            )
            .unwrap();
        registry.track_watch(watch.id(), session.clone());
        session.add_watch(watch);
        assert_eq!(store.watch_count(), 1);
    }

    #[test]
    fn test_watch_error_during_initial_sync_replaces_sync_marker() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, rx) = session(&store);
        watch_port(&store, &registry, &session);

        store.inject_error(DbNum::ConfigDb, &TableSpec::new("PORT"));
        assert!(rx.try_recv().is_err());

        assert!(session.complete_sync());
        let msgs: Vec<_> = rx.try_iter().map(|m| (m.is_terminated, m.sync_complete)).collect();
        assert_eq!(msgs, vec![(true, true)]);

        session.send_terminated();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_complete_sync_without_error() {
        let store = MemoryStore::new();
        let (session, rx) = session(&store);
        assert!(!session.complete_sync());
        assert!(session.is_sync_done());
        let msgs: Vec<_> = rx.try_iter().map(|m| (m.is_terminated, m.sync_complete)).collect();
        assert_eq!(msgs, vec![(false, true)]);
    }

    /// Group for `/interfaces/interface[name=Ethernet0]` on PORT|Ethernet0,
    /// with the entry already in the session's on-change cache
    fn cached_port_group(store: &MemoryStore, session: &SubscriptionSession) -> Arc<NotificationGroup> {
        let ts = TableSpec::new("PORT");
        let key = Key::new(["Ethernet0"]);
        store.set_entry(DbNum::ConfigDb, &ts, &key, Value::from_pairs([("mtu", "9100")]));
        let db = session.dbs.get(DbNum::ConfigDb).unwrap();
        db.register_table_for_on_change_caching(&ts).unwrap();
        db.get_entry(&ts, &key).unwrap();

        let target = PathTarget::new(
            Path::parse("/interfaces/interface[name=Ethernet0]").unwrap(),
            DbNum::ConfigDb,
            ts,
            key,
        );
        let mut set = GroupSet::default();
        set.add(Arc::new(info(&target)));
        set.into_db_groups().remove(0).1.remove(0)
    }

    fn entry_deleted(group: &Arc<NotificationGroup>) -> ChangeMsg {
        ChangeMsg {
            nid: "n0".into(),
            skey: group.to_skeys().remove(0),
            key: Key::new(["Ethernet0"]),
            event: SEvent::Del,
        }
    }

    #[test]
    fn test_worker_delivers_queued_change() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, rx) = session(&store);
        session.set_sync_done();
        let group = cached_port_group(&store, &session);
        let (handle, signal) = stop_channel();
        registry.register(signal.id(), session.clone());

        let (change_tx, change_rx) = channel::bounded(4);
        change_tx.send(entry_deleted(&group)).unwrap();
        let worker = spawn_worker(session.clone(), registry.clone(), change_rx, signal).unwrap();

        let msg = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(msg.path, "/interfaces/interface[name=Ethernet0]");
        assert_eq!(msg.delete, vec![String::new()]);

        handle.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, rx) = session(&store);
        session.set_sync_done();
        let group = cached_port_group(&store, &session);
        let (handle, signal) = stop_channel();
        registry.register(signal.id(), session.clone());

        let (change_tx, change_rx) = channel::bounded(8);
        for _ in 0..8 {
            change_tx.send(entry_deleted(&group)).unwrap();
        }
        handle.stop();

        let worker = spawn_worker(session.clone(), registry.clone(), change_rx, signal).unwrap();
        worker.join().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.active_sessions(), 0);
    }

    #[test]
    fn test_worker_cleans_up_on_stop() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (session, _rx) = session(&store);
        let (handle, signal) = stop_channel();
        registry.register(signal.id(), session.clone());

        let (change_tx, change_rx) = channel::bounded(4);
        let worker = spawn_worker(session.clone(), registry.clone(), change_rx, signal).unwrap();

        // A change for an unknown group is ignored
        change_tx
            .send(ChangeMsg {
                nid: "n0".into(),
                skey: SKey::new(TableSpec::new("PORT"), Key::new(["*"])),
                key: Key::new(["Ethernet0"]),
                event: SEvent::HSet,
            })
            .unwrap();

        handle.stop();
        worker.join().unwrap();
        assert_eq!(registry.active_sessions(), 0);
        assert!(session.dbs.get(DbNum::ConfigDb).map_or(true, |d| !d.is_open()));
        drop(change_tx);
    }

    #[test]
    fn test_change_enqueue_after_worker_gone() {
        let store = MemoryStore::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let ts = TableSpec::new("PORT");
        let db = store
            .connector()
            .open(DbOptions::new(DbNum::ConfigDb).with_on_change())
            .unwrap();
        let (tx, rx) = channel::bounded(1);
        let _watch = db
            .subscribe(
                vec![SKey::new(ts.clone(), Key::new(["*"]))],
                watch_handler(Arc::downgrade(&registry), tx),
            )
            .unwrap();
        drop(rx);

        // Must not block or panic
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["Ethernet0"]), Value::from_pairs([("mtu", "1")]));
        store.set_entry(DbNum::ConfigDb, &ts, &Key::new(["Ethernet0"]), Value::from_pairs([("mtu", "2")]));
    }
}
