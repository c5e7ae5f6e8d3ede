//! Shared fixtures for the subscription integration tests.
//!
//! - [`InterfacesApp`]: serves `/openconfig-interfaces:interfaces/interface[name=*]`
//!   from CONFIG_DB `PORT`, STATE_DB `PORT_TABLE` and COUNTERS_DB `COUNTERS`;
//!   `ethernet/state/counters` reads `COUNTERS` through a field scan
//! - [`SystemApp`]: serves `/openconfig-system:system/clock` without the store
//! - [`Harness`]: a [`MemoryStore`] plus a [`Translib`] wired to both apps

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use translib_db::{DbNum, DbSet, Key, MemoryStore, TableSpec, Value};
use translib_path::Path;
use translib_subscribe::{
    AppError, AppModule, AppRegistry, DataNode, DataTree, FieldMapping, Notification, NotificationContext,
    NotificationSender, NotificationType, OnChangeHandler, PathTarget, ProcessSubscribeRequest, SubscribeResponse,
    TranslateSubscribeRequest, TranslateSubscribeResponse, Translib,
};

pub const INTERFACES: &str = "/openconfig-interfaces:interfaces";
pub const CLOCK: &str = "/openconfig-system:system/clock";

/// Counter fields of the COUNTERS table and the leaves they map to
pub const COUNTER_LEAVES: [(&str, &str); 3] =
    [("in_octets", "in-octets"), ("out_octets", "out-octets"), ("in_pkts", "in-pkts")];

/// Sample interval advertised for counters, in seconds
pub const COUNTERS_INTERVAL: u32 = 30;

pub const TIMEOUT: Duration = Duration::from_secs(3);

pub fn port_table() -> TableSpec {
    TableSpec::new("PORT")
}

pub fn port_state_table() -> TableSpec {
    TableSpec::new("PORT_TABLE")
}

pub fn counters_table() -> TableSpec {
    TableSpec::new("COUNTERS")
}

pub fn intf_path(name: &str) -> String {
    format!("{}/interface[name={}]", INTERFACES, name)
}

/// Path mapping for the interfaces subtree
#[derive(Default)]
pub struct InterfacesApp {
    translate_calls: AtomicUsize,
    fail_watches_on_get: Mutex<Option<MemoryStore>>,
}

impl InterfacesApp {
    pub fn translate_calls(&self) -> usize {
        self.translate_calls.load(Ordering::SeqCst)
    }

    /// Make the next `get` fail every PORT watch of `store` before reading
    pub fn fail_watches_on_next_get(&self, store: &MemoryStore) {
        *self.fail_watches_on_get.lock().unwrap() = Some(store.clone());
    }
}

fn port_target(path: Path, key: &Key) -> PathTarget {
    PathTarget::new(path, DbNum::ConfigDb, port_table(), key.clone()).with_on_change(true)
}

fn counters_target(path: Path, key: &Key) -> PathTarget {
    let mapping = COUNTER_LEAVES
        .iter()
        .fold(FieldMapping::new(""), |m, (field, leaf)| m.with_field(*field, *leaf));
    PathTarget::new(path, DbNum::CountersDb, counters_table(), key.clone())
        .with_on_change(true)
        .with_mapping(mapping)
}

fn counter_field(leaf: &str) -> Option<&'static str> {
    COUNTER_LEAVES.iter().find(|(_, l)| *l == leaf).map(|(f, _)| *f)
}

/// Reports the oper-status leaf of the changed port through `update_paths`
fn oper_status_handler() -> OnChangeHandler {
    Arc::new(|ctx: &NotificationContext<'_>, sender: &dyn NotificationSender| {
        let Some(name) = ctx.key.and_then(|k| k.get(0)) else {
            return;
        };
        sender.send(Notification {
            path: format!("{}/state", intf_path(name)),
            update_paths: vec!["/oper-status".to_string()],
            ..Default::default()
        });
    })
}

fn not_found(path: &Path) -> AppError {
    AppError::NotFound(path.to_string())
}

fn read(dbs: &DbSet, db: DbNum, ts: &TableSpec, key: &Key, path: &Path) -> Result<Value, AppError> {
    let conn = dbs.get(db).ok_or_else(|| AppError::Internal(format!("{} not open", db)))?;
    conn.get_entry(ts, key).map_err(|_| not_found(path))
}

fn config_tree(port: &Value) -> DataTree {
    let mut tree = DataTree::new();
    for leaf in ["mtu", "description"] {
        if let Some(v) = port.get(leaf) {
            tree.insert(leaf, DataNode::leaf(v));
        }
    }
    tree
}

fn counters_tree(counters: &Value) -> DataTree {
    let mut tree = DataTree::new();
    for (field, leaf) in COUNTER_LEAVES {
        if let Some(v) = counters.get(field) {
            tree.insert(leaf, DataNode::leaf(v));
        }
    }
    tree
}

fn leaf_of(value: &Value, field: &str, path: &Path) -> Result<DataNode, AppError> {
    value.get(field).map(DataNode::leaf).ok_or_else(|| not_found(path))
}

impl AppModule for InterfacesApp {
    fn translate_subscribe(
        &self,
        req: &TranslateSubscribeRequest<'_>,
    ) -> Result<TranslateSubscribeResponse, AppError> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        let path = Path::parse(req.path).map_err(|e| AppError::InvalidArgument(e.to_string()))?;
        let name = path
            .elem(1)
            .and_then(|e| e.key("name"))
            .ok_or_else(|| AppError::NotSupported(req.path.to_string()))?;
        let key = Key::new([name]);
        let intf = path.sub_path(0, 2);
        let names: Vec<&str> = path.elems().iter().skip(2).map(|e| e.name()).collect();

        let mut resp = TranslateSubscribeResponse::default();
        match names.as_slice() {
            [] => {
                resp.targets.push(
                    port_target(path.clone(), &key).with_mapping(
                        FieldMapping::new("config")
                            .with_field("mtu", "mtu")
                            .with_field("description", "description"),
                    ),
                );
                if req.recurse {
                    let counters = intf
                        .join_str("/state/counters")
                        .map_err(|e| AppError::Internal(e.to_string()))?;
                    resp.children.push(
                        counters_target(counters, &key)
                            .with_preferred(NotificationType::Sample)
                            .with_min_interval(COUNTERS_INTERVAL),
                    );
                }
            }
            ["config"] => resp.targets.push(
                port_target(path.clone(), &key).with_mapping(
                    FieldMapping::new("")
                        .with_field("mtu", "mtu")
                        .with_field("description", "description"),
                ),
            ),
            ["config", leaf @ ("mtu" | "description")] => resp
                .targets
                .push(port_target(path.clone(), &key).with_mapping(FieldMapping::new("").with_field(*leaf, ""))),
            ["state"] => resp.targets.push(
                PathTarget::new(path.clone(), DbNum::StateDb, port_state_table(), key)
                    .with_on_change(true)
                    .with_handler(oper_status_handler()),
            ),
            ["state", "counters"] => resp.targets.push(counters_target(path.clone(), &key)),
            ["ethernet", "state", "counters"] => {
                resp.targets.push(counters_target(path.clone(), &key).with_field_scan("*"))
            }
            _ => return Err(AppError::NotSupported(req.path.to_string())),
        }
        Ok(resp)
    }

    fn process_subscribe(&self, req: &ProcessSubscribeRequest<'_>) -> Result<Path, AppError> {
        let name = req
            .key
            .and_then(|k| k.get(0))
            .ok_or_else(|| AppError::InvalidArgument("no key".to_string()))?;
        let mut path = req.path.clone();
        if let Some(e) = path.elem_mut(1) {
            e.set_key("name", name);
        }
        Ok(path)
    }

    fn get(&self, path: &Path, dbs: &DbSet) -> Result<DataNode, AppError> {
        let failing = self.fail_watches_on_get.lock().unwrap().take();
        if let Some(store) = failing {
            store.inject_error(DbNum::ConfigDb, &port_table());
        }

        let name = path
            .elem(1)
            .and_then(|e| e.key("name"))
            .ok_or_else(|| AppError::InvalidArgument(path.to_string()))?;
        let key = Key::new([name]);
        let names: Vec<&str> = path.elems().iter().skip(2).map(|e| e.name()).collect();

        match names.as_slice() {
            [] => {
                let port = read(dbs, DbNum::ConfigDb, &port_table(), &key, path)?;
                let mut tree = DataTree::new()
                    .with_leaf("name", name)
                    .with("config", config_tree(&port));
                if let Ok(c) = read(dbs, DbNum::CountersDb, &counters_table(), &key, path) {
                    tree.insert("state", DataTree::new().with("counters", counters_tree(&c)));
                }
                Ok(tree.into())
            }
            ["config"] => Ok(config_tree(&read(dbs, DbNum::ConfigDb, &port_table(), &key, path)?).into()),
            ["config", leaf] => leaf_of(&read(dbs, DbNum::ConfigDb, &port_table(), &key, path)?, leaf, path),
            ["state"] => {
                let state = read(dbs, DbNum::StateDb, &port_state_table(), &key, path)?;
                let mut tree = DataTree::new();
                if let Some(v) = state.get("oper_status") {
                    tree.insert("oper-status", DataNode::leaf(v));
                }
                Ok(tree.into())
            }
            ["state", "oper-status"] => leaf_of(
                &read(dbs, DbNum::StateDb, &port_state_table(), &key, path)?,
                "oper_status",
                path,
            ),
            ["state", "counters"] | ["ethernet", "state", "counters"] => {
                Ok(counters_tree(&read(dbs, DbNum::CountersDb, &counters_table(), &key, path)?).into())
            }
            ["state", "counters", leaf] | ["ethernet", "state", "counters", leaf] => {
                let field = counter_field(leaf).ok_or_else(|| not_found(path))?;
                leaf_of(&read(dbs, DbNum::CountersDb, &counters_table(), &key, path)?, field, path)
            }
            _ => Err(not_found(path)),
        }
    }
}

/// Clock container computed outside the store
pub struct SystemApp;

impl AppModule for SystemApp {
    fn translate_subscribe(
        &self,
        req: &TranslateSubscribeRequest<'_>,
    ) -> Result<TranslateSubscribeResponse, AppError> {
        translib_subscribe::empty_subscribe_response(req.path).map_err(|e| AppError::InvalidArgument(e.to_string()))
    }

    fn process_subscribe(&self, req: &ProcessSubscribeRequest<'_>) -> Result<Path, AppError> {
        Ok(req.path.clone())
    }

    fn get(&self, path: &Path, _dbs: &DbSet) -> Result<DataNode, AppError> {
        if path.to_string() == CLOCK {
            Ok(DataTree::new().with_leaf("timezone-name", "UTC").into())
        } else {
            Err(not_found(path))
        }
    }
}

/// Store, apps and engine for one test
pub struct Harness {
    pub store: MemoryStore,
    pub interfaces: Arc<InterfacesApp>,
    pub translib: Translib,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let interfaces = Arc::new(InterfacesApp::default());
        let apps = AppRegistry::new()
            .with_module(INTERFACES, interfaces.clone())
            .and_then(|r| r.with_module("/openconfig-system:system", Arc::new(SystemApp)))
            .unwrap();
        let translib = Translib::new(apps, Arc::new(store.connector()));
        Self {
            store,
            interfaces,
            translib,
        }
    }

    pub fn set_port(&self, name: &str, fields: &[(&str, &str)]) {
        self.store.set_entry(
            DbNum::ConfigDb,
            &port_table(),
            &Key::new([name]),
            Value::from_pairs(fields.iter().copied()),
        );
    }

    pub fn mod_port(&self, name: &str, fields: &[(&str, &str)]) {
        self.store.mod_entry(
            DbNum::ConfigDb,
            &port_table(),
            &Key::new([name]),
            Value::from_pairs(fields.iter().copied()),
        );
    }

    pub fn set_counters(&self, name: &str, fields: &[(&str, &str)]) {
        self.store.set_entry(
            DbNum::CountersDb,
            &counters_table(),
            &Key::new([name]),
            Value::from_pairs(fields.iter().copied()),
        );
    }

    pub fn set_oper_status(&self, name: &str, status: &str) {
        self.store.set_entry(
            DbNum::StateDb,
            &port_state_table(),
            &Key::new([name]),
            Value::from_pairs([("oper_status", status)]),
        );
    }

    /// Wait until no on-change subscription or store watch is left
    pub fn wait_for_cleanup(&self) {
        let deadline = Instant::now() + TIMEOUT;
        while self.translib.registry().active_sessions() > 0 || self.store.watch_count() > 0 {
            assert!(Instant::now() < deadline, "subscription was not cleaned up");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn recv(rx: &Receiver<SubscribeResponse>) -> SubscribeResponse {
    rx.recv_timeout(TIMEOUT).expect("no message received in time")
}

/// Messages up to and including the sync marker
pub fn recv_until_sync(rx: &Receiver<SubscribeResponse>) -> Vec<SubscribeResponse> {
    let mut msgs = Vec::new();
    loop {
        let msg = recv(rx);
        let done = msg.sync_complete;
        msgs.push(msg);
        if done {
            return msgs;
        }
    }
}

pub fn assert_silent(rx: &Receiver<SubscribeResponse>) {
    if let Ok(msg) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("unexpected message: {:?}", msg);
    }
}

pub fn update_json(msg: &SubscribeResponse) -> serde_json::Value {
    serde_json::to_value(&msg.update).unwrap()
}

pub fn queue() -> (crossbeam::channel::Sender<SubscribeResponse>, Receiver<SubscribeResponse>) {
    unbounded()
}
