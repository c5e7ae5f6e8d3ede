//! # Translib Subscribe
//!
//! Change-data-capture engine of the translib northbound data-access layer.
//! Clients subscribe to structured paths; the engine maps them to store
//! tables and keys through app modules, registers keyspace watches, and
//! turns every store change into path-based update/delete notifications on
//! the client's delivery queue.
//!
//! ## Architecture
//!
//! ```text
//!   subscribe(paths) ──> translate ──> group by (db, table, key pattern)
//!                                          │ watch
//!                                          v
//!   store writer ── SEvent ──> bounded channel ──> session worker
//!                                                    │ diff old/new entry
//!                                                    v
//!                           dispatch: process_subscribe + get ──> client queue
//! ```
//!
//! Every on-change subscription first receives the current state of its
//! paths and a sync-complete marker; changes follow after that. Firing the
//! request's stop signal releases the watches and connections.
//!
//! ## Modules
//!
//! - [`app`]: the contract app modules implement and their registry
//! - [`message`]: request and response types
//! - [`tree`]: the sparse payload tree
//! - [`diff`]: field level comparison of store entries
//! - [`lifecycle`]: stop signals and the subscription registry

pub mod app;
mod api;
mod config;
mod counter;
pub mod diff;
mod dispatch;
mod error;
mod group;
mod info;
pub mod lifecycle;
pub mod logging;
pub mod message;
mod processor;
mod session;
mod translate;
pub mod tree;

pub use api::Translib;
pub use app::{
    empty_subscribe_response, AppModule, AppRegistry, DeleteAction, FieldMapping, Notification,
    NotificationContext, NotificationSender, OnChangeHandler, PathTarget, ProcessSubscribeRequest,
    TranslateSubscribeRequest, TranslateSubscribeResponse,
};
pub use config::{SubscribeConfig, MIN_SUBSCRIBE_INTERVAL};
pub use diff::{entry_compare, entry_fields, EntryDiff};
pub use error::{AppError, Result, SubscribeError};
pub use lifecycle::{stop_channel, StopHandle, StopId, StopSignal, SubscriptionRegistry};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use message::{
    IsSubscribePath, IsSubscribeRequest, IsSubscribeResponse, NotificationType, SubscribeRequest, SubscribeResponse,
};
pub use session::SubscribeSession;
pub use tree::{DataNode, DataTree};
