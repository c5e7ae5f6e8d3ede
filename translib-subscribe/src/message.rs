//! Request and response types of the subscribe APIs

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Sender;
use serde::Serialize;

use crate::error::SubscribeError;
use crate::lifecycle::StopSignal;
use crate::session::SubscribeSession;
use crate::tree::DataTree;

/// Notification kind requested by a client or preferred by a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum NotificationType {
    /// Let the server pick per path
    #[default]
    TargetDefined,
    /// Periodic sampling
    Sample,
    /// Notify on every store change
    OnChange,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationType::TargetDefined => "TargetDefined",
            NotificationType::Sample => "Sample",
            NotificationType::OnChange => "OnChange",
        };
        f.write_str(s)
    }
}

/// One message pushed to a subscriber's delivery queue.
///
/// `delete` entries are relative to `path`. A message with
/// `sync_complete` or `is_terminated` set carries no data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeResponse {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<DataTree>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    /// Nanoseconds since the unix epoch
    pub timestamp: i64,
    pub sync_complete: bool,
    pub is_terminated: bool,
}

impl SubscribeResponse {
    pub(crate) fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            update: None,
            delete: Vec::new(),
            timestamp: now_nanos(),
            sync_complete: false,
            is_terminated: false,
        }
    }

    pub(crate) fn sync(sync_complete: bool, is_terminated: bool) -> Self {
        Self {
            sync_complete,
            is_terminated,
            ..Self::new("")
        }
    }

    /// Whether this is a sync or terminate marker rather than data
    pub fn is_marker(&self) -> bool {
        self.update.is_none() && self.delete.is_empty() && self.path.is_empty()
    }
}

pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Input of [`crate::Translib::subscribe`] and [`crate::Translib::stream`]
#[derive(Clone)]
pub struct SubscribeRequest {
    pub paths: Vec<String>,
    pub queue: Sender<SubscribeResponse>,
    /// Ends an on-change subscription when fired. Required by `subscribe`.
    pub stop: Option<StopSignal>,
    pub session: Option<Arc<SubscribeSession>>,
}

impl SubscribeRequest {
    pub fn new<I, S>(paths: I, queue: Sender<SubscribeResponse>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            queue,
            stop: None,
            session: None,
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_session(mut self, session: Arc<SubscribeSession>) -> Self {
        self.session = Some(session);
        self
    }
}

/// One path of an [`IsSubscribeRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsSubscribePath {
    /// Correlates the path with its responses
    pub id: u32,
    pub path: String,
    pub mode: NotificationType,
}

impl IsSubscribePath {
    pub fn new(id: u32, path: impl Into<String>, mode: NotificationType) -> Self {
        Self {
            id,
            path: path.into(),
            mode,
        }
    }
}

/// Input of [`crate::Translib::is_subscribe_supported`]
#[derive(Debug, Clone, Default)]
pub struct IsSubscribeRequest {
    pub paths: Vec<IsSubscribePath>,
    pub session: Option<Arc<SubscribeSession>>,
}

impl IsSubscribeRequest {
    pub fn new(paths: Vec<IsSubscribePath>) -> Self {
        Self {
            paths,
            session: None,
        }
    }

    pub fn with_session(mut self, session: Arc<SubscribeSession>) -> Self {
        self.session = Some(session);
        self
    }
}

/// Subscription capabilities of one path (or of a sample sub-path split out
/// of a target-defined request)
#[derive(Debug)]
pub struct IsSubscribeResponse {
    pub id: u32,
    pub path: String,
    pub is_sub_path: bool,
    pub on_change_supported: bool,
    pub wildcard_supported: bool,
    /// Seconds
    pub min_interval: u32,
    pub preferred: NotificationType,
    pub error: Option<SubscribeError>,
}

impl IsSubscribeResponse {
    pub(crate) fn new(id: u32, path: impl Into<String>, min_interval: u32) -> Self {
        Self {
            id,
            path: path.into(),
            is_sub_path: false,
            on_change_supported: true,
            wildcard_supported: true,
            min_interval,
            preferred: NotificationType::OnChange,
            error: None,
        }
    }
}
