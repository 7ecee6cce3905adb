//! One-shot watches on coordination-service nodes.
//!
//! A watch is registered by a read (`exists`, `get_data`, `get_children`) and
//! fires at most once. After it fires the owner must re-arm it with another
//! read; the property stores always re-arm as part of the re-read.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Type of change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Node was created (exists-watch on an absent node).
    NodeCreated,
    /// Node was deleted.
    NodeDeleted,
    /// Node data was replaced.
    NodeDataChanged,
    /// A child was added or removed.
    NodeChildrenChanged,
}

/// An event delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    /// Type of change.
    pub event_type: EventType,
    /// Path the watch was registered on.
    pub path: String,
}

impl WatchedEvent {
    /// Create a new event.
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}

/// Receiver of watch notifications.
///
/// Implementations must not block: they are invoked from the thread that
/// completes the triggering operation.
pub trait Watcher: Send + Sync {
    /// Handle a fired watch.
    fn process(&self, event: WatchedEvent);
}

/// Shared watcher handle passed to read operations.
pub type WatcherRef = Arc<dyn Watcher>;

impl Watcher for mpsc::UnboundedSender<WatchedEvent> {
    fn process(&self, event: WatchedEvent) {
        // Receiver dropped means the owner stopped caring.
        let _ = self.send(event);
    }
}

/// Create a channel-backed watcher and the receiving end of its events.
pub fn channel_watcher() -> (WatcherRef, mpsc::UnboundedReceiver<WatchedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Identity comparison of two watcher handles.
pub(crate) fn same_watcher(a: &WatcherRef, b: &WatcherRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
