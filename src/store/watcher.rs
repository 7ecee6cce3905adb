//! Per-property watch loop.
//!
//! One task per published property. It reads the property, arming a watch,
//! then waits for a trigger: a fired watch, a newly connected session, or
//! the retry timer after a failed read. A fired watch opens a read window;
//! every event arriving before the window closes is folded into the single
//! read that follows it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::strategy::ReadState;
use super::StoreInner;
use crate::config::StoreConfig;
use crate::connection::SessionState;
use crate::error::Result;
use crate::watch::{channel_watcher, WatcherRef};

/// Delay between a fired watch and the coalesced re-read.
///
/// With jitter the delay falls between the middle and the end of the
/// window so that clients sharing a window do not re-read in lockstep.
pub(crate) fn read_delay(config: &StoreConfig) -> Duration {
    let window = config.read_window();
    if window.is_zero() || !config.read_jitter {
        return window;
    }
    let mid = window / 2;
    let spread = mid.as_millis() as u64;
    if spread == 0 {
        return window;
    }
    mid + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Last view handed to the bus, as serialized bytes.
enum Published {
    Nothing,
    View(Option<Vec<u8>>),
}

struct PropertyWatch<T> {
    store: Arc<StoreInner<T>>,
    name: String,
    path: String,
    published: Published,
}

impl<T: Send + Sync + 'static> PropertyWatch<T> {
    /// Publish the cached view, if any, before the first live read.
    async fn bootstrap_from_cache(&mut self) {
        let Some(cache) = self.store.cache.clone() else {
            return;
        };
        let view = match cache.get(&self.name).await {
            Ok(Some(view)) => view,
            Ok(None) => return,
            Err(e) => {
                warn!(name = %self.name, error = %e, "failed to read cached view");
                return;
            }
        };
        let value = match &view.value {
            Some(bytes) => match self.store.strategy.serializer().from_bytes(Some(bytes)) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(name = %self.name, error = %e, "discarding undecodable cached view");
                    return;
                }
            },
            None => None,
        };
        debug!(name = %self.name, "serving cached view");
        self.publish(value, view.value);
    }

    async fn read(&mut self, state: &mut ReadState<T>, watcher: WatcherRef) -> Result<()> {
        let value = self
            .store
            .strategy
            .read(self.store.client.as_ref(), &self.path, state, Some(watcher))
            .await?;
        let bytes = match &value {
            Some(value) => Some(self.store.strategy.serializer().to_bytes(value)?),
            None => None,
        };
        if let Some(cache) = &self.store.cache {
            if let Err(e) = cache.put(&self.name, bytes.as_deref()).await {
                warn!(name = %self.name, error = %e, "failed to update cached view");
            }
        }
        self.publish(value, bytes);
        Ok(())
    }

    fn publish(&mut self, value: Option<T>, bytes: Option<Vec<u8>>) {
        let first = match &self.published {
            Published::View(last) if *last == bytes => return,
            Published::View(_) => false,
            Published::Nothing => true,
        };
        let Some(sink) = self.store.sink.lock().clone() else {
            debug!(name = %self.name, "no sink attached, dropping view");
            return;
        };
        if first {
            sink.publish_initialize(&self.name, value);
        } else {
            match value {
                Some(value) => sink.publish_add(&self.name, value),
                None => sink.publish_remove(&self.name),
            }
        }
        self.published = Published::View(bytes);
    }
}

/// Watch `name` until `cancel` fires.
pub(crate) async fn watch_property<T: Send + Sync + 'static>(
    store: Arc<StoreInner<T>>,
    name: String,
    cancel: CancellationToken,
) {
    let path = store.property_path(&name);
    let mut watch = PropertyWatch {
        store: store.clone(),
        name: name.clone(),
        path,
        published: Published::Nothing,
    };
    debug!(name = %name, path = %watch.path, "watching property");

    let (watcher, mut events) = channel_watcher();
    let mut sessions = store.connection.state_stream();
    let initial = store.connection.snapshot();
    let mut last_session = (initial.state, initial.generation);
    let mut state = ReadState::default();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = watch.bootstrap_from_cache() => {}
    }

    loop {
        // Events already queued are covered by the read below.
        while events.try_recv().is_ok() {}

        let retry_at = match watch.read(&mut state, watcher.clone()).await {
            Ok(()) => None,
            Err(e) => {
                warn!(name = %name, error = %e, "property read failed, will retry");
                Some(Instant::now() + store.config.resync_interval())
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(name = %name, "stopped watching property");
                    return;
                }
                Some(event) = events.recv() => {
                    debug!(name = %name, event = ?event.event_type, "property changed");
                    let delay = read_delay(&store.config);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = sleep(delay) => {}
                        }
                    }
                    break;
                }
                Some(snapshot) = sessions.next() => {
                    let previous = last_session;
                    last_session = (snapshot.state, snapshot.generation);
                    let reconnected = snapshot.state == SessionState::Connected
                        && (previous.0 != SessionState::Connected || previous.1 != snapshot.generation);
                    if reconnected {
                        debug!(name = %name, generation = snapshot.generation, "session connected, re-reading");
                        break;
                    }
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => break,
            }
        }
    }
}
