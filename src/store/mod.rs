//! Property stores.
//!
//! A [`PropertyStore`] keeps named properties under a base path and
//! publishes their current views to an [`EventBus`](crate::bus::EventBus).
//! The variant decides how a property maps onto nodes:
//!
//! - [`Permanent`]: one persistent node per property, last writer wins.
//! - [`Ephemeral`]: one ephemeral child per writer, merged into one value.
//! - [`ChildrenData`]: read-only map of every child's name to its data.
//!
//! Each published property is followed by its own watch task. Watch-fired
//! re-reads can be delayed by a read window so that a burst of changes
//! costs one read. With a [`PropertyCache`] the last observed view of every
//! property is kept on disk and served while the service is unreachable.

mod strategy;
mod watcher;

pub use strategy::{
    ChildFilter, ChildrenData, Ephemeral, Permanent, ReadState, StoreStrategy,
    DEFAULT_EPHEMERAL_PREFIX,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{PropertyEventPublisher, PublishSink};
use crate::cache::PropertyCache;
use crate::client::{join_path, validate_path, Coordinator, CoordinatorExt};
use crate::config::StoreConfig;
use crate::connection::PersistentConnection;
use crate::error::{CoordError, Result};

pub(crate) struct StoreInner<T> {
    base_path: String,
    client: Arc<dyn Coordinator>,
    connection: PersistentConnection,
    strategy: Arc<dyn StoreStrategy<T>>,
    config: StoreConfig,
    cache: Option<Arc<dyn PropertyCache>>,
    sink: Mutex<Option<PublishSink<T>>>,
    watchers: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
    writes: TaskTracker,
}

impl<T> StoreInner<T> {
    pub(crate) fn property_path(&self, name: &str) -> String {
        join_path(&self.base_path, name)
    }
}

/// Named properties under one base path.
///
/// Cloning is cheap; clones share watchers and in-flight writes.
pub struct PropertyStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for PropertyStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for PropertyStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("base_path", &self.inner.base_path)
            .field("watched", &self.inner.watchers.lock().len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> PropertyStore<T> {
    /// Create a store.
    ///
    /// `client` carries all reads and writes and is usually a
    /// [`DiscoveryClient`](crate::registry::DiscoveryClient) over
    /// `connection`; `connection` tells the store when a session comes up
    /// so it can re-read what a lost session stopped watching.
    pub fn new(
        base_path: impl Into<String>,
        client: Arc<dyn Coordinator>,
        connection: PersistentConnection,
        strategy: Arc<dyn StoreStrategy<T>>,
        config: StoreConfig,
        cache: Option<Arc<dyn PropertyCache>>,
    ) -> Result<Self> {
        let base_path = base_path.into();
        validate_path(&base_path)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                base_path,
                client,
                connection,
                strategy,
                config,
                cache,
                sink: Mutex::new(None),
                watchers: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                writes: TaskTracker::new(),
            }),
        })
    }

    pub fn base_path(&self) -> &str {
        &self.inner.base_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Create the base path.
    ///
    /// An unreachable service is not an error: properties are served from
    /// the cache until a session comes up.
    ///
    /// Watched names are not read here. Each name is first read by its
    /// watch task, which the bus starts when the name gets its first
    /// subscriber, so a subscriber registered before `start` still receives
    /// the initial view.
    pub async fn start(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoordError::ShutDown);
        }
        match self
            .inner
            .client
            .ensure_persistent_node_exists(&self.inner.base_path)
            .await
        {
            Ok(()) => {
                info!(path = %self.inner.base_path, "property store started");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(path = %self.inner.base_path, error = %e, "property store started without a session");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write `value` as the property (permanent) or as one more
    /// contribution to it (ephemeral).
    pub async fn put(&self, name: &str, value: T) -> Result<()> {
        let inner = self.inner.clone();
        let path = inner.property_path(name);
        self.track(async move {
            inner
                .strategy
                .put(inner.client.as_ref(), &path, &value)
                .await
        })
        .await
    }

    /// Remove the property with every contribution.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let inner = self.inner.clone();
        let path = inner.property_path(name);
        self.track(async move { inner.strategy.remove(inner.client.as_ref(), &path).await })
            .await
    }

    /// Remove one contribution, identified by its value.
    pub async fn remove_partial(&self, name: &str, value: T) -> Result<()> {
        let inner = self.inner.clone();
        let path = inner.property_path(name);
        self.track(async move {
            inner
                .strategy
                .remove_partial(inner.client.as_ref(), &path, &value)
                .await
        })
        .await
    }

    /// Read a property once, without watching it. Falls back to the cache
    /// when the service cannot be reached.
    pub async fn get(&self, name: &str) -> Result<Option<T>> {
        let path = self.inner.property_path(name);
        let mut state = ReadState::default();
        let live = self
            .inner
            .strategy
            .read(self.inner.client.as_ref(), &path, &mut state, None)
            .await;
        match (live, &self.inner.cache) {
            (Err(e), Some(cache)) if e.is_transient() => {
                debug!(name = %name, error = %e, "serving property from cache");
                match cache.get(name).await? {
                    Some(view) => match view.value {
                        Some(bytes) => self
                            .inner
                            .strategy
                            .serializer()
                            .from_bytes(Some(&bytes))
                            .map(Some),
                        None => Ok(None),
                    },
                    None => Err(e),
                }
            }
            (live, _) => live,
        }
    }

    /// Names currently being published.
    pub fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.watchers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wait for in-flight writes, then stop every watcher. Writes issued
    /// after this fail with `ShutDown`.
    pub async fn shutdown(&self) {
        self.inner.writes.close();
        self.inner.writes.wait().await;
        self.inner.cancel.cancel();
        self.inner.watchers.lock().clear();
        info!(path = %self.inner.base_path, "property store shut down");
    }

    /// Run a write to completion even if the caller stops waiting for it.
    async fn track<F>(&self, write: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        // Held across the check so that a concurrent shutdown waits for
        // this write.
        let token = self.inner.writes.token();
        if self.inner.writes.is_closed() {
            return Err(CoordError::ShutDown);
        }
        let handle = self.inner.writes.spawn(write);
        drop(token);
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(CoordError::ShutDown),
        }
    }
}

impl<T: Send + Sync + 'static> PropertyEventPublisher<T> for PropertyStore<T> {
    fn set_sink(&self, sink: PublishSink<T>) {
        *self.inner.sink.lock() = Some(sink);
    }

    fn start_publishing(&self, name: &str) {
        if self.inner.cancel.is_cancelled() {
            warn!(name = %name, "store is shut down, not publishing");
            return;
        }
        let token = {
            let mut watchers = self.inner.watchers.lock();
            if watchers.contains_key(name) {
                return;
            }
            let token = self.inner.cancel.child_token();
            watchers.insert(name.to_string(), token.clone());
            token
        };
        tokio::spawn(watcher::watch_property(
            self.inner.clone(),
            name.to_string(),
            token,
        ));
    }

    fn stop_publishing(&self, name: &str) {
        if let Some(token) = self.inner.watchers.lock().remove(name) {
            token.cancel();
        }
    }
}
