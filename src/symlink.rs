//! Symlink-resolving client.
//!
//! A path segment starting with `$` names a symlink node whose data is the
//! absolute path it points to. Reads resolve links left to right: the path
//! up to and including the first link segment is replaced by the link's
//! target and resolution starts over, up to a hop limit.
//!
//! Watches passed to reads are registered on every link traversed as well as
//! on the final node, so re-pointing a link fires the caller's watch. The
//! first event wins and is reported against the caller's path; an event
//! that arrives before the read has returned is held back until it has.
//!
//! Writes resolve only the parent path: `set_data("/a/$link", ..)` rewrites
//! the link itself.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::{join_path, node_name, parent_path, validate_path, Acl, Coordinator, CreateMode, Stat};
use crate::error::{CoordError, Result};
use crate::serializer::{Serializer, StringSerializer};
use crate::watch::{EventType, WatchedEvent, Watcher, WatcherRef};

/// Marker that starts a symlink segment.
pub const SYMLINK_PREFIX: char = '$';

/// Default bound on links followed while resolving one path.
pub const DEFAULT_MAX_HOPS: usize = 16;

/// Returns true if a single path segment is a symlink.
pub fn is_symlink_segment(segment: &str) -> bool {
    segment.starts_with(SYMLINK_PREFIX)
}

/// Returns true if any segment of `path` is a symlink.
pub fn contains_symlink(path: &str) -> bool {
    path.split('/').any(is_symlink_segment)
}

/// Byte offset just past the first symlink segment of `path`.
pub fn first_symlink_end(path: &str) -> Option<usize> {
    let mut offset = 0;
    for segment in path.split('/') {
        let end = offset + segment.len();
        if is_symlink_segment(segment) {
            return Some(end);
        }
        offset = end + 1;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Data,
    Children,
}

#[derive(Default)]
struct WatchState {
    fired: bool,
    disabled: bool,
    completed: bool,
    pending: Option<WatchedEvent>,
}

/// Caller's watcher as registered on links and on the resolved node.
struct SymlinkWatcher {
    target: WatcherRef,
    raw_path: String,
    kind: WatchKind,
    state: Mutex<WatchState>,
}

impl SymlinkWatcher {
    fn new(target: WatcherRef, raw_path: &str, kind: WatchKind) -> Arc<Self> {
        Arc::new(Self {
            target,
            raw_path: raw_path.to_string(),
            kind,
            state: Mutex::new(WatchState::default()),
        })
    }

    fn rewrite(&self, event: WatchedEvent) -> WatchedEvent {
        let event_type = match (self.kind, event.event_type) {
            (WatchKind::Children, EventType::NodeDataChanged) => EventType::NodeChildrenChanged,
            (_, other) => other,
        };
        WatchedEvent::new(event_type, self.raw_path.clone())
    }

    /// The read returned; release a held event.
    fn complete(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.completed = true;
            state.pending.take()
        };
        if let Some(event) = pending {
            self.target.process(event);
        }
    }

    /// The read failed; the watch will never fire.
    fn disable(&self) {
        let mut state = self.state.lock();
        state.disabled = true;
        state.pending = None;
    }
}

impl Watcher for SymlinkWatcher {
    fn process(&self, event: WatchedEvent) {
        let event = self.rewrite(event);
        let deliver = {
            let mut state = self.state.lock();
            if state.fired || state.disabled {
                return;
            }
            state.fired = true;
            if state.completed {
                Some(event)
            } else {
                state.pending = Some(event);
                None
            }
        };
        if let Some(event) = deliver {
            self.target.process(event);
        }
    }
}

fn settle<T>(watcher: &Option<Arc<SymlinkWatcher>>, raw_path: &str, result: Result<T>) -> Result<T> {
    if let Some(watcher) = watcher {
        if result.is_ok() {
            watcher.complete();
        } else {
            watcher.disable();
        }
    }
    result.map_err(|e| match e {
        CoordError::NoNode(_) => CoordError::NoNode(raw_path.to_string()),
        other => other,
    })
}

/// Coordinator wrapper that resolves symlink segments.
#[derive(Debug, Clone)]
pub struct PathResolvingClient<C> {
    inner: C,
    max_hops: usize,
    serializer: StringSerializer,
}

impl<C: Coordinator> PathResolvingClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            max_hops: DEFAULT_MAX_HOPS,
            serializer: StringSerializer,
        }
    }

    /// Bound the number of links followed per path.
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Resolve every symlink in `path`.
    pub async fn resolve(&self, path: &str) -> Result<String> {
        let mut current = path.to_string();
        let mut hops = 0;
        while let Some(end) = first_symlink_end(&current) {
            current = self.follow(&current, end, None, &mut hops).await?;
        }
        Ok(current)
    }

    fn parse_target(&self, link: &str, data: &[u8]) -> Result<String> {
        let target = self.serializer.from_bytes(Some(data))?;
        validate_path(&target)?;
        if target == "/" {
            return Err(CoordError::InvalidPath(format!("{} points at the root", link)));
        }
        Ok(target)
    }

    fn count_hop(&self, current: &str, hops: &mut usize) -> Result<()> {
        *hops += 1;
        if *hops > self.max_hops {
            warn!(path = %current, max_hops = self.max_hops, "symlink hop limit exceeded");
            return Err(CoordError::NoNode(current.to_string()));
        }
        Ok(())
    }

    /// Replace the prefix of `current` ending at `end` with its link target.
    async fn follow(
        &self,
        current: &str,
        end: usize,
        watcher: Option<WatcherRef>,
        hops: &mut usize,
    ) -> Result<String> {
        self.count_hop(current, hops)?;
        let link = &current[..end];
        let (data, _) = self.inner.get_data(link, watcher).await?;
        match self.parse_target(link, &data) {
            Ok(target) => Ok(format!("{}{}", target, &current[end..])),
            Err(e) => {
                warn!(link = %link, error = %e, "malformed symlink target");
                Err(CoordError::NoNode(link.to_string()))
            }
        }
    }

    /// Resolve the parent of `path`, keeping the last segment verbatim.
    async fn resolve_parent(&self, path: &str) -> Result<String> {
        let parent = match parent_path(path) {
            Some(parent) if contains_symlink(parent) => parent,
            _ => return Ok(path.to_string()),
        };
        let resolved = self.resolve(parent).await?;
        Ok(join_path(&resolved, node_name(path)))
    }

    /// Map a node created under a resolved parent back to the caller's parent.
    fn logical_created(path: &str, created: &str) -> String {
        match parent_path(path) {
            Some(parent) => join_path(parent, node_name(created)),
            None => created.to_string(),
        }
    }

    async fn exists_resolving(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        let mut current = path.to_string();
        let mut hops = 0;
        loop {
            let Some(end) = first_symlink_end(&current) else {
                return self.inner.exists(&current, watcher).await;
            };
            self.count_hop(&current, &mut hops)?;
            let link = current[..end].to_string();
            match self.inner.get_data(&link, watcher.clone()).await {
                Ok((data, _)) => match self.parse_target(&link, &data) {
                    Ok(target) => current = format!("{}{}", target, &current[end..]),
                    Err(e) => {
                        // The watch on the link stays armed.
                        warn!(link = %link, error = %e, "malformed symlink target");
                        return Ok(None);
                    }
                },
                Err(CoordError::NoNode(_)) => {
                    // Watch the missing link so its creation is observed.
                    match self.inner.exists(&link, watcher.clone()).await? {
                        None => {
                            debug!(link = %link, "symlink does not exist");
                            return Ok(None);
                        }
                        Some(_) => continue,
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_data_resolving(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        let mut current = path.to_string();
        let mut hops = 0;
        while let Some(end) = first_symlink_end(&current) {
            current = self.follow(&current, end, watcher.clone(), &mut hops).await?;
        }
        self.inner.get_data(&current, watcher).await
    }

    async fn get_children_resolving(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        let mut current = path.to_string();
        let mut hops = 0;
        while let Some(end) = first_symlink_end(&current) {
            current = self.follow(&current, end, watcher.clone(), &mut hops).await?;
        }
        self.inner.get_children(&current, watcher).await
    }
}

fn wrap(watcher: Option<WatcherRef>, path: &str, kind: WatchKind) -> (Option<Arc<SymlinkWatcher>>, Option<WatcherRef>) {
    let wrapped = watcher.map(|w| SymlinkWatcher::new(w, path, kind));
    let as_ref = wrapped.clone().map(|w| w as WatcherRef);
    (wrapped, as_ref)
}

#[async_trait]
impl<C: Coordinator> Coordinator for PathResolvingClient<C> {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        let resolved = self.resolve_parent(path).await?;
        if resolved == path {
            return self.inner.create(path, data, acl, mode).await;
        }
        let created = self.inner.create(&resolved, data, acl, mode).await?;
        Ok(Self::logical_created(path, &created))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let resolved = self.resolve_parent(path).await?;
        self.inner.delete(&resolved, version).await
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        if !contains_symlink(path) {
            return self.inner.exists(path, watcher).await;
        }
        let (wrapped, watcher) = wrap(watcher, path, WatchKind::Data);
        let result = self.exists_resolving(path, watcher).await;
        match settle(&wrapped, path, result) {
            Err(CoordError::NoNode(_)) => Ok(None),
            other => other,
        }
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        if !contains_symlink(path) {
            return self.inner.get_data(path, watcher).await;
        }
        let (wrapped, watcher) = wrap(watcher, path, WatchKind::Data);
        let result = self.get_data_resolving(path, watcher).await;
        settle(&wrapped, path, result)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        let resolved = self.resolve_parent(path).await?;
        self.inner.set_data(&resolved, data, version).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        if !contains_symlink(path) {
            return self.inner.get_children(path, watcher).await;
        }
        let (wrapped, watcher) = wrap(watcher, path, WatchKind::Children);
        let result = self.get_children_resolving(path, watcher).await;
        settle(&wrapped, path, result)
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        if !contains_symlink(path) {
            return self.inner.get_acl(path).await;
        }
        let resolved = self.resolve(path).await;
        let result = match resolved {
            Ok(resolved) => self.inner.get_acl(&resolved).await,
            Err(e) => Err(e),
        };
        settle(&None, path, result)
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        self.inner.add_auth(scheme, auth).await
    }

    async fn create_unique_sequential(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        let resolved = self.resolve_parent(path).await?;
        let created = self
            .inner
            .create_unique_sequential(&resolved, data, acl, mode)
            .await?;
        if resolved == path {
            return Ok(created);
        }
        Ok(Self::logical_created(path, &created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CoordinatorExt;
    use crate::memory::{MemoryServer, MemorySession};
    use crate::watch::channel_watcher;

    async fn fixture() -> (MemoryServer, MemorySession, PathResolvingClient<MemorySession>) {
        let server = MemoryServer::new();
        let raw = server.session();
        raw.ensure_persistent_node_exists("/real/node/c1").await.unwrap();
        raw.ensure_persistent_node_exists("/real/node/c2").await.unwrap();
        raw.set_data("/real/node", b"payload".to_vec(), None).await.unwrap();
        raw.ensure_persistent_node_exists("/links").await.unwrap();
        raw.create_symlink("/links/$k0", "/real").await.unwrap();
        raw.create_symlink("/links/$k1", "/links/$k0").await.unwrap();
        raw.create_symlink("/links/$k2", "/links/$k1").await.unwrap();
        let client = PathResolvingClient::new(server.session());
        (server, raw, client)
    }

    #[test]
    fn test_symlink_helpers() {
        assert!(is_symlink_segment("$cluster"));
        assert!(!is_symlink_segment("cluster"));
        assert!(contains_symlink("/d2/$uris/a"));
        assert!(!contains_symlink("/d2/uris/a"));
        assert_eq!(first_symlink_end("/d2/$uris/a"), Some(8));
        assert_eq!(&"/d2/$uris/a"[..8], "/d2/$uris");
        assert_eq!(first_symlink_end("/$a"), Some(3));
        assert_eq!(first_symlink_end("/a/b"), None);
    }

    #[tokio::test]
    async fn test_transparent_through_nested_links() {
        let (_server, raw, client) = fixture().await;
        let direct_data = raw.get_data("/real/node", None).await.unwrap();
        let direct_children = raw.get_children("/real/node", None).await.unwrap();
        let direct_stat = raw.exists("/real/node", None).await.unwrap();

        for path in [
            "/real/node",
            "/links/$k0/node",
            "/links/$k1/node",
            "/links/$k2/node",
        ] {
            assert_eq!(client.get_data(path, None).await.unwrap(), direct_data, "{}", path);
            assert_eq!(
                client.get_children(path, None).await.unwrap(),
                direct_children,
                "{}",
                path
            );
            assert_eq!(client.exists(path, None).await.unwrap(), direct_stat, "{}", path);
        }
        assert_eq!(client.resolve("/links/$k2/node").await.unwrap(), "/real/node");
    }

    #[tokio::test]
    async fn test_missing_link_is_not_found() {
        let (_server, _raw, client) = fixture().await;
        let path = "/links/$missing/node";

        let err = client.get_data(path, None).await.unwrap_err();
        assert!(matches!(err, CoordError::NoNode(ref p) if p == path));
        let err = client.get_children(path, None).await.unwrap_err();
        assert!(err.is_no_node());
        assert!(client.exists(path, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_target_is_not_found() {
        let (_server, raw, client) = fixture().await;
        raw.create_symlink("/links/$bad", "/real").await.unwrap();
        raw.set_data("/links/$bad", vec![0xff, 0xfe], None).await.unwrap();
        raw.create_symlink("/links/$relative", "/real").await.unwrap();
        raw.set_data("/links/$relative", b"real".to_vec(), None).await.unwrap();

        for path in ["/links/$bad/node", "/links/$relative/node"] {
            assert!(client.get_data(path, None).await.unwrap_err().is_no_node());
            assert!(client.get_children(path, None).await.unwrap_err().is_no_node());
            assert!(client.exists(path, None).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_cycle_hits_hop_limit() {
        let (_server, raw, client) = fixture().await;
        raw.create_symlink("/links/$a", "/links/$b").await.unwrap();
        raw.create_symlink("/links/$b", "/links/$a").await.unwrap();

        assert!(client.get_data("/links/$a/x", None).await.unwrap_err().is_no_node());
        assert!(client.exists("/links/$a/x", None).await.unwrap().is_none());
        let limited = PathResolvingClient::new(raw).with_max_hops(1);
        assert!(limited.get_data("/links/$k1/node", None).await.unwrap_err().is_no_node());
    }

    #[tokio::test]
    async fn test_watch_on_resolved_node() {
        let (_server, raw, client) = fixture().await;
        let (watcher, mut rx) = channel_watcher();

        client.get_data("/links/$k1/node", Some(watcher)).await.unwrap();
        raw.set_data("/real/node", b"new".to_vec(), None).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            WatchedEvent::new(EventType::NodeDataChanged, "/links/$k1/node")
        );
    }

    #[tokio::test]
    async fn test_repointing_link_fires_once() {
        let (_server, raw, client) = fixture().await;
        raw.ensure_persistent_node_exists("/other/node").await.unwrap();
        let (watcher, mut rx) = channel_watcher();

        client.get_children("/links/$k0/node", Some(watcher)).await.unwrap();
        raw.set_symlink_data("/links/$k0", "/other").await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            WatchedEvent::new(EventType::NodeChildrenChanged, "/links/$k0/node")
        );

        raw.ensure_persistent_node_exists("/real/node/c3").await.unwrap();
        assert!(rx.try_recv().is_err());

        let (children, _) = client.get_children("/links/$k0/node", None).await.unwrap();
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_exists_watches_missing_link() {
        let (_server, raw, client) = fixture().await;
        let (watcher, mut rx) = channel_watcher();

        assert!(client
            .exists("/links/$later/node", Some(watcher))
            .await
            .unwrap()
            .is_none());
        raw.create_symlink("/links/$later", "/real").await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event, WatchedEvent::new(EventType::NodeCreated, "/links/$later/node"));
        assert!(client.exists("/links/$later/node", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_read_does_not_fire() {
        let (_server, raw, client) = fixture().await;
        let (watcher, mut rx) = channel_watcher();

        let err = client
            .get_data("/links/$k0/absent", Some(watcher))
            .await
            .unwrap_err();
        assert!(err.is_no_node());
        raw.set_symlink_data("/links/$k0", "/other").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writes_resolve_parent_only() {
        let (_server, raw, client) = fixture().await;

        let created = client
            .create("/links/$k1/fresh", b"x".to_vec(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(created, "/links/$k1/fresh");
        assert!(raw.exists("/real/fresh", None).await.unwrap().is_some());

        let seq = client
            .create("/links/$k0/seq-", Vec::new(), vec![Acl::open_unsafe()], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert!(seq.starts_with("/links/$k0/seq-"));

        client.set_data("/links/$k0/fresh", b"y".to_vec(), None).await.unwrap();
        assert_eq!(raw.get_data("/real/fresh", None).await.unwrap().0, b"y");

        // The last segment addresses the link node itself.
        client.set_symlink_data("/links/$k0", "/other").await.unwrap();
        assert_eq!(raw.get_data("/links/$k0", None).await.unwrap().0, b"/other");

        client.delete("/links/$k1/fresh", None).await.unwrap_err();
        client.set_symlink_data("/links/$k0", "/real").await.unwrap();
        client.delete("/links/$k1/fresh", None).await.unwrap();
        assert!(raw.exists("/real/fresh", None).await.unwrap().is_none());
    }

    #[test]
    fn test_watcher_defers_until_complete() {
        let (target, mut rx) = channel_watcher();
        let watcher = SymlinkWatcher::new(target, "/a/$l/b", WatchKind::Data);

        watcher.process(WatchedEvent::new(EventType::NodeDataChanged, "/a/$l"));
        assert!(rx.try_recv().is_err());

        watcher.complete();
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::new(EventType::NodeDataChanged, "/a/$l/b")
        );

        watcher.process(WatchedEvent::new(EventType::NodeDeleted, "/x/b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_watcher_drops_pending() {
        let (target, mut rx) = channel_watcher();
        let watcher = SymlinkWatcher::new(target, "/a/$l", WatchKind::Children);

        watcher.process(WatchedEvent::new(EventType::NodeDataChanged, "/a/$l"));
        watcher.disable();
        watcher.complete();
        assert!(rx.try_recv().is_err());
    }
}
