//! In-memory coordination service.
//!
//! [`MemoryServer`] implements the raw client contract in-process: sessions,
//! ephemeral and sequential nodes, one-shot watches, ACL storage, stop/start
//! of the whole service, forced session expiry and fault injection. It is
//! NOT a replicated service and keeps nothing on disk. Use for testing only.
//!
//! Permissions are stored and reported but not enforced.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{parent_path, validate_path, Acl, Coordinator, CreateMode, Id, Stat};
use crate::config::ConnectionConfig;
use crate::connection::{Connector, Session, SessionEvent};
use crate::error::{CoordError, Result};
use crate::watch::{same_watcher, EventType, WatchedEvent, WatcherRef};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Operation kinds, used to target faults and count reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    GetChildren,
    GetAcl,
}

/// When an injected connection loss hits the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// The request is dropped before the server applies it.
    BeforeApply,
    /// The server applies the request but the reply is lost.
    AfterApply,
}

/// A one-shot injected connection loss for the next matching operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub op: OpKind,
    pub mode: FaultMode,
    /// Only match operations on this path.
    pub path: Option<String>,
}

impl Fault {
    /// Fault for the next operation of kind `op` on any path.
    pub fn new(op: OpKind, mode: FaultMode) -> Self {
        Self {
            op,
            mode,
            path: None,
        }
    }

    /// Restrict the fault to one path.
    pub fn on_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

struct SessionEntry {
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    auth: Vec<Id>,
    timeout: Duration,
    disconnected_at: Option<Instant>,
    alive: bool,
    closed: bool,
}

type Fired = (WatcherRef, WatchedEvent);

struct ServerState {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    running: bool,
    next_session_id: i64,
    sessions: HashMap<i64, SessionEntry>,
    data_watches: HashMap<String, Vec<(i64, WatcherRef)>>,
    child_watches: HashMap<String, Vec<(i64, WatcherRef)>>,
    faults: VecDeque<Fault>,
    reads: HashMap<(OpKind, String), usize>,
    latency: Duration,
}

impl ServerState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                acl: vec![Acl::open_unsafe()],
                stat: Stat::default(),
            },
        );
        Self {
            nodes,
            zxid: 0,
            running: true,
            next_session_id: 0x1000,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            faults: VecDeque::new(),
            reads: HashMap::new(),
            latency: Duration::ZERO,
        }
    }

    fn open_session(
        &mut self,
        timeout: Duration,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> i64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(
            id,
            SessionEntry {
                events,
                auth: Vec::new(),
                timeout,
                disconnected_at: None,
                alive: true,
                closed: false,
            },
        );
        id
    }

    fn check_session(&self, id: i64) -> Result<()> {
        let entry = self.sessions.get(&id).ok_or(CoordError::SessionExpired)?;
        if entry.closed {
            return Err(CoordError::Closed);
        }
        if !entry.alive {
            return Err(CoordError::SessionExpired);
        }
        if !self.running {
            return Err(CoordError::ConnectionLoss);
        }
        Ok(())
    }

    fn take_fault(&mut self, op: OpKind, path: &str) -> Option<FaultMode> {
        let idx = self.faults.iter().position(|fault| {
            fault.op == op && fault.path.as_deref().map_or(true, |p| p == path)
        })?;
        self.faults.remove(idx).map(|fault| fault.mode)
    }

    fn count_read(&mut self, op: OpKind, path: &str) {
        *self.reads.entry((op, path.to_string())).or_insert(0) += 1;
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn add_watch(table: &mut HashMap<String, Vec<(i64, WatcherRef)>>, session: i64, path: &str, watcher: WatcherRef) {
        let entries = table.entry(path.to_string()).or_default();
        if !entries.iter().any(|(_, w)| same_watcher(w, &watcher)) {
            entries.push((session, watcher));
        }
    }

    /// Remove the watches of `path` and queue their events. A watcher
    /// registered in both tables is notified once.
    fn trigger(
        &mut self,
        path: &str,
        data_event: Option<EventType>,
        child_event: Option<EventType>,
        fired: &mut Vec<Fired>,
    ) {
        let start = fired.len();
        let tables = [
            (data_event, self.data_watches.remove(path)),
            (child_event, self.child_watches.remove(path)),
        ];
        for (event, entries) in tables {
            let (Some(event_type), Some(entries)) = (event, entries) else {
                continue;
            };
            for (_, watcher) in entries {
                let duplicate = fired[start..]
                    .iter()
                    .any(|(w, _)| same_watcher(w, &watcher));
                if !duplicate {
                    fired.push((watcher, WatchedEvent::new(event_type, path)));
                }
            }
        }
    }

    fn expand_acl(&self, session: i64, acl: Vec<Acl>) -> Result<Vec<Acl>> {
        if acl.is_empty() {
            return Err(CoordError::InvalidAcl("empty acl".to_string()));
        }
        let mut expanded = Vec::with_capacity(acl.len());
        for entry in acl {
            if entry.id.scheme != "auth" {
                expanded.push(entry);
                continue;
            }
            let ids = self
                .sessions
                .get(&session)
                .map(|s| s.auth.clone())
                .unwrap_or_default();
            if ids.is_empty() {
                return Err(CoordError::InvalidAcl(
                    "auth scheme used without credentials".to_string(),
                ));
            }
            expanded.extend(ids.into_iter().map(|id| Acl { perms: entry.perms, id }));
        }
        Ok(expanded)
    }

    fn create(
        &mut self,
        session: i64,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
        fired: &mut Vec<Fired>,
    ) -> Result<String> {
        validate_path(path)?;
        let parent = parent_path(path)
            .ok_or_else(|| CoordError::NodeExists(path.to_string()))?
            .to_string();
        let acl = self.expand_acl(session, acl)?;
        let parent_stat = match self.nodes.get(&parent) {
            Some(node) => node.stat,
            None => return Err(CoordError::NoNode(parent)),
        };
        if parent_stat.ephemeral_owner != 0 {
            return Err(CoordError::NoChildrenForEphemerals(parent));
        }
        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, parent_stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let data_length = data.len() as i32;
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                acl,
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
                    data_length,
                    ..Stat::default()
                },
            },
        );
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.stat.cversion += 1;
            node.stat.num_children += 1;
        }

        self.trigger(&actual, Some(EventType::NodeCreated), None, fired);
        self.trigger(&parent, None, Some(EventType::NodeChildrenChanged), fired);
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: Option<i32>, fired: &mut Vec<Fired>) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::InvalidPath("cannot delete the root".to_string()));
        }
        let stat = match self.nodes.get(path) {
            Some(node) => node.stat,
            None => return Err(CoordError::NoNode(path.to_string())),
        };
        if let Some(expected) = version {
            if expected != stat.version {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    found: stat.version,
                });
            }
        }
        if stat.num_children > 0 {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        self.remove(path, fired);
        Ok(())
    }

    fn remove(&mut self, path: &str, fired: &mut Vec<Fired>) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.zxid += 1;
        self.trigger(
            path,
            Some(EventType::NodeDeleted),
            Some(EventType::NodeDeleted),
            fired,
        );
        if let Some(parent) = parent_path(path) {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.stat.cversion += 1;
                node.stat.num_children -= 1;
            }
            let parent = parent.to_string();
            self.trigger(&parent, None, Some(EventType::NodeChildrenChanged), fired);
        }
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
        fired: &mut Vec<Fired>,
    ) -> Result<Stat> {
        validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    found: node.stat.version,
                });
            }
        }
        self.zxid += 1;
        let zxid = self.zxid;
        node.stat.data_length = data.len() as i32;
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        let stat = node.stat;
        self.trigger(path, Some(EventType::NodeDataChanged), None, fired);
        Ok(stat)
    }

    /// End a session: drop its watches, then delete its ephemeral nodes.
    fn end_session(&mut self, id: i64, closed: bool, fired: &mut Vec<Fired>) -> Option<mpsc::UnboundedSender<SessionEvent>> {
        let entry = self.sessions.get_mut(&id)?;
        if !entry.alive {
            return None;
        }
        entry.alive = false;
        entry.closed = closed;
        let events = entry.events.take();

        for table in [&mut self.data_watches, &mut self.child_watches] {
            for entries in table.values_mut() {
                entries.retain(|(owner, _)| *owner != id);
            }
            table.retain(|_, entries| !entries.is_empty());
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove(path, fired);
        }
        debug!(session_id = id, ephemerals = owned.len(), closed, "session ended");
        events
    }
}

fn notify(fired: Vec<Fired>) {
    for (watcher, event) in fired {
        watcher.process(event);
    }
}

/// In-process coordination service for tests.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Create a running server holding only the root node.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new())),
        }
    }

    /// Open a session that receives no state events.
    pub fn session(&self) -> MemorySession {
        let id = self.state.lock().open_session(DEFAULT_SESSION_TIMEOUT, None);
        MemorySession {
            state: self.state.clone(),
            id,
        }
    }

    /// Open a session and return the receiver of its state events.
    pub fn session_with_events(
        &self,
        timeout: Duration,
    ) -> (MemorySession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.lock().open_session(timeout, Some(tx));
        let session = MemorySession {
            state: self.state.clone(),
            id,
        };
        (session, rx)
    }

    /// Whether the server accepts requests.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Stop serving. Every live session is disconnected but not expired.
    pub fn stop(&self) {
        let mut senders = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let now = Instant::now();
            for entry in state.sessions.values_mut().filter(|e| e.alive) {
                entry.disconnected_at = Some(now);
                senders.extend(entry.events.clone());
            }
        }
        info!("memory server stopped");
        for tx in senders {
            let _ = tx.send(SessionEvent::Disconnected);
        }
    }

    /// Resume serving. Sessions disconnected for longer than their timeout
    /// are expired; the others reconnect.
    pub fn start(&self) {
        let mut fired = Vec::new();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            let now = Instant::now();
            let ids: Vec<i64> = state
                .sessions
                .iter()
                .filter(|(_, e)| e.alive)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                let Some(entry) = state.sessions.get_mut(&id) else {
                    continue;
                };
                let overdue = entry
                    .disconnected_at
                    .take()
                    .is_some_and(|at| now.duration_since(at) >= entry.timeout);
                if overdue {
                    if let Some(tx) = state.end_session(id, false, &mut fired) {
                        events.push((tx, SessionEvent::Expired));
                    }
                } else if let Some(tx) = entry.events.clone() {
                    events.push((tx, SessionEvent::Connected));
                }
            }
        }
        info!("memory server started");
        for (tx, event) in events {
            let _ = tx.send(event);
        }
        notify(fired);
    }

    /// Invalidate a session as if its timeout had elapsed.
    pub fn expire_session(&self, id: i64) {
        let mut fired = Vec::new();
        let events = self.state.lock().end_session(id, false, &mut fired);
        info!(session_id = id, "session expired");
        if let Some(tx) = events {
            let _ = tx.send(SessionEvent::Expired);
        }
        notify(fired);
    }

    /// Queue a one-shot connection loss.
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Delay every request by `latency` before the server handles it.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Number of faults not yet consumed.
    pub fn pending_faults(&self) -> usize {
        self.state.lock().faults.len()
    }

    /// Number of successful reads of kind `op` on `path`.
    pub fn read_count(&self, op: OpKind, path: &str) -> usize {
        self.state
            .lock()
            .reads
            .get(&(op, path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Ids of all live sessions.
    pub fn live_sessions(&self) -> Vec<i64> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .sessions
            .iter()
            .filter(|(_, e)| e.alive)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryServer")
            .field("nodes", &state.nodes.len())
            .field("running", &state.running)
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(CoordError::ConnectionLoss);
        }
        let id = state.open_session(config.session_timeout(), Some(events));
        debug!(session_id = id, "session opened");
        Ok(Arc::new(MemorySession {
            state: self.state.clone(),
            id,
        }))
    }
}

/// A client session on a [`MemoryServer`].
pub struct MemorySession {
    state: Arc<Mutex<ServerState>>,
    id: i64,
}

impl MemorySession {
    /// Session id assigned by the server.
    pub fn id(&self) -> i64 {
        self.id
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn run<T>(
        &self,
        op: OpKind,
        path: &str,
        apply: impl FnOnce(&mut ServerState, &mut Vec<Fired>) -> Result<T>,
    ) -> Result<T> {
        let mut fired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            state.check_session(self.id)?;
            let fault = state.take_fault(op, path);
            if fault == Some(FaultMode::BeforeApply) {
                debug!(?op, path = %path, "injected fault before apply");
                return Err(CoordError::ConnectionLoss);
            }
            let result = apply(&mut state, &mut fired);
            if fault == Some(FaultMode::AfterApply) {
                debug!(?op, path = %path, ok = result.is_ok(), "injected fault after apply");
                Err(CoordError::ConnectionLoss)
            } else {
                result
            }
        };
        notify(fired);
        result
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        self.delay().await;
        let id = self.id;
        self.run(OpKind::Create, path, |state, fired| {
            state.create(id, path, data, acl, mode, fired)
        })
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.delay().await;
        self.run(OpKind::Delete, path, |state, fired| {
            state.delete(path, version, fired)
        })
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        self.delay().await;
        let id = self.id;
        self.run(OpKind::Exists, path, |state, _| {
            validate_path(path)?;
            state.count_read(OpKind::Exists, path);
            if let Some(watcher) = watcher {
                ServerState::add_watch(&mut state.data_watches, id, path, watcher);
            }
            Ok(state.nodes.get(path).map(|node| node.stat))
        })
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        self.delay().await;
        let id = self.id;
        self.run(OpKind::GetData, path, |state, _| {
            validate_path(path)?;
            let (data, stat) = match state.nodes.get(path) {
                Some(node) => (node.data.clone(), node.stat),
                None => return Err(CoordError::NoNode(path.to_string())),
            };
            state.count_read(OpKind::GetData, path);
            if let Some(watcher) = watcher {
                ServerState::add_watch(&mut state.data_watches, id, path, watcher);
            }
            Ok((data, stat))
        })
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        self.delay().await;
        self.run(OpKind::SetData, path, |state, fired| {
            state.set_data(path, data, version, fired)
        })
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        self.delay().await;
        let id = self.id;
        self.run(OpKind::GetChildren, path, |state, _| {
            validate_path(path)?;
            let stat = match state.nodes.get(path) {
                Some(node) => node.stat,
                None => return Err(CoordError::NoNode(path.to_string())),
            };
            let children = state.children_of(path);
            state.count_read(OpKind::GetChildren, path);
            if let Some(watcher) = watcher {
                ServerState::add_watch(&mut state.child_watches, id, path, watcher);
            }
            Ok((children, stat))
        })
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        self.delay().await;
        self.run(OpKind::GetAcl, path, |state, _| {
            validate_path(path)?;
            state
                .nodes
                .get(path)
                .map(|node| (node.acl.clone(), node.stat))
                .ok_or_else(|| CoordError::NoNode(path.to_string()))
        })
    }

    /// Credentials become the id `scheme:<credentials as text>`.
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_session(self.id)?;
        let id = Id {
            scheme: scheme.to_string(),
            id: String::from_utf8_lossy(auth).into_owned(),
        };
        if let Some(entry) = state.sessions.get_mut(&self.id) {
            if !entry.auth.contains(&id) {
                entry.auth.push(id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_id(&self) -> i64 {
        self.id
    }

    async fn close(&self) {
        let mut fired = Vec::new();
        let _ = self.state.lock().end_session(self.id, true, &mut fired);
        notify(fired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::channel_watcher;

    #[tokio::test]
    async fn test_create_and_read() {
        let server = MemoryServer::new();
        let client = server.session();

        let path = client
            .create("/a", b"one".to_vec(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path, "/a");

        let (data, stat) = client.get_data("/a", None).await.unwrap();
        assert_eq!(data, b"one");
        assert_eq!(stat.version, 0);
        assert_eq!(stat.data_length, 3);

        let err = client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NodeExists(_)));

        let err = client
            .create("/x/y", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NoNode(_)));
    }

    #[tokio::test]
    async fn test_sequential_names() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/p", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();

        let first = client
            .create("/p/n-", Vec::new(), vec![Acl::open_unsafe()], CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = client
            .create("/p/n-", Vec::new(), vec![Acl::open_unsafe()], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(first, "/p/n-0000000000");
        assert_eq!(second, "/p/n-0000000001");
    }

    #[tokio::test]
    async fn test_versions() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();

        let stat = client.set_data("/a", b"x".to_vec(), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = client.set_data("/a", b"y".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion { expected: 0, found: 1, .. }));

        let err = client.delete("/a", Some(7)).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion { .. }));
        client.delete("/a", Some(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_set_data_keeps_zxid() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        let (_, first) = client.get_data("/a", None).await.unwrap();

        let err = client.set_data("/a", b"x".to_vec(), Some(7)).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion { .. }));
        let err = client.set_data("/missing", b"x".to_vec(), None).await.unwrap_err();
        assert!(err.is_no_node());

        client
            .create("/b", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        let (_, second) = client.get_data("/b", None).await.unwrap();
        assert_eq!(second.czxid, first.czxid + 1);
    }

    #[tokio::test]
    async fn test_latency_delays_requests() {
        let server = MemoryServer::new();
        let client = server.session();
        server.set_latency(Duration::from_millis(50));

        let started = std::time::Instant::now();
        client.exists("/", None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        server.set_latency(Duration::ZERO);
        let started = std::time::Instant::now();
        client.exists("/", None).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_delete_not_empty() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        client
            .create("/a/b", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();

        let err = client.delete("/a", None).await.unwrap_err();
        assert!(matches!(err, CoordError::NotEmpty(_)));
    }

    #[tokio::test]
    async fn test_watches_fire_once() {
        let server = MemoryServer::new();
        let client = server.session();
        let (watcher, mut rx) = channel_watcher();

        assert!(client.exists("/a", Some(watcher.clone())).await.unwrap().is_none());
        client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::NodeCreated);

        client.set_data("/a", b"x".to_vec(), None).await.unwrap();
        assert!(rx.try_recv().is_err());

        client.get_data("/a", Some(watcher.clone())).await.unwrap();
        client.get_data("/a", Some(watcher.clone())).await.unwrap();
        client.set_data("/a", b"y".to_vec(), None).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::NodeDataChanged);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_child_watch() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/p", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        let (watcher, mut rx) = channel_watcher();

        client.get_children("/p", Some(watcher.clone())).await.unwrap();
        client
            .create("/p/c", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event, WatchedEvent::new(EventType::NodeChildrenChanged, "/p"));

        // Child data changes do not fire the parent's child watch.
        client.get_children("/p", Some(watcher.clone())).await.unwrap();
        client.set_data("/p/c", b"x".to_vec(), None).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_watch_on_absent_get_data() {
        let server = MemoryServer::new();
        let client = server.session();
        let (watcher, mut rx) = channel_watcher();

        let err = client.get_data("/a", Some(watcher)).await.unwrap_err();
        assert!(err.is_no_node());
        client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ephemeral_removed_on_expiry() {
        let server = MemoryServer::new();
        let owner = server.session();
        let observer = server.session();
        let (watcher, mut rx) = channel_watcher();

        owner
            .create("/e", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Ephemeral)
            .await
            .unwrap();
        observer.exists("/e", Some(watcher)).await.unwrap();

        server.expire_session(owner.id());
        assert!(observer.exists("/e", None).await.unwrap().is_none());
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::NodeDeleted);

        let err = owner.exists("/e", None).await.unwrap_err();
        assert!(matches!(err, CoordError::SessionExpired));
    }

    #[tokio::test]
    async fn test_no_children_for_ephemerals() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/e", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Ephemeral)
            .await
            .unwrap();
        let err = client
            .create("/e/c", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NoChildrenForEphemerals(_)));
    }

    #[tokio::test]
    async fn test_faults() {
        let server = MemoryServer::new();
        let client = server.session();

        server.inject_fault(Fault::new(OpKind::Create, FaultMode::BeforeApply));
        let err = client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(client.exists("/a", None).await.unwrap().is_none());

        server.inject_fault(Fault::new(OpKind::Create, FaultMode::AfterApply));
        let err = client
            .create("/a", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(client.exists("/a", None).await.unwrap().is_some());
        assert_eq!(server.pending_faults(), 0);
    }

    #[tokio::test]
    async fn test_fault_path_filter() {
        let server = MemoryServer::new();
        let client = server.session();
        server.inject_fault(Fault::new(OpKind::Exists, FaultMode::BeforeApply).on_path("/b"));

        client.exists("/a", None).await.unwrap();
        assert_eq!(server.pending_faults(), 1);
        assert!(client.exists("/b", None).await.is_err());
        assert_eq!(server.pending_faults(), 0);
    }

    #[tokio::test]
    async fn test_stop_start_keeps_session() {
        let server = MemoryServer::new();
        let (client, mut events) = server.session_with_events(Duration::from_secs(30));

        server.stop();
        assert_eq!(events.recv().await, Some(SessionEvent::Disconnected));
        let err = client.exists("/", None).await.unwrap_err();
        assert!(matches!(err, CoordError::ConnectionLoss));

        server.start();
        assert_eq!(events.recv().await, Some(SessionEvent::Connected));
        assert!(client.exists("/", None).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_past_timeout_expires() {
        let server = MemoryServer::new();
        let (client, mut events) = server.session_with_events(Duration::from_secs(5));
        client
            .create("/e", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Ephemeral)
            .await
            .unwrap();

        server.stop();
        assert_eq!(events.recv().await, Some(SessionEvent::Disconnected));
        tokio::time::advance(Duration::from_secs(6)).await;
        server.start();
        assert_eq!(events.recv().await, Some(SessionEvent::Expired));

        let other = server.session();
        assert!(other.exists("/e", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acl_expansion() {
        let server = MemoryServer::new();
        let client = server.session();

        let err = client
            .create("/a", Vec::new(), vec![Acl::creator_all()], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidAcl(_)));

        client.add_auth("digest", b"user:secret").await.unwrap();
        client
            .create("/a", Vec::new(), vec![Acl::creator_all()], CreateMode::Persistent)
            .await
            .unwrap();
        let (acl, _) = client.get_acl("/a").await.unwrap();
        assert_eq!(acl, vec![Acl::new(crate::client::Perms::ALL, "digest", "user:secret")]);
    }

    #[tokio::test]
    async fn test_read_count() {
        let server = MemoryServer::new();
        let client = server.session();
        client.get_children("/", None).await.unwrap();
        client.get_children("/", None).await.unwrap();
        assert_eq!(server.read_count(OpKind::GetChildren, "/"), 2);
        assert_eq!(server.read_count(OpKind::GetData, "/"), 0);
    }

    #[tokio::test]
    async fn test_close_session() {
        let server = MemoryServer::new();
        let client = server.session();
        client
            .create("/e", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Ephemeral)
            .await
            .unwrap();
        client.close().await;

        let err = client.exists("/", None).await.unwrap_err();
        assert!(matches!(err, CoordError::Closed));
        assert!(server.session().exists("/e", None).await.unwrap().is_none());
    }
}
