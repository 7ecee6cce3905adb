//! Persistent connection with automatic session re-establishment.
//!
//! A [`PersistentConnection`] owns at most one live [`Session`] at a time. A
//! supervisor task opens sessions through a [`Connector`], follows the
//! session's state events and replaces the session when the service expires
//! it. Every transition is published as a [`SessionSnapshot`] on a watch
//! channel and fanned out to registered [`StateListener`]s in registration
//! order.
//!
//! ```text
//! CONNECTING -> CONNECTED <-> DISCONNECTED
//!                   |              |
//!                   +--> EXPIRED <-+
//!                           |
//!                      CONNECTING (new session)
//! any state -> CLOSED (shutdown, terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Acl, Coordinator, CreateMode, Stat};
use crate::config::ConnectionConfig;
use crate::error::{CoordError, Result};
use crate::watch::WatcherRef;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Expired,
    Closed,
}

/// State change reported by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection to the service restored; the session survived.
    Connected,
    /// Connection to the service lost; the session may still recover.
    Disconnected,
    /// The service invalidated the session.
    Expired,
}

/// A raw client session.
#[async_trait]
pub trait Session: Coordinator {
    /// Id assigned by the service.
    fn session_id(&self) -> i64;

    /// Release the session. Its ephemeral nodes are deleted.
    async fn close(&self);
}

/// Opens sessions to a coordination service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session. Later state changes of the session are sent on
    /// `events`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>>;
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Id of the current session, if any.
    pub session_id: Option<i64>,
    /// Number of sessions established so far.
    pub generation: u64,
    /// When the current session was established.
    pub established_at: Option<Instant>,
}

/// A transition delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub previous: SessionState,
    pub current: SessionState,
    pub session_id: Option<i64>,
    pub generation: u64,
}

/// Receiver of connection state transitions.
///
/// Called on the supervisor task while transitions are serialized: must
/// not block and must not call [`PersistentConnection::shutdown`].
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, change: &StateChange);
}

impl<F> StateListener for F
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn on_state_change(&self, change: &StateChange) {
        self(change)
    }
}

/// Handle returned by [`PersistentConnection::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<dyn Session>>>,
    /// Credentials added so far, replayed onto every new session.
    auth: Mutex<Vec<(String, Vec<u8>)>>,
    snapshot: watch::Sender<SessionSnapshot>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn StateListener>)>>,
    next_listener: AtomicU64,
    transitions: Mutex<()>,
    started: AtomicBool,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn current_state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Deliver the transition to listeners, then publish it to waiters.
    /// Callers hold `transitions`.
    fn publish(&self, previous: SessionState, next: SessionSnapshot) {
        let change = StateChange {
            previous,
            current: next.state,
            session_id: next.session_id,
            generation: next.generation,
        };
        let listeners: Vec<Arc<dyn StateListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_state_change(&change);
        }
        self.snapshot.send_replace(next);
    }

    /// Make `session` current. Returns false if the connection was closed
    /// in the meantime.
    fn install(&self, session: Arc<dyn Session>) -> bool {
        let _guard = self.transitions.lock();
        let mut next = self.snapshot.borrow().clone();
        let previous = next.state;
        if previous == SessionState::Closed {
            return false;
        }
        let id = session.session_id();
        *self.session.write() = Some(session);
        next.state = SessionState::Connected;
        next.session_id = Some(id);
        next.generation += 1;
        next.established_at = Some(Instant::now());
        info!(session_id = id, generation = next.generation, "session established");
        self.publish(previous, next);
        true
    }

    fn update(&self, state: SessionState) {
        let _guard = self.transitions.lock();
        let mut next = self.snapshot.borrow().clone();
        let previous = next.state;
        if previous == state || previous == SessionState::Closed {
            return;
        }
        next.state = state;
        if matches!(state, SessionState::Expired | SessionState::Closed) {
            *self.session.write() = None;
            next.session_id = None;
            next.established_at = None;
        }
        info!(from = ?previous, to = ?state, "connection state changed");
        self.publish(previous, next);
    }
}

/// A connection that survives session expiry.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<Inner>,
}

impl PersistentConnection {
    /// Create a connection. Nothing happens until [`start`](Self::start).
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: SessionState::Connecting,
            session_id: None,
            generation: 0,
            established_at: None,
        });
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                session: RwLock::new(None),
                auth: Mutex::new(Vec::new()),
                snapshot,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                transitions: Mutex::new(()),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Configuration this connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Begin connecting. Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) || self.inner.cancel.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(supervise(self.inner.clone()));
        *self.inner.supervisor.lock() = Some(handle);
    }

    /// Release the session and stop reconnecting. Terminal.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.inner.update(SessionState::Closed);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Id of the current session, if one is established.
    pub fn session_id(&self) -> Option<i64> {
        self.inner.snapshot.borrow().session_id
    }

    /// Register a listener for every later transition.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Stream of snapshots, starting with the current one.
    pub fn state_stream(&self) -> WatchStream<SessionSnapshot> {
        WatchStream::new(self.inner.snapshot.subscribe())
    }

    /// Wait until a session is connected.
    pub async fn wait_connected(&self) -> Result<SessionSnapshot> {
        self.wait_for(|s| s.state == SessionState::Connected).await
    }

    /// Wait for a connected session established strictly after `after`.
    pub async fn wait_for_session_after(&self, after: Instant) -> Result<SessionSnapshot> {
        self.wait_for(|s| {
            s.state == SessionState::Connected && s.established_at.is_some_and(|at| at > after)
        })
        .await
    }

    async fn wait_for(
        &self,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.inner.snapshot.subscribe();
        let snapshot = rx
            .wait_for(|s| s.state == SessionState::Closed || predicate(s))
            .await
            .map_err(|_| CoordError::Closed)?
            .clone();
        if snapshot.state == SessionState::Closed {
            return Err(CoordError::Closed);
        }
        Ok(snapshot)
    }

    fn current(&self) -> Result<Arc<dyn Session>> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoordError::Closed);
        }
        self.inner
            .session
            .read()
            .clone()
            .ok_or(CoordError::ConnectionLoss)
    }
}

/// An operation lost to an expired session is reported as a connectivity
/// failure; the next attempt runs on the replacement session.
fn lost_to_expiry<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(CoordError::SessionExpired) => Err(CoordError::ConnectionLoss),
        other => other,
    }
}

async fn supervise(inner: Arc<Inner>) {
    loop {
        inner.update(SessionState::Connecting);
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                result = inner.connector.connect(&inner.config, tx.clone()) => match result {
                    Ok(session) => break session,
                    Err(e) => {
                        warn!(error = %e, connect_string = %inner.config.connect_string, "connect failed");
                        tokio::select! {
                            _ = inner.cancel.cancelled() => return,
                            _ = tokio::time::sleep(inner.config.reconnect_interval()) => {}
                        }
                    }
                },
            }
        };
        drop(tx);

        let credentials = inner.auth.lock().clone();
        for (scheme, auth) in &credentials {
            if let Err(e) = session.add_auth(scheme, auth).await {
                warn!(error = %e, scheme = %scheme, "failed to re-apply credentials");
            }
        }

        if !inner.install(session.clone()) {
            session.close().await;
            return;
        }

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(SessionEvent::Connected) => inner.update(SessionState::Connected),
                    Some(SessionEvent::Disconnected) => inner.update(SessionState::Disconnected),
                    Some(SessionEvent::Expired) | None => {
                        debug!(session_id = session.session_id(), "session lost");
                        inner.update(SessionState::Expired);
                        break;
                    }
                },
            }
        }
    }
}

impl fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("connect_string", &self.inner.config.connect_string)
            .field("snapshot", &*self.inner.snapshot.borrow())
            .finish()
    }
}

#[async_trait]
impl Coordinator for PersistentConnection {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        lost_to_expiry(self.current()?.create(path, data, acl, mode).await)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        lost_to_expiry(self.current()?.delete(path, version).await)
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        lost_to_expiry(self.current()?.exists(path, watcher).await)
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        lost_to_expiry(self.current()?.get_data(path, watcher).await)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        lost_to_expiry(self.current()?.set_data(path, data, version).await)
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        lost_to_expiry(self.current()?.get_children(path, watcher).await)
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        lost_to_expiry(self.current()?.get_acl(path).await)
    }

    /// The credentials are also applied to every session established later.
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        {
            let mut credentials = self.inner.auth.lock();
            if !credentials.iter().any(|(s, a)| s == scheme && a == auth) {
                credentials.push((scheme.to_string(), auth.to_vec()));
            }
        }
        lost_to_expiry(self.current()?.add_auth(scheme, auth).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CoordinatorExt;
    use crate::memory::MemoryServer;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval_ms: 10,
            session_timeout_ms: 1_000,
            ..ConnectionConfig::new("memory")
        }
    }

    fn recording_listener() -> (Arc<dyn StateListener>, Arc<Mutex<Vec<StateChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn StateListener> =
            Arc::new(move |change: &StateChange| sink.lock().push(change.clone()));
        (listener, seen)
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server));
        let err = conn.exists("/", None).await.unwrap_err();
        assert!(matches!(err, CoordError::ConnectionLoss));
        assert_eq!(conn.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_start_connects_and_notifies() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        let (listener, seen) = recording_listener();
        conn.add_listener(listener);

        conn.start();
        conn.start();
        let snapshot = conn.wait_connected().await.unwrap();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(server.live_sessions().len(), 1);

        let changes = seen.lock().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].current, SessionState::Connected);
        assert_eq!(changes[0].session_id, snapshot.session_id);

        assert!(conn.exists("/", None).await.unwrap().is_some());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_keeps_session() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        conn.start();
        let first = conn.wait_connected().await.unwrap();

        let mut states = conn.state_stream();
        server.stop();
        while let Some(snapshot) = states.next().await {
            if snapshot.state == SessionState::Disconnected {
                break;
            }
        }
        let err = conn.exists("/", None).await.unwrap_err();
        assert!(err.is_transient());

        server.start();
        let second = conn.wait_connected().await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.generation, 1);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_expiry_creates_new_session() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        conn.start();
        let first = conn.wait_connected().await.unwrap();
        conn.create("/e", Vec::new(), vec![Acl::open_unsafe()], CreateMode::Ephemeral)
            .await
            .unwrap();

        let (listener, seen) = recording_listener();
        conn.add_listener(listener);
        let before = Instant::now();
        server.expire_session(first.session_id.unwrap());

        let fresh = conn.wait_for_session_after(before).await.unwrap();
        assert_ne!(fresh.session_id, first.session_id);
        assert_eq!(fresh.generation, 2);

        // Ephemeral data of the old session is cleanly gone.
        assert!(conn.exists("/e", None).await.unwrap().is_none());

        let changes = seen.lock().clone();
        let states: Vec<SessionState> = changes.iter().map(|c| c.current).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Expired,
                SessionState::Connecting,
                SessionState::Connected
            ]
        );
        assert_eq!(
            changes
                .iter()
                .filter(|c| c.current == SessionState::Connected)
                .count(),
            1
        );
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_server_returns() {
        let server = MemoryServer::new();
        server.stop();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        conn.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.state(), SessionState::Connecting);

        server.start();
        conn.wait_connected().await.unwrap();
        conn.ensure_persistent_node_exists("/a/b").await.unwrap();
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        conn.start();
        conn.wait_connected().await.unwrap();

        conn.shutdown().await;
        assert_eq!(conn.state(), SessionState::Closed);
        assert!(server.live_sessions().is_empty());

        let err = conn.exists("/", None).await.unwrap_err();
        assert!(matches!(err, CoordError::Closed));
        let err = conn.wait_connected().await.unwrap_err();
        assert!(matches!(err, CoordError::Closed));

        conn.start();
        assert_eq!(conn.state(), SessionState::Closed);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_credentials_survive_session_replacement() {
        let server = MemoryServer::new();
        let bystander = server.session();
        let conn = PersistentConnection::new(test_config(), Arc::new(server.clone()));
        conn.start();
        let first = conn.wait_connected().await.unwrap();
        conn.add_auth("digest", b"user:secret").await.unwrap();

        let before = Instant::now();
        server.expire_session(first.session_id.unwrap());
        conn.wait_for_session_after(before).await.unwrap();

        conn.create("/e", Vec::new(), vec![Acl::creator_all()], CreateMode::Ephemeral)
            .await
            .unwrap();
        let (acl, _) = bystander.get_acl("/e").await.unwrap();
        assert_eq!(acl.len(), 1);
        assert_eq!(acl[0].id.scheme, "digest");
        assert_eq!(acl[0].id.id, "user:secret");
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let server = MemoryServer::new();
        let conn = PersistentConnection::new(test_config(), Arc::new(server));
        let (listener, seen) = recording_listener();
        let id = conn.add_listener(listener);
        assert!(conn.remove_listener(id));
        assert!(!conn.remove_listener(id));

        conn.start();
        conn.wait_connected().await.unwrap();
        assert!(seen.lock().is_empty());
        conn.shutdown().await;
    }
}
