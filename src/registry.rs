//! Shared connections and the assembled client stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::acl::AclEnforcingClient;
use crate::client::{Acl, Coordinator, CreateMode, Stat};
use crate::config::{AclConfig, ConnectionConfig};
use crate::connection::{Connector, PersistentConnection};
use crate::error::Result;
use crate::retry::RetryingClient;
use crate::symlink::PathResolvingClient;
use crate::watch::WatcherRef;

/// One started [`PersistentConnection`] per distinct configuration.
///
/// Configurations that differ in any field, tuning parameters included,
/// get separate connections.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<ConnectionConfig, PersistentConnection>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The shared connection for `config`, started on first use.
    pub fn get_or_create(&self, config: &ConnectionConfig) -> PersistentConnection {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(config) {
            return existing.clone();
        }
        info!(connect_string = %config.connect_string, "creating shared connection");
        let connection = PersistentConnection::new(config.clone(), self.connector.clone());
        connection.start();
        connections.insert(config.clone(), connection.clone());
        connection
    }

    /// Number of distinct connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Shut down and forget every connection.
    pub async fn shutdown(&self) {
        let connections: Vec<PersistentConnection> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.shutdown().await;
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}

type Stack = AclEnforcingClient<RetryingClient<PersistentConnection>>;

/// Full client stack over a shared connection: symlink resolution, ACL
/// enforcement and retries, in that order from the caller's side.
///
/// With `symlink_aware` off in the connection config, paths are used
/// literally and `$` segments name ordinary nodes.
pub struct DiscoveryClient {
    resolving: PathResolvingClient<Stack>,
    symlink_aware: bool,
}

impl DiscoveryClient {
    pub fn new(connection: PersistentConnection, acl: AclConfig) -> Self {
        let config = connection.config().clone();
        let retrying = RetryingClient::new(connection, config.retry.clone());
        Self {
            resolving: PathResolvingClient::new(AclEnforcingClient::new(retrying, acl)),
            symlink_aware: config.symlink_aware,
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &PersistentConnection {
        self.resolving.inner().inner().inner()
    }

    /// The stack below symlink resolution.
    fn literal(&self) -> &Stack {
        self.resolving.inner()
    }
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("connection", self.connection())
            .field("symlink_aware", &self.symlink_aware)
            .finish()
    }
}

#[async_trait]
impl Coordinator for DiscoveryClient {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        if self.symlink_aware {
            self.resolving.create(path, data, acl, mode).await
        } else {
            self.literal().create(path, data, acl, mode).await
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        if self.symlink_aware {
            self.resolving.delete(path, version).await
        } else {
            self.literal().delete(path, version).await
        }
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        if self.symlink_aware {
            self.resolving.exists(path, watcher).await
        } else {
            self.literal().exists(path, watcher).await
        }
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        if self.symlink_aware {
            self.resolving.get_data(path, watcher).await
        } else {
            self.literal().get_data(path, watcher).await
        }
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        if self.symlink_aware {
            self.resolving.set_data(path, data, version).await
        } else {
            self.literal().set_data(path, data, version).await
        }
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        if self.symlink_aware {
            self.resolving.get_children(path, watcher).await
        } else {
            self.literal().get_children(path, watcher).await
        }
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        if self.symlink_aware {
            self.resolving.get_acl(path).await
        } else {
            self.literal().get_acl(path).await
        }
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        self.literal().add_auth(scheme, auth).await
    }

    async fn create_unique_sequential(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        if self.symlink_aware {
            self.resolving
                .create_unique_sequential(path, data, acl, mode)
                .await
        } else {
            self.literal()
                .create_unique_sequential(path, data, acl, mode)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::{CoordinatorExt, Perms};
    use crate::config::AuthInfo;
    use crate::memory::MemoryServer;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval_ms: 10,
            ..ConnectionConfig::new("memory")
        }
    }

    #[tokio::test]
    async fn test_registry_shares_equal_configs() {
        let server = MemoryServer::new();
        let registry = ConnectionRegistry::new(Arc::new(server.clone()));

        let a = registry.get_or_create(&config());
        let b = registry.get_or_create(&config());
        let tuned = ConnectionConfig {
            session_timeout_ms: 5_000,
            ..config()
        };
        let c = registry.get_or_create(&tuned);
        assert_eq!(registry.len(), 2);

        a.wait_connected().await.unwrap();
        b.wait_connected().await.unwrap();
        c.wait_connected().await.unwrap();
        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.session_id(), c.session_id());
        assert_eq!(server.live_sessions().len(), 2);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(server.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_client_stack() {
        let server = MemoryServer::new();
        let registry = ConnectionRegistry::new(Arc::new(server.clone()));
        let connection = registry.get_or_create(&config());
        connection.wait_connected().await.unwrap();

        let acl = AclConfig {
            acl: vec![Acl::creator_all()],
            auth: Some(AuthInfo {
                scheme: "digest".to_string(),
                credentials: b"user:secret".to_vec(),
            }),
        };
        let client = DiscoveryClient::new(connection, acl);

        client.ensure_persistent_node_exists("/d1/hosts").await.unwrap();
        client.create_symlink("/$alias", "/d1").await.unwrap();

        let created = client
            .create_unique_sequential(
                "/$alias/hosts/ephemeral",
                b"h1".to_vec(),
                vec![Acl::open_unsafe()],
                CreateMode::EphemeralSequential,
            )
            .await
            .unwrap();
        assert!(created.starts_with("/$alias/hosts/ephemeral-"));

        let (children, _) = client.get_children("/$alias/hosts", None).await.unwrap();
        assert_eq!(children.len(), 1);

        let bystander = server.session();
        let (acl, _) = bystander
            .get_acl(&format!("/d1/hosts/{}", children[0]))
            .await
            .unwrap();
        assert_eq!(acl.len(), 1);
        assert_eq!(acl[0].perms, Perms::ALL);
        assert_eq!(acl[0].id.id, "user:secret");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_literal_paths_without_symlinks() {
        let server = MemoryServer::new();
        let connection = PersistentConnection::new(
            ConnectionConfig {
                symlink_aware: false,
                ..config()
            },
            Arc::new(server.clone()),
        );
        connection.start();
        connection.wait_connected().await.unwrap();
        let client = DiscoveryClient::new(connection.clone(), AclConfig::default());

        let raw = server.session();
        raw.create("/$plain", b"/elsewhere".to_vec(), vec![Acl::open_unsafe()], CreateMode::Persistent)
            .await
            .unwrap();

        let (data, _) = client.get_data("/$plain", None).await.unwrap();
        assert_eq!(data, b"/elsewhere");
        assert!(client.exists("/elsewhere", None).await.unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(5), connection.shutdown())
            .await
            .unwrap();
    }
}
