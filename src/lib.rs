//! # univrs-discovery
//!
//! Dynamic discovery on top of a hierarchical, watch-based coordination
//! service.
//!
//! Producers announce facts ("this host serves cluster c1") as ephemeral
//! nodes that vanish with their session; consumers subscribe to
//! eventually-consistent views of those facts. The crate layers:
//!
//! - **Retries**: [`RetryingClient`] retries operations lost to a dropped
//!   connection and creates sequential nodes exactly once.
//! - **ACLs**: [`AclEnforcingClient`] forces the configured ACL onto
//!   ephemeral nodes.
//! - **Symlinks**: [`PathResolvingClient`] resolves `$name` path segments
//!   whose data is another path.
//! - **Sessions**: [`PersistentConnection`] replaces expired sessions and
//!   tells listeners about every transition.
//! - **Stores**: [`PropertyStore`] keeps permanent or merged ephemeral
//!   properties current through watches, with delayed re-reads and an
//!   optional SQLite cache. A children-data store publishes the map of a
//!   node's children to their data.
//! - **Bus**: [`EventBus`] delivers initialize/add/remove notifications to
//!   subscribers on a single dispatcher task.
//!
//! [`MemoryServer`] is an in-process coordination service used to test
//! every layer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use univrs_discovery::prelude::*;
//!
//! struct Printer;
//!
//! impl PropertyEventSubscriber<String> for Printer {
//!     fn on_initialize(&self, name: &str, value: Option<&String>) {
//!         println!("{name} = {value:?}");
//!     }
//!     fn on_add(&self, name: &str, value: &String) {
//!         println!("{name} -> {value}");
//!     }
//!     fn on_remove(&self, name: &str) {
//!         println!("{name} removed");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> univrs_discovery::Result<()> {
//!     let server = MemoryServer::new();
//!     let registry = ConnectionRegistry::new(Arc::new(server));
//!     let connection = registry.get_or_create(&ConnectionConfig::new("memory"));
//!     connection.wait_connected().await?;
//!
//!     let client = Arc::new(DiscoveryClient::new(connection.clone(), AclConfig::default()));
//!     let store = PropertyStore::new(
//!         "/config",
//!         client,
//!         connection,
//!         Arc::new(Permanent::new(StringSerializer)),
//!         StoreConfig::default(),
//!         None,
//!     )?;
//!     store.start().await?;
//!
//!     let bus = EventBus::new(Arc::new(store.clone()));
//!     bus.register(["timeout"], Arc::new(Printer));
//!
//!     store.put("timeout", "30s".to_string()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Ephemeral Announcements
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! use univrs_discovery::prelude::*;
//!
//! # async fn announce(connection: PersistentConnection) -> univrs_discovery::Result<()> {
//! let client = Arc::new(DiscoveryClient::new(connection.clone(), AclConfig::default()));
//! let hosts: PropertyStore<BTreeSet<String>> = PropertyStore::new(
//!     "/clusters",
//!     client,
//!     connection,
//!     Arc::new(Ephemeral::new(StringSetSerializer, SetUnionMerger)),
//!     StoreConfig { read_window_ms: 2_000, ..StoreConfig::default() },
//!     None,
//! )?;
//!
//! // Visible to subscribers of "c1" until this session ends.
//! hosts.put("c1", ["host-1:8080".to_string()].into_iter().collect()).await?;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod merger;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod store;
pub mod symlink;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use acl::AclEnforcingClient;
pub use bus::{EventBus, PropertyEventPublisher, PropertyEventSubscriber, PublishSink};
pub use cache::{CachedView, PropertyCache, SqliteCache};
pub use client::{Acl, Coordinator, CoordinatorExt, CreateMode, Id, Perms, Stat, MAX_PATH_LENGTH};
pub use config::{AclConfig, AuthInfo, ConnectionConfig, RetryConfig, StoreConfig};
pub use connection::{
    Connector, PersistentConnection, Session, SessionEvent, SessionSnapshot, SessionState,
    StateChange, StateListener,
};
pub use error::{CoordError, ErrorClass, Result};
pub use memory::MemoryServer;
pub use merger::{Merger, SetUnionMerger};
pub use registry::{ConnectionRegistry, DiscoveryClient};
pub use retry::RetryingClient;
pub use serializer::{
    ChildMapSerializer, JsonSerializer, Serializer, StringSerializer, StringSetSerializer,
};
pub use store::{ChildFilter, ChildrenData, Ephemeral, Permanent, PropertyStore, StoreStrategy};
pub use symlink::PathResolvingClient;
pub use watch::{EventType, WatchedEvent, Watcher, WatcherRef};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::bus::{EventBus, PropertyEventSubscriber};
    pub use crate::client::{Acl, Coordinator, CoordinatorExt, CreateMode};
    pub use crate::config::{AclConfig, ConnectionConfig, RetryConfig, StoreConfig};
    pub use crate::connection::PersistentConnection;
    pub use crate::error::{CoordError, Result};
    pub use crate::memory::MemoryServer;
    pub use crate::merger::SetUnionMerger;
    pub use crate::registry::{ConnectionRegistry, DiscoveryClient};
    pub use crate::serializer::{JsonSerializer, StringSerializer, StringSetSerializer};
    pub use crate::store::{ChildrenData, Ephemeral, Permanent, PropertyStore};
}
