//! Coordinator trait - the raw client contract every layer implements.
//!
//! A coordination service stores a tree of nodes addressed by `/`-separated
//! paths. Each node carries opaque data, an ACL and a [`Stat`]. Nodes are
//! persistent or ephemeral (deleted when the creating session ends), and may
//! be created with a monotonically increasing sequence suffix.
//!
//! The layers of this crate ([`RetryingClient`](crate::retry::RetryingClient),
//! [`AclEnforcingClient`](crate::acl::AclEnforcingClient),
//! [`PathResolvingClient`](crate::symlink::PathResolvingClient)) all implement
//! [`Coordinator`] and wrap another implementation, so they stack freely.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordError, Result};
use crate::symlink::is_symlink_segment;
use crate::watch::WatcherRef;

/// Maximum path length in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Transaction id of the last data change.
    pub mzxid: i64,
    /// Data version, incremented by every `set_data`.
    pub version: i32,
    /// Child version, incremented on every child add or remove.
    pub cversion: i32,
    /// Owning session for ephemeral nodes, zero otherwise.
    pub ephemeral_owner: i64,
    /// Number of children.
    pub num_children: i32,
    /// Length of the data in bytes.
    pub data_length: i32,
}

/// Permission bits of an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perms(pub u32);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(2);
    pub const CREATE: Perms = Perms(4);
    pub const DELETE: Perms = Perms(8);
    pub const ADMIN: Perms = Perms(16);
    pub const ALL: Perms = Perms(31);

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Identity an ACL entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// Scheme, e.g. `world`, `digest`, `auth`.
    pub scheme: String,
    /// Scheme-specific identity.
    pub id: String,
}

/// One ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub perms: Perms,
    pub id: Id,
}

impl Acl {
    /// Create an ACL entry.
    pub fn new(perms: Perms, scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            perms,
            id: Id {
                scheme: scheme.into(),
                id: id.into(),
            },
        }
    }

    /// Everything allowed for anyone.
    pub fn open_unsafe() -> Self {
        Self::new(Perms::ALL, "world", "anyone")
    }

    /// Read-only for anyone.
    pub fn read_unsafe() -> Self {
        Self::new(Perms::READ, "world", "anyone")
    }

    /// Everything allowed for the identities authenticated on the creating
    /// session. The service expands this into concrete ids.
    pub fn creator_all() -> Self {
        Self::new(Perms::ALL, "auth", "")
    }
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    /// Node is removed when its session ends.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Service appends a sequence suffix to the name.
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Validate that a path is well-formed.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CoordError::InvalidPath("path cannot be empty".to_string()));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(CoordError::InvalidPath(format!(
            "path exceeds maximum length of {} bytes",
            MAX_PATH_LENGTH
        )));
    }
    if !path.starts_with('/') {
        return Err(CoordError::InvalidPath(format!(
            "path must start with '/': {}",
            path
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(CoordError::InvalidPath(format!(
            "path must not end with '/': {}",
            path
        )));
    }
    if path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(CoordError::InvalidPath(format!(
            "empty path segment: {}",
            path
        )));
    }
    Ok(())
}

/// Parent of a path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Append a child name to a path.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Asynchronous operations of a coordination-service client.
///
/// Every read can register a one-shot [`Watcher`](crate::watch::Watcher).
/// Reads of an absent node register no watch except through `exists`, which
/// always arms one so that the later creation is observed.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node and return its actual path (with the sequence suffix
    /// for sequential modes).
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String>;

    /// Delete a node. `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Stat of a node, or `None` if it does not exist.
    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>>;

    /// Data and stat of a node.
    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)>;

    /// Replace the data of a node. `None` matches any version.
    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat>;

    /// Child names (not full paths) and the stat of the parent.
    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)>;

    /// ACL of a node.
    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)>;

    /// Attach credentials to the session.
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()>;

    /// Create a sequential node exactly once, even when the request has to
    /// be resubmitted.
    ///
    /// The base implementation issues a single create; the retrying layer
    /// replaces it with the token-reconciling protocol.
    async fn create_unique_sequential(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        self.create(path, data, acl, mode).await
    }
}

#[async_trait]
impl<C: Coordinator + ?Sized> Coordinator for Arc<C> {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        (**self).create(path, data, acl, mode).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        (**self).delete(path, version).await
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        (**self).exists(path, watcher).await
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        (**self).get_data(path, watcher).await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        (**self).set_data(path, data, version).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        (**self).get_children(path, watcher).await
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        (**self).get_acl(path).await
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        (**self).add_auth(scheme, auth).await
    }

    async fn create_unique_sequential(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        (**self).create_unique_sequential(path, data, acl, mode).await
    }
}

/// Node management helpers available on every [`Coordinator`].
#[async_trait]
pub trait CoordinatorExt: Coordinator {
    /// Create `path` and any missing ancestors as empty persistent nodes.
    /// A node that already exists counts as success.
    async fn ensure_persistent_node_exists(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let mut pending = vec![path.to_string()];
        while let Some(current) = pending.last().cloned() {
            if current == "/" {
                pending.pop();
                continue;
            }
            match self
                .create(&current, Vec::new(), vec![Acl::open_unsafe()], CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(CoordError::NodeExists(_)) => {
                    pending.pop();
                }
                Err(CoordError::NoNode(_)) => match parent_path(&current) {
                    Some(parent) => pending.push(parent.to_string()),
                    None => return Err(CoordError::NoNode(current)),
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete `path` at the version observed by a preceding `exists`.
    /// An absent node counts as success.
    async fn remove_node(&self, path: &str) -> Result<()> {
        match self.exists(path, None).await? {
            None => Ok(()),
            Some(stat) => match self.delete(path, Some(stat.version)).await {
                Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Delete `path` and everything below it.
    async fn remove_node_recursive(&self, path: &str) -> Result<()> {
        let mut stack = vec![path.to_string()];
        let mut visited = Vec::new();
        while let Some(current) = stack.pop() {
            match self.get_children(&current, None).await {
                Ok((children, _)) => {
                    stack.extend(children.iter().map(|child| join_path(&current, child)));
                    visited.push(current);
                }
                Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for node in visited.iter().rev() {
            match self.delete(node, None).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(path = %path, removed = visited.len(), "removed subtree");
        Ok(())
    }

    /// Create a symlink node at `link` pointing at `target`.
    async fn create_symlink(&self, link: &str, target: &str) -> Result<()> {
        check_symlink_args(link, target)?;
        self.create(
            link,
            target.as_bytes().to_vec(),
            vec![Acl::open_unsafe()],
            CreateMode::Persistent,
        )
        .await?;
        Ok(())
    }

    /// Point the symlink at `link` to `target`, creating it if absent.
    async fn set_symlink_data(&self, link: &str, target: &str) -> Result<()> {
        check_symlink_args(link, target)?;
        match self.set_data(link, target.as_bytes().to_vec(), None).await {
            Ok(_) => Ok(()),
            Err(CoordError::NoNode(_)) => self.create_symlink(link, target).await,
            Err(e) => Err(e),
        }
    }
}

impl<C: Coordinator + ?Sized> CoordinatorExt for C {}

fn check_symlink_args(link: &str, target: &str) -> Result<()> {
    validate_path(link)?;
    validate_path(target)?;
    if !is_symlink_segment(node_name(link)) {
        return Err(CoordError::InvalidPath(format!(
            "last segment of {} is not a symlink",
            link
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;

    #[test]
    fn test_validate_path_valid() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/d2").is_ok());
        assert!(validate_path("/d2/uris/$cluster").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        for path in ["", "d2", "/d2/", "/d2//uris"] {
            let err = validate_path(path).unwrap_err();
            assert!(matches!(err, CoordError::InvalidPath(_)), "{}", path);
        }
        let long = format!("/{}", "a".repeat(MAX_PATH_LENGTH));
        assert!(validate_path(&long).is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
        assert_eq!(node_name("/a/b/c"), "c");
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }

    #[test]
    fn test_perms() {
        assert!(Perms::ALL.contains(Perms::READ));
        assert!(Perms::ALL.contains(Perms::ADMIN));
        assert!(!Perms::READ.contains(Perms::WRITE));
    }

    #[tokio::test]
    async fn test_ensure_persistent_node_exists() {
        let server = MemoryServer::new();
        let client = server.session();

        client.ensure_persistent_node_exists("/a/b/c").await.unwrap();
        assert!(client.exists("/a", None).await.unwrap().is_some());
        assert!(client.exists("/a/b/c", None).await.unwrap().is_some());

        // Second call is a no-op.
        client.ensure_persistent_node_exists("/a/b/c").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_node() {
        let server = MemoryServer::new();
        let client = server.session();
        client.ensure_persistent_node_exists("/a").await.unwrap();
        client.set_data("/a", b"x".to_vec(), None).await.unwrap();

        client.remove_node("/a").await.unwrap();
        assert!(client.exists("/a", None).await.unwrap().is_none());
        client.remove_node("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_node_recursive() {
        let server = MemoryServer::new();
        let client = server.session();
        client.ensure_persistent_node_exists("/root/a/x").await.unwrap();
        client.ensure_persistent_node_exists("/root/a/y").await.unwrap();
        client.ensure_persistent_node_exists("/root/b").await.unwrap();

        client.remove_node_recursive("/root").await.unwrap();
        assert!(client.exists("/root", None).await.unwrap().is_none());
        let (children, _) = client.get_children("/", None).await.unwrap();
        assert!(children.is_empty());

        // Absent subtree is fine.
        client.remove_node_recursive("/root").await.unwrap();
    }

    #[tokio::test]
    async fn test_symlink_helpers() {
        let server = MemoryServer::new();
        let client = server.session();
        client.ensure_persistent_node_exists("/links").await.unwrap();

        let err = client.create_symlink("/links/plain", "/a").await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidPath(_)));

        client.set_symlink_data("/links/$l", "/a").await.unwrap();
        let (data, _) = client.get_data("/links/$l", None).await.unwrap();
        assert_eq!(data, b"/a");

        client.set_symlink_data("/links/$l", "/b").await.unwrap();
        let (data, stat) = client.get_data("/links/$l", None).await.unwrap();
        assert_eq!(data, b"/b");
        assert_eq!(stat.version, 1);
    }
}
