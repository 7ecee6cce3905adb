//! Store variants.
//!
//! A permanent property is a single persistent node whose data is the
//! value. An ephemeral property is a persistent node whose ephemeral
//! children each hold one writer's contribution; its value is the merge of
//! all live children. A children-data property is a persistent node read
//! as the map of its children's names to their data.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::{join_path, parent_path, Acl, Coordinator, CoordinatorExt, CreateMode};
use crate::error::{CoordError, Result};
use crate::merger::{merge_children, Merger};
use crate::serializer::{ChildMapSerializer, Serializer};
use crate::watch::WatcherRef;

/// Default name prefix of ephemeral children.
pub const DEFAULT_EPHEMERAL_PREFIX: &str = "ephemeral";

/// Per-property state kept between reads by one watcher.
#[derive(Debug)]
pub struct ReadState<T> {
    /// Creation id of the property node the children belong to.
    pub(crate) czxid: Option<i64>,
    /// Decoded value of every known child.
    pub(crate) children: BTreeMap<String, T>,
}

impl<T> Default for ReadState<T> {
    fn default() -> Self {
        Self {
            czxid: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> ReadState<T> {
    fn reset(&mut self) {
        self.czxid = None;
        self.children.clear();
    }
}

/// How a store variant reads and writes property nodes.
#[async_trait]
pub trait StoreStrategy<T>: Send + Sync {
    /// Codec for node data and cached views.
    fn serializer(&self) -> &dyn Serializer<T>;

    /// Read the property at `path`, arming `watcher` for the changes this
    /// variant observes. An absent property arms an exists-watch and reads
    /// as `None`.
    async fn read(
        &self,
        client: &dyn Coordinator,
        path: &str,
        state: &mut ReadState<T>,
        watcher: Option<WatcherRef>,
    ) -> Result<Option<T>>;

    async fn put(&self, client: &dyn Coordinator, path: &str, value: &T) -> Result<()>;

    async fn remove(&self, client: &dyn Coordinator, path: &str) -> Result<()>;

    /// Withdraw one contribution from the property.
    async fn remove_partial(&self, client: &dyn Coordinator, path: &str, value: &T) -> Result<()>;
}

/// Selects the children of an ephemeral property that take part in the
/// merge.
pub trait ChildFilter: Send + Sync {
    fn filter(&self, children: Vec<String>) -> Vec<String>;
}

impl<F> ChildFilter for F
where
    F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
{
    fn filter(&self, children: Vec<String>) -> Vec<String> {
        self(children)
    }
}

/// List the children of `path`, arming `watcher` on the listing. An absent
/// node arms an exists-watch instead and lists as `None`.
async fn list_children(
    client: &dyn Coordinator,
    path: &str,
    watcher: Option<WatcherRef>,
) -> Result<Option<Vec<String>>> {
    loop {
        match client.get_children(path, watcher.clone()).await {
            Ok((names, _)) => return Ok(Some(names)),
            Err(e) if e.is_no_node() => {
                if !watch_absent(client, path, watcher.clone()).await? {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Arm an exists-watch on an absent node. Returns true if the node turned
/// out to exist, in which case the caller reads it again.
async fn watch_absent(client: &dyn Coordinator, path: &str, watcher: Option<WatcherRef>) -> Result<bool> {
    Ok(client.exists(path, watcher).await?.is_some())
}

/// One persistent node per property, replaced wholesale.
pub struct Permanent<T> {
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> Permanent<T> {
    pub fn new(serializer: impl Serializer<T> + 'static) -> Self {
        Self {
            serializer: Arc::new(serializer),
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> StoreStrategy<T> for Permanent<T> {
    fn serializer(&self) -> &dyn Serializer<T> {
        self.serializer.as_ref()
    }

    async fn read(
        &self,
        client: &dyn Coordinator,
        path: &str,
        _state: &mut ReadState<T>,
        watcher: Option<WatcherRef>,
    ) -> Result<Option<T>> {
        loop {
            match client.get_data(path, watcher.clone()).await {
                Ok((data, _)) => return self.serializer.from_bytes(Some(&data)).map(Some),
                Err(e) if e.is_no_node() => {
                    if !watch_absent(client, path, watcher.clone()).await? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the node or overwrite it at the version just observed. A
    /// concurrent writer surfaces as `BadVersion`.
    async fn put(&self, client: &dyn Coordinator, path: &str, value: &T) -> Result<()> {
        let data = self.serializer.to_bytes(value)?;
        if let Some(parent) = parent_path(path) {
            client.ensure_persistent_node_exists(parent).await?;
        }
        for _ in 0..2 {
            match client.exists(path, None).await? {
                Some(stat) => {
                    client.set_data(path, data.clone(), Some(stat.version)).await?;
                    return Ok(());
                }
                None => match client
                    .create(path, data.clone(), vec![Acl::open_unsafe()], CreateMode::Persistent)
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(CoordError::NodeExists(_)) => {
                        debug!(path = %path, "property created concurrently, overwriting");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Err(CoordError::NodeExists(path.to_string()))
    }

    async fn remove(&self, client: &dyn Coordinator, path: &str) -> Result<()> {
        client.remove_node(path).await
    }

    async fn remove_partial(&self, _client: &dyn Coordinator, path: &str, _value: &T) -> Result<()> {
        Err(CoordError::Unsupported(format!(
            "partial removal of permanent property {}",
            path
        )))
    }
}

/// Merged ephemeral contributions, one child per writer.
///
/// Only child membership is watched. A contribution is immutable once
/// written, so rewriting a child's data in place is not observed.
pub struct Ephemeral<T> {
    serializer: Arc<dyn Serializer<T>>,
    merger: Arc<dyn Merger<T>>,
    prefix: String,
    filter: Option<Arc<dyn ChildFilter>>,
}

impl<T> Ephemeral<T> {
    pub fn new(serializer: impl Serializer<T> + 'static, merger: impl Merger<T> + 'static) -> Self {
        Self {
            serializer: Arc::new(serializer),
            merger: Arc::new(merger),
            prefix: DEFAULT_EPHEMERAL_PREFIX.to_string(),
            filter: None,
        }
    }

    /// Merge only the children `filter` keeps. Writes are unaffected.
    pub fn with_child_filter(mut self, filter: impl ChildFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Name prefix of the children this store creates.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Read and decode every child of `path`. Children that vanish while
    /// being read are skipped.
    async fn read_all_children(
        &self,
        client: &dyn Coordinator,
        path: &str,
    ) -> Result<BTreeMap<String, T>> {
        let (names, _) = client.get_children(path, None).await?;
        let mut children = BTreeMap::new();
        for name in names {
            match client.get_data(&join_path(path, &name), None).await {
                Ok((data, _)) => {
                    children.insert(name, self.serializer.from_bytes(Some(&data))?);
                }
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(children)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> StoreStrategy<T> for Ephemeral<T> {
    fn serializer(&self) -> &dyn Serializer<T> {
        self.serializer.as_ref()
    }

    async fn read(
        &self,
        client: &dyn Coordinator,
        path: &str,
        state: &mut ReadState<T>,
        watcher: Option<WatcherRef>,
    ) -> Result<Option<T>> {
        let (names, stat) = loop {
            match client.get_children(path, watcher.clone()).await {
                Ok(listing) => break listing,
                Err(e) if e.is_no_node() => {
                    state.reset();
                    if !watch_absent(client, path, watcher.clone()).await? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if state.czxid != Some(stat.czxid) {
            state.reset();
            state.czxid = Some(stat.czxid);
        }
        let names = match &self.filter {
            Some(filter) => filter.filter(names),
            None => names,
        };
        state.children.retain(|name, _| names.contains(name));

        for name in names {
            if state.children.contains_key(&name) {
                continue;
            }
            match client.get_data(&join_path(path, &name), None).await {
                Ok((data, _)) => {
                    let value = self.serializer.from_bytes(Some(&data))?;
                    state.children.insert(name, value);
                }
                // Session of the writer ended between listing and read.
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }

        let empty = self.serializer.from_bytes(None)?;
        Ok(Some(merge_children(
            self.merger.as_ref(),
            empty,
            state.children.values(),
        )))
    }

    async fn put(&self, client: &dyn Coordinator, path: &str, value: &T) -> Result<()> {
        let data = self.serializer.to_bytes(value)?;
        client.ensure_persistent_node_exists(path).await?;
        let created = client
            .create_unique_sequential(
                &join_path(path, &self.prefix),
                data,
                vec![Acl::open_unsafe()],
                CreateMode::EphemeralSequential,
            )
            .await?;
        debug!(path = %created, "ephemeral contribution created");
        Ok(())
    }

    async fn remove(&self, client: &dyn Coordinator, path: &str) -> Result<()> {
        client.remove_node_recursive(path).await
    }

    async fn remove_partial(&self, client: &dyn Coordinator, path: &str, value: &T) -> Result<()> {
        let children = match self.read_all_children(client, path).await {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.merger.unmerge(value, &children) {
            Some(name) => {
                let child = join_path(path, &name);
                debug!(path = %child, "removing ephemeral contribution");
                client.remove_node(&child).await
            }
            None => {
                debug!(path = %path, "no child holds the contribution");
                Ok(())
            }
        }
    }
}

/// Map of child name to child data, following membership and the data of
/// every child.
///
/// Read-only: children are written by whoever owns them, so `put` and the
/// removals are rejected.
pub struct ChildrenData<V> {
    child: Arc<dyn Serializer<V>>,
    serializer: ChildMapSerializer<V>,
}

impl<V> ChildrenData<V> {
    pub fn new(child_serializer: impl Serializer<V> + 'static) -> Self {
        let child: Arc<dyn Serializer<V>> = Arc::new(child_serializer);
        Self {
            serializer: ChildMapSerializer::new(child.clone()),
            child,
        }
    }

    fn read_only(path: &str) -> CoordError {
        CoordError::Unsupported(format!("children data of {} is read-only", path))
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> StoreStrategy<BTreeMap<String, V>> for ChildrenData<V> {
    fn serializer(&self) -> &dyn Serializer<BTreeMap<String, V>> {
        &self.serializer
    }

    /// Arms the child watch on `path` and a data watch on every child, so
    /// a changed child re-reads the whole map.
    async fn read(
        &self,
        client: &dyn Coordinator,
        path: &str,
        _state: &mut ReadState<BTreeMap<String, V>>,
        watcher: Option<WatcherRef>,
    ) -> Result<Option<BTreeMap<String, V>>> {
        let Some(names) = list_children(client, path, watcher.clone()).await? else {
            return Ok(None);
        };
        let mut children = BTreeMap::new();
        for name in names {
            let child = join_path(path, &name);
            match client.get_data(&child, watcher.clone()).await {
                Ok((data, _)) => match self.child.from_bytes(Some(&data)) {
                    Ok(value) => {
                        children.insert(name, value);
                    }
                    Err(e) => warn!(path = %child, error = %e, "skipping undecodable child"),
                },
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Some(children))
    }

    async fn put(&self, _client: &dyn Coordinator, path: &str, _value: &BTreeMap<String, V>) -> Result<()> {
        Err(Self::read_only(path))
    }

    async fn remove(&self, _client: &dyn Coordinator, path: &str) -> Result<()> {
        Err(Self::read_only(path))
    }

    async fn remove_partial(
        &self,
        _client: &dyn Coordinator,
        path: &str,
        _value: &BTreeMap<String, V>,
    ) -> Result<()> {
        Err(Self::read_only(path))
    }
}
