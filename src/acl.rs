//! ACL-enforcing client.
//!
//! Ephemeral nodes announce live processes, so they always carry the
//! configured ACL: the caller's list is discarded and the configured
//! credentials, if any, are attached to the session first. Persistent
//! creates keep the caller's ACL unchanged.

use async_trait::async_trait;
use tracing::debug;

use crate::client::{Acl, Coordinator, CreateMode, Stat};
use crate::config::AclConfig;
use crate::error::Result;
use crate::watch::WatcherRef;

/// Coordinator wrapper that applies the configured ACL to ephemeral creates.
#[derive(Debug, Clone)]
pub struct AclEnforcingClient<C> {
    inner: C,
    config: AclConfig,
}

impl<C: Coordinator> AclEnforcingClient<C> {
    pub fn new(inner: C, config: AclConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn config(&self) -> &AclConfig {
        &self.config
    }

    /// ACL to create with, authenticating the session when the configured
    /// ACL applies.
    async fn acl_for(&self, path: &str, acl: Vec<Acl>, mode: CreateMode) -> Result<Vec<Acl>> {
        if !mode.is_ephemeral() {
            return Ok(acl);
        }
        if let Some(auth) = &self.config.auth {
            self.inner.add_auth(&auth.scheme, &auth.credentials).await?;
        }
        debug!(path = %path, entries = self.config.acl.len(), "applying configured acl");
        Ok(self.config.acl.clone())
    }
}

#[async_trait]
impl<C: Coordinator> Coordinator for AclEnforcingClient<C> {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        let acl = self.acl_for(path, acl, mode).await?;
        self.inner.create(path, data, acl, mode).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.inner.delete(path, version).await
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        self.inner.exists(path, watcher).await
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        self.inner.get_data(path, watcher).await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        self.inner.set_data(path, data, version).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        self.inner.get_children(path, watcher).await
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        self.inner.get_acl(path).await
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
        let acl = self.acl_for(path, acl, mode).await?;
        self.inner.create_unique_sequential(path, data, acl, mode).await
    }
}
