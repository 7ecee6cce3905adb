//! Retrying client.
//!
//! Operations failing with a transient error (connection loss) are
//! resubmitted up to [`RetryConfig::limit`] times, optionally with
//! exponential backoff. Logical errors pass through untouched.
//!
//! Sequential creates are not idempotent: a create whose reply was lost may
//! have been applied. [`Coordinator::create_unique_sequential`] tags the node
//! name with a token generated once per logical create and, before every
//! resubmission, scans the parent for a child carrying that token and the
//! same data. A plain `create` with a sequential mode is never retried.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::client::{join_path, parent_path, Acl, Coordinator, CreateMode, Stat};
use crate::config::RetryConfig;
use crate::error::{CoordError, Result};
use crate::watch::WatcherRef;

/// What to do with the result of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hand the result to the caller.
    Done,
    /// Resubmit after `delay`.
    Retry { delay: Duration },
    /// Budget exhausted; hand the transient failure to the caller.
    GiveUp,
}

/// Decide the fate of an attempt. `retries` is the number of resubmissions
/// already made for this operation.
pub fn decide<T>(config: &RetryConfig, retries: u32, result: &Result<T>) -> RetryDecision {
    match result {
        Err(e) if e.is_transient() => {
            if retries < config.limit {
                RetryDecision::Retry {
                    delay: backoff_delay(config, retries + 1),
                }
            } else {
                RetryDecision::GiveUp
            }
        }
        _ => RetryDecision::Done,
    }
}

/// Delay before the `retry`-th resubmission (1-based):
/// `initial * 2^(retry - 1)` capped at the maximum, or zero without backoff.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    if !config.exponential_backoff || retry == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
    config
        .initial_backoff()
        .saturating_mul(factor)
        .min(config.max_backoff())
}

/// Run `attempt` until [`decide`] says stop.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    op: &'static str,
    path: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        let result = attempt().await;
        match decide(config, retries, &result) {
            RetryDecision::Done => return result,
            RetryDecision::GiveUp => {
                error!(op, path = %path, retries, "connection lost, giving up");
                return result;
            }
            RetryDecision::Retry { delay } => {
                retries += 1;
                info!(op, path = %path, attempt = retries, ?delay, "retrying after connection loss");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Coordinator wrapper that retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: Coordinator> RetryingClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Look for a child of `parent` created by an earlier attempt of the
    /// create tagged with `token`.
    async fn find_created(&self, parent: &str, token: &str, data: &[u8]) -> Result<Option<String>> {
        let (children, _) = self.inner.get_children(parent, None).await?;
        for child in children.iter().filter(|name| name.contains(token)) {
            let path = join_path(parent, child);
            match self.inner.get_data(&path, None).await {
                Ok((existing, _)) if existing == data => return Ok(Some(path)),
                Ok(_) | Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<C: Coordinator> Coordinator for RetryingClient<C> {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        if mode.is_sequential() {
            let result = self.inner.create(path, data, acl, mode).await;
            if matches!(&result, Err(e) if e.is_transient()) {
                error!(
                    path = %path,
                    "connection lost during create of a sequential node; use create_unique_sequential"
                );
            }
            return result;
        }
        with_retry(&self.config, "create", path, || {
            self.inner.create(path, data.clone(), acl.clone(), mode)
        })
        .await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        with_retry(&self.config, "delete", path, || self.inner.delete(path, version)).await
    }

    async fn exists(&self, path: &str, watcher: Option<WatcherRef>) -> Result<Option<Stat>> {
        with_retry(&self.config, "exists", path, || {
            self.inner.exists(path, watcher.clone())
        })
        .await
    }

    async fn get_data(&self, path: &str, watcher: Option<WatcherRef>) -> Result<(Vec<u8>, Stat)> {
        with_retry(&self.config, "get_data", path, || {
            self.inner.get_data(path, watcher.clone())
        })
        .await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        with_retry(&self.config, "set_data", path, || {
            self.inner.set_data(path, data.clone(), version)
        })
        .await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<WatcherRef>,
    ) -> Result<(Vec<String>, Stat)> {
        with_retry(&self.config, "get_children", path, || {
            self.inner.get_children(path, watcher.clone())
        })
        .await
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat)> {
        with_retry(&self.config, "get_acl", path, || self.inner.get_acl(path)).await
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()> {
        with_retry(&self.config, "add_auth", scheme, || self.inner.add_auth(scheme, auth)).await
    }

    /// Creates `<path>-<token>-<sequence>`. A transient failure of the
    /// create or of the reconciling scan consumes one retry; the create is
    /// only resubmitted after a scan found no node from an earlier attempt.
    async fn create_unique_sequential(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<String> {
        if !mode.is_sequential() {
            return self.create(path, data, acl, mode).await;
        }
        let parent = parent_path(path)
            .ok_or_else(|| CoordError::InvalidPath(format!("no parent: {}", path)))?
            .to_string();
        let token = Uuid::new_v4().to_string();
        let tagged = format!("{}-{}-", path, token);

        let mut retries = 0;
        let mut result = self.inner.create(&tagged, data.clone(), acl.clone(), mode).await;
        loop {
            match decide(&self.config, retries, &result) {
                RetryDecision::Done => return result,
                RetryDecision::GiveUp => {
                    error!(path = %tagged, retries, "connection lost, giving up sequential create");
                    return result;
                }
                RetryDecision::Retry { delay } => {
                    retries += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            result = match self.find_created(&parent, &token, &data).await {
                Ok(Some(existing)) => {
                    info!(path = %existing, attempt = retries, "sequential node created by an earlier attempt");
                    Ok(existing)
                }
                Ok(None) => {
                    info!(path = %tagged, attempt = retries, "retrying sequential create");
                    self.inner.create(&tagged, data.clone(), acl.clone(), mode).await
                }
                Err(e) => Err(e),
            };
        }
    }
}
