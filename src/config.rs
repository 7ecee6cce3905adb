//! Configuration inputs for connections, retries, ACLs and stores.
//!
//! Loading these from files or flags is left to the embedding application;
//! the structs only fix the semantics of each knob.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::Acl;

/// Retry behaviour of [`RetryingClient`](crate::retry::RetryingClient).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of resubmissions after a transient failure.
    /// Zero disables retrying.
    pub limit: u32,
    /// Sleep between attempts, doubling each time.
    pub exponential_backoff: bool,
    /// First backoff interval in milliseconds.
    pub initial_backoff_ms: u64,
    /// Ceiling for the backoff interval in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            exponential_backoff: false,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        Self {
            limit: 0,
            ..Self::default()
        }
    }

    /// Initial backoff interval.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Maximum backoff interval.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Connection parameters.
///
/// Two configs that differ in any field get distinct shared connections in
/// the [`ConnectionRegistry`](crate::registry::ConnectionRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Host list understood by the [`Connector`](crate::connection::Connector).
    pub connect_string: String,
    /// Session timeout in milliseconds. A session that cannot reach the
    /// service for this long is expired by the service.
    pub session_timeout_ms: u64,
    /// Delay between attempts to open a new session.
    pub reconnect_interval_ms: u64,
    /// Retry policy for operations issued through the connection.
    pub retry: RetryConfig,
    /// Resolve `$`-prefixed path segments as symbolic links.
    pub symlink_aware: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_string: "localhost:2181".to_string(),
            session_timeout_ms: 30_000,
            reconnect_interval_ms: 1_000,
            retry: RetryConfig::default(),
            symlink_aware: true,
        }
    }
}

impl ConnectionConfig {
    /// Config for the given host list with default tuning.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }

    /// Session timeout.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Delay between reconnect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Credentials attached to a session before ephemeral creates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Auth scheme, e.g. `digest`.
    pub scheme: String,
    /// Scheme-specific credentials.
    pub credentials: Vec<u8>,
}

/// ACL enforcement for ephemeral creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// ACL applied to every ephemeral node.
    pub acl: Vec<Acl>,
    /// Optional credentials; `None` applies the ACL without authenticating.
    pub auth: Option<AuthInfo>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            acl: vec![Acl::open_unsafe()],
            auth: None,
        }
    }
}

/// Property store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Width of the coalescing window for watch-triggered re-reads in
    /// milliseconds. Zero re-reads immediately.
    pub read_window_ms: u64,
    /// Randomize the delay inside the window (between its midpoint and its
    /// end) so that many clients do not re-read in lockstep.
    pub read_jitter: bool,
    /// Delay before retrying a re-read that failed.
    pub resync_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_window_ms: 0,
            read_jitter: true,
            resync_interval_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Coalescing window width.
    pub fn read_window(&self) -> Duration {
        Duration::from_millis(self.read_window_ms)
    }

    /// Retry interval for failed re-reads.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }
}
