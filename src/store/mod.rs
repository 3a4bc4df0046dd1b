// Remote state store abstraction: a hierarchical key-value tree addressed by
// slash-separated paths, with live change subscriptions and server-side
// disconnect-triggered mutations.
//
// The game engine only ever talks to the [`RemoteStore`] trait. Two backends
// exist: an in-process reference implementation ([`memory::MemoryBackend`])
// used by tests and local play, and a WebSocket client adapter
// ([`ws::WsStore`]) for a hosted realtime backend.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store connection closed")]
    Disconnected,

    #[error("invalid value at `{path}`: {message}")]
    InvalidValue { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// One change notification for a subscribed path. `value` is the complete
/// current value at the path after the mutation that triggered the
/// notification; `None` means the path no longer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub value: Option<Value>,
}

/// A live subscription to a single store path.
///
/// The first notification arrives immediately after subscribing and carries
/// the value at subscription time; every store mutation that alters the value
/// at the path produces a further notification, in the order the store
/// applied the writes.
///
/// Cancelling stops future notifications but does not affect writes already
/// in flight. Cancel is idempotent and also runs on drop, so teardown is
/// safe regardless of which exit path triggers it.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Change>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        path: String,
        rx: mpsc::UnboundedReceiver<Change>,
        cancel: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Subscription {
            path,
            rx,
            cancel: Some(cancel),
        }
    }

    /// The path this subscription watches.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Receive the next change notification. Returns `None` once the
    /// subscription has been cancelled (locally or by the backend).
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Stop receiving notifications. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(f) = self.cancel.take() {
            debug!("cancelling subscription on `{}`", self.path);
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// Disconnect-triggered mutations
// ---------------------------------------------------------------------------

/// Mutation the store server applies if the connection drops before the
/// client cancels it. This is the only mechanism guaranteed to run when the
/// client cannot execute further code.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectAction {
    /// Remove the value at the armed path.
    Remove,
    /// Replace the value at the armed path.
    Put(Value),
}

/// Handle for an armed disconnect mutation.
///
/// Dropping the guard deliberately does *not* cancel the armed mutation: the
/// mutation must stay armed for the whole session so it still fires if the
/// process dies. Only an explicit [`DisconnectGuard::cancel`] (the clean-exit
/// path) disarms it.
pub struct DisconnectGuard {
    path: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl DisconnectGuard {
    pub(crate) fn new(path: String, cancel: Box<dyn FnOnce() + Send + Sync>) -> Self {
        DisconnectGuard {
            path,
            cancel: Some(cancel),
        }
    }

    /// The path the armed mutation targets.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Disarm the mutation. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(f) = self.cancel.take() {
            debug!("disarming on-disconnect mutation for `{}`", self.path);
            f();
        }
    }
}

// ---------------------------------------------------------------------------
// The store trait
// ---------------------------------------------------------------------------

/// Path-addressed key-value store with change subscriptions.
///
/// Paths are slash-separated (`rooms/ABC/players/Alice`). Writes are
/// last-writer-wins at the granularity of the written subtree; there is no
/// compare-and-swap and no cross-path atomicity. An empty object is
/// indistinguishable from an absent path (writing `{}` removes the node).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the complete value at `path`, or `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the subtree at `path` with `value`, creating intermediate
    /// nodes as needed.
    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Remove the subtree at `path`. Removing an absent path is a no-op.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Subscribe to value changes at `path`. The current value is delivered
    /// as the first notification.
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Arm a mutation the server applies if this connection drops without a
    /// clean shutdown.
    async fn arm_on_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<DisconnectGuard, StoreError>;
}

/// Split a slash-separated path into non-empty segments.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
