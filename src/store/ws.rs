// WebSocket client adapter for a hosted realtime store backend.
//
// Speaks a small JSON frame protocol: requests carry a correlation id and get
// exactly one reply; the server additionally pushes `update` frames for live
// subscriptions. Frame routing is factored out of the socket I/O (the same
// way the message pump is in the rest of this codebase) so it can be tested
// against in-memory streams without opening TCP ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::{Change, DisconnectAction, DisconnectGuard, RemoteStore, StoreError, Subscription};

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Get { id: u64, path: String },
    Put { id: u64, path: String, value: Value },
    Remove { id: u64, path: String },
    /// The request id doubles as the subscription id in later `update`
    /// frames and in `unsubscribe`.
    Subscribe { id: u64, path: String },
    Unsubscribe { id: u64, sub: u64 },
    /// The request id doubles as the armed-mutation handle.
    ArmDisconnect { id: u64, path: String, action: DisconnectAction },
    CancelDisconnect { id: u64, armed: u64 },
}

impl ClientFrame {
    fn id(&self) -> u64 {
        match self {
            ClientFrame::Get { id, .. }
            | ClientFrame::Put { id, .. }
            | ClientFrame::Remove { id, .. }
            | ClientFrame::Subscribe { id, .. }
            | ClientFrame::Unsubscribe { id, .. }
            | ClientFrame::ArmDisconnect { id, .. }
            | ClientFrame::CancelDisconnect { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Update {
        sub: u64,
        #[serde(default)]
        value: Option<Value>,
    },
}

// ---------------------------------------------------------------------------
// Frame routing
// ---------------------------------------------------------------------------

/// Routes server frames to the request/subscription that is waiting for them.
#[derive(Default)]
pub struct Router {
    pending: HashMap<u64, oneshot::Sender<ServerFrame>>,
    subs: HashMap<u64, mpsc::UnboundedSender<Change>>,
}

impl Router {
    /// Deliver one server frame. Replies resolve the pending request with the
    /// matching id; updates land in the subscription channel. Frames with no
    /// waiter are dropped (the waiter may have been cancelled meanwhile).
    pub fn route(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply { id, .. } => match self.pending.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => debug!("dropping reply for unknown request {id}"),
            },
            ServerFrame::Update { sub, value } => match self.subs.get(&sub) {
                Some(tx) => {
                    if tx.send(Change { value }).is_err() {
                        self.subs.remove(&sub);
                    }
                }
                None => debug!("dropping update for cancelled subscription {sub}"),
            },
        }
    }

    /// Drop all waiters; pending requests observe `Disconnected` and
    /// subscription receivers run dry.
    fn shutdown(&mut self) {
        self.pending.clear();
        self.subs.clear();
    }
}

/// Read frames from any websocket message stream, routing each to `router`.
/// Returns when the stream ends, a close frame arrives, or an error occurs.
///
/// Generic over the stream type so it can be tested with in-memory streams.
pub async fn route_frames<St>(mut stream: St, router: Arc<Mutex<Router>>)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                Ok(frame) => lock_router(&router).route(frame),
                Err(e) => warn!("ignoring malformed server frame: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("store server sent close frame");
                break;
            }
            Err(e) => {
                warn!("store connection error: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    lock_router(&router).shutdown();
}

/// Forward outgoing frames from the channel to the websocket sink.
pub async fn pump_frames<S>(mut rx: mpsc::UnboundedReceiver<ClientFrame>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to encode frame {}: {e}", frame.id());
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!("store connection write failed: {e}");
            break;
        }
    }
}

fn lock_router(router: &Arc<Mutex<Router>>) -> MutexGuard<'_, Router> {
    router.lock().expect("ws router mutex poisoned")
}

// ---------------------------------------------------------------------------
// The store client
// ---------------------------------------------------------------------------

/// [`RemoteStore`] implementation over a WebSocket connection.
pub struct WsStore {
    out: mpsc::UnboundedSender<ClientFrame>,
    router: Arc<Mutex<Router>>,
    next_id: AtomicU64,
}

impl WsStore {
    /// Connect to the store server at `url` (e.g. `ws://host:port/sync`) and
    /// spawn the read/write pump tasks.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StoreError::Backend(format!("connect to {url} failed: {e}")))?;
        info!("connected to store server at {url}");

        let (write, read) = stream.split();
        let (out, out_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Mutex::new(Router::default()));

        tokio::spawn(pump_frames(out_rx, write));
        tokio::spawn(route_frames(read, router.clone()));

        Ok(WsStore {
            out,
            router,
            next_id: AtomicU64::new(1),
        })
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one request frame and await its reply.
    async fn request(&self, frame: ClientFrame) -> Result<Option<Value>, StoreError> {
        let id = frame.id();
        let (tx, rx) = oneshot::channel();
        lock_router(&self.router).pending.insert(id, tx);

        if self.out.send(frame).is_err() {
            lock_router(&self.router).pending.remove(&id);
            return Err(StoreError::Disconnected);
        }

        match rx.await {
            Ok(ServerFrame::Reply {
                ok, value, error, ..
            }) => {
                if ok {
                    Ok(value)
                } else {
                    Err(StoreError::Backend(
                        error.unwrap_or_else(|| "unspecified server error".into()),
                    ))
                }
            }
            // The router only ever resolves a pending request with a Reply.
            Ok(_) => Err(StoreError::Backend("protocol violation".into())),
            Err(_) => Err(StoreError::Disconnected),
        }
    }
}

#[async_trait]
impl RemoteStore for WsStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.request(ClientFrame::Get {
            id: self.alloc_id(),
            path: path.to_string(),
        })
        .await
    }

    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.request(ClientFrame::Put {
            id: self.alloc_id(),
            path: path.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.request(ClientFrame::Remove {
            id: self.alloc_id(),
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let id = self.alloc_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Register before sending so an update racing the reply is not lost.
        lock_router(&self.router).subs.insert(id, tx.clone());

        let initial = match self
            .request(ClientFrame::Subscribe {
                id,
                path: path.to_string(),
            })
            .await
        {
            Ok(v) => v,
            Err(e) => {
                lock_router(&self.router).subs.remove(&id);
                return Err(e);
            }
        };
        // The reply carries the value at subscription time; deliver it as the
        // first notification, matching the memory backend.
        let _ = tx.send(Change { value: initial });

        let router = self.router.clone();
        let out = self.out.clone();
        let next = self.alloc_id();
        let cancel = Box::new(move || {
            lock_router(&router).subs.remove(&id);
            let _ = out.send(ClientFrame::Unsubscribe { id: next, sub: id });
        });
        Ok(Subscription::new(path.to_string(), rx, cancel))
    }

    async fn arm_on_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<DisconnectGuard, StoreError> {
        let id = self.alloc_id();
        self.request(ClientFrame::ArmDisconnect {
            id,
            path: path.to_string(),
            action,
        })
        .await?;

        let out = self.out.clone();
        let next = self.alloc_id();
        let cancel = Box::new(move || {
            let _ = out.send(ClientFrame::CancelDisconnect {
                id: next,
                armed: id,
            });
        });
        Ok(DisconnectGuard::new(path.to_string(), cancel))
    }
}
