// In-process reference store backend.
//
// A single shared JSON tree guarded by a mutex, with per-subscription change
// fan-out and per-connection disconnect queues. This is the backend the test
// suite runs against: several `MemoryStore` connections share one
// `MemoryBackend`, so multi-client scenarios (races, crashes, room teardown)
// can be exercised deterministically in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    segments, Change, DisconnectAction, DisconnectGuard, RemoteStore, StoreError, Subscription,
};

// ---------------------------------------------------------------------------
// Shared backend state
// ---------------------------------------------------------------------------

struct SubEntry {
    path: String,
    tx: mpsc::UnboundedSender<Change>,
    /// Last value delivered on this subscription; notifications are only
    /// sent when the value at the path actually changed.
    last: Option<Value>,
}

struct Armed {
    conn_id: u64,
    path: String,
    action: DisconnectAction,
}

#[derive(Default)]
struct Shared {
    root: Value,
    subs: HashMap<u64, SubEntry>,
    armed: HashMap<u64, Armed>,
    next_id: u64,
}

/// The shared tree. Clients connect with [`MemoryBackend::connect`]; each
/// connection gets its own id so disconnect-triggered mutations can be fired
/// per client.
pub struct MemoryBackend {
    inner: Mutex<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBackend {
            inner: Mutex::new(Shared {
                root: Value::Object(Map::new()),
                ..Default::default()
            }),
        })
    }

    /// Open a new connection to this backend.
    pub fn connect(self: &Arc<Self>) -> MemoryStore {
        let conn_id = {
            let mut shared = self.lock();
            shared.next_id += 1;
            shared.next_id
        };
        MemoryStore {
            backend: self.clone(),
            conn_id,
        }
    }

    /// Simulate an unclean disconnect of `conn_id`: every mutation armed by
    /// that connection fires, in arming order.
    pub fn drop_connection(self: &Arc<Self>, conn_id: u64) {
        let mut shared = self.lock();
        let mut fired: Vec<(u64, Armed)> = shared
            .armed
            .iter()
            .filter(|(_, a)| a.conn_id == conn_id)
            .map(|(id, a)| {
                (
                    *id,
                    Armed {
                        conn_id: a.conn_id,
                        path: a.path.clone(),
                        action: a.action.clone(),
                    },
                )
            })
            .collect();
        fired.sort_by_key(|(id, _)| *id);
        for (id, _) in &fired {
            shared.armed.remove(id);
        }
        for (_, armed) in fired {
            info!(
                "connection {} dropped: firing armed mutation at `{}`",
                conn_id, armed.path
            );
            match armed.action {
                DisconnectAction::Remove => Self::apply_remove(&mut shared, &armed.path),
                DisconnectAction::Put(value) => Self::apply_put(&mut shared, &armed.path, value),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Mutex poisoning only happens if a thread panicked mid-mutation,
        // which the test suite would surface anyway.
        self.inner.lock().expect("memory store mutex poisoned")
    }

    fn apply_put(shared: &mut Shared, path: &str, value: Value) {
        match normalize(value) {
            Some(v) => put_at(&mut shared.root, path, v),
            // An empty object is indistinguishable from an absent node.
            None => remove_at(&mut shared.root, path),
        }
        Self::notify(shared);
    }

    fn apply_remove(shared: &mut Shared, path: &str) {
        remove_at(&mut shared.root, path);
        Self::notify(shared);
    }

    /// Push a change to every subscription whose value actually changed,
    /// pruning subscriptions whose receiver is gone.
    fn notify(shared: &mut Shared) {
        let root = shared.root.clone();
        let mut dead = Vec::new();
        for (id, sub) in shared.subs.iter_mut() {
            let current = value_at(&root, &sub.path);
            if current == sub.last {
                continue;
            }
            sub.last = current.clone();
            if sub.tx.send(Change { value: current }).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            shared.subs.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handle
// ---------------------------------------------------------------------------

/// One client connection to a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    conn_id: u64,
}

impl MemoryStore {
    /// Connection id, used with [`MemoryBackend::drop_connection`] to
    /// simulate a crash of this client.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let shared = self.backend.lock();
        Ok(value_at(&shared.root, path))
    }

    async fn put(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut shared = self.backend.lock();
        MemoryBackend::apply_put(&mut shared, path, value);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut shared = self.backend.lock();
        MemoryBackend::apply_remove(&mut shared, path);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id;
        {
            let mut shared = self.backend.lock();
            shared.next_id += 1;
            sub_id = shared.next_id;
            let current = value_at(&shared.root, path);
            // Initial snapshot, then change-driven notifications.
            let _ = tx.send(Change {
                value: current.clone(),
            });
            shared.subs.insert(
                sub_id,
                SubEntry {
                    path: path.to_string(),
                    tx,
                    last: current,
                },
            );
        }
        debug!("subscribed to `{}` (sub {})", path, sub_id);

        let backend = self.backend.clone();
        let cancel = Box::new(move || {
            backend.lock().subs.remove(&sub_id);
        });
        Ok(Subscription::new(path.to_string(), rx, cancel))
    }

    async fn arm_on_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<DisconnectGuard, StoreError> {
        let armed_id;
        {
            let mut shared = self.backend.lock();
            shared.next_id += 1;
            armed_id = shared.next_id;
            shared.armed.insert(
                armed_id,
                Armed {
                    conn_id: self.conn_id,
                    path: path.to_string(),
                    action,
                },
            );
        }
        let backend = self.backend.clone();
        let cancel = Box::new(move || {
            backend.lock().armed.remove(&armed_id);
        });
        Ok(DisconnectGuard::new(path.to_string(), cancel))
    }
}

// ---------------------------------------------------------------------------
// JSON tree helpers
// ---------------------------------------------------------------------------

/// Read the value at `path`, cloning the subtree. Returns `None` for absent
/// paths or when a non-object node is traversed through.
fn value_at(root: &Value, path: &str) -> Option<Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node.clone())
}

/// Replace the subtree at `path` with `value`, creating intermediate objects
/// as needed. An existing non-object node along the path is overwritten.
fn put_at(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    if segs.is_empty() {
        *root = value;
        return;
    }
    let mut node = root;
    for seg in &segs[..segs.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .expect("just ensured object")
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut()
        .expect("just ensured object")
        .insert(segs[segs.len() - 1].to_string(), value);
}

/// Remove the subtree at `path`, then prune any parent objects left empty so
/// the tree never contains empty nodes.
fn remove_at(root: &mut Value, path: &str) {
    let segs = segments(path);
    if segs.is_empty() {
        *root = Value::Object(Map::new());
        return;
    }
    remove_rec(root, &segs);
}

/// Recursive removal helper: returns true if `node` ended up empty and the
/// parent should drop it.
fn remove_rec(node: &mut Value, segs: &[&str]) -> bool {
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    if segs.len() == 1 {
        map.remove(segs[0]);
    } else if let Some(child) = map.get_mut(segs[0]) {
        if remove_rec(child, &segs[1..]) {
            map.remove(segs[0]);
        }
    }
    map.is_empty()
}

/// Strip empty objects recursively. `None` means the value normalizes away
/// entirely (empty object or null).
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}
