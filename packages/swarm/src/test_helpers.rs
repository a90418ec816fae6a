//! In-process fakes for the credential service and the realtime store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::credentials::{CredentialService, Credentials};
use crate::error::SwarmError;
use crate::store::{StoreConnection, StoreConnector, Subscription, tree};

struct Watcher {
    connection: u64,
    path: String,
    tx: mpsc::Sender<Value>,
}

#[derive(Default)]
struct StoreInner {
    root: Value,
    watchers: Vec<Watcher>,
    writes: Vec<(String, Value)>,
    broken: Vec<String>,
    open: HashSet<u64>,
}

/// A shared JSON tree with live subscriptions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    next_connection: Arc<AtomicU64>,
}

fn related(a: &str, b: &str) -> bool {
    let a = a.trim_matches('/');
    let b = b.trim_matches('/');
    a.is_empty()
        || b.is_empty()
        || a == b
        || a.starts_with(&format!("{b}/"))
        || b.starts_with(&format!("{a}/"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Value {
        let inner = self.inner.lock().unwrap();
        tree::get(&inner.root, path).cloned().unwrap_or(Value::Null)
    }

    /// A change made by someone else; notifies subscribers.
    pub fn remote_set(&self, path: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        Self::apply(&mut inner, path, value);
    }

    /// Writes under `prefix` fail from now on.
    pub fn break_path(&self, prefix: &str) {
        self.inner.lock().unwrap().broken.push(prefix.to_string());
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes.len()
    }

    pub fn writes_to(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    /// End every live subscription on exactly `path`, as a server would.
    pub fn drop_subscriptions(&self, path: &str) {
        self.inner.lock().unwrap().watchers.retain(|w| w.path != path);
    }

    fn apply(inner: &mut StoreInner, path: &str, value: Value) {
        tree::put(&mut inner.root, path, value);
        let root = &inner.root;
        inner.watchers.retain(|w| !w.tx.is_closed());
        for w in inner.watchers.iter().filter(|w| related(&w.path, path)) {
            let current = tree::get(root, &w.path).cloned().unwrap_or(Value::Null);
            let _ = w.tx.try_send(current);
        }
    }
}

/// Connector onto a [`MemoryStore`], with an optional connect delay and
/// concurrency counters.
pub struct MemoryConnector {
    store: MemoryStore,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connected: Mutex<Vec<(String, Instant)>>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connected: Mutex::new(Vec::new()),
        }
    }

    /// Every connect takes this long.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Token and completion time of every connect, in completion order.
    pub fn connected(&self) -> Vec<(String, Instant)> {
        self.connected.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn StoreConnection>, SwarmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let id = self.store.next_connection.fetch_add(1, Ordering::SeqCst);
        self.store.inner.lock().unwrap().open.insert(id);
        self.connected
            .lock()
            .unwrap()
            .push((credentials.token.clone(), Instant::now()));
        Ok(Arc::new(MemoryConnection {
            id,
            store: self.store.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    store: MemoryStore,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn set(&self, path: &str, value: Value) -> Result<(), SwarmError> {
        let mut inner = self.store.inner.lock().unwrap();
        if !inner.open.contains(&self.id) {
            return Err(SwarmError::Transport("connection closed".into()));
        }
        if inner.broken.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(SwarmError::Transport(format!("write to {path} refused")));
        }
        inner.writes.push((path.to_string(), value.clone()));
        MemoryStore::apply(&mut inner, path, value);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, SwarmError> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.store.inner.lock().unwrap();
        if !inner.open.contains(&self.id) {
            return Err(SwarmError::Transport("connection closed".into()));
        }
        let current = tree::get(&inner.root, path).cloned().unwrap_or(Value::Null);
        let _ = tx.try_send(current);
        inner.watchers.push(Watcher {
            connection: self.id,
            path: path.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) {
        let mut inner = self.store.inner.lock().unwrap();
        inner.open.remove(&self.id);
        inner.watchers.retain(|w| w.connection != self.id);
    }
}

/// Credential service with per-name scripted behavior and concurrency
/// counters.
#[derive(Default)]
pub struct ScriptedCredentials {
    rejected: HashMap<String, String>,
    flaky: Mutex<HashMap<String, usize>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always refuse `name` with `reason`.
    pub fn reject(mut self, name: &str, reason: &str) -> Self {
        self.rejected.insert(name.to_string(), reason.to_string());
        self
    }

    /// Fail the first `failures` attempts for `name` with a transport error.
    pub fn flaky(self, name: &str, failures: usize) -> Self {
        self.flaky.lock().unwrap().insert(name.to_string(), failures);
        self
    }

    /// Every acquisition takes this long.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Name and start time of every acquisition, in call order.
    pub fn started(&self) -> Vec<(String, Instant)> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialService for ScriptedCredentials {
    async fn acquire(&self, _group_id: &str, name: &str) -> Result<Credentials, SwarmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap()
            .push((name.to_string(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(reason) = self.rejected.get(name) {
            return Err(SwarmError::Auth(reason.clone()));
        }
        if let Some(remaining) = self.flaky.lock().unwrap().get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SwarmError::Transport("connection reset".into()));
            }
        }
        Ok(Credentials {
            token: format!("token-{name}"),
            endpoint: "memory://store".into(),
        })
    }
}
