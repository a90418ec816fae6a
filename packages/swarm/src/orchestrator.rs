//! Orchestrator: owns the pool, its primary-session watcher and the enforcers.
//!
//! Lifecycle operations (installing a pool, tearing it down, replacing an
//! enforcer) are serialized. Reads and broadcasts only take the pool lock long
//! enough to copy the session list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use swarm_envelope::Sealer;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::config::{PoolConfig, StoreLayout, SwarmConfig};
use crate::credentials::CredentialService;
use crate::diff::DiffEngine;
use crate::enforcer::{Enforcer, Fanout};
use crate::error::SwarmError;
use crate::events::{EventBus, SwarmEvent};
use crate::message::encode_message;
use crate::pool::{AvatarChoice, JoinFailure, Pool, PoolResult, display_names, presence};
use crate::session::{Session, SessionId, SessionStatus};
use crate::store::{StoreConnector, Subscription};

/// Rewrites each display name before use.
pub type NameTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct OrchestratorSettings {
    pub pool: PoolConfig,
    pub layout: Arc<StoreLayout>,
    pub avatars: Vec<String>,
    pub name_transform: Option<NameTransform>,
}

impl From<&SwarmConfig> for OrchestratorSettings {
    fn from(config: &SwarmConfig) -> Self {
        Self {
            pool: config.pool.clone(),
            layout: Arc::new(config.layout.clone()),
            avatars: config.avatars.clone(),
            name_transform: None,
        }
    }
}

/// Result of one session's write during a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub session: SessionId,
    pub name: String,
    pub result: Result<(), SwarmError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub group: Option<String>,
    pub pool_size: usize,
    pub primary: Option<String>,
    pub joining: bool,
    /// Fields with a running enforcer, sorted.
    pub enforced: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct SnapshotView {
    value: Option<Value>,
    participants: Vec<String>,
}

/// The primary session's subscription task.
struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Watcher {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Resets the in-flight flag when the join ends, however it ends.
struct JoinGuard<'a>(&'a AtomicBool);

impl<'a> JoinGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    settings: OrchestratorSettings,
    sealer: Sealer,
    credentials: Arc<dyn CredentialService>,
    connector: Arc<dyn StoreConnector>,
    lifecycle: Mutex<()>,
    pool: Mutex<Pool>,
    watcher: Mutex<Option<Watcher>>,
    enforcers: Mutex<HashMap<String, Enforcer>>,
    joining: AtomicBool,
    next_session: AtomicU64,
    next_generation: AtomicU64,
    message_seq: AtomicU64,
    events: EventBus,
    view: watch::Sender<SnapshotView>,
}

/// Handle to the orchestration core. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        sealer: Sealer,
        credentials: Arc<dyn CredentialService>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let (view, _) = watch::channel(SnapshotView::default());
        Self {
            inner: Arc::new(Inner {
                settings,
                sealer,
                credentials,
                connector,
                lifecycle: Mutex::new(()),
                pool: Mutex::new(Pool::default()),
                watcher: Mutex::new(None),
                enforcers: Mutex::new(HashMap::new()),
                joining: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                message_seq: AtomicU64::new(0),
                events: EventBus::new(),
                view,
            }),
        }
    }

    /// Register an event subscriber. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the pool with `count` new sessions joined to `group_id`.
    ///
    /// Sessions join in batches of `batch_size`; a batch starts only once the
    /// previous one has settled. Individual failures end up in
    /// [`PoolResult::failures`] and never fail the call.
    pub async fn join_batch(
        &self,
        group_id: &str,
        base_name: &str,
        count: usize,
        avatar: AvatarChoice,
    ) -> Result<PoolResult, SwarmError> {
        let inner = &self.inner;
        let settings = &inner.settings;
        let group_id = group_id.trim();
        let base_name = base_name.trim();
        if group_id.is_empty() {
            return Err(SwarmError::InvalidInput("group id is empty".into()));
        }
        if base_name.is_empty() {
            return Err(SwarmError::InvalidInput("name is empty".into()));
        }
        if count == 0 || count > settings.pool.max_sessions {
            return Err(SwarmError::InvalidInput(format!(
                "count must be between 1 and {}",
                settings.pool.max_sessions
            )));
        }

        let _guard = JoinGuard::acquire(&inner.joining).ok_or(SwarmError::JoinInProgress)?;
        inner.teardown(None).await;

        let names: Vec<String> = display_names(base_name, count)
            .into_iter()
            .map(|n| match &settings.name_transform {
                Some(transform) => transform(&n),
                None => n,
            })
            .collect();
        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        info!(group = %group_id, count, generation, "joining");

        let mut connected: Vec<Arc<Session>> = Vec::with_capacity(count);
        let mut failures = Vec::new();

        for (index, batch) in names.chunks(settings.pool.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(settings.pool.batch_delay).await;
            }

            let attempts = batch.iter().map(|name| {
                let id = SessionId(inner.next_session.fetch_add(1, Ordering::SeqCst));
                let session = Arc::new(Session::new(id, group_id, name, settings.layout.clone()));
                let presence = presence(&settings.layout, avatar.pick(&settings.avatars));
                let credentials = inner.credentials.clone();
                let connector = inner.connector.clone();
                let backoff = settings.pool.backoff;
                let task = tokio::spawn({
                    let session = session.clone();
                    async move {
                        session
                            .join(&*credentials, &*connector, presence, backoff)
                            .await
                    }
                });
                async move {
                    let result = match task.await {
                        Ok(result) => result,
                        Err(e) => Err(SwarmError::Transport(format!("join task failed: {e}"))),
                    };
                    (session, result)
                }
            });

            // Settled results of this batch only
            let settled = join_all(attempts).await;
            let before = connected.len();
            for (session, result) in settled {
                match result {
                    Ok(()) => connected.push(session),
                    Err(error) => failures.push(JoinFailure {
                        name: session.display_name().to_string(),
                        reason: error.to_string(),
                        error,
                    }),
                }
            }
            debug!(
                batch = index + 1,
                size = batch.len(),
                connected = connected.len() - before,
                "batch settled"
            );
        }

        let result = PoolResult {
            requested: count,
            connected: connected.len(),
            failures,
        };
        info!(
            group = %group_id,
            requested = result.requested,
            connected = result.connected,
            failed = result.failures.len(),
            "join finished"
        );

        let _lifecycle = inner.lifecycle.lock().await;
        {
            let mut pool = inner.pool.lock().await;
            *pool = Pool {
                generation,
                sessions: connected.clone(),
            };
        }
        if let Some(primary) = connected.first() {
            inner.start_watcher(primary, generation).await;
            if let Some(fixed) = avatar.fixed() {
                inner
                    .replace_enforcer(&settings.layout.avatar, json!(fixed))
                    .await;
            }
        }

        Ok(result)
    }

    /// Write `value` to `field` on every session. Per-session failures are
    /// reported in the outcomes and never affect the other writes.
    pub async fn broadcast(&self, field: &str, value: Value) -> Vec<WriteOutcome> {
        self.inner.broadcast(field, value).await
    }

    /// Tear down every session and stop the watcher and every enforcer.
    pub async fn teardown_all(&self) {
        self.inner.teardown(None).await;
    }

    /// Privileged `{group}/{path}` write through the primary session.
    pub async fn write_root(&self, path: &str, value: Value) -> Result<(), SwarmError> {
        let primary = self.inner.pool.lock().await.primary().cloned();
        match primary {
            Some(primary) => primary.write_root(path, value).await,
            None => Err(SwarmError::NotConnected),
        }
    }

    /// Seal `text` and publish it as the next message of every session.
    pub async fn send_message(&self, text: &str) -> Result<Vec<WriteOutcome>, SwarmError> {
        let layout = &self.inner.settings.layout;
        let seq = self.inner.message_seq.fetch_add(1, Ordering::SeqCst);
        let entry = encode_message(&self.inner.sealer, text, &layout.sequence, seq)?;
        Ok(self.inner.broadcast(&layout.message, entry).await)
    }

    /// Start (or replace) the enforcer for `field`. Enforcers of other fields
    /// keep running.
    pub async fn set_desired(&self, field: &str, value: Value) -> Result<(), SwarmError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.pool.lock().await.is_empty() {
            return Err(SwarmError::NotConnected);
        }
        self.inner.replace_enforcer(field, value).await;
        Ok(())
    }

    /// Stop the enforcer for `field`. Returns whether one was registered.
    pub async fn clear_desired(&self, field: &str) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let enforcer = self.inner.enforcers.lock().await.remove(field);
        match enforcer {
            Some(enforcer) => {
                enforcer.stop().await;
                true
            }
            None => false,
        }
    }

    /// Sorted participant names of the current snapshot.
    pub fn participants(&self) -> Vec<String> {
        self.inner.view.borrow().participants.clone()
    }

    /// Last full value seen by the primary session.
    pub fn snapshot(&self) -> Option<Value> {
        self.inner.view.borrow().value.clone()
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let (pool_size, primary) = {
            let pool = self.inner.pool.lock().await;
            (pool.sessions.len(), pool.primary().cloned())
        };
        let mut enforced: Vec<String> = self
            .inner
            .enforcers
            .lock()
            .await
            .values()
            .filter(|e| e.is_running())
            .map(|e| e.field().to_string())
            .collect();
        enforced.sort();
        OrchestratorStatus {
            group: primary.as_ref().map(|s| s.group_id().to_string()),
            pool_size,
            primary: primary.map(|s| s.display_name().to_string()),
            joining: self.inner.joining.load(Ordering::Acquire),
            enforced,
        }
    }
}

impl Inner {
    async fn sessions(&self) -> Vec<Arc<Session>> {
        self.pool.lock().await.sessions.clone()
    }

    async fn broadcast(&self, field: &str, value: Value) -> Vec<WriteOutcome> {
        let sessions = self.sessions().await;
        let writes = sessions.iter().map(|session| {
            let value = value.clone();
            async move {
                WriteOutcome {
                    session: session.id(),
                    name: session.display_name().to_string(),
                    result: session.write(field, value).await,
                }
            }
        });
        let outcomes = join_all(writes).await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            debug!(%field, failed, total = outcomes.len(), "broadcast partially failed");
        }
        outcomes
    }

    /// Tear down the pool. With `only` set, do nothing unless the current pool
    /// is that generation.
    async fn teardown(&self, only: Option<u64>) {
        let _lifecycle = self.lifecycle.lock().await;
        let sessions = {
            let mut pool = self.pool.lock().await;
            if only.is_some_and(|g| g != pool.generation) {
                debug!(generation = ?only, current = pool.generation, "stale teardown ignored");
                return;
            }
            std::mem::take(&mut pool.sessions)
        };

        let enforcers: Vec<Enforcer> = {
            let mut enforcers = self.enforcers.lock().await;
            enforcers.drain().map(|(_, e)| e).collect()
        };
        join_all(enforcers.into_iter().map(Enforcer::stop)).await;
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }

        let count = sessions.len();
        join_all(sessions.iter().map(|s| s.teardown())).await;
        self.view.send_replace(SnapshotView::default());
        if count > 0 {
            info!(sessions = count, "pool torn down");
        }
    }

    async fn replace_enforcer(self: &Arc<Self>, field: &str, value: Value) {
        let mut enforcers = self.enforcers.lock().await;
        if let Some(previous) = enforcers.remove(field) {
            previous.stop().await;
        }
        let enforcer = Enforcer::spawn(
            Arc::downgrade(self),
            field,
            value,
            self.settings.pool.enforcer_interval,
        );
        enforcers.insert(enforcer.field().to_string(), enforcer);
    }

    async fn start_watcher(self: &Arc<Self>, primary: &Arc<Session>, generation: u64) {
        let root = match primary.subscribe("").await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(session = %primary.id(), error = %e, "primary subscription failed");
                return;
            }
        };
        let blocks = match primary.subscribe(&self.settings.layout.blocks).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(session = %primary.id(), error = %e, "block list subscription failed");
                None
            }
        };

        let engine = DiffEngine::new(self.settings.layout.clone(), self.sealer.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_primary(
            Arc::downgrade(self),
            primary.clone(),
            generation,
            root,
            blocks,
            engine,
            cancel.clone(),
        ));
        debug!(session = %primary.id(), generation, "watching primary");

        let previous = self.watcher.lock().await.replace(Watcher { cancel, handle });
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }
}

#[async_trait]
impl Fanout for Inner {
    async fn active_sessions(&self) -> usize {
        self.pool.lock().await.sessions.len()
    }

    async fn fan_out(&self, field: &str, value: Value) {
        self.broadcast(field, value).await;
    }
}

async fn next_value(sub: &mut Option<Subscription>) -> Option<Value> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Subscribe to `path` again after the store ended the stream. Gives up only
/// when cancelled or once the primary is no longer connected.
async fn resubscribe(
    primary: &Session,
    path: &str,
    policy: ReconnectPolicy,
    cancel: &CancellationToken,
) -> Option<Subscription> {
    let mut attempt: u32 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(policy.delay(attempt)) => {}
        }
        if primary.status().await != SessionStatus::Connected {
            return None;
        }
        match primary.subscribe(path).await {
            Ok(sub) => {
                info!(session = %primary.id(), %path, attempt, "resubscribed");
                return Some(sub);
            }
            Err(e) => {
                debug!(session = %primary.id(), %path, attempt, error = %e, "resubscribe failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Feed the primary's subscriptions through the diff engine, strictly one
/// push at a time.
async fn watch_primary(
    inner: Weak<Inner>,
    primary: Arc<Session>,
    generation: u64,
    mut root: Subscription,
    mut blocks: Option<Subscription>,
    mut engine: DiffEngine,
    cancel: CancellationToken,
) {
    let policy = match inner.upgrade() {
        Some(inner) => inner.settings.pool.resubscribe,
        None => return,
    };
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            value = root.recv() => {
                let Some(value) = value else {
                    warn!(generation, "primary subscription closed, resubscribing");
                    match resubscribe(&primary, "", policy, &cancel).await {
                        Some(sub) => root = sub,
                        None => break,
                    }
                    continue;
                };
                let Some(inner) = inner.upgrade() else { break };

                let events = engine.on_snapshot(value);
                inner.view.send_replace(SnapshotView {
                    value: engine.snapshot().cloned(),
                    participants: engine.participants().to_vec(),
                });
                for event in events {
                    inner.events.emit(event);
                }

                if engine.is_ended() {
                    info!(generation, "session ended, tearing down pool");
                    tokio::spawn(async move {
                        inner.teardown(Some(generation)).await;
                    });
                    break;
                }
            }
            value = next_value(&mut blocks) => {
                let Some(value) = value else {
                    debug!(generation, "block list subscription closed");
                    blocks = None;
                    continue;
                };
                if let (Some(event), Some(inner)) = (engine.on_blocks(&value), inner.upgrade()) {
                    inner.events.emit(event);
                }
            }
        }
    }
}
