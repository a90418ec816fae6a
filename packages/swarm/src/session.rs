//! One authenticated participant connection.
//!
//! A session starts `Connecting`, becomes `Connected` once credentials were
//! issued and the presence write landed, and ends `Failed`. `Failed` is
//! terminal: it marks both a join that never succeeded and a session that was
//! torn down. Rejoining means creating a new session.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::StoreLayout;
use crate::credentials::{CredentialService, Credentials};
use crate::error::SwarmError;
use crate::store::{StoreConnection, StoreConnector, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Failed,
}

enum SessionState {
    Connecting,
    Connected {
        credentials: Credentials,
        connection: Arc<dyn StoreConnection>,
    },
    Failed {
        last_error: Option<SwarmError>,
    },
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        match self {
            SessionState::Connecting => SessionStatus::Connecting,
            SessionState::Connected { .. } => SessionStatus::Connected,
            SessionState::Failed { .. } => SessionStatus::Failed,
        }
    }
}

pub struct Session {
    id: SessionId,
    group_id: String,
    display_name: String,
    layout: Arc<StoreLayout>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        group_id: &str,
        display_name: &str,
        layout: Arc<StoreLayout>,
    ) -> Self {
        Self {
            id,
            group_id: group_id.to_string(),
            display_name: display_name.to_string(),
            layout,
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status()
    }

    /// Why the session failed, if it failed rather than being torn down.
    pub async fn last_error(&self) -> Option<SwarmError> {
        match &*self.state.lock().await {
            SessionState::Failed { last_error } => last_error.clone(),
            _ => None,
        }
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        match &*self.state.lock().await {
            SessionState::Connected { credentials, .. } => Some(credentials.clone()),
            _ => None,
        }
    }

    /// `{group}/{participants}/{name}`: everything this session owns.
    pub fn participant_path(&self) -> String {
        self.layout
            .participant_path(&self.group_id, &self.display_name, "")
    }

    pub async fn acquire_credentials(
        &self,
        service: &dyn CredentialService,
    ) -> Result<Credentials, SwarmError> {
        service.acquire(&self.group_id, &self.display_name).await
    }

    /// Open a store connection and register presence. On success the session
    /// is `Connected` and owns the connection.
    pub async fn connect(
        &self,
        connector: &dyn StoreConnector,
        credentials: Credentials,
        presence: Value,
    ) -> Result<(), SwarmError> {
        let connection = connector.connect(&credentials).await?;
        if let Err(e) = connection.set(&self.participant_path(), presence).await {
            connection.close().await;
            return Err(e);
        }

        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Connecting) {
            *state = SessionState::Connected {
                credentials,
                connection,
            };
            return Ok(());
        }
        drop(state);
        connection.close().await;
        Err(SwarmError::InvalidInput(format!(
            "session {} is no longer connecting",
            self.id
        )))
    }

    /// Acquire credentials and connect, retrying per `backoff`. Exhausting the
    /// retries leaves the session `Failed` with the last error.
    pub async fn join(
        &self,
        service: &dyn CredentialService,
        connector: &dyn StoreConnector,
        presence: Value,
        backoff: BackoffPolicy,
    ) -> Result<(), SwarmError> {
        let attempts = backoff.attempts();
        let mut attempt = 0;
        let err = loop {
            attempt += 1;
            let result = async {
                let credentials = self.acquire_credentials(service).await?;
                self.connect(connector, credentials, presence.clone()).await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(session = %self.id, name = %self.display_name, attempt, "joined");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = backoff.delay(attempt);
                    debug!(
                        session = %self.id,
                        name = %self.display_name,
                        attempt,
                        error = %e,
                        "join attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break e,
            }
        };

        warn!(session = %self.id, name = %self.display_name, attempt, error = %err, "join failed");
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Connecting) {
            *state = SessionState::Failed {
                last_error: Some(err.clone()),
            };
        }
        Err(err)
    }

    async fn connection(&self) -> Result<Arc<dyn StoreConnection>, SwarmError> {
        match &*self.state.lock().await {
            SessionState::Connected { connection, .. } => Ok(connection.clone()),
            _ => Err(SwarmError::Transport(format!(
                "session {} is not connected",
                self.id
            ))),
        }
    }

    /// Write `value` under this session's own participant entry.
    pub async fn write(&self, field: &str, value: Value) -> Result<(), SwarmError> {
        let path = self
            .layout
            .participant_path(&self.group_id, &self.display_name, field);
        self.connection().await?.set(&path, value).await
    }

    /// Privileged write at `{group}/{path}`.
    pub async fn write_root(&self, path: &str, value: Value) -> Result<(), SwarmError> {
        let path = format!("{}/{}", self.group_id, path.trim_start_matches('/'));
        self.connection().await?.set(&path, value).await
    }

    /// Subscribe to `{group}/{path}`; an empty path is the group root.
    pub async fn subscribe(&self, path: &str) -> Result<Subscription, SwarmError> {
        let path = path.trim_matches('/');
        let full = if path.is_empty() {
            self.group_id.clone()
        } else {
            format!("{}/{}", self.group_id, path)
        };
        self.connection().await?.subscribe(&full).await
    }

    /// Clear presence (best effort) and release the connection. A second call
    /// does nothing.
    pub async fn teardown(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            if matches!(*state, SessionState::Failed { .. }) {
                return;
            }
            std::mem::replace(&mut *state, SessionState::Failed { last_error: None })
        };

        if let SessionState::Connected { connection, .. } = previous {
            if let Err(e) = connection.set(&self.participant_path(), Value::Null).await {
                debug!(session = %self.id, error = %e, "presence clear failed");
            }
            connection.close().await;
            info!(session = %self.id, name = %self.display_name, "session torn down");
        }
    }
}
