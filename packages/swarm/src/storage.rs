//! Sealed key/value state kept in `<config_dir>/state.json`.
//!
//! Every value is sealed on its own, so the file is a JSON object of
//! envelopes. Entries may carry an expiry; an expired or unreadable entry
//! reads as absent.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use swarm_envelope::{Envelope, Sealer};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";

#[derive(Serialize, Deserialize)]
struct Stored<T> {
    value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SecureStorage {
    path: PathBuf,
    sealer: Sealer,
    entries: Mutex<Map<String, Value>>,
}

impl SecureStorage {
    /// Open `<dir>/state.json`, creating `dir` if needed. A missing file is an
    /// empty store; a corrupt one is discarded with a warning.
    pub fn open(dir: &Path, sealer: Sealer) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(STATE_FILE);

        let entries = if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable state file");
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path,
            sealer,
            entries: Mutex::new(entries),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().ok()?;
        let envelope = Envelope::recognize(entries.get(key)?)?;
        let stored: Stored<T> = match self.sealer.open_json(&envelope) {
            Ok(stored) => stored,
            Err(e) => {
                debug!(%key, error = %e, "stored entry did not open");
                return None;
            }
        };
        if stored.expires_at_ms.is_some_and(|at| now_ms() >= at) {
            debug!(%key, "stored entry expired");
            return None;
        }
        Some(stored.value)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, value, None)
    }

    /// Store `value` so that it reads as absent once `ttl` has passed.
    pub fn set_for<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let expires_at = now_ms().saturating_add(ttl.as_millis() as u64);
        self.put(key, value, Some(expires_at))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn put<T: Serialize>(&self, key: &str, value: &T, expires_at_ms: Option<u64>) -> Result<()> {
        let envelope = self
            .sealer
            .seal_json(&Stored {
                value,
                expires_at_ms,
            })
            .with_context(|| format!("failed to seal {key}"))?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        entries.insert(key.to_string(), envelope.to_json());
        self.save(&entries)
    }

    /// Replace the file through a temporary sibling, mode 0600.
    fn save(&self, entries: &Map<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", tmp.display()))?;
        }

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
