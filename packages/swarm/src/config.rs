use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm_envelope::Sealer;

use crate::backoff::{BackoffPolicy, ReconnectPolicy};

// =============================================================================
// Unified config (figment-deserialized from defaults / swarm.toml / env vars)
// =============================================================================
//
//   swarm.toml:      [pool]
//                    batch_size = 5
//
//   env var:         SWARM_POOL__BATCH_SIZE=5   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub pool: PoolFileConfig,
    #[serde(default)]
    pub enforcer: EnforcerFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
    #[serde(default)]
    pub layout: StoreLayout,
    #[serde(default = "default_avatars")]
    pub avatars: Vec<String>,
}

/// Credential service location (lives under `[backend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    /// Explicit base URL. Skips discovery when set.
    #[serde(default)]
    pub url: Option<String>,
    /// JSON documents of the form `{"url": "..."}`, queried in order.
    #[serde(default)]
    pub discovery_urls: Vec<String>,
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    #[serde(default = "default_join_path")]
    pub join_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long a discovered URL is reused before probing again.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            discovery_urls: Vec::new(),
            fallback_url: default_fallback_url(),
            join_path: default_join_path(),
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Envelope key (lives under `[transport]`). Base64 of 32 bytes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolFileConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Delays before re-subscribing once the store ends the primary stream.
    #[serde(default = "default_resubscribe_base_ms")]
    pub resubscribe_base_ms: u64,
    #[serde(default = "default_resubscribe_max_ms")]
    pub resubscribe_max_ms: u64,
}

impl Default for PoolFileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            max_sessions: default_max_sessions(),
            resubscribe_base_ms: default_resubscribe_base_ms(),
            resubscribe_max_ms: default_resubscribe_max_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnforcerFileConfig {
    #[serde(default = "default_enforcer_interval_ms")]
    pub interval_ms: u64,
}

impl Default for EnforcerFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_enforcer_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreFileConfig {
    /// Token exchange endpoint; the custom token is used as-is when unset.
    #[serde(default)]
    pub auth_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

/// Key names of the store's wire schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLayout {
    pub participants: String,
    pub blocks: String,
    pub stage: String,
    pub finished_stage: String,
    pub settings: String,
    pub category: String,
    pub variant: String,
    pub message: String,
    pub sequence: String,
    pub avatar: String,
    pub ready: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            participants: "c".into(),
            blocks: "bu".into(),
            stage: "stg".into(),
            finished_stage: "fin".into(),
            settings: "s".into(),
            category: "t".into(),
            variant: "m".into(),
            message: "msg".into(),
            sequence: "i".into(),
            avatar: "b".into(),
            ready: "rt".into(),
        }
    }
}

impl StoreLayout {
    /// `{group}/{participants}/{name}`, plus `/{field}` when a field is given.
    pub fn participant_path(&self, group_id: &str, name: &str, field: &str) -> String {
        let base = format!("{}/{}/{}", group_id, self.participants, name);
        if field.is_empty() {
            base
        } else {
            format!("{}/{}", base, field.trim_start_matches('/'))
        }
    }
}

fn default_fallback_url() -> String {
    "http://localhost:4500".to_string()
}
fn default_join_path() -> String {
    "/join".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_delay_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_max_sessions() -> usize {
    500
}
fn default_resubscribe_base_ms() -> u64 {
    500
}
fn default_resubscribe_max_ms() -> u64 {
    30_000
}
fn default_enforcer_interval_ms() -> u64 {
    500
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}
fn default_avatars() -> Vec<String> {
    [
        "Chick", "Chicken", "Cow", "Goat", "Horse", "Pig", "Sheep", "Duck", "Alpaca", "Dog",
        "Cat", "Rabbit", "Goldfish", "Hamster", "Turtle", "Kitten", "Puppy", "Bear", "Moose",
        "Fox",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Build a figment that layers: defaults → swarm.toml → SWARM_* env vars.
///
///   `SWARM_POOL__BATCH_SIZE=5`  →  `pool.batch_size = 5`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("swarm.toml")))
        .merge(Env::prefixed("SWARM_").split("__"))
}

/// Default config directory: `~/.swarm`, or `./.swarm` without a home.
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".swarm"))
        .unwrap_or_else(|| PathBuf::from(".swarm"))
}

// =============================================================================
// Resolved runtime view
// =============================================================================

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: Option<String>,
    pub discovery_urls: Vec<String>,
    pub fallback_url: String,
    pub join_path: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub backoff: BackoffPolicy,
    pub max_sessions: usize,
    pub enforcer_interval: Duration,
    pub resubscribe: ReconnectPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_file(&PoolFileConfig::default(), &EnforcerFileConfig::default())
    }
}

impl PoolConfig {
    pub fn from_file(fc: &PoolFileConfig, enforcer: &EnforcerFileConfig) -> Self {
        Self {
            batch_size: fc.batch_size.max(1),
            batch_delay: Duration::from_millis(fc.batch_delay_ms),
            backoff: BackoffPolicy::new(fc.max_retries, Duration::from_millis(fc.retry_base_ms)),
            max_sessions: fc.max_sessions,
            enforcer_interval: Duration::from_millis(enforcer.interval_ms.max(1)),
            resubscribe: ReconnectPolicy {
                base: Duration::from_millis(fc.resubscribe_base_ms),
                max: Duration::from_millis(fc.resubscribe_max_ms),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub url: Option<String>,
    pub reconnect: ReconnectPolicy,
}

#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub backend: BackendConfig,
    pub sealer: Sealer,
    pub pool: PoolConfig,
    pub store_auth_url: Option<String>,
    pub chat: ChatConfig,
    pub layout: StoreLayout,
    pub avatars: Vec<String>,
}

impl SwarmConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let sealer = match &fc.transport.key {
            Some(encoded) => Sealer::from_base64(encoded)
                .context("transport.key must be base64 of 32 bytes")?,
            None => Sealer::default(),
        };

        Ok(Self {
            backend: BackendConfig {
                url: fc.backend.url.clone().filter(|u| !u.is_empty()),
                discovery_urls: fc.backend.discovery_urls.clone(),
                fallback_url: fc.backend.fallback_url.clone(),
                join_path: fc.backend.join_path.clone(),
                timeout: Duration::from_secs(fc.backend.timeout_secs),
                cache_ttl: Duration::from_secs(fc.backend.cache_ttl_secs),
            },
            sealer,
            pool: PoolConfig::from_file(&fc.pool, &fc.enforcer),
            store_auth_url: fc.store.auth_url.clone().filter(|u| !u.is_empty()),
            chat: ChatConfig {
                url: fc.chat.url.clone().filter(|u| !u.is_empty()),
                reconnect: ReconnectPolicy {
                    base: Duration::from_millis(fc.chat.reconnect_base_ms),
                    max: Duration::from_millis(fc.chat.reconnect_max_ms),
                },
            },
            layout: fc.layout.clone(),
            avatars: fc.avatars.clone(),
        })
    }

    /// Load and resolve configuration from `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(config_dir)
            .extract()
            .with_context(|| format!("Failed to load config from {:?}", config_dir))?;
        Self::from_file(&fc)
    }
}
