//! Pool shape: the ordered set of connected sessions and the result of
//! filling it.

use std::str::FromStr;
use std::sync::Arc;

use rand::seq::IndexedRandom;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::StoreLayout;
use crate::error::SwarmError;
use crate::session::Session;

/// A session that did not make it into the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinFailure {
    pub name: String,
    pub reason: String,
    #[serde(skip)]
    pub error: SwarmError,
}

/// Outcome of a batch join. Partial success is a normal result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolResult {
    pub requested: usize,
    pub connected: usize,
    pub failures: Vec<JoinFailure>,
}

impl PoolResult {
    pub fn is_partial(&self) -> bool {
        self.connected > 0 && self.connected < self.requested
    }
}

/// Connected sessions in batch order. The first one is the primary.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    pub generation: u64,
    pub sessions: Vec<Arc<Session>>,
}

impl Pool {
    pub fn primary(&self) -> Option<&Arc<Session>> {
        self.sessions.first()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// `count` display names derived from `base`: the base itself for a single
/// session, `base1..baseN` otherwise.
pub fn display_names(base: &str, count: usize) -> Vec<String> {
    if count == 1 {
        return vec![base.to_string()];
    }
    (1..=count).map(|i| format!("{base}{i}")).collect()
}

/// Avatar selection for new sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AvatarChoice {
    #[default]
    Random,
    Fixed(String),
}

impl FromStr for AvatarChoice {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("random") {
            Ok(AvatarChoice::Random)
        } else {
            Ok(AvatarChoice::Fixed(s.to_string()))
        }
    }
}

impl AvatarChoice {
    /// The avatar for one session; `None` when choosing randomly from nothing.
    pub fn pick(&self, avatars: &[String]) -> Option<String> {
        match self {
            AvatarChoice::Fixed(v) => Some(v.clone()),
            AvatarChoice::Random => avatars.choose(&mut rand::rng()).cloned(),
        }
    }

    pub fn fixed(&self) -> Option<&str> {
        match self {
            AvatarChoice::Fixed(v) => Some(v),
            AvatarChoice::Random => None,
        }
    }
}

/// Presence entry written when a session connects.
pub fn presence(layout: &StoreLayout, avatar: Option<String>) -> Value {
    let mut entry = Map::new();
    if let Some(avatar) = avatar {
        entry.insert(layout.avatar.clone(), Value::String(avatar));
    }
    entry.insert(layout.ready.clone(), Value::Bool(true));
    Value::Object(entry)
}
