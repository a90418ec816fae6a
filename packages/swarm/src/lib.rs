//! Multi-session orchestration over a realtime data store.
//!
//! An [`Orchestrator`] joins many sessions to one group in bounded batches,
//! fans writes out across them, and watches the primary session's
//! subscription through a [`DiffEngine`] that reports each change once.
//! The [`ChatChannel`] is an independent encrypted side channel.

pub mod backoff;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod diff;
pub mod discovery;
pub mod enforcer;
pub mod error;
pub mod events;
pub mod message;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test_helpers;

pub use backoff::{BackoffPolicy, ReconnectPolicy};
pub use chat::{ChatChannel, ChatEvent, ChatMessage, ChatSource};
pub use config::{StoreLayout, SwarmConfig};
pub use credentials::{CredentialService, Credentials, HttpCredentialService};
pub use diff::DiffEngine;
pub use error::SwarmError;
pub use events::{EndReason, SwarmEvent};
pub use orchestrator::{Orchestrator, OrchestratorSettings, OrchestratorStatus, WriteOutcome};
pub use pool::{AvatarChoice, JoinFailure, PoolResult};
pub use session::{Session, SessionId, SessionStatus};
pub use storage::SecureStorage;
pub use store::rest::RestStore;
