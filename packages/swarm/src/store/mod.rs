//! The realtime store as seen by a session: connect, write, subscribe, close.
//!
//! The store itself is a black box. [`rest::RestStore`] is the shipped
//! binding; tests use an in-memory implementation.

pub mod rest;
pub mod tree;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::error::SwarmError;

/// Full current value of a subscribed path, delivered on every change.
/// `Value::Null` means the path is empty. The channel closes when the
/// subscription ends.
pub type Subscription = mpsc::Receiver<Value>;

/// Opens authenticated connections to the store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn StoreConnection>, SwarmError>;
}

/// One authenticated connection.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Replace the value at `path`. `Value::Null` deletes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), SwarmError>;

    async fn subscribe(&self, path: &str) -> Result<Subscription, SwarmError>;

    /// Release the connection and end its subscriptions.
    async fn close(&self);
}
