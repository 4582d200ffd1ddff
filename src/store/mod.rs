//! The shared list + pub/sub store that callers and workers meet on.
//!
//! The protocol only needs a handful of primitives: push to the right of a
//! list, pop from the left, set a key expiry, publish, subscribe, and run a
//! batch of writes atomically. [`Store`] is that surface; [`MemoryStore`]
//! keeps everything in process and [`crate::db::Db`] maps it onto Postgres.

pub mod memory;

pub use memory::{Fault, MemoryStore};

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// One write inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Append `payload` to the list at `key`.
    RPush { key: String, payload: Vec<u8> },
    /// Expire the whole list at `key` after `ttl`. No-op if the key is absent.
    PExpire { key: String, ttl: Duration },
    /// Deliver `payload` to every current subscriber of `channel`.
    Publish { channel: String, payload: Vec<u8> },
}

/// A batch of writes applied all-or-nothing by [`Store::exec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpush(mut self, key: impl Into<String>, payload: Vec<u8>) -> Self {
        self.commands.push(Command::RPush {
            key: key.into(),
            payload,
        });
        self
    }

    pub fn pexpire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(Command::PExpire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn publish(mut self, channel: impl Into<String>, payload: Vec<u8>) -> Self {
        self.commands.push(Command::Publish {
            channel: channel.into(),
            payload,
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl IntoIterator for Transaction {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// A live subscription to one channel.
///
/// Messages arrive in publish order. Dropping the subscription (or calling
/// [`Subscription::unsubscribe`]) releases whatever the backend holds for it.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the backend has gone away.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Store primitives consumed by callers and workers.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Apply every command in `tx` atomically.
    async fn exec(&self, tx: Transaction) -> Result<()>;

    /// Remove and return the head of the list at `key`.
    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to `channel`. The subscription is active when this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Longest channel name the backend can deliver on, if it has a limit.
    fn max_channel_len(&self) -> Option<usize> {
        None
    }
}

/// Fail with `InvalidArgument` if `store` cannot carry `channel`.
pub fn check_channel(store: &dyn Store, channel: &str) -> Result<()> {
    match store.max_channel_len() {
        Some(max) if channel.len() > max => Err(Error::InvalidArgument(format!(
            "channel {channel:?} is {} bytes, the store allows {max}",
            channel.len()
        ))),
        _ => Ok(()),
    }
}
