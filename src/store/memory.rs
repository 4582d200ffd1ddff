//! In-process store.
//!
//! Lists expire lazily: an expired key is discarded the next time anything
//! touches it, the way a key-value server treats a passive expiry. Channels
//! fan out over unbounded mpsc senders.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use super::{Command, Store, Subscription, Transaction};
use crate::error::{Error, Result};

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Exec,
    Pop,
    Publish,
}

#[derive(Default)]
struct List {
    items: VecDeque<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl List {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>;

#[derive(Default)]
struct Inner {
    lists: Mutex<HashMap<String, List>>,
    channels: Mutex<Subscribers>,
    next_subscriber: AtomicU64,
    fail_exec: AtomicBool,
    fail_pop: AtomicBool,
    fail_publish: AtomicBool,
}

impl Inner {
    fn fault(&self, fault: Fault) -> &AtomicBool {
        match fault {
            Fault::Exec => &self.fail_exec,
            Fault::Pop => &self.fail_pop,
            Fault::Publish => &self.fail_publish,
        }
    }

    fn check(&self, fault: Fault) -> Result<()> {
        if self.fault(fault).load(Ordering::SeqCst) {
            return Err(Error::Store(format!("injected {fault:?} failure")));
        }
        Ok(())
    }

    fn deliver(&self, channel: &str, payload: &[u8]) -> usize {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|(_, tx)| tx.send(payload.to_vec()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        delivered
    }
}

/// Process-local [`Store`]. Cloning shares the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fault` fail (or succeed again) until toggled back.
    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        self.inner.fault(fault).store(enabled, Ordering::SeqCst);
    }

    /// Number of items in the list at `key`, honouring expiry.
    pub fn len(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut lists = self.inner.lists.lock();
        match lists.get(key) {
            Some(list) if list.is_expired(now) => {
                lists.remove(key);
                0
            }
            Some(list) => list.items.len(),
            None => 0,
        }
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// Live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec(&self, tx: Transaction) -> Result<()> {
        self.inner.check(Fault::Exec)?;

        let now = Instant::now();
        // Holding the list lock across the whole batch keeps it atomic with
        // respect to concurrent pops.
        let mut lists = self.inner.lists.lock();
        for command in tx {
            match command {
                Command::RPush { key, payload } => {
                    let list = lists.entry(key).or_default();
                    if list.is_expired(now) {
                        *list = List::default();
                    }
                    list.items.push_back(payload);
                }
                Command::PExpire { key, ttl } => {
                    if let Some(list) = lists.get_mut(&key) {
                        if list.is_expired(now) {
                            lists.remove(&key);
                        } else {
                            list.expires_at = Some(now + ttl);
                        }
                    }
                }
                Command::Publish { channel, payload } => {
                    let delivered = self.inner.deliver(&channel, &payload);
                    trace!(channel, delivered, "published");
                }
            }
        }
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.check(Fault::Pop)?;

        let now = Instant::now();
        let mut lists = self.inner.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(None);
        };
        if list.is_expired(now) {
            lists.remove(key);
            return Ok(None);
        }
        let item = list.items.pop_front();
        if list.items.is_empty() {
            lists.remove(key);
        }
        Ok(item)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.inner.check(Fault::Publish)?;
        let delivered = self.inner.deliver(channel, payload);
        trace!(channel, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        let inner = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut channels = inner.channels.lock();
            if let Some(subscribers) = channels.get_mut(&name) {
                subscribers.retain(|(sub, _)| *sub != id);
                if subscribers.is_empty() {
                    channels.remove(&name);
                }
            }
        }))
    }
}
