//! Reply waiters.
//!
//! A task prompting a user registers a waiter keyed by `(user, channel)`.
//! The next message from that user in that channel that isn't a command
//! is delivered to the head waiter; every other waiter for the same key is
//! told to retry its prompt. Waiters are deliberately not queued: each one
//! must get an answer of some kind before its timeout, so the losers race
//! again instead of waiting behind the head.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{Mutex, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Replied,
    Interrupted,
    RetryPrompt,
    Timeout,
}

/// What a waiter receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub matched: bool,
    pub status: ReplyStatus,
    pub text: String,
}

impl Reply {
    fn status(status: ReplyStatus) -> Self {
        Self {
            matched: false,
            status,
            text: String::new(),
        }
    }
}

struct Waiter {
    id: u64,
    re: Regex,
    tx: oneshot::Sender<Reply>,
}

type WaiterKey = (String, String);

/// A registered waiter; await it with [`ReplyRegistry::wait`].
pub struct PendingReply {
    pub id: u64,
    /// True when no other waiter existed, so the caller should send its prompt.
    pub first: bool,
    rx: oneshot::Receiver<Reply>,
    key: WaiterKey,
}

#[derive(Default)]
pub struct ReplyRegistry {
    waiters: Mutex<HashMap<WaiterKey, Vec<Waiter>>>,
    next_id: AtomicU64,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next message from `user` in `channel`.
    pub async fn register(&self, user: &str, channel: &str, re: Regex) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let key = (user.to_string(), channel.to_string());
        let mut waiters = self.waiters.lock().await;
        let list = waiters.entry(key.clone()).or_default();
        let first = list.is_empty();
        list.push(Waiter { id, re, tx });
        tracing::debug!(user, channel, waiters = list.len(), "Registered reply waiter");
        PendingReply { id, first, rx, key }
    }

    pub async fn has_waiter(&self, user: &str, channel: &str) -> bool {
        self.waiters
            .lock()
            .await
            .contains_key(&(user.to_string(), channel.to_string()))
    }

    /// Hand a message to the waiters for `(user, channel)`. Returns false if
    /// nobody was waiting.
    pub async fn deliver(&self, user: &str, channel: &str, text: &str) -> bool {
        let Some(list) = self.take(user, channel).await else {
            return false;
        };
        for (i, w) in list.into_iter().enumerate() {
            let reply = if i == 0 {
                Reply {
                    matched: w.re.is_match(text),
                    status: ReplyStatus::Replied,
                    text: text.to_string(),
                }
            } else {
                Reply::status(ReplyStatus::RetryPrompt)
            };
            let _ = w.tx.send(reply);
        }
        true
    }

    /// A new command arrived: interrupt the head waiter, retry the rest.
    pub async fn interrupt(&self, user: &str, channel: &str) -> bool {
        let Some(list) = self.take(user, channel).await else {
            return false;
        };
        for (i, w) in list.into_iter().enumerate() {
            let status = if i == 0 {
                ReplyStatus::Interrupted
            } else {
                ReplyStatus::RetryPrompt
            };
            let _ = w.tx.send(Reply::status(status));
        }
        true
    }

    /// Wait for a reply, giving up after `timeout`.
    ///
    /// On timeout the whole list for the key is released and the other
    /// waiters are told to retry. If a reply raced in at the deadline it is
    /// returned as though the timeout hadn't fired.
    pub async fn wait(&self, pending: PendingReply, timeout: Duration) -> Reply {
        let PendingReply { id, mut rx, key, .. } = pending;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Reply::status(ReplyStatus::Interrupted),
            Err(_) => {
                let mut waiters = self.waiters.lock().await;
                let owned = waiters
                    .get(&key)
                    .is_some_and(|list| list.iter().any(|w| w.id == id));
                if owned {
                    if let Some(list) = waiters.remove(&key) {
                        for w in list.into_iter().filter(|w| w.id != id) {
                            let _ = w.tx.send(Reply::status(ReplyStatus::RetryPrompt));
                        }
                    }
                    drop(waiters);
                    tracing::warn!(user = %key.0, channel = %key.1, "Timed out waiting for a reply");
                    return Reply::status(ReplyStatus::Timeout);
                }
                drop(waiters);
                rx.await
                    .unwrap_or_else(|_| Reply::status(ReplyStatus::Interrupted))
            }
        }
    }

    /// Withdraw a waiter that never got to prompt.
    pub async fn cancel(&self, pending: PendingReply) {
        let mut waiters = self.waiters.lock().await;
        if let Some(list) = waiters.get_mut(&pending.key) {
            list.retain(|w| w.id != pending.id);
            if list.is_empty() {
                waiters.remove(&pending.key);
            }
        }
    }

    async fn take(&self, user: &str, channel: &str) -> Option<Vec<Waiter>> {
        self.waiters
            .lock()
            .await
            .remove(&(user.to_string(), channel.to_string()))
    }
}
