//! Exclusive-run queues.
//!
//! A tag present in the map is held by exactly one pipeline. Its queue holds
//! wake-up handles for pipelines waiting their turn, in arrival order.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, oneshot};

/// Outcome of asking for a tag with queueing.
#[derive(Debug)]
pub enum Claim {
    /// The tag was free and is now held by the caller.
    Acquired,
    /// Someone else holds it; the receiver fires when it's the caller's turn.
    Queued(oneshot::Receiver<()>),
}

#[derive(Debug, Default)]
pub struct RunQueues {
    queues: Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>,
}

impl RunQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the tag if nobody holds it.
    pub async fn try_claim(&self, tag: &str) -> bool {
        let mut queues = self.queues.lock().await;
        if queues.contains_key(tag) {
            return false;
        }
        queues.insert(tag.to_string(), VecDeque::new());
        true
    }

    /// Take the tag, or join the back of its queue.
    pub async fn claim_or_enqueue(&self, tag: &str) -> Claim {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(tag) {
            Some(queue) => {
                let (tx, rx) = oneshot::channel();
                queue.push_back(tx);
                tracing::debug!(tag, queue_len = queue.len(), "Exclusive tag busy, queueing");
                Claim::Queued(rx)
            }
            None => {
                queues.insert(tag.to_string(), VecDeque::new());
                Claim::Acquired
            }
        }
    }

    /// Release the tag. Ownership passes to the head of the queue; waiters
    /// that have gone away are skipped. With nobody waiting the tag is freed.
    pub async fn release(&self, tag: &str) {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(tag) else {
            tracing::warn!(tag, "Released an exclusive tag nobody held");
            return;
        };
        while let Some(next) = queue.pop_front() {
            if next.send(()).is_ok() {
                tracing::debug!(tag, remaining = queue.len(), "Woke next queued pipeline");
                return;
            }
        }
        queues.remove(tag);
        tracing::debug!(tag, "Exclusive tag released");
    }

    pub async fn is_held(&self, tag: &str) -> bool {
        self.queues.lock().await.contains_key(tag)
    }
}
