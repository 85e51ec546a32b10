//! Short-term memory.
//!
//! Small values keyed by `(key, user, channel)` with a timestamp. The matcher
//! uses it to resolve "it" to the last-mentioned thing and to recall the last
//! message heard before a blank command; tasks use it through
//! `Robot::remember` / `Robot::recall`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Key for the last message heard from a user in a channel.
pub const LAST_MSG_KEY: &str = "lastMsg";

/// Memory key for a context label.
pub fn context_key(label: &str) -> String {
    format!("context:{label}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoryKey {
    key: String,
    user: String,
    channel: String,
}

impl MemoryKey {
    fn new(key: &str, user: &str, channel: &str) -> Self {
        Self {
            key: key.to_string(),
            user: user.to_string(),
            channel: channel.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    stored: Instant,
}

#[derive(Debug, Default)]
pub struct ShortTermMemory {
    entries: RwLock<HashMap<MemoryKey, MemoryEntry>>,
}

impl ShortTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one and resetting its age.
    pub async fn remember(&self, key: &str, user: &str, channel: &str, value: impl Into<String>) {
        self.entries.write().await.insert(
            MemoryKey::new(key, user, channel),
            MemoryEntry {
                value: value.into(),
                stored: Instant::now(),
            },
        );
    }

    /// Value no older than `max_age`, without touching its age.
    pub async fn recall(
        &self,
        key: &str,
        user: &str,
        channel: &str,
        max_age: Duration,
    ) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(&MemoryKey::new(key, user, channel))
            .filter(|e| e.stored.elapsed() <= max_age)
            .map(|e| e.value.clone())
    }

    /// Value no older than `max_age`; a hit resets the age.
    pub async fn recall_fresh(
        &self,
        key: &str,
        user: &str,
        channel: &str,
        max_age: Duration,
    ) -> Option<String> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&MemoryKey::new(key, user, channel))?;
        if entry.stored.elapsed() > max_age {
            return None;
        }
        entry.stored = Instant::now();
        Some(entry.value.clone())
    }

    pub async fn forget(&self, key: &str, user: &str, channel: &str) {
        self.entries
            .write()
            .await
            .remove(&MemoryKey::new(key, user, channel));
    }

    /// Drop entries older than `max_age`; returns how many were dropped.
    pub async fn prune(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.stored.elapsed() <= max_age);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HORIZON: Duration = Duration::from_secs(77);

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_not_returned() {
        let mem = ShortTermMemory::new();
        mem.remember("context:location", "alice", "general", "Paris")
            .await;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            mem.recall("context:location", "alice", "general", HORIZON)
                .await
                .as_deref(),
            Some("Paris")
        );
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(
            mem.recall("context:location", "alice", "general", HORIZON)
                .await
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_recall_refreshes_the_timestamp() {
        let mem = ShortTermMemory::new();
        mem.remember("k", "alice", "general", "v").await;
        tokio::time::advance(Duration::from_secs(70)).await;
        assert!(mem.recall_fresh("k", "alice", "general", HORIZON).await.is_some());
        tokio::time::advance(Duration::from_secs(70)).await;
        assert!(mem.recall_fresh("k", "alice", "general", HORIZON).await.is_some());
    }

    #[tokio::test]
    async fn scoped_by_user_and_channel() {
        let mem = ShortTermMemory::new();
        mem.remember("k", "alice", "general", "v").await;
        assert!(mem.recall("k", "bob", "general", HORIZON).await.is_none());
        assert!(mem.recall("k", "alice", "ops", HORIZON).await.is_none());
        mem.forget("k", "alice", "general").await;
        assert!(mem.recall("k", "alice", "general", HORIZON).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_only_old_entries() {
        let mem = ShortTermMemory::new();
        mem.remember("old", "alice", "general", "1").await;
        tokio::time::advance(Duration::from_secs(500)).await;
        mem.remember("new", "alice", "general", "2").await;
        assert_eq!(mem.prune(Duration::from_secs(420)).await, 1);
        assert!(mem.recall("new", "alice", "general", HORIZON).await.is_some());
    }
}
