//! Per-protocol user and channel identity maps.
//!
//! Connectors publish name⇄ID tables; the whole table for a protocol is
//! replaced at once and readers work from an `Arc` snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Name⇄ID tables for one protocol.
#[derive(Debug, Clone, Default)]
pub struct ProtocolIdentities {
    user_ids: HashMap<String, String>,
    user_names: HashMap<String, String>,
    channel_ids: HashMap<String, String>,
    channel_names: HashMap<String, String>,
}

impl ProtocolIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        let (name, id) = (name.into(), id.into());
        self.user_names.insert(id.clone(), name.clone());
        self.user_ids.insert(name, id);
        self
    }

    pub fn with_channel(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        let (name, id) = (name.into(), id.into());
        self.channel_names.insert(id.clone(), name.clone());
        self.channel_ids.insert(name, id);
        self
    }

    pub fn user_id(&self, name: &str) -> Option<&str> {
        self.user_ids.get(name).map(String::as_str)
    }

    pub fn user_name(&self, id: &str) -> Option<&str> {
        self.user_names.get(id).map(String::as_str)
    }

    pub fn channel_id(&self, name: &str) -> Option<&str> {
        self.channel_ids.get(name).map(String::as_str)
    }

    pub fn channel_name(&self, id: &str) -> Option<&str> {
        self.channel_names.get(id).map(String::as_str)
    }
}

type Snapshot = Arc<HashMap<String, Arc<ProtocolIdentities>>>;

/// Identity maps for all protocols.
#[derive(Debug, Default)]
pub struct IdentityMaps {
    maps: RwLock<Snapshot>,
}

impl IdentityMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tables for `protocol`.
    pub async fn replace(&self, protocol: &str, identities: ProtocolIdentities) {
        let mut guard = self.maps.write().await;
        let mut next: HashMap<_, _> = (**guard).clone();
        next.insert(protocol.to_string(), Arc::new(identities));
        *guard = Arc::new(next);
        tracing::debug!(protocol, "Identity maps updated");
    }

    /// Snapshot of one protocol's tables.
    pub async fn snapshot(&self, protocol: &str) -> Arc<ProtocolIdentities> {
        self.maps
            .read()
            .await
            .get(protocol)
            .cloned()
            .unwrap_or_default()
    }

    /// ID for a user name, falling back to the name itself.
    pub async fn resolve_user_id(&self, protocol: &str, name: &str) -> String {
        let ids = self.snapshot(protocol).await;
        ids.user_id(name).unwrap_or(name).to_string()
    }

    /// ID for a channel name, falling back to the name itself.
    pub async fn resolve_channel_id(&self, protocol: &str, name: &str) -> String {
        let ids = self.snapshot(protocol).await;
        ids.channel_id(name).unwrap_or(name).to_string()
    }
}
