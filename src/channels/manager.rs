//! Connector manager: owns every connector and merges their inbound streams.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::select_all;

use crate::channels::{Connector, MessageStream};
use crate::error::ChannelError;

/// Holds connectors by protocol.
#[derive(Default)]
pub struct ConnectorManager {
    connectors: HashMap<String, Arc<dyn Connector>>,
    /// Protocol used when a pipeline has none (scheduled jobs).
    default_protocol: Option<String>,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connector. The first one added becomes the default protocol.
    pub fn add(&mut self, connector: Arc<dyn Connector>) {
        let protocol = connector.protocol().to_string();
        if self.default_protocol.is_none() {
            self.default_protocol = Some(protocol.clone());
        }
        tracing::debug!(%protocol, "Added connector");
        self.connectors.insert(protocol, connector);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(protocol).cloned()
    }

    pub fn default_protocol(&self) -> &str {
        self.default_protocol.as_deref().unwrap_or_default()
    }

    /// Start every connector and merge their streams.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut streams = Vec::with_capacity(self.connectors.len());
        for (protocol, connector) in &self.connectors {
            let stream = connector.start().await?;
            tracing::info!(%protocol, "Connector started");
            streams.push(stream);
        }
        Ok(Box::pin(select_all(streams)))
    }

    /// Shut down every connector, logging failures.
    pub async fn shutdown_all(&self) {
        for (protocol, connector) in &self.connectors {
            if let Err(e) = connector.shutdown().await {
                tracing::warn!(%protocol, "Connector shutdown failed: {}", e);
            }
        }
    }
}
