//! Endpoint fallback.
//!
//! Tries several connectors in order of preference and returns the first
//! connection that opens. Devices typically list a LAN address first and a
//! local address second.

use crate::traits::{Connection, Connector, TransportError};
use async_trait::async_trait;
use sideline_protocol::Identity;
use std::sync::Arc;
use tracing::{debug, warn};

/// A connector that tries multiple connectors in order of preference.
pub struct FallbackConnector {
    connectors: Vec<Arc<dyn Connector>>,
}

impl FallbackConnector {
    /// Create a new fallback connector.
    ///
    /// Connectors are tried in order (first = highest priority).
    #[must_use]
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        Self { connectors }
    }

    /// Build a WebSocket connector per endpoint.
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn from_endpoints<I, S>(endpoints: I, template: &crate::websocket::WebSocketConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let connectors = endpoints
            .into_iter()
            .map(|base_url| {
                Arc::new(crate::websocket::WebSocketConnector::new(
                    crate::websocket::WebSocketConfig {
                        base_url: base_url.into(),
                        ..template.clone()
                    },
                )) as Arc<dyn Connector>
            })
            .collect();
        Self::new(connectors)
    }

    /// Add a connector to the end of the fallback chain.
    pub fn add_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// Get the list of connector names in priority order.
    #[must_use]
    pub fn connector_names(&self) -> Vec<&'static str> {
        self.connectors.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Connector for FallbackConnector {
    async fn connect(&self, identity: &Identity) -> Result<Box<dyn Connection>, TransportError> {
        let mut last_error = None;

        for (index, connector) in self.connectors.iter().enumerate() {
            if !connector.is_healthy() {
                continue;
            }
            match connector.connect(identity).await {
                Ok(connection) => {
                    debug!(
                        index,
                        transport = connector.name(),
                        "Endpoint accepted connection"
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(index, transport = connector.name(), "Endpoint failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Other("No healthy endpoints available".into())))
    }

    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_healthy(&self) -> bool {
        self.connectors.iter().any(|c| c.is_healthy())
    }
}
