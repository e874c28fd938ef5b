//! Browser-facing WebSocket server.
//!
//! Browser apps cannot hold client certificates, so this endpoint skips
//! the certificate exchange entirely: connections authenticate through
//! their page origin and are promoted straight to trusted sessions. To
//! keep observers uniform, both the plain and the secure connection
//! attempt callbacks fire for every browser connection.

use std::sync::Arc;

use crate::error::{ProtocolError, Result};
use crate::server::events::ServerEvents;
use crate::transport::websocket::{SessionMode, WebSocketServer};
use crate::transport::{ServerTransport, TlsConfig};

pub struct BrowserServer {
    inner: WebSocketServer,
}

impl BrowserServer {
    pub fn new(events: Arc<dyn ServerEvents>) -> Self {
        Self {
            inner: WebSocketServer::with_mode(events, SessionMode::Browser),
        }
    }
}

#[async_trait::async_trait]
impl ServerTransport for BrowserServer {
    async fn start(&mut self, port: u16, tls: Option<TlsConfig>) -> Result<u16> {
        if tls.is_some() {
            return Err(ProtocolError::Configuration(
                "browser server does not take a TLS configuration".to_string(),
            ));
        }
        self.inner.start(port, None).await
    }

    async fn stop(&mut self) {
        self.inner.stop().await;
    }

    fn local_port(&self) -> Option<u16> {
        self.inner.local_port()
    }
}
