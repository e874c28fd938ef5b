//! Server construction.
//!
//! Applications do not instantiate transports directly; they ask the
//! factory for a started server. With a TLS configuration the factory
//! produces the authenticated variant of the chosen transport, without
//! one the certificate-exchange variant.

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::server::events::ServerEvents;
use crate::transport::{BrowserServer, ServerTransport, TcpServer, TlsConfig, WebSocketServer};

/// Which wire transport a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Length-prefixed JSON over raw TCP
    #[default]
    Tcp,
    /// WebSocket
    WebSocket,
}

/// Creates a device-facing server and starts it. Returns once the port is
/// bound and the server accepts connections; binding failures (including
/// `EADDRINUSE`) surface as the error.
pub async fn create_server(
    port: u16,
    events: Arc<dyn ServerEvents>,
    tls: Option<TlsConfig>,
    transport: TransportKind,
) -> Result<Box<dyn ServerTransport>> {
    let secure = tls.is_some();
    let mut server: Box<dyn ServerTransport> = match transport {
        TransportKind::Tcp => Box::new(TcpServer::new(events)),
        TransportKind::WebSocket if secure => Box::new(WebSocketServer::secure(events)),
        TransportKind::WebSocket => Box::new(WebSocketServer::insecure(events)),
    };

    let bound_port = server.start(port, tls).await?;
    info!(port = bound_port, ?transport, secure, "server started");
    Ok(server)
}

/// Creates and starts the browser-facing WebSocket server.
pub async fn create_browser_server(
    port: u16,
    events: Arc<dyn ServerEvents>,
) -> Result<Box<dyn ServerTransport>> {
    let mut server: Box<dyn ServerTransport> = Box::new(BrowserServer::new(events));
    let bound_port = server.start(port, None).await?;
    info!(port = bound_port, "browser server started");
    Ok(server)
}
