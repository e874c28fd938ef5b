//! Devlink connectivity core.
//!
//! Implements the device-facing side of the Devlink debugging bridge:
//! parsing client queries, running the certificate exchange that bootstraps
//! device trust, serving WebSocket and raw-TCP transports with a shared
//! connection state machine, and multiplexing request/response traffic
//! over a single socket.
//!
//! # Architecture
//!
//! - [`query`] - connection parameter parsing ([`ClientQuery`],
//!   [`SecureClientQuery`])
//! - [`certs`] - local certificate authority and CSR exchange
//! - [`transport`] - WebSocket, TLS WebSocket, browser and TCP adapters
//! - [`server`] - server factory and the [`ServerEvents`] callback seam
//! - [`multiplex`] - request/response correlation with deadlines
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use devlink_protocol::{
//!     create_server, CertificateAuthority, ServerEvents, TransportKind,
//! };
//! # async fn run(events: Arc<dyn ServerEvents>) -> devlink_protocol::Result<()> {
//! let authority = CertificateAuthority::open("/var/lib/devlink/certs")?;
//! let tls = authority.tls_config()?;
//!
//! // Insecure endpoint for certificate exchange, secure endpoint for traffic.
//! let insecure = create_server(8089, Arc::clone(&events), None, TransportKind::WebSocket).await?;
//! let secure = create_server(8088, events, Some(tls), TransportKind::WebSocket).await?;
//! # Ok(())
//! # }
//! ```

pub mod certs;
pub mod error;
pub mod multiplex;
pub mod query;
pub mod server;
pub mod transport;

pub use certs::{
    generate_csr, CertificateAuthority, CertificateBundle, CertificateExchanger, ExchangeResponse,
    ExchangeState,
};
pub use error::{ProtocolError, Result};
pub use multiplex::{
    RequestMultiplexer, SocketMessage, DEFAULT_EXEC_TIMEOUT, HANDSHAKE_TIMEOUT,
};
pub use query::{
    parse_client_query, parse_query_string, parse_secure_client_query, ClientQuery, DeviceOs,
    ExchangeMedium, QueryParams, SecureClientQuery,
};
pub use server::{
    create_browser_server, create_server, ClientDescription, DeviceDescription, DeviceKind,
    ServerEvents, TransportKind,
};
pub use transport::{
    BrowserServer, ClientConnection, ServerTransport, TcpServer, TlsConfig, WebSocketServer,
};
