//! Server transports.
//!
//! Three adapters share one connection model: a plain WebSocket server for
//! certificate exchange, a mutually-authenticated TLS WebSocket server for
//! app traffic, and a length-prefixed JSON-over-TCP server for clients
//! without a WebSocket stack. Each adapter owns socket IO only; connection
//! semantics live in [`session`].

pub mod browser;
pub(crate) mod session;
pub mod tcp;
pub mod websocket;

pub use browser::BrowserServer;
pub use session::ClientConnection;
pub use tcp::TcpServer;
pub use websocket::WebSocketServer;

use async_trait::async_trait;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;

use crate::error::{ProtocolError, Result};

/// PEM material for the secure transports.
///
/// `ca_pem` anchors client certificate verification; connections without a
/// certificate signed by it are refused during the TLS handshake.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

impl TlsConfig {
    /// Builds an acceptor that presents the server identity and requires a
    /// client certificate chained to the configured CA.
    pub(crate) fn build_acceptor(&self) -> Result<Arc<SslAcceptor>> {
        let cert = X509::from_pem(self.cert_pem.as_bytes())?;
        let key = PKey::private_key_from_pem(self.key_pem.as_bytes())?;
        let ca = X509::from_pem(self.ca_pem.as_bytes())?;

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder.check_private_key()?;
        builder.cert_store_mut().add_cert(ca.clone())?;
        builder.add_client_ca(&ca)?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);

        Ok(Arc::new(builder.build()))
    }
}

/// Common lifecycle of all server adapters.
#[async_trait]
pub trait ServerTransport: Send {
    /// Binds the server and starts accepting connections. Returns the port
    /// actually bound, which differs from `port` when `0` was requested.
    async fn start(&mut self, port: u16, tls: Option<TlsConfig>) -> Result<u16>;

    /// Stops accepting and asks every live connection to close.
    async fn stop(&mut self);

    /// Port the server is currently bound to, if started.
    fn local_port(&self) -> Option<u16>;
}

impl std::fmt::Debug for dyn ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("local_port", &self.local_port())
            .finish()
    }
}

/// Instruction to a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Serialized JSON frame to deliver
    Frame(String),
    /// Close the connection after flushing
    Close,
}

/// One live connection: the writer command channel plus the reader task
/// pumping frames off the socket.
pub(crate) struct LiveConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

/// Live connections of one server, keyed by an accept sequence number.
/// `stop` drains it, pushing a close through every writer task and
/// aborting the readers so the sockets drop even when a peer never
/// acknowledges the close.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, LiveConnection>>,
}

impl ConnectionRegistry {
    pub async fn insert(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
        reader: JoinHandle<()>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .await
            .insert(id, LiveConnection { outbound, reader });
        id
    }

    pub async fn remove(&self, id: u64) {
        self.connections.lock().await.remove(&id);
    }

    pub async fn close_all(&self) {
        for (_, connection) in self.connections.lock().await.drain() {
            let _ = connection.outbound.send(Outbound::Close);
            connection.reader.abort();
        }
    }
}

/// Binds on all interfaces, translating the bind failure for ports that
/// are already taken.
pub(crate) async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProtocolError::from_bind_error(e, port))
}

/// Runs the server side of the TLS handshake on a fresh TCP connection.
pub(crate) async fn tls_accept(
    acceptor: &SslAcceptor,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls).accept().await?;
    Ok(tls)
}
