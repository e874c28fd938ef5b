//! WebSocket server adapter.
//!
//! One adapter serves three roles, selected at construction: the insecure
//! certificate-exchange endpoint, the mutually-authenticated TLS endpoint
//! for app traffic, and the browser endpoint (insecure, but treated as
//! trusted because browser apps authenticate via their page origin).
//! Clients announce themselves through the query string of the upgrade URL.

use futures::{SinkExt, StreamExt};
use openssl::ssl::SslAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::query::{
    parse_client_query, parse_query_string, parse_secure_client_query, ExchangeMedium,
    SecureClientQuery,
};
use crate::server::events::ServerEvents;
use crate::transport::session::{run_trusted_session, run_untrusted_session, SessionIo};
use crate::transport::{bind, tls_accept, ConnectionRegistry, Outbound, ServerTransport, TlsConfig};

/// Role a WebSocket server plays, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    /// Insecure endpoint accepting certificate exchange requests only
    CertificateExchange,
    /// TLS endpoint for authenticated app connections
    Trusted,
    /// Insecure endpoint for browser apps, treated as trusted
    Browser,
}

pub struct WebSocketServer {
    events: Arc<dyn ServerEvents>,
    mode: SessionMode,
    registry: Arc<ConnectionRegistry>,
    accept_task: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl WebSocketServer {
    /// Creates the insecure certificate-exchange server.
    pub fn insecure(events: Arc<dyn ServerEvents>) -> Self {
        Self::with_mode(events, SessionMode::CertificateExchange)
    }

    /// Creates the TLS server for authenticated connections. `start` will
    /// refuse to run without a [`TlsConfig`].
    pub fn secure(events: Arc<dyn ServerEvents>) -> Self {
        Self::with_mode(events, SessionMode::Trusted)
    }

    pub(crate) fn with_mode(events: Arc<dyn ServerEvents>, mode: SessionMode) -> Self {
        Self {
            events,
            mode,
            registry: Arc::new(ConnectionRegistry::default()),
            accept_task: None,
            local_port: None,
        }
    }
}

#[async_trait::async_trait]
impl ServerTransport for WebSocketServer {
    async fn start(&mut self, port: u16, tls: Option<TlsConfig>) -> Result<u16> {
        let acceptor = match (self.mode, tls) {
            (SessionMode::Trusted, Some(config)) => Some(config.build_acceptor()?),
            (SessionMode::Trusted, None) => {
                return Err(ProtocolError::Configuration(
                    "secure WebSocket server requires a TLS configuration".to_string(),
                ))
            }
            (_, Some(_)) => {
                return Err(ProtocolError::Configuration(
                    "insecure WebSocket server does not take a TLS configuration".to_string(),
                ))
            }
            (_, None) => None,
        };

        let listener = bind(port).await?;
        let local_port = listener.local_addr()?.port();
        self.local_port = Some(local_port);
        info!(mode = ?self.mode, port = local_port, "WebSocket server listening");
        self.events.on_listening(local_port).await;

        let events = Arc::clone(&self.events);
        let registry = Arc::clone(&self.registry);
        let mode = self.mode;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let events = Arc::clone(&events);
                        let registry = Arc::clone(&registry);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(error) =
                                serve_connection(stream, peer, acceptor, mode, &events, &registry)
                                    .await
                            {
                                warn!(%peer, %error, "WebSocket connection failed");
                                events.on_error(&error).await;
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "failed to accept WebSocket connection");
                    }
                }
            }
        }));

        Ok(local_port)
    }

    async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.registry.close_all().await;
        debug!(mode = ?self.mode, "WebSocket server stopped");
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: Option<Arc<SslAcceptor>>,
    mode: SessionMode,
    events: &Arc<dyn ServerEvents>,
    registry: &Arc<ConnectionRegistry>,
) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let tls = tls_accept(&acceptor, stream).await?;
            handle_websocket(tls, peer, mode, events, registry).await
        }
        None => handle_websocket(stream, peer, mode, events, registry).await,
    }
}

async fn handle_websocket<S>(
    stream: S,
    peer: SocketAddr,
    mode: SessionMode,
    events: &Arc<dyn ServerEvents>,
    registry: &Arc<ConnectionRegistry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut raw_query: Option<String> = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        raw_query = request.uri().query().map(str::to_owned);
        Ok(response)
    })
    .await?;

    let params = parse_query_string(raw_query.as_deref().unwrap_or(""));
    debug!(%peer, ?mode, "WebSocket handshake complete");

    match mode {
        SessionMode::CertificateExchange => {
            let query = parse_client_query(&params)
                .filter(|query| query.os.supports_certificate_exchange());
            let Some(query) = query else {
                let _ = ws.close(None).await;
                return Err(ProtocolError::InvalidQuery(format!(
                    "no certificate-exchange client query in {raw_query:?}"
                )));
            };
            let (io, connection_id) = spawn_io(ws, registry).await;
            run_untrusted_session(io, query, Arc::clone(events)).await;
            registry.remove(connection_id).await;
        }
        SessionMode::Trusted => {
            let query = match parse_secure_client_query(&params) {
                Ok(Some(query)) => query,
                Ok(None) => {
                    let _ = ws.close(None).await;
                    return Err(ProtocolError::InvalidQuery(format!(
                        "no secure client query in {raw_query:?}"
                    )));
                }
                Err(error) => {
                    let _ = ws.close(None).await;
                    return Err(error);
                }
            };
            let (io, connection_id) = spawn_io(ws, registry).await;
            run_trusted_session(io, query, Arc::clone(events), false).await;
            registry.remove(connection_id).await;
        }
        SessionMode::Browser => {
            let Some(base) = parse_client_query(&params) else {
                let _ = ws.close(None).await;
                return Err(ProtocolError::InvalidQuery(format!(
                    "no client query in {raw_query:?}"
                )));
            };
            let query = SecureClientQuery {
                query: base,
                medium: ExchangeMedium::None,
                csr: None,
                csr_path: None,
            };
            let (io, connection_id) = spawn_io(ws, registry).await;
            run_trusted_session(io, query, Arc::clone(events), true).await;
            registry.remove(connection_id).await;
        }
    }

    Ok(())
}

/// Splits the socket into a writer task fed by an [`Outbound`] channel and
/// a reader task that forwards text frames, and registers the connection
/// so `stop` can reach it.
async fn spawn_io<S>(
    ws: WebSocketStream<S>,
    registry: &Arc<ConnectionRegistry>,
) -> (SessionIo, u64)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    let (mut sink, mut stream) = ws.split();

    tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            match command {
                Outbound::Frame(frame) => {
                    if sink.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!("dropping non-UTF-8 binary frame");
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    debug!(%error, "WebSocket read ended");
                    break;
                }
            }
        }
    });

    let connection_id = registry.insert(out_tx.clone(), reader).await;

    (
        SessionIo {
            outbound: out_tx,
            inbound: in_rx,
        },
        connection_id,
    )
}
