//! Raw TCP server adapter.
//!
//! Serves clients without a WebSocket stack. Frames are length-prefixed:
//! a 4-byte big-endian size followed by that many bytes of UTF-8 JSON.
//! The first frame on every connection is the setup payload, a JSON object
//! carrying the same parameters other clients put into their upgrade URL.
//! With a TLS configuration the adapter serves authenticated sessions;
//! without one it serves certificate exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::query::{parse_client_query, parse_secure_client_query, QueryParams};
use crate::server::events::ServerEvents;
use crate::transport::session::{run_trusted_session, run_untrusted_session, SessionIo};
use crate::transport::{bind, tls_accept, ConnectionRegistry, Outbound, ServerTransport, TlsConfig};

/// Frames above this size indicate a broken or hostile peer.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How long a fresh connection gets to deliver its setup payload.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpServer {
    events: Arc<dyn ServerEvents>,
    registry: Arc<ConnectionRegistry>,
    accept_task: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl TcpServer {
    pub fn new(events: Arc<dyn ServerEvents>) -> Self {
        Self {
            events,
            registry: Arc::new(ConnectionRegistry::default()),
            accept_task: None,
            local_port: None,
        }
    }
}

#[async_trait::async_trait]
impl ServerTransport for TcpServer {
    async fn start(&mut self, port: u16, tls: Option<TlsConfig>) -> Result<u16> {
        let acceptor = tls.map(|config| config.build_acceptor()).transpose()?;

        let listener = bind(port).await?;
        let local_port = listener.local_addr()?.port();
        self.local_port = Some(local_port);
        info!(
            port = local_port,
            secure = acceptor.is_some(),
            "TCP server listening"
        );
        self.events.on_listening(local_port).await;

        let events = Arc::clone(&self.events);
        let registry = Arc::clone(&self.registry);

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let events = Arc::clone(&events);
                        let registry = Arc::clone(&registry);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let result = match &acceptor {
                                Some(acceptor) => match tls_accept(acceptor, stream).await {
                                    Ok(tls) => {
                                        handle_stream(tls, peer, true, &events, &registry).await
                                    }
                                    Err(error) => Err(error),
                                },
                                None => {
                                    handle_stream(stream, peer, false, &events, &registry).await
                                }
                            };
                            if let Err(error) = result {
                                warn!(%peer, %error, "TCP connection failed");
                                events.on_error(&error).await;
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "failed to accept TCP connection");
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
        debug!("TCP server stopped");
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }
}

async fn handle_stream<S>(
    stream: S,
    peer: SocketAddr,
    trusted: bool,
    events: &Arc<dyn ServerEvents>,
    registry: &Arc<ConnectionRegistry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);

    let setup = tokio::time::timeout(SETUP_TIMEOUT, read_frame(&mut read_half))
        .await
        .map_err(|_| {
            ProtocolError::Timeout("no setup payload within the handshake deadline".to_string())
        })??;
    let Some(setup) = setup else {
        debug!(%peer, "connection closed before setup payload");
        return Ok(());
    };

    let params: QueryParams = serde_json::from_str(&setup)
        .map_err(|_| ProtocolError::InvalidQuery("setup payload is not a JSON object".to_string()))?;
    debug!(%peer, trusted, "TCP setup payload received");

    if trusted {
        let Some(query) = parse_secure_client_query(&params)? else {
            return Err(ProtocolError::InvalidQuery(
                "setup payload is not a secure client query".to_string(),
            ));
        };
        let (io, connection_id) = spawn_io(read_half, write_half, registry).await;
        run_trusted_session(io, query, Arc::clone(events), false).await;
        registry.remove(connection_id).await;
    } else {
        let query = parse_client_query(&params)
            .filter(|query| query.os.supports_certificate_exchange())
            .ok_or_else(|| {
                ProtocolError::InvalidQuery(
                    "setup payload is not a certificate-exchange client query".to_string(),
                )
            })?;
        let (io, connection_id) = spawn_io(read_half, write_half, registry).await;
        run_untrusted_session(io, query, Arc::clone(events)).await;
        registry.remove(connection_id).await;
    }

    Ok(())
}

async fn spawn_io<R, W>(
    mut read_half: R,
    mut write_half: W,
    registry: &Arc<ConnectionRegistry>,
) -> (SessionIo, u64)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            match command {
                Outbound::Frame(frame) => {
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(%error, "TCP read ended");
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

/// Reads one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::InvalidMessage(format!(
            "frame of {length} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidMessage("frame is not valid UTF-8".to_string()))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> Result<()> {
    let payload = frame.as_bytes();
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
