//! Per-connection state machine, shared by all transports.
//!
//! Transports reduce their sockets to two channels: an inbound stream of
//! text frames and an outbound sink of [`Outbound`] commands. On top of
//! that, [`run_untrusted_session`] drives the certificate exchange flow and
//! [`run_trusted_session`] drives authenticated app connections.
//!
//! One contract applies to both: a frame that is not valid JSON is logged
//! and dropped. It never raises an error callback and never terminates the
//! connection, because a single garbled frame from a misbehaving SDK must
//! not take down an otherwise healthy session.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::certs::{ExchangeState, UntrustedMessage};
use crate::error::{ProtocolError, Result};
use crate::query::{ClientQuery, ExchangeMedium, SecureClientQuery};
use crate::server::events::{ClientDescription, ServerEvents};
use crate::transport::Outbound;

/// Channel pair a transport hands to a session. The transport's reader
/// task feeds `inbound` and drops it when the socket closes; its writer
/// task consumes whatever is sent through `outbound`.
pub(crate) struct SessionIo {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

type PendingResponses = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Handle to an authenticated client connection, given to the application
/// through `ServerEvents::on_connection_created`. Cloning is cheap; all
/// clones refer to the same socket.
#[derive(Clone)]
pub struct ClientConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingResponses,
}

impl ClientConnection {
    fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends a fire-and-forget message to the client.
    pub fn send(&self, data: &Value) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(data.to_string()))
            .map_err(|_| ProtocolError::Disconnected("connection is closed".to_string()))
    }

    /// Sends a message carrying a numeric `id` field and resolves once the
    /// client answers with a frame echoing that id. A `success` field in
    /// the answer resolves the future, an `error` field rejects it.
    pub async fn send_expect_response(&self, data: &Value) -> Result<Value> {
        let id = data
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProtocolError::InvalidMessage(
                    "messages expecting a response need a numeric 'id' field".to_string(),
                )
            })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(error) = self.send(data) {
            self.pending.lock().await.remove(&id);
            return Err(error);
        }

        rx.await
            .map_err(|_| ProtocolError::Disconnected("connection closed while waiting".to_string()))?
    }

    /// Asks the transport to close the connection.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Routes an inbound frame that carries an `id` to its waiting caller.
    /// Responses nobody is waiting for are logged and dropped.
    async fn resolve_response(&self, id: u64, data: Value) {
        let Some(tx) = self.pending.lock().await.remove(&id) else {
            warn!(id, "dropping response with no matching request");
            return;
        };
        let result = if data.get("error").is_some() {
            Err(ProtocolError::ExecFailed(data["error"].clone()))
        } else {
            Ok(data)
        };
        let _ = tx.send(result);
    }

    /// Rejects every in-flight request, used when the socket goes away.
    async fn fail_pending(&self, reason: &str) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(ProtocolError::Disconnected(reason.to_string())));
        }
    }
}

/// Drives a certificate-exchange connection until the peer disconnects or
/// the exchange concludes.
pub(crate) async fn run_untrusted_session(
    mut io: SessionIo,
    query: ClientQuery,
    events: Arc<dyn ServerEvents>,
) {
    events.on_connection_attempt(&query).await;
    let mut state = ExchangeState::AwaitingCsr;

    while let Some(raw) = io.inbound.recv().await {
        let message: UntrustedMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(device_id = %query.device_id, %error, "dropping unparsable frame");
                continue;
            }
        };

        match message {
            UntrustedMessage::SignCertificate {
                csr,
                destination,
                medium,
            } => {
                if state != ExchangeState::AwaitingCsr {
                    warn!(?state, "ignoring repeated signCertificate request");
                    continue;
                }

                let medium = match medium.map(ExchangeMedium::from_number).transpose() {
                    Ok(medium) => medium.unwrap_or(ExchangeMedium::FsAccess),
                    Err(error) => {
                        state = ExchangeState::Rejected;
                        events.on_error(&error).await;
                        let _ = io.outbound.send(Outbound::Close);
                        break;
                    }
                };

                state = ExchangeState::Signing;
                debug!(device_id = %query.device_id, ?state, "processing CSR");

                match events.on_process_csr(&query, &csr, &destination, medium).await {
                    Ok(response) => {
                        state = ExchangeState::Responded;
                        match serde_json::to_string(&response) {
                            Ok(frame) => {
                                let _ = io.outbound.send(Outbound::Frame(frame));
                            }
                            Err(error) => {
                                warn!(%error, "failed to serialize exchange response");
                            }
                        }
                    }
                    Err(error) => {
                        state = ExchangeState::Rejected;
                        warn!(device_id = %query.device_id, %error, "certificate signing failed");
                        events.on_error(&error).await;
                        let _ = io.outbound.send(Outbound::Close);
                        break;
                    }
                }
            }
            UntrustedMessage::SignCertificateAck {} => {
                debug!(device_id = %query.device_id, "client confirmed certificate install");
            }
        }
    }

    debug!(device_id = %query.device_id, ?state, "untrusted connection ended");
}

/// Drives an authenticated connection: announces it, relays messages to
/// the application and correlates request/response pairs.
///
/// `announce_insecure` replays the plain connection-attempt callback first;
/// browser connections skip the certificate exchange but observers still
/// expect both announcements.
pub(crate) async fn run_trusted_session(
    mut io: SessionIo,
    query: SecureClientQuery,
    events: Arc<dyn ServerEvents>,
    announce_insecure: bool,
) {
    if announce_insecure {
        events.on_connection_attempt(&query.query).await;
    }
    events.on_secure_connection_attempt(&query).await;

    let client = ClientDescription::from_query(&query);
    let connection = ClientConnection::new(io.outbound.clone());
    events
        .on_connection_created(&client, connection.clone())
        .await;

    while let Some(raw) = io.inbound.recv().await {
        let data: Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(error) => {
                warn!(client = %client.id, %error, "dropping unparsable frame");
                continue;
            }
        };

        match data.get("id").and_then(Value::as_u64) {
            Some(id) => connection.resolve_response(id, data).await,
            None => events.on_client_message(&client.id, &raw).await,
        }
    }

    connection.fail_pending("client disconnected").await;
    events.on_connection_closed(&client.id).await;
    debug!(client = %client.id, "trusted connection ended");
}
