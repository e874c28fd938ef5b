//! Callback seam between the connectivity core and the application.
//!
//! The transports report everything that happens on their sockets through
//! [`ServerEvents`]; the application implements it once and shares one
//! instance across all server adapters. Every callback has a no-op default
//! except [`ServerEvents::on_process_csr`], which the core cannot answer
//! on its own because the certificate authority belongs to the app.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::certs::ExchangeResponse;
use crate::error::{ProtocolError, Result};
use crate::query::{ClientQuery, DeviceOs, SecureClientQuery};
use crate::transport::ClientConnection;

/// Whether a device is physical hardware or an emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Physical,
    Emulator,
    Dummy,
}

/// A device known to the bridge, as surfaced to device trackers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub os: DeviceOs,
    pub title: String,
    pub device_type: DeviceKind,
    pub serial: String,
}

/// An authenticated client, identified across reconnects by a composite id
/// of app, OS, device title and device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescription {
    pub id: String,
    pub query: ClientQuery,
    pub sdk_version: u32,
}

impl ClientDescription {
    pub fn from_query(query: &SecureClientQuery) -> Self {
        let base = &query.query;
        Self {
            id: format!(
                "{}#{}#{}#{}",
                base.app, base.os, base.device, base.device_id
            ),
            query: base.clone(),
            sdk_version: base.sdk_version.unwrap_or(0),
        }
    }
}

/// Server lifecycle and connection callbacks.
#[async_trait]
pub trait ServerEvents: Send + Sync + 'static {
    /// Server bound its port and accepts connections.
    async fn on_listening(&self, _port: u16) {}

    /// An untrusted client opened a connection with a plausible query.
    async fn on_connection_attempt(&self, _query: &ClientQuery) {}

    /// An authenticated client passed the TLS handshake and query parsing.
    async fn on_secure_connection_attempt(&self, _query: &SecureClientQuery) {}

    /// An authenticated connection is ready for traffic. The connection
    /// handle stays valid until `on_connection_closed` fires for the same
    /// client id.
    async fn on_connection_created(
        &self,
        _client: &ClientDescription,
        _connection: ClientConnection,
    ) {
    }

    /// The connection for the given client id went away.
    async fn on_connection_closed(&self, _id: &str) {}

    /// A client sent a frame that is not a response to a pending request.
    /// `payload` is the raw JSON text.
    async fn on_client_message(&self, _id: &str, _payload: &str) {}

    /// A connection failed in a way worth surfacing: unparsable queries,
    /// handshake failures, refused certificate signings. Malformed frames
    /// on established connections are dropped without reaching this.
    async fn on_error(&self, _error: &ProtocolError) {}

    /// Sign the CSR of a connecting device and deploy the result according
    /// to `medium`. `destination` is the device-sandbox path used by
    /// filesystem deployment. Typically forwarded to a
    /// [`CertificateExchanger`](crate::certs::CertificateExchanger).
    async fn on_process_csr(
        &self,
        query: &ClientQuery,
        csr: &str,
        destination: &str,
        medium: crate::query::ExchangeMedium,
    ) -> Result<ExchangeResponse>;
}
