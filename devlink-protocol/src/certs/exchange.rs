//! Certificate exchange flow.
//!
//! Untrusted connections exist for exactly one purpose: submitting a
//! certificate signing request and receiving a signed client certificate
//! back. [`UntrustedMessage`] models the frames such a connection may send,
//! [`ExchangeState`] tracks where in the flow a connection is, and
//! [`CertificateExchanger`] implements the delivery mediums on top of a
//! [`CertificateAuthority`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::certs::authority::CertificateAuthority;
use crate::error::Result;
use crate::query::{ClientQuery, ExchangeMedium};

/// Filename of the CA certificate deployed into a device sandbox.
pub const DEVICE_CA_FILE: &str = "devlink-ca.crt";
/// Filename of the signed client certificate deployed into a device sandbox.
pub const DEVICE_CERT_FILE: &str = "device.crt";

/// Lifecycle of a single untrusted connection.
///
/// ```text
/// AwaitingQuery -> AwaitingCsr -> Signing -> Responded
///                                        \-> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Socket is open, connection parameters not yet parsed
    AwaitingQuery,
    /// Query accepted, waiting for a `signCertificate` frame
    AwaitingCsr,
    /// CSR handed off to the certificate authority
    Signing,
    /// Signed response written back to the client
    Responded,
    /// Signing failed; the connection is being torn down
    Rejected,
}

/// Frames an untrusted connection may send. Anything with an unknown
/// `method` fails to parse and is dropped by the session loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method")]
pub enum UntrustedMessage {
    /// Request to sign the embedded CSR and deploy the certificate to
    /// `destination` via the given medium.
    #[serde(rename = "signCertificate")]
    SignCertificate {
        csr: String,
        destination: String,
        medium: Option<u64>,
    },
    /// Client acknowledges that it received and installed the certificate.
    #[serde(rename = "signCertificateAck")]
    SignCertificateAck {},
}

/// Certificates returned in-band when the exchange medium is
/// [`ExchangeMedium::Www`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateBundle {
    #[serde(rename = "caCert")]
    pub ca_cert: String,
    #[serde(rename = "clientCert")]
    pub client_cert: String,
}

/// Response frame sent back for a `signCertificate` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificateBundle>,
}

/// Implements the exchange mediums on top of a local CA.
///
/// Applications plug this into their `ServerEvents::on_process_csr`
/// implementation; the transports never touch the CA directly.
#[derive(Clone)]
pub struct CertificateExchanger {
    authority: Arc<CertificateAuthority>,
}

impl CertificateExchanger {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }

    /// Signs `csr` and deploys the result according to `medium`.
    ///
    /// * [`ExchangeMedium::FsAccess`] writes the CA and client certificates
    ///   into the `destination` directory inside the device sandbox.
    /// * [`ExchangeMedium::Www`] returns both certificates in the response
    ///   so the client can install them itself.
    /// * [`ExchangeMedium::None`] skips deployment entirely.
    pub async fn process(
        &self,
        query: &ClientQuery,
        csr: &str,
        destination: &str,
        medium: ExchangeMedium,
    ) -> Result<ExchangeResponse> {
        if medium == ExchangeMedium::None {
            debug!(device_id = %query.device_id, "certificate deployment skipped");
            return Ok(ExchangeResponse {
                device_id: query.device_id.clone(),
                certificates: None,
            });
        }

        let client_cert = self.authority.sign_csr(csr)?;
        let ca_cert = self.authority.ca_certificate_pem()?;
        info!(
            device_id = %query.device_id,
            app = %query.app,
            medium = medium.as_number(),
            "signed device certificate"
        );

        let certificates = if medium == ExchangeMedium::Www {
            Some(CertificateBundle {
                ca_cert,
                client_cert,
            })
        } else {
            self.deploy_to_filesystem(destination, &ca_cert, &client_cert)
                .await?;
            None
        };

        Ok(ExchangeResponse {
            device_id: query.device_id.clone(),
            certificates,
        })
    }

    async fn deploy_to_filesystem(
        &self,
        destination: &str,
        ca_cert: &str,
        client_cert: &str,
    ) -> Result<()> {
        let destination = Path::new(destination);
        tokio::fs::create_dir_all(destination).await?;
        tokio::fs::write(destination.join(DEVICE_CA_FILE), ca_cert).await?;
        tokio::fs::write(destination.join(DEVICE_CERT_FILE), client_cert).await?;
        debug!("deployed certificates to {}", destination.display());
        Ok(())
    }
}
