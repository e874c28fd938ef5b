//! Local certificate authority.
//!
//! The desktop server owns a self-signed CA that anchors all device trust.
//! On first start the CA key pair and a server certificate (CN `localhost`)
//! are generated and persisted; later starts reload them from disk. Device
//! apps submit certificate signing requests which [`CertificateAuthority::sign_csr`]
//! turns into client certificates, after validating the request signature
//! and the app name embedded in its common name.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509, X509NameBuilder, X509Req};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};
use crate::transport::TlsConfig;

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";
const SERVER_KEY_FILE: &str = "server.key";
const SERVER_CERT_FILE: &str = "server.crt";

const CA_VALIDITY_DAYS: u32 = 3650;
const SERVER_VALIDITY_DAYS: u32 = 825;
const CLIENT_VALIDITY_DAYS: u32 = 365;

const RSA_KEY_BITS: u32 = 2048;

/// CA state loaded into memory, plus the server's own TLS identity.
pub struct CertificateAuthority {
    dir: PathBuf,
    ca_cert: X509,
    ca_key: PKey<Private>,
    server_cert: X509,
    server_key: PKey<Private>,
    // In-memory serial counter; signing is otherwise stateless, so this is
    // the only mutable state shared between concurrent signings.
    next_serial: AtomicU32,
}

impl CertificateAuthority {
    /// Opens the CA directory, generating CA and server credentials on
    /// first use.
    ///
    /// # Arguments
    /// * `dir` - Directory holding `ca.key`, `ca.crt`, `server.key`, `server.crt`
    // TODO: regenerate persisted material when it is close to expiry instead
    // of letting TLS handshakes start failing after ten years.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (ca_cert, ca_key) = match Self::load_pair(&dir, CA_CERT_FILE, CA_KEY_FILE) {
            Some(pair) => pair,
            None => {
                info!("generating certificate authority in {}", dir.display());
                let (cert, key) = generate_ca()?;
                Self::store_pair(&dir, CA_CERT_FILE, CA_KEY_FILE, &cert, &key)?;
                (cert, key)
            }
        };

        let (server_cert, server_key) = match Self::load_pair(&dir, SERVER_CERT_FILE, SERVER_KEY_FILE)
        {
            Some(pair) => pair,
            None => {
                debug!("generating server certificate");
                let (cert, key) = generate_server_certificate(&ca_cert, &ca_key)?;
                Self::store_pair(&dir, SERVER_CERT_FILE, SERVER_KEY_FILE, &cert, &key)?;
                (cert, key)
            }
        };

        Ok(Self {
            dir,
            ca_cert,
            ca_key,
            server_cert,
            server_key,
            next_serial: AtomicU32::new(2),
        })
    }

    fn load_pair(dir: &Path, cert_file: &str, key_file: &str) -> Option<(X509, PKey<Private>)> {
        let cert_pem = fs::read(dir.join(cert_file)).ok()?;
        let key_pem = fs::read(dir.join(key_file)).ok()?;
        let cert = X509::from_pem(&cert_pem).ok()?;
        let key = PKey::private_key_from_pem(&key_pem).ok()?;
        Some((cert, key))
    }

    fn store_pair(
        dir: &Path,
        cert_file: &str,
        key_file: &str,
        cert: &X509,
        key: &PKey<Private>,
    ) -> Result<()> {
        fs::write(dir.join(cert_file), cert.to_pem()?)?;
        fs::write(dir.join(key_file), key.private_key_to_pem_pkcs8()?)?;
        Ok(())
    }

    /// Directory this authority persists its material under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Signs a device certificate signing request and returns the client
    /// certificate as PEM.
    ///
    /// The CSR is sanitized (stray carriage returns stripped, surrounding
    /// whitespace trimmed), its self-signature is verified and its common
    /// name is checked against the allowed app-name alphabet before the CA
    /// key touches it.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<String> {
        let csr_pem = sanitize_csr(csr_pem);
        if csr_pem.is_empty() {
            return Err(ProtocolError::CertificateExchange(
                "received an empty CSR".to_string(),
            ));
        }

        let request = X509Req::from_pem(csr_pem.as_bytes())?;
        let public_key = request.public_key()?;
        if !request.verify(&public_key)? {
            return Err(ProtocolError::CertificateExchange(
                "CSR signature does not verify against its own public key".to_string(),
            ));
        }

        let app_name = common_name(&request)?;
        if !is_allowed_app_name(&app_name) {
            return Err(ProtocolError::CertificateExchange(format!(
                "disallowed app name in CSR: {app_name:?}"
            )));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        debug!(app = %app_name, serial, "signing device certificate");

        let serial_number = BigNum::from_u32(serial)?.to_asn1_integer()?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CLIENT_VALIDITY_DAYS)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(request.subject_name())?;
        builder.set_issuer_name(self.ca_cert.subject_name())?;
        builder.set_pubkey(&public_key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.sign(&self.ca_key, MessageDigest::sha256())?;

        pem_string(builder.build().to_pem()?)
    }

    /// The CA certificate as PEM, handed to devices so they can pin it.
    pub fn ca_certificate_pem(&self) -> Result<String> {
        pem_string(self.ca_cert.to_pem()?)
    }

    /// SHA-256 fingerprint of the CA certificate in colon-separated form,
    /// e.g. `AB:CD:...`.
    pub fn fingerprint(&self) -> Result<String> {
        let der = self.ca_cert.to_der()?;
        let digest = Sha256::digest(&der);
        Ok(digest
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// TLS material for the secure server transports: the server identity
    /// plus the CA that client certificates are verified against.
    pub fn tls_config(&self) -> Result<TlsConfig> {
        Ok(TlsConfig {
            cert_pem: pem_string(self.server_cert.to_pem()?)?,
            key_pem: pem_string(self.server_key.private_key_to_pem_pkcs8()?)?,
            ca_pem: self.ca_certificate_pem()?,
        })
    }
}

/// Generates a PEM certificate signing request and matching private key for
/// the given app name. Companion SDKs embed this on the device side; tests
/// use it to drive the exchange end to end.
pub fn generate_csr(common_name: &str) -> Result<(String, String)> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509Req::builder()?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.sign(&key, MessageDigest::sha256())?;

    let csr = pem_string(builder.build().to_pem()?)?;
    let key_pem = pem_string(key.private_key_to_pem_pkcs8()?)?;
    Ok((csr, key_pem))
}

fn generate_ca() -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", "Devlink")?;
    name.append_entry_by_text("CN", "Devlink CA")?;
    let name = name.build();

    let serial_number = random_serial()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CA_VALIDITY_DAYS)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial_number)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build(), key))
}

fn generate_server_certificate(ca_cert: &X509, ca_key: &PKey<Private>) -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", "Devlink")?;
    name.append_entry_by_text("CN", "localhost")?;
    let name = name.build();

    let serial_number = random_serial()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(SERVER_VALIDITY_DAYS)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial_number)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
    builder.sign(ca_key, MessageDigest::sha256())?;

    Ok((builder.build(), key))
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn common_name(request: &X509Req) -> Result<String> {
    for entry in request.subject_name().entries() {
        if entry.object().nid() == Nid::COMMONNAME {
            return Ok(entry.data().as_utf8()?.to_string());
        }
    }
    Err(ProtocolError::CertificateExchange(
        "CSR subject has no common name".to_string(),
    ))
}

/// App names may only use word characters, dots and dashes. Anything else
/// would end up inside filesystem paths derived from the name.
fn is_allowed_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Strips carriage returns and surrounding whitespace from a CSR as
/// received off the wire.
fn sanitize_csr(csr: &str) -> String {
    csr.replace('\r', "").trim().to_string()
}

fn pem_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::CertificateExchange("PEM output is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_and_reloads_material() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        for file in [CA_KEY_FILE, CA_CERT_FILE, SERVER_KEY_FILE, SERVER_CERT_FILE] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }

        let fingerprint = authority.fingerprint().unwrap();
        assert!(fingerprint.contains(':'));

        // A second open must load the same CA instead of minting a new one.
        let reopened = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(reopened.fingerprint().unwrap(), fingerprint);
    }

    #[test]
    fn test_sign_csr_issues_client_certificate() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        let (csr, _key) = generate_csr("deathstar").unwrap();
        let cert_pem = authority.sign_csr(&csr).unwrap();

        let cert = X509::from_pem(cert_pem.as_bytes()).unwrap();
        let subject = common_name_of(cert.subject_name());
        let issuer = common_name_of(cert.issuer_name());
        assert_eq!(subject.as_deref(), Some("deathstar"));
        assert_eq!(issuer.as_deref(), Some("Devlink CA"));
    }

    #[test]
    fn test_sign_csr_tolerates_wire_whitespace() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        let (csr, _key) = generate_csr("app-1.debug").unwrap();
        let mangled = format!("  {}  \n", csr.replace('\n', "\r\n"));
        assert!(authority.sign_csr(&mangled).is_ok());
    }

    #[test]
    fn test_sign_csr_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        assert!(matches!(
            authority.sign_csr("   \r\n  "),
            Err(ProtocolError::CertificateExchange(_))
        ));
        assert!(authority.sign_csr("not a csr at all").is_err());
    }

    #[test]
    fn test_sign_csr_rejects_disallowed_app_name() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        let (csr, _key) = generate_csr("evil app; rm -rf").unwrap();
        assert!(matches!(
            authority.sign_csr(&csr),
            Err(ProtocolError::CertificateExchange(_))
        ));
    }

    #[test]
    fn test_tls_config_contains_pem_material() {
        let dir = TempDir::new().unwrap();
        let authority = CertificateAuthority::open(dir.path()).unwrap();

        let tls = authority.tls_config().unwrap();
        assert!(tls.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(tls.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(tls.ca_pem.contains("BEGIN CERTIFICATE"));
    }

    fn common_name_of(name: &openssl::x509::X509NameRef) -> Option<String> {
        name.entries()
            .find(|entry| entry.object().nid() == Nid::COMMONNAME)
            .and_then(|entry| entry.data().as_utf8().ok().map(|s| s.to_string()))
    }
}
