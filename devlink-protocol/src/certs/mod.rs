//! Certificate authority and device certificate exchange.

pub mod authority;
pub mod exchange;

pub use authority::{generate_csr, CertificateAuthority};
pub use exchange::{
    CertificateBundle, CertificateExchanger, ExchangeResponse, ExchangeState, UntrustedMessage,
    DEVICE_CA_FILE, DEVICE_CERT_FILE,
};
