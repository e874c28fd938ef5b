//! Client query parsing.
//!
//! Every inbound connection announces itself with a set of key/value
//! parameters, either as the query string of a WebSocket upgrade URL or as
//! the first JSON frame on a raw TCP connection. This module turns those
//! parameters into a [`ClientQuery`] (untrusted connections) or a
//! [`SecureClientQuery`] (authenticated connections carrying certificate
//! exchange parameters).
//!
//! Parsing is deliberately forgiving: an incomplete query yields `None`
//! rather than an error, because half-configured SDKs retry with corrected
//! parameters and must not tear the server down. The single hard failure
//! is an out-of-range `medium` value, which indicates a client newer than
//! this server.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Untyped connection parameters, as decoded from a URL query string or a
/// TCP setup payload.
pub type QueryParams = serde_json::Map<String, Value>;

/// Decodes a URL query string into [`QueryParams`].
///
/// Uses form-urlencoded semantics, so percent escapes and `+` are decoded.
/// Repeated keys keep the last value.
pub fn parse_query_string(raw: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        params.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    params
}

/// Operating system the connecting app runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceOs {
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Windows,
    #[serde(rename = "MacOS")]
    MacOs,
    Metro,
    #[serde(rename = "JSWebApp")]
    JsWebApp,
}

impl DeviceOs {
    /// Parses the OS identifier used on the wire. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Android" => Some(DeviceOs::Android),
            "iOS" => Some(DeviceOs::Ios),
            "Windows" => Some(DeviceOs::Windows),
            "MacOS" => Some(DeviceOs::MacOs),
            "Metro" => Some(DeviceOs::Metro),
            "JSWebApp" => Some(DeviceOs::JsWebApp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceOs::Android => "Android",
            DeviceOs::Ios => "iOS",
            DeviceOs::Windows => "Windows",
            DeviceOs::MacOs => "MacOS",
            DeviceOs::Metro => "Metro",
            DeviceOs::JsWebApp => "JSWebApp",
        }
    }

    /// Whether this OS may start a certificate exchange. Browser apps get
    /// their trust from the page origin instead and are excluded.
    pub fn supports_certificate_exchange(&self) -> bool {
        !matches!(self, DeviceOs::JsWebApp)
    }
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a freshly signed client certificate is delivered back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMedium {
    /// Server writes the certificate into the device's sandbox via a shared
    /// filesystem path. The historical default.
    FsAccess = 1,
    /// Certificate is returned in-band inside the signing response.
    Www = 2,
    /// No certificate deployment happens (already-trusted connections).
    None = 3,
}

impl ExchangeMedium {
    /// Converts the numeric wire value. Out-of-range values are a hard
    /// error: they mean the client speaks a newer protocol revision.
    pub fn from_number(value: u64) -> Result<Self> {
        match value {
            1 => Ok(ExchangeMedium::FsAccess),
            2 => Ok(ExchangeMedium::Www),
            3 => Ok(ExchangeMedium::None),
            other => Err(ProtocolError::UnknownMedium(other)),
        }
    }

    pub fn as_number(&self) -> u64 {
        *self as u64
    }
}

/// Identity of a connecting app, parsed from connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQuery {
    /// Stable device identifier (serial number or emulator id)
    pub device_id: String,
    /// Human readable device title
    pub device: String,
    /// Name of the app that opened the connection
    pub app: String,
    /// Operating system of the device
    pub os: DeviceOs,
    /// Version of the client SDK, if the client reports one
    pub sdk_version: Option<u32>,
}

/// A [`ClientQuery`] extended with certificate exchange parameters, used by
/// authenticated connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureClientQuery {
    pub query: ClientQuery,
    /// Delivery medium for signed certificates
    pub medium: ExchangeMedium,
    /// Decoded PEM certificate signing request, if the client sent one
    pub csr: Option<String>,
    /// Device-local path the client stores its CSR under
    pub csr_path: Option<String>,
}

fn get_string(params: &QueryParams, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

/// Numeric parameters arrive as JSON numbers from TCP setup payloads and as
/// strings from URL query strings; both spellings are accepted.
fn get_number(params: &QueryParams, key: &str) -> Option<u64> {
    match params.get(key) {
        Some(Value::Number(value)) => value.as_u64(),
        Some(Value::String(value)) => value.parse().ok(),
        _ => None,
    }
}

/// Extracts a [`ClientQuery`] from connection parameters.
///
/// Returns `None` when any required field is missing, empty or carries an
/// unknown OS. This never errors; incomplete handshakes are dropped quietly
/// by the caller.
pub fn parse_client_query(params: &QueryParams) -> Option<ClientQuery> {
    let device_id = get_string(params, "device_id")?;
    let device = get_string(params, "device")?;
    let app = get_string(params, "app")?;
    let os = DeviceOs::parse(&get_string(params, "os")?)?;
    let sdk_version =
        get_number(params, "sdk_version").and_then(|version| u32::try_from(version).ok());

    Some(ClientQuery {
        device_id,
        device,
        app,
        os,
        sdk_version,
    })
}

/// Extracts a [`SecureClientQuery`] from connection parameters.
///
/// Builds on [`parse_client_query`] and additionally requires an OS that
/// participates in certificate exchange. The `csr` parameter is transported
/// base64-encoded and is decoded here. A missing `medium` defaults to
/// [`ExchangeMedium::FsAccess`]; an out-of-range one is the only error this
/// function produces.
pub fn parse_secure_client_query(params: &QueryParams) -> Result<Option<SecureClientQuery>> {
    let Some(query) = parse_client_query(params) else {
        return Ok(None);
    };
    if !query.os.supports_certificate_exchange() {
        return Ok(None);
    }

    let medium = match get_number(params, "medium") {
        Some(value) => ExchangeMedium::from_number(value)?,
        None => ExchangeMedium::FsAccess,
    };

    let csr = match get_string(params, "csr") {
        Some(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| ProtocolError::InvalidQuery(format!("csr is not valid base64: {e}")))?;
            let pem = String::from_utf8(bytes)
                .map_err(|_| ProtocolError::InvalidQuery("csr is not valid UTF-8".to_string()))?;
            Some(pem)
        }
        None => None,
    };

    Ok(Some(SecureClientQuery {
        query,
        medium,
        csr,
        csr_path: get_string(params, "csr_path"),
    }))
}
