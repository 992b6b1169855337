//! Client and service configuration.
//!
//! Keypair material for the transport is passed explicitly through [`TlsConfig`];
//! nothing is read from global state except the server address fallback in
//! [`ClientConfig::resolve_uri`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::messages::ProtocolVersion;

/// Environment variable holding the server address, or a path to a file containing it.
pub const SERVER_URI_ENV: &str = "PAIRING_SERVER_URI";
pub const DEFAULT_SERVER_URI: &str = "127.0.0.1:2601";

const DEFAULT_PAIRING_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10 * 1000;
const DEFAULT_SESSION_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_FRAME_BUFFER: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pem: {0}")]
    Pem(String),
    #[error("no certificate found in pem input")]
    MissingCertificate,
    #[error("no private key found in pem input")]
    MissingKey,
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid server uri: {0}")]
    InvalidUri(String),
}

/// PEM encoded keypair and CA used to identify the caller on the transport.
///
/// New devices use an anonymous keypair that is not bound to any node. The material
/// is validated on construction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTlsConfig", into = "RawTlsConfig")]
pub struct TlsConfig {
    cert_pem: String,
    key_pem: String,
    ca_pem: String,
    cert_chain: Vec<Vec<u8>>,
    key_der: Vec<u8>,
    ca_der: Vec<Vec<u8>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct RawTlsConfig {
    cert_pem: String,
    key_pem: String,
    ca_pem: String,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl TryFrom<RawTlsConfig> for TlsConfig {
    type Error = ConfigError;

    fn try_from(raw: RawTlsConfig) -> Result<Self, Self::Error> {
        TlsConfig::new(&raw.cert_pem, &raw.key_pem, &raw.ca_pem)
    }
}

impl From<TlsConfig> for RawTlsConfig {
    fn from(tls: TlsConfig) -> Self {
        RawTlsConfig {
            cert_pem: tls.cert_pem,
            key_pem: tls.key_pem,
            ca_pem: tls.ca_pem,
        }
    }
}

fn parse_certs(pem: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::MissingCertificate);
    }
    Ok(certs)
}

impl TlsConfig {
    pub fn new(cert_pem: &str, key_pem: &str, ca_pem: &str) -> Result<Self, ConfigError> {
        let cert_chain = parse_certs(cert_pem)?;
        let ca_der = parse_certs(ca_pem)?;
        let mut reader = key_pem.as_bytes();
        let key_der = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ConfigError::Pem(e.to_string()))?
            .ok_or(ConfigError::MissingKey)?
            .secret_der()
            .to_vec();
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            ca_pem: ca_pem.to_string(),
            cert_chain,
            key_der,
            ca_der,
        })
    }

    pub fn from_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        ca: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))
        };
        Self::new(&read(cert.as_ref())?, &read(key.as_ref())?, &read(ca.as_ref())?)
    }

    /// DER certificates, leaf first.
    pub fn cert_chain(&self) -> &[Vec<u8>] {
        &self.cert_chain
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn ca_certs(&self) -> &[Vec<u8>] {
        &self.ca_der
    }

    /// Hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> String {
        let leaf = self.cert_chain.first().map(Vec::as_slice).unwrap_or_default();
        Sha256::digest(leaf)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Settings shared by the new-device and attestation clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub tls: TlsConfig,
    /// Overrides the server address.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Upper bound on the wait for the terminal frame.
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,
    /// Upper bound on each request/response call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_pairing_timeout_ms() -> u64 {
    DEFAULT_PAIRING_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl ClientConfig {
    pub fn new(tls: TlsConfig) -> Self {
        Self {
            tls,
            uri: None,
            protocol_version: ProtocolVersion::default(),
            pairing_timeout_ms: DEFAULT_PAIRING_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolves the server address: explicit override, then [`SERVER_URI_ENV`]
    /// (a value or a path to a file holding it), then [`DEFAULT_SERVER_URI`].
    pub fn resolve_uri(&self) -> Result<String, ConfigError> {
        let raw = match &self.uri {
            Some(uri) => uri.clone(),
            None => match std::env::var(SERVER_URI_ENV) {
                Ok(var) if Path::new(&var).is_file() => std::fs::read_to_string(&var)
                    .map_err(|e| {
                        ConfigError::Io(format!("{var} (from {SERVER_URI_ENV}): {e}"))
                    })?,
                Ok(var) => var,
                Err(_) => DEFAULT_SERVER_URI.to_string(),
            },
        };
        normalize_uri(&raw)
    }
}

/// Strips an optional `tcp://` scheme and checks for a `host:port` shape.
pub fn normalize_uri(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let addr = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(ConfigError::InvalidUri(raw.to_string())),
    }
}

/// Server-side session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Sessions expire after this long whether or not they were resolved.
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<ProtocolVersion>,
    /// Capacity of each session's frame channel.
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

fn default_session_ttl_ms() -> u64 {
    DEFAULT_SESSION_TTL_MS
}

fn default_supported_versions() -> Vec<ProtocolVersion> {
    vec![ProtocolVersion::V1, ProtocolVersion::V2]
}

fn default_frame_buffer() -> usize {
    DEFAULT_FRAME_BUFFER
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            supported_versions: default_supported_versions(),
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

impl ServiceConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
}
