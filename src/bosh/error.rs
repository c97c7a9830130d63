//! Error types for the BOSH transport.

use std::time::Duration;

use thiserror::Error;

use super::condition::Condition;

/// Failure of a single HTTP exchange or of the preflight probe.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response could not be read.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// No response within the read timeout derived from `wait`.
    #[error("HTTP request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The preflight TCP connection failed.
    #[error("connection manager {host}:{port} unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    /// The HTTP client could not be built (TLS roots, proxy URL).
    #[error("HTTP client setup failed: {0}")]
    Setup(String),

    /// Request or response body could not be (de)compressed.
    #[error("{codec} compression failed: {reason}")]
    Compression { codec: &'static str, reason: String },
}

/// Malformed wire unit.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("XML parsing error: {0}")]
    Xml(String),

    #[error("expected <body/> wrapper, found <{0}>")]
    UnexpectedRoot(String),

    #[error("response contained no <body/> element")]
    Empty,

    #[error("invalid value {value:?} for attribute '{attribute}'")]
    InvalidAttribute { attribute: &'static str, value: String },
}

/// Rejected configuration, detected before any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither a BOSH host nor an XMPP domain is configured")]
    MissingTarget,

    #[error("wait must be at least one second")]
    ZeroWait,

    #[error("route must look like 'proto:host:port', got {0:?}")]
    InvalidRoute(String),

    #[error("invalid BOSH endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("RID {0} leaves no room below 2^53")]
    RidOutOfRange(u64),
}

/// Error surfaced to the owner of a [`Session`](super::Session).
#[derive(Debug, Error)]
pub enum BoshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Preflight or session-creation exchange failed during `connect`.
    #[error("failed to open BOSH session with {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The connection manager ended the session with a terminal condition,
    /// either in a terminate body or through a non-200 HTTP status.
    #[error("BOSH session terminated: {condition}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Terminated {
        condition: Condition,
        status: Option<u16>,
        uri: Option<String>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("BOSH session is not connected")]
    NotConnected,

    #[error("connection manager does not support pausing the session")]
    PauseUnsupported,
}

impl BoshError {
    /// Terminal condition, when the session was ended by the connection manager.
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            BoshError::Terminated { condition, .. } => Some(condition),
            _ => None,
        }
    }

    /// Offending HTTP status, when the failure came from a non-200 response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            BoshError::Terminated { status, .. } => *status,
            _ => None,
        }
    }

    /// Redirect target of a `see-other-uri` termination.
    pub fn redirect_uri(&self) -> Option<&str> {
        match self {
            BoshError::Terminated { uri, .. } => uri.as_deref(),
            _ => None,
        }
    }
}
