//! Terminal binding conditions (XEP-0124 §17).
//!
//! A connection manager reports a fatal problem either with a
//! `type='terminate'` body carrying one of these conditions or, for legacy
//! managers, with a bare HTTP error status. Both end up as a [`Condition`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition attached to a terminate (or error) body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    BadRequest,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    ItemNotFound,
    OtherRequest,
    PolicyViolation,
    RemoteConnectionFailed,
    /// Error of the embedded XMPP stream; the BOSH transport itself is fine.
    RemoteStreamError,
    SeeOtherUri,
    SystemShutdown,
    UndefinedCondition,
    /// Anything the vocabulary does not know, kept verbatim.
    Other(String),
}

impl Condition {
    /// Parse the wire token. Unknown tokens are preserved as [`Condition::Other`].
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "bad-request" => Condition::BadRequest,
            "host-gone" => Condition::HostGone,
            "host-unknown" => Condition::HostUnknown,
            "improper-addressing" => Condition::ImproperAddressing,
            "internal-server-error" => Condition::InternalServerError,
            "item-not-found" => Condition::ItemNotFound,
            "other-request" => Condition::OtherRequest,
            "policy-violation" => Condition::PolicyViolation,
            "remote-connection-failed" => Condition::RemoteConnectionFailed,
            "remote-stream-error" => Condition::RemoteStreamError,
            "see-other-uri" => Condition::SeeOtherUri,
            "system-shutdown" => Condition::SystemShutdown,
            "undefined-condition" => Condition::UndefinedCondition,
            other => Condition::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Condition::BadRequest => "bad-request",
            Condition::HostGone => "host-gone",
            Condition::HostUnknown => "host-unknown",
            Condition::ImproperAddressing => "improper-addressing",
            Condition::InternalServerError => "internal-server-error",
            Condition::ItemNotFound => "item-not-found",
            Condition::OtherRequest => "other-request",
            Condition::PolicyViolation => "policy-violation",
            Condition::RemoteConnectionFailed => "remote-connection-failed",
            Condition::RemoteStreamError => "remote-stream-error",
            Condition::SeeOtherUri => "see-other-uri",
            Condition::SystemShutdown => "system-shutdown",
            Condition::UndefinedCondition => "undefined-condition",
            Condition::Other(token) => token,
        }
    }

    /// Map a non-200 HTTP status to the condition a legacy connection
    /// manager means by it (XEP-0124 §17.2 "Deprecated HTTP Conditions").
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Condition::BadRequest,
            403 => Condition::PolicyViolation,
            404 => Condition::ItemNotFound,
            _ => Condition::UndefinedCondition,
        }
    }

    /// Whether this condition ends the BOSH session.
    ///
    /// `remote-stream-error` only concerns the wrapped XMPP stream and is
    /// delivered to the caller as payload instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Condition::RemoteStreamError)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tokens_round_trip() {
        for token in [
            "bad-request",
            "host-gone",
            "host-unknown",
            "improper-addressing",
            "internal-server-error",
            "item-not-found",
            "other-request",
            "policy-violation",
            "remote-connection-failed",
            "remote-stream-error",
            "see-other-uri",
            "system-shutdown",
            "undefined-condition",
        ] {
            let condition = Condition::from_token(token);
            assert!(!matches!(condition, Condition::Other(_)), "{token} should be known");
            assert_eq!(condition.as_str(), token);
        }
    }

    #[test]
    fn test_unknown_token_is_preserved() {
        let condition = Condition::from_token("quantum-flux");
        assert_eq!(condition, Condition::Other("quantum-flux".to_string()));
        assert_eq!(condition.to_string(), "quantum-flux");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Condition::from_http_status(400), Condition::BadRequest);
        assert_eq!(Condition::from_http_status(403), Condition::PolicyViolation);
        assert_eq!(Condition::from_http_status(404), Condition::ItemNotFound);
        assert_eq!(Condition::from_http_status(500), Condition::UndefinedCondition);
        assert_eq!(Condition::from_http_status(502), Condition::UndefinedCondition);
    }

    #[test]
    fn test_only_remote_stream_error_is_not_fatal() {
        assert!(!Condition::RemoteStreamError.is_fatal());
        assert!(Condition::SeeOtherUri.is_fatal());
        assert!(Condition::Other("x".into()).is_fatal());
    }
}
