//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::compression::ContentCodec;
use super::error::ConfigError;

/// Default `wait`: how long the connection manager may hold a request.
pub const DEFAULT_WAIT_SECS: u32 = 60;

/// Default request path of the connection manager.
pub const DEFAULT_PATH: &str = "/bosh";

/// Immutable settings for one [`Session`](super::Session).
///
/// Either `host` or `domain` must be set. With only a domain, the endpoint
/// is discovered (XEP-0156) and falls back to the conventional port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoshConfig {
    /// XMPP service domain; `to` of the session-creation request.
    pub domain: Option<String>,
    /// Explicit connection manager: `host`, `host:port` or a full URL.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Use `https` for an explicit host without scheme.
    pub secure: bool,
    pub path: String,
    pub wait: u32,
    /// `proto:host:port` for multi-tenant connection managers.
    pub route: Option<String>,
    pub lang: String,
    /// Enable XEP-0124 §15 key sequencing.
    pub use_key_sequence: bool,
    /// Codecs the client can (de)compress, in preference order.
    pub compression: Vec<ContentCodec>,
    /// HTTP proxy URL for all requests.
    pub proxy: Option<String>,
    /// Skip TLS certificate verification. Development only.
    pub dangerous_insecure_tls: bool,
    pub connect_timeout_secs: u64,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            domain: None,
            host: None,
            port: None,
            secure: false,
            path: DEFAULT_PATH.to_string(),
            wait: DEFAULT_WAIT_SECS,
            route: None,
            lang: "en".to_string(),
            use_key_sequence: false,
            compression: vec![ContentCodec::Deflate, ContentCodec::Gzip],
            proxy: None,
            dangerous_insecure_tls: false,
            connect_timeout_secs: 15,
        }
    }
}

impl BoshConfig {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    pub fn with_host(self, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..self
        }
    }

    pub fn with_secure(self, secure: bool) -> Self {
        Self { secure, ..self }
    }

    pub fn with_path(self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self
        }
    }

    pub fn with_wait(self, wait: u32) -> Self {
        Self { wait, ..self }
    }

    pub fn with_route(self, route: impl Into<String>) -> Self {
        Self {
            route: Some(route.into()),
            ..self
        }
    }

    pub fn with_lang(self, lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            ..self
        }
    }

    pub fn with_key_sequence(self, use_key_sequence: bool) -> Self {
        Self {
            use_key_sequence,
            ..self
        }
    }

    pub fn with_compression(self, compression: Vec<ContentCodec>) -> Self {
        Self {
            compression,
            ..self
        }
    }

    pub fn with_proxy(self, proxy: impl Into<String>) -> Self {
        Self {
            proxy: Some(proxy.into()),
            ..self
        }
    }

    pub fn with_dangerous_insecure_tls(self, enabled: bool) -> Self {
        Self {
            dangerous_insecure_tls: enabled,
            ..self
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Configured XMPP domain, ignoring a blank value.
    pub fn service_domain(&self) -> Option<&str> {
        self.domain.as_deref().filter(|d| !d.trim().is_empty())
    }

    /// Reject configurations that cannot work, before any I/O happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_host = self.host.as_deref().is_some_and(|h| !h.trim().is_empty());
        if !has_host && self.service_domain().is_none() {
            return Err(ConfigError::MissingTarget);
        }
        if self.wait == 0 {
            return Err(ConfigError::ZeroWait);
        }
        if let Some(route) = &self.route {
            if !is_valid_route(route) {
                return Err(ConfigError::InvalidRoute(route.clone()));
            }
        }
        Ok(())
    }
}

/// `proto:host:port` with a non-empty protocol and host and a numeric port.
fn is_valid_route(route: &str) -> bool {
    let Some((proto, rest)) = route.split_once(':') else {
        return false;
    };
    let Some((host, port)) = rest.rsplit_once(':') else {
        return false;
    };
    !proto.is_empty() && !host.is_empty() && port.parse::<u16>().is_ok()
}
