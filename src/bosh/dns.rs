//! Connection manager resolution: explicit host parsing and XEP-0156 lookup.
//!
//! An explicit host (`https://host:port/path`, `host:port`, `host`) is used
//! as given. With only an XMPP domain, the `_xmppconnect.{domain}` TXT
//! record is queried for `_xmpp-client-xbosh=<url>` entries; without one the
//! conventional `http://{domain}:5280/bosh` is used.

use std::fmt;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use url::Url;

use super::config::BoshConfig;
use super::error::ConfigError;

/// Conventional plain-HTTP BOSH port.
pub const DEFAULT_HTTP_PORT: u16 = 5280;

/// Conventional HTTPS BOSH port.
pub const DEFAULT_HTTPS_PORT: u16 = 5443;

/// TXT attribute name of a BOSH endpoint (XEP-0156 §3).
const XBOSH_TXT_PREFIX: &str = "_xmpp-client-xbosh=";

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Resolved HTTP endpoint of a connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshEndpoint {
    pub secure: bool,
    /// Host name or address; IPv6 literals keep their brackets.
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BoshEndpoint {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme(), self.host, self.port, self.path)
    }

    /// Host without IPv6 brackets, for TLS names and socket addresses.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Parse an absolute `http(s)://` URL. A missing path becomes `default_path`.
    pub fn from_url(input: &str, default_path: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(input.trim()).map_err(|_| ConfigError::InvalidEndpoint(input.to_string()))?;
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(ConfigError::InvalidEndpoint(input.to_string())),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidEndpoint(input.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT });
        let path = match url.path() {
            "" | "/" => normalize_path(default_path),
            p => p.to_string(),
        };
        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }
}

impl fmt::Display for BoshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Result of parsing the configured target.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    /// Explicit endpoint, skip discovery
    Direct(BoshEndpoint),
    /// Domain only, perform XEP-0156 discovery
    Domain(String),
}

/// Parse the configured target into an explicit endpoint or a domain to
/// discover.
///
/// Supported host formats:
/// - `https://host:port/path`  → as given
/// - `http://host`             → port 80, configured path
/// - `host:port`               → scheme from `secure`, configured path
/// - `host`                    → configured or default port
pub fn parse_server_input(config: &BoshConfig) -> Result<ParsedServer, ConfigError> {
    let host_input = config.host.as_deref().map(str::trim).filter(|h| !h.is_empty());
    let Some(host_input) = host_input else {
        return match config.service_domain() {
            Some(domain) => Ok(ParsedServer::Domain(domain.trim().to_string())),
            None => Err(ConfigError::MissingTarget),
        };
    };

    if host_input.starts_with("http://") || host_input.starts_with("https://") {
        return BoshEndpoint::from_url(host_input, &config.path).map(ParsedServer::Direct);
    }

    let default_port = if config.secure {
        DEFAULT_HTTPS_PORT
    } else {
        DEFAULT_HTTP_PORT
    };

    // host:port, using rsplit_once to handle bracketed IPv6 addresses
    let (host, port) = match host_input.rsplit_once(':') {
        Some((host, port_str)) if !host.ends_with(':') => match port_str.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => return Err(ConfigError::InvalidEndpoint(host_input.to_string())),
        },
        _ => (host_input, config.port.unwrap_or(default_port)),
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidEndpoint(host_input.to_string()));
    }

    Ok(ParsedServer::Direct(BoshEndpoint {
        secure: config.secure,
        host: host.to_string(),
        port,
        path: normalize_path(&config.path),
    }))
}

/// Endpoint used when discovery finds nothing.
pub fn fallback_endpoint(domain: &str, config: &BoshConfig) -> BoshEndpoint {
    BoshEndpoint {
        secure: config.secure,
        host: domain.to_string(),
        port: config.port.unwrap_or(if config.secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }),
        path: normalize_path(&config.path),
    }
}

/// Pull BOSH URLs out of TXT record strings, HTTPS first.
pub fn xbosh_urls_from_txt<'a>(records: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut urls: Vec<String> = records
        .into_iter()
        .filter_map(|record| record.trim().strip_prefix(XBOSH_TXT_PREFIX))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    // Stable sort keeps record order within each scheme
    urls.sort_by_key(|url| !url.starts_with("https://"));
    urls
}

/// Discover BOSH endpoints for `domain` via `_xmppconnect` TXT records.
///
/// Returns an empty list when the lookup fails or yields nothing usable.
pub async fn discover_bosh_endpoints(domain: &str, default_path: &str) -> Vec<BoshEndpoint> {
    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let txt_name = format!("_xmppconnect.{}", domain);
    info!(domain, txt = %txt_name, "TXT lookup: trying BOSH discovery");
    let records: Vec<String> = match resolver.txt_lookup(txt_name.as_str()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|segment| String::from_utf8_lossy(segment).into_owned())
                    .collect::<String>()
            })
            .collect(),
        Err(e) => {
            info!(
                domain,
                txt = %txt_name,
                lookup_ms = elapsed_ms(resolve_started),
                error = %e,
                "TXT lookup failed"
            );
            Vec::new()
        }
    };

    let endpoints: Vec<BoshEndpoint> = xbosh_urls_from_txt(records.iter().map(String::as_str))
        .into_iter()
        .filter_map(|url| match BoshEndpoint::from_url(&url, default_path) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(domain, url = %url, error = %e, "Ignoring unusable BOSH URL in TXT record");
                None
            }
        })
        .collect();

    info!(
        domain,
        count = endpoints.len(),
        lookup_ms = elapsed_ms(resolve_started),
        "BOSH discovery complete"
    );
    endpoints
}

/// Resolve the endpoint to connect to.
pub async fn resolve_endpoint(config: &BoshConfig) -> Result<BoshEndpoint, ConfigError> {
    match parse_server_input(config)? {
        ParsedServer::Direct(endpoint) => {
            info!(url = %endpoint, "Using explicit BOSH endpoint");
            Ok(endpoint)
        }
        ParsedServer::Domain(domain) => {
            let discovered = discover_bosh_endpoints(&domain, &config.path).await;
            match discovered.into_iter().next() {
                Some(endpoint) => {
                    info!(domain, url = %endpoint, "Using discovered BOSH endpoint");
                    Ok(endpoint)
                }
                None => {
                    let endpoint = fallback_endpoint(&domain, config);
                    warn!(domain, url = %endpoint, "No BOSH endpoint advertised, using fallback");
                    Ok(endpoint)
                }
            }
        }
    }
}
