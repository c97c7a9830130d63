//! The `<body/>` wrapper exchanged in every BOSH request and response.
//!
//! A [`Body`] is built once per exchange and never mutated after it has been
//! stamped and encoded. Attributes the session engine cares about are typed;
//! everything else rides along in [`Body::extra`] so that it survives a
//! decode/encode cycle untouched. Payload children are opaque XML fragments.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::condition::Condition;

/// Namespace of the `<body/>` element (XEP-0124).
pub const HTTPBIND_NS: &str = "http://jabber.org/protocol/httpbind";

/// Namespace of the `xmpp:` attributes (XEP-0206).
pub const XBOSH_NS: &str = "urn:xmpp:xbosh";

/// Protocol version advertised in the session-creation request.
pub const BOSH_VERSION: &str = "1.6";

/// `content` attribute of the session-creation request.
pub const CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// `type` attribute of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
    #[default]
    Normal,
    /// Recoverable binding error: resend everything not yet acknowledged.
    Error,
    Terminate,
}

impl BodyType {
    pub fn from_token(token: &str) -> Self {
        match token {
            "error" => BodyType::Error,
            "terminate" => BodyType::Terminate,
            _ => BodyType::Normal,
        }
    }

    /// Wire token, or `None` for a normal body (the attribute is omitted).
    pub fn token(self) -> Option<&'static str> {
        match self {
            BodyType::Normal => None,
            BodyType::Error => Some("error"),
            BodyType::Terminate => Some("terminate"),
        }
    }
}

/// One BOSH wire unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub rid: Option<u64>,
    pub sid: Option<String>,
    pub ack: Option<u64>,
    pub kind: BodyType,
    pub condition: Option<Condition>,
    /// Redirect target of `see-other-uri`.
    pub uri: Option<String>,

    pub to: Option<String>,
    pub lang: Option<String>,
    pub route: Option<String>,
    pub ver: Option<String>,
    pub content: Option<String>,
    pub authid: Option<String>,

    pub hold: Option<u32>,
    pub wait: Option<u32>,
    pub requests: Option<u32>,
    pub polling: Option<u32>,
    pub inactivity: Option<u32>,
    pub maxpause: Option<u32>,
    pub pause: Option<u32>,

    pub key: Option<String>,
    pub newkey: Option<String>,

    /// Codecs the sender can decompress (`accept` attribute).
    pub accept: Option<String>,

    /// `xmpp:restart='true'` (XEP-0206 stream restart).
    pub restart: bool,
    /// `xmpp:version`, sent with the session-creation request.
    pub xmpp_version: Option<String>,

    /// Attributes without a typed field, in document order.
    pub extra: Vec<(String, String)>,

    /// Wrapped child elements, raw XML, in document order.
    pub payload: Vec<String>,
}

impl Body {
    /// Body carrying the caller's payload elements.
    pub fn with_payload(payload: Vec<String>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Empty body, used to keep a long-poll request open.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Session-creation request (XEP-0124 §7.1, XEP-0206 §6).
    ///
    /// `ack='1'` announces that the client supports acknowledgments.
    pub fn creation(domain: &str, lang: &str, hold: u32, wait: u32, route: Option<&str>) -> Self {
        Self {
            to: Some(domain.to_string()),
            lang: Some(lang.to_string()),
            ver: Some(BOSH_VERSION.to_string()),
            content: Some(CONTENT_TYPE.to_string()),
            hold: Some(hold),
            wait: Some(wait),
            route: route.map(str::to_string),
            ack: Some(1),
            xmpp_version: Some("1.0".to_string()),
            ..Default::default()
        }
    }

    /// Stream restart request sent after SASL (XEP-0206 §5). Never has payload.
    pub fn restart(domain: &str, lang: &str) -> Self {
        Self {
            to: Some(domain.to_string()),
            lang: Some(lang.to_string()),
            restart: true,
            ..Default::default()
        }
    }

    /// Session termination request.
    pub fn terminate(payload: Vec<String>) -> Self {
        Self {
            kind: BodyType::Terminate,
            payload,
            ..Default::default()
        }
    }

    /// Pause request (XEP-0124 §10).
    pub fn pause(seconds: u32) -> Self {
        Self {
            pause: Some(seconds),
            ..Default::default()
        }
    }

    pub fn is_terminate(&self) -> bool {
        self.kind == BodyType::Terminate
    }

    /// Redirect target of a `see-other-uri` termination: the `uri` attribute,
    /// or the text of a `<uri/>` child as XEP-0124 §17.8 shows it.
    pub fn redirect_uri(&self) -> Option<String> {
        if let Some(uri) = &self.uri {
            return Some(uri.clone());
        }
        self.payload.iter().find_map(|child| uri_text(child))
    }
}

/// Unescaped text of a `<uri>...</uri>` fragment. `None` for any other
/// element or for mixed content.
fn uri_text(fragment: &str) -> Option<String> {
    let mut reader = Reader::from_str(fragment.trim());
    match reader.read_event().ok()? {
        Event::Start(e) if e.local_name().as_ref() == b"uri" => {}
        _ => return None,
    }
    let mut text = String::new();
    loop {
        match reader.read_event().ok()? {
            Event::Text(t) => text.push_str(&t.unescape().ok()?),
            Event::CData(c) => text.push_str(std::str::from_utf8(&c.into_inner()).ok()?),
            Event::End(e) if e.local_name().as_ref() == b"uri" => break,
            _ => return None,
        }
    }
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
