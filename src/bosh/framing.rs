//! BOSH XML framing: `<body/>` encoding and decoding.
//!
//! The session engine does not interpret payload. Decoding therefore only
//! parses the wrapper attributes and slices every direct child of `<body/>`
//! out of the buffer as a raw XML fragment, tracking element depth to find
//! stanza boundaries.

use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::body::{Body, BodyType, HTTPBIND_NS, XBOSH_NS};
use super::condition::Condition;
use super::error::CodecError;

/// Turns bodies into bytes and back. Implementations must be deterministic:
/// a resent body is re-transmitted from the bytes produced the first time.
pub trait BodyCodec: Send + Sync + 'static {
    fn encode(&self, body: &Body) -> Result<Vec<u8>, CodecError>;

    /// Decode one HTTP response payload into one or more bodies.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Body>, CodecError>;
}

/// Default codec: XEP-0124 XML with the XEP-0206 `xmpp:` attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlCodec;

impl BodyCodec for XmlCodec {
    fn encode(&self, body: &Body) -> Result<Vec<u8>, CodecError> {
        Ok(encode_body(body).into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Body>, CodecError> {
        decode_bodies(bytes)
    }
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, " {}='{}'", name, escape(value));
}

fn push_opt<T: std::fmt::Display>(out: &mut String, name: &str, value: &Option<T>) {
    if let Some(value) = value {
        push_attr(out, name, &value.to_string());
    }
}

/// Serialize a body. Attribute order is fixed so equal bodies encode to
/// equal bytes.
pub fn encode_body(body: &Body) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<body");
    push_opt(&mut out, "rid", &body.rid);
    push_opt(&mut out, "sid", &body.sid);
    push_opt(&mut out, "ack", &body.ack);
    if let Some(kind) = body.kind.token() {
        push_attr(&mut out, "type", kind);
    }
    push_opt(&mut out, "condition", &body.condition);
    push_opt(&mut out, "uri", &body.uri);
    push_opt(&mut out, "to", &body.to);
    push_opt(&mut out, "xml:lang", &body.lang);
    push_opt(&mut out, "route", &body.route);
    push_opt(&mut out, "ver", &body.ver);
    push_opt(&mut out, "content", &body.content);
    push_opt(&mut out, "authid", &body.authid);
    push_opt(&mut out, "hold", &body.hold);
    push_opt(&mut out, "wait", &body.wait);
    push_opt(&mut out, "requests", &body.requests);
    push_opt(&mut out, "polling", &body.polling);
    push_opt(&mut out, "inactivity", &body.inactivity);
    push_opt(&mut out, "maxpause", &body.maxpause);
    push_opt(&mut out, "pause", &body.pause);
    push_opt(&mut out, "key", &body.key);
    push_opt(&mut out, "newkey", &body.newkey);
    push_opt(&mut out, "accept", &body.accept);
    if body.restart || body.xmpp_version.is_some() {
        push_attr(&mut out, "xmlns:xmpp", XBOSH_NS);
    }
    if body.restart {
        push_attr(&mut out, "xmpp:restart", "true");
    }
    push_opt(&mut out, "xmpp:version", &body.xmpp_version);
    for (name, value) in &body.extra {
        push_attr(&mut out, name, value);
    }
    push_attr(&mut out, "xmlns", HTTPBIND_NS);

    if body.payload.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        for child in &body.payload {
            out.push_str(child);
        }
        out.push_str("</body>");
    }
    out
}

fn parse_number<T: std::str::FromStr>(
    attribute: &'static str,
    value: &str,
) -> Result<Option<T>, CodecError> {
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| CodecError::InvalidAttribute {
            attribute,
            value: value.to_string(),
        })
}

fn parse_attributes(start: &BytesStart<'_>) -> Result<Body, CodecError> {
    let mut body = Body::default();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| CodecError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CodecError::Xml(e.to_string()))?
            .into_owned();
        match key.as_str() {
            "rid" => body.rid = parse_number("rid", &value)?,
            "sid" => body.sid = Some(value),
            "ack" => body.ack = parse_number("ack", &value)?,
            "type" => body.kind = BodyType::from_token(&value),
            "condition" => body.condition = Some(Condition::from_token(&value)),
            "uri" => body.uri = Some(value),
            "to" => body.to = Some(value),
            "xml:lang" => body.lang = Some(value),
            "route" => body.route = Some(value),
            "ver" => body.ver = Some(value),
            "content" => body.content = Some(value),
            "authid" => body.authid = Some(value),
            "hold" => body.hold = parse_number("hold", &value)?,
            "wait" => body.wait = parse_number("wait", &value)?,
            "requests" => body.requests = parse_number("requests", &value)?,
            "polling" => body.polling = parse_number("polling", &value)?,
            "inactivity" => body.inactivity = parse_number("inactivity", &value)?,
            "maxpause" => body.maxpause = parse_number("maxpause", &value)?,
            "pause" => body.pause = parse_number("pause", &value)?,
            "key" => body.key = Some(value),
            "newkey" => body.newkey = Some(value),
            "accept" => body.accept = Some(value),
            "xmpp:restart" => body.restart = value == "true",
            "xmpp:version" => body.xmpp_version = Some(value),
            // Namespace declarations are regenerated on encode
            "xmlns" | "xmlns:xmpp" | "xmlns:stream" => {}
            _ => body.extra.push((key, value)),
        }
    }
    Ok(body)
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Where the scanner is relative to the current `<body/>` wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between wrappers, waiting for `<body>`.
    Outside,
    /// Inside `<body>`, between payload children.
    InBody,
    /// Inside a payload child, collecting until depth returns to 0.
    InChild,
}

/// Decode every `<body/>` wrapper in `buffer`, in document order.
pub fn decode_bodies(buffer: &[u8]) -> Result<Vec<Body>, CodecError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut bodies = Vec::new();
    let mut current: Option<Body> = None;
    let mut state = ScanState::Outside;
    let mut depth: u32 = 0;
    let mut child_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => match state {
                ScanState::Outside => {
                    if e.name().local_name().as_ref() != b"body" {
                        return Err(CodecError::UnexpectedRoot(bytes_to_string(e.name().as_ref())));
                    }
                    current = Some(parse_attributes(&e)?);
                    state = ScanState::InBody;
                }
                ScanState::InBody => {
                    state = ScanState::InChild;
                    child_start = pos;
                    depth = 1;
                }
                ScanState::InChild => depth += 1,
            },
            Ok(Event::Empty(e)) => match state {
                ScanState::Outside => {
                    if e.name().local_name().as_ref() != b"body" {
                        return Err(CodecError::UnexpectedRoot(bytes_to_string(e.name().as_ref())));
                    }
                    bodies.push(parse_attributes(&e)?);
                }
                ScanState::InBody => {
                    // Self-closing top-level child (e.g. <presence/>)
                    let tag_end = reader.buffer_position() as usize;
                    if let Some(body) = current.as_mut() {
                        body.payload.push(bytes_to_string(&buffer[pos..tag_end]));
                    }
                }
                ScanState::InChild => {}
            },
            Ok(Event::End(_)) => match state {
                ScanState::InChild => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let tag_end = reader.buffer_position() as usize;
                        if let Some(body) = current.as_mut() {
                            body.payload.push(bytes_to_string(&buffer[child_start..tag_end]));
                        }
                        state = ScanState::InBody;
                    }
                }
                ScanState::InBody => {
                    if let Some(body) = current.take() {
                        bodies.push(body);
                    }
                    state = ScanState::Outside;
                }
                ScanState::Outside => {}
            },
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                // Whitespace between children, or text inside a child
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(CodecError::Xml(e.to_string())),
        }
    }

    if state != ScanState::Outside {
        return Err(CodecError::Xml("unclosed <body> element".to_string()));
    }
    if bodies.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(bodies)
}
