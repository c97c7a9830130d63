//! HTTP body compression and its negotiation (XEP-0124 §7.1 `accept`).
//!
//! The client advertises what it can decompress in `Accept-Encoding` on
//! every request. Request bodies are only compressed with a codec the
//! connection manager listed in the `accept` attribute of its
//! session-creation response.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::error::TransportError;

/// A content coding this client implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCodec {
    /// HTTP `deflate`, i.e. a zlib stream.
    Deflate,
    Gzip,
}

impl ContentCodec {
    pub fn token(self) -> &'static str {
        match self {
            ContentCodec::Deflate => "deflate",
            ContentCodec::Gzip => "gzip",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "deflate" => Some(ContentCodec::Deflate),
            "gzip" | "x-gzip" => Some(ContentCodec::Gzip),
            _ => None,
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let failed = |e: std::io::Error| TransportError::Compression {
            codec: self.token(),
            reason: e.to_string(),
        };
        match self {
            ContentCodec::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
            ContentCodec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(data.len() * 4);
        let result = match self {
            ContentCodec::Deflate => ZlibDecoder::new(data).read_to_end(&mut out),
            ContentCodec::Gzip => GzDecoder::new(data).read_to_end(&mut out),
        };
        result.map_err(|e| TransportError::Compression {
            codec: self.token(),
            reason: e.to_string(),
        })?;
        Ok(out)
    }
}

/// Pick the request codec: the first entry of the far end's `accept` list
/// (its preference order) that `supported` also contains.
///
/// `None` means requests go out uncompressed; that is not an error.
pub fn negotiate(offered: &str, supported: &[ContentCodec]) -> Option<ContentCodec> {
    offered
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(ContentCodec::from_token)
        .find(|codec| supported.contains(codec))
}

/// `Accept-Encoding` header value for the supported codecs.
pub fn accept_encoding(supported: &[ContentCodec]) -> Option<String> {
    if supported.is_empty() {
        return None;
    }
    Some(
        supported
            .iter()
            .map(|codec| codec.token())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Codec of a response, from its `Content-Encoding` header.
///
/// `Ok(None)` for identity or a missing header. An unknown coding is an
/// error: the body cannot be parsed.
pub fn response_codec(content_encoding: Option<&str>) -> Result<Option<ContentCodec>, TransportError> {
    match content_encoding.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) if value.eq_ignore_ascii_case("identity") => Ok(None),
        Some(value) => ContentCodec::from_token(value)
            .map(Some)
            .ok_or_else(|| TransportError::Request(format!("unsupported Content-Encoding '{}'", value))),
    }
}
