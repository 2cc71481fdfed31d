//! Wire protocol for the tunnel agent.
//!
//! Defines the binary [`Frame`] exchanged over the duplex channel between the
//! agent and the relay, the JSON descriptors carried as frame payloads, and
//! the well-known frame type names both sides agree on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Only wire version this crate understands.
pub const VERSION: u8 = 1;

/// `version(1) + request_id(16) + type_len(1)`. Frames shorter than this are
/// dropped before the type length byte is even trusted.
pub const MIN_FRAME_LEN: usize = 18;

/// Opaque identifier minted by the relay for each end-user request.
pub type RequestId = [u8; 16];

/// Frame type names, fixed by the protocol.
pub mod frame_type {
    pub const HTTP: &str = "http";
    pub const WS: &str = "ws";
    pub const HEAD: &str = "head";
    pub const DATA: &str = "data";
    pub const END: &str = "end";
    pub const BAD_GATEWAY: &str = "badgateway";
    pub const GO_IDLE: &str = "go-idle";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame type name is longer than 255 bytes")]
    TypeNameTooLong,
    #[error("failed to serialize JSON payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A single frame on the duplex channel.
///
/// Wire layout: `version(1) || request_id(16) || type_len(1) || type(type_len) || payload(rest)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: RequestId,
    pub frame_type: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(request_id: RequestId, frame_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            frame_type: frame_type.into(),
            payload,
        }
    }

    pub fn empty(request_id: RequestId, frame_type: impl Into<String>) -> Self {
        Self::new(request_id, frame_type, Vec::new())
    }

    pub fn json(
        request_id: RequestId,
        frame_type: impl Into<String>,
        body: &impl Serialize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(request_id, frame_type, serde_json::to_vec(body)?))
    }

    pub fn is_type(&self, name: &str) -> bool {
        self.frame_type == name
    }

    /// Encode this frame to its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.frame_type.len() > u8::MAX as usize {
            return Err(ProtocolError::TypeNameTooLong);
        }
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + self.frame_type.len() + self.payload.len());
        out.push(VERSION);
        out.extend_from_slice(&self.request_id);
        out.push(self.frame_type.len() as u8);
        out.extend_from_slice(self.frame_type.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a frame from the wire. Returns `None` for anything malformed —
    /// short frames and unrecognized versions are silently dropped, never an
    /// error, per the protocol's own tolerance for garbage on the channel.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        if bytes.len() < MIN_FRAME_LEN {
            return None;
        }
        if bytes[0] != VERSION {
            return None;
        }
        let mut request_id = [0u8; 16];
        request_id.copy_from_slice(&bytes[1..17]);
        let type_len = bytes[17] as usize;
        let type_start = 18;
        let type_end = type_start + type_len;
        if bytes.len() < type_end {
            return None;
        }
        let frame_type = std::str::from_utf8(&bytes[type_start..type_end])
            .ok()?
            .to_string();
        let payload = bytes[type_end..].to_vec();
        Some(Frame {
            request_id,
            frame_type,
            payload,
        })
    }
}

/// A header value that may carry one or several values, matching the
/// relay's JSON representation (`"v"` or `["v1", "v2"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    /// Iterate the individual values, regardless of representation.
    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::One(v) => vec![v.as_str()],
            HeaderValue::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

pub type HeaderMap = HashMap<String, HeaderValue>;

/// Payload of an `http`/`ws` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestDescriptor {
    pub url: String,
    pub subdomain: String,
    pub method: String,
    pub headers: HeaderMap,
}

/// Payload of a `head` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseHead {
    pub status_code: u16,
    pub headers: HeaderMap,
}

/// Payload of a `go-idle` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleDescriptor {
    pub db: String,
    pub db_key: String,
    pub api_key: String,
    pub token: String,
}

pub mod constants {
    /// Keepalive ping cadence on the duplex channel.
    pub const WS_PING_INTERVAL_SECONDS: u64 = 15;
}

/// Generate a new client id: 16 random bytes, base64url-encoded.
pub fn new_client_id() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut bytes = [0u8; 16];
    rand_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn rand_bytes(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(b: u8) -> RequestId {
        let mut id = [0u8; 16];
        id[15] = b;
        id
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let frame = Frame::empty(rid(1), frame_type::END);
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let frame = Frame::new(rid(7), frame_type::DATA, b"hello".to_vec());
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_rejects_short_frames() {
        assert!(Frame::decode(&[1, 2, 3]).is_none());
        let mut almost = vec![VERSION];
        almost.extend_from_slice(&[0u8; 16]);
        almost.push(0);
        // exactly 18 bytes, type_len = 0, no payload: should decode.
        assert!(Frame::decode(&almost).is_some());
        almost.pop();
        assert!(Frame::decode(&almost).is_none());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let frame = Frame::empty(rid(1), frame_type::END);
        let mut bytes = frame.encode().unwrap();
        bytes[0] = 2;
        assert!(Frame::decode(&bytes).is_none());
    }

    #[test]
    fn test_request_id_compared_by_value() {
        let a = Frame::empty(rid(9), frame_type::END);
        let b = Frame::decode(&a.encode().unwrap()).unwrap();
        assert_eq!(a.request_id, b.request_id);
    }

    #[test]
    fn test_header_value_accepts_single_and_multi() {
        let single: HeaderValue = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(single.values(), vec!["a"]);

        let multi: HeaderValue = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(multi.values(), vec!["a", "b"]);
    }

    #[test]
    fn test_http_request_descriptor_roundtrips_through_json() {
        let mut headers = HeaderMap::new();
        headers.insert("host".to_string(), HeaderValue::One("app.example".to_string()));
        let desc = HttpRequestDescriptor {
            url: "/ping".to_string(),
            subdomain: "app".to_string(),
            method: "GET".to_string(),
            headers,
        };
        let bytes = serde_json::to_vec(&desc).unwrap();
        let back: HttpRequestDescriptor = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.url, "/ping");
        assert_eq!(back.subdomain, "app");
    }
}
