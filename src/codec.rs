//! Payload normalisation shared by the broker server and client.
//!
//! Data crossing the RPC boundary may arrive as an envelope `{"data": "<base64>"}`,
//! as UTF-8 text, or as a raw byte array. Both directions normalise with the same
//! rules so that instrument code cannot tell a local channel from a remote one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Wire representation of a byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// `{"data": "<base64>"}`
    Envelope {
        /// Base64 (standard alphabet) encoded bytes
        data: String,
    },
    /// Plain text, sent as its UTF-8 bytes
    Text(String),
    /// JSON array of byte values
    Raw(Vec<u8>),
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        ensure_bytes(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// Envelope → decoded bytes (or the UTF-8 bytes of `data` if it is not valid
/// base64), text → UTF-8 bytes, raw → unchanged.
pub fn coerce_bytes(payload: Payload) -> Vec<u8> {
    match payload {
        Payload::Envelope { data } => match STANDARD.decode(data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => data.into_bytes(),
        },
        Payload::Text(text) => text.into_bytes(),
        Payload::Raw(bytes) => bytes,
    }
}

/// Lossy UTF-8 view of a payload.
pub fn coerce_str(payload: Payload) -> String {
    String::from_utf8_lossy(&coerce_bytes(payload)).into_owned()
}

/// Bytes → envelope.
pub fn ensure_bytes(bytes: &[u8]) -> Payload {
    Payload::Envelope {
        data: STANDARD.encode(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_payload_shapes() {
        let env: Payload = serde_json::from_str(r#"{"data":"Vk9MVD8="}"#).unwrap();
        assert_eq!(coerce_bytes(env), b"VOLT?");

        let text: Payload = serde_json::from_str(r#""VOLT?""#).unwrap();
        assert_eq!(coerce_bytes(text), b"VOLT?");

        let raw: Payload = serde_json::from_str("[86,79,76,84,63]").unwrap();
        assert_eq!(coerce_bytes(raw), b"VOLT?");
    }

    #[test]
    fn test_envelope_with_invalid_base64_falls_back_to_text() {
        let payload = Payload::Envelope {
            data: "not base64!".into(),
        };
        assert_eq!(coerce_bytes(payload), b"not base64!");
    }

    #[test]
    fn test_binary_survives_envelope() {
        let bytes = [0u8, 255, 10, 13, 128];
        let json = serde_json::to_string(&ensure_bytes(&bytes)).unwrap();
        assert!(json.starts_with(r#"{"data":"#));
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(coerce_bytes(back), bytes);
    }

    #[test]
    fn test_coerce_str_is_lossy() {
        assert_eq!(coerce_str(Payload::Raw(vec![0x4f, 0x4b, 0xff])), "OK\u{fffd}");
    }
}
