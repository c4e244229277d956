//! Frames exchanged on a peer-to-peer session.
//!
//! The handshake pair carries the ephemeral public keys; once the session
//! is keyed, `message` frames carry sealed payloads and are acknowledged
//! by correlation id. A bare `{"error": …}` object (no `type` tag) is a
//! sender-observed fault and is handled separately by the session engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{frame, Error};

pub const ERROR_INVALID_MESSAGE: &str = "invalid_message";
pub const ERROR_DECRYPTION_FAILED: &str = "decryption_failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFrame {
    /// Initiator → responder: begins the session.
    Handshake { key: String, from: String },
    /// Responder → initiator: completes key agreement.
    HandshakeAck { key: String },
    /// A sealed application message, either direction once keyed.
    Message {
        #[serde(rename = "messageType")]
        message_type: String,
        data: String,
        #[serde(rename = "correlationId")]
        correlation_id: String,
    },
    /// Delivery acknowledgement for a `message`.
    Ack {
        #[serde(rename = "correlationId")]
        correlation_id: String,
    },
    Ping,
    Pong,
}

/// The plaintext sealed inside a `message` frame. The correlation id is
/// carried both here and on the outer frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Value,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

/// Encode a session frame as a wire line.
pub fn encode(frame: &SessionFrame) -> Result<Vec<u8>, Error> {
    frame::encode(frame)
}

/// Encode the bare fault object the protocol uses for sender-observed
/// errors.
pub fn encode_fault(error: &str) -> Vec<u8> {
    let mut line = serde_json::json!({ "error": error }).to_string().into_bytes();
    line.push(b'\n');
    line
}

/// Classify one decoded line from the peer channel.
pub fn classify(value: Value) -> Result<PeerFrame, Error> {
    if value.get("type").is_none() {
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Ok(PeerFrame::Fault(error.to_string()));
        }
    }

    serde_json::from_value(value)
        .map(PeerFrame::Session)
        .map_err(|_| Error::InvalidJson)
}

#[derive(Debug, PartialEq)]
pub enum PeerFrame {
    Session(SessionFrame),
    Fault(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_tags_match_the_wire_grammar() {
        let frame = SessionFrame::Message {
            message_type: "hello".to_string(),
            data: "abc".to_string(),
            correlation_id: "00ff00ff00ff00ff".to_string(),
        };

        let value: Value = serde_json::from_slice(
            encode(&frame).unwrap().strip_suffix(b"\n").unwrap(),
        )
        .unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["messageType"], "hello");
        assert_eq!(value["correlationId"], "00ff00ff00ff00ff");
    }

    #[test]
    fn classify_splits_faults_from_frames() {
        assert_eq!(
            classify(json!({"error": "decryption_failed"})).unwrap(),
            PeerFrame::Fault("decryption_failed".to_string())
        );

        assert_eq!(
            classify(json!({"type": "ping"})).unwrap(),
            PeerFrame::Session(SessionFrame::Ping)
        );

        assert!(classify(json!({"type": "message"})).is_err());
    }

    #[test]
    fn fault_lines_are_valid_frames() {
        let line = encode_fault(ERROR_INVALID_MESSAGE);
        let value: Value = serde_json::from_slice(line.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(value["error"], "invalid_message");
    }

    #[test]
    fn handshake_round_trip() {
        let frame = SessionFrame::Handshake {
            key: "a2V5".to_string(),
            from: "f".repeat(32),
        };

        let value: Value =
            serde_json::from_slice(encode(&frame).unwrap().strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(classify(value).unwrap(), PeerFrame::Session(frame));
    }
}
