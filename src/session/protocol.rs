//! Protocol Messages
//!
//! Messages between a session and the relay that orders input. Encoded
//! with bincode on the wire; JSON is available for logging and debugging.

use serde::{Deserialize, Serialize};

use crate::core::hash::Digest256;
use crate::sim::frame::Tick;
use crate::sim::input::TickInputs;
use crate::sim::players::PlayerRef;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(String),
    /// Message could not be decoded.
    #[error("Failed to decode message: {0}")]
    Decode(String),
    /// Outgoing queue is full.
    #[error("Send queue full")]
    QueueFull,
    /// Transport closed.
    #[error("Disconnected")]
    Disconnected,
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from a session to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim a player slot.
    Join {
        /// Requested slot.
        player: PlayerRef,
        /// Transport actor id.
        actor_id: i32,
        /// Encoded runtime player payload.
        data: Vec<u8>,
        /// Digest of the runtime config; peers must agree.
        config_digest: Digest256,
    },

    /// Local input for a tick.
    Input {
        /// Tick the input applies to.
        tick: Tick,
        /// Player slot.
        player: PlayerRef,
        /// Encoded input.
        input: Vec<u8>,
        /// Encoded command, if one was issued.
        command: Option<Vec<u8>>,
    },

    /// Checksum of a verified tick.
    Checksum {
        /// Tick.
        tick: Tick,
        /// Checksum.
        checksum: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the relay to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Start simulating at `tick`, optionally from a serialized frame
    /// (late join).
    Start {
        /// First tick to simulate.
        tick: Tick,
        /// Serialized frame of `tick - 1`.
        frame_data: Option<Vec<u8>>,
    },

    /// Confirmed input of one tick.
    Inputs(TickInputs),

    /// A peer's checksum.
    Checksum {
        /// Tick.
        tick: Tick,
        /// Checksum.
        checksum: u64,
    },

    /// Replace the verified frame.
    Resync {
        /// Tick of the frame.
        tick: Tick,
        /// Serialized frame.
        frame_data: Vec<u8>,
    },

    /// Stop advancing time.
    Pause,

    /// Continue advancing time.
    Resume,

    /// Session ended by the relay.
    Disconnect {
        /// Reason.
        reason: String,
    },
}

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_json() {
        let msg = ClientMessage::Input {
            tick: 42,
            player: 1,
            input: vec![1, 2, 3],
            command: None,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("input"));
        assert_eq!(ClientMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_server_inputs_binary() {
        let msg = ServerMessage::Inputs(TickInputs::new(7).with_input(0, vec![9]));
        let bytes = msg.to_bytes().unwrap();
        match ServerMessage::from_bytes(&bytes).unwrap() {
            ServerMessage::Inputs(inputs) => {
                assert_eq!(inputs.tick, 7);
                assert_eq!(inputs.inputs[&0], vec![9]);
            }
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_join_carries_digest() {
        let msg = ClientMessage::Join {
            player: 0,
            actor_id: 3,
            data: Vec::new(),
            config_digest: [7; 32],
        };
        assert_eq!(ClientMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(ServerMessage::from_bytes(&[0xff; 3]), Err(ProtocolError::Decode(_))));
        assert!(ServerMessage::from_json("{\"nope\":1}").is_err());
    }
}
