//! Wire messages exchanged between windows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use tandem_common::{Result, WindowId};

use crate::mutation::Mutation;
use crate::state::SharedState;

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum Payload {
    /// A mutation applied by the sender.
    Mutation(Mutation),
    /// A newly opened window asks its siblings for their state.
    SyncRequest,
    /// Reply to a [`Payload::SyncRequest`], addressed to one window.
    ///
    /// `seen` holds the highest sequence number per window whose mutations
    /// `state` already contains, the responder's own included.
    Snapshot {
        to: WindowId,
        state: SharedState,
        seen: HashMap<WindowId, u64>,
    },
}

/// A message together with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Window that published the message.
    pub sender: WindowId,
    /// Per-sender sequence number, starting at 1.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: WindowId, seq: u64, payload: Payload) -> Self {
        Self {
            sender,
            seq,
            sent_at: Utc::now(),
            payload,
        }
    }

    /// Encode for the broadcast channel.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a message received from the broadcast channel.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Short description for logging.
    pub fn describe(&self) -> &'static str {
        match &self.payload {
            Payload::Mutation(m) => m.name(),
            Payload::SyncRequest => "syncRequest",
            Payload::Snapshot { .. } => "snapshot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::{Error, ResourceId};

    #[test]
    fn test_envelope_wire_shape() {
        let sender = WindowId::generate();
        let envelope = Envelope::new(
            sender,
            7,
            Payload::Mutation(Mutation::AddResource(ResourceId::new("gdrive").unwrap())),
        );

        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["payload"]["kind"], "mutation");
        assert_eq!(value["payload"]["body"]["type"], "addResource");

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.describe(), "addResource");
    }

    #[test]
    fn test_snapshot_carries_seen_map() {
        let sender = WindowId::generate();
        let to = WindowId::generate();
        let seen = HashMap::from([(sender, 4), (to, 1)]);
        let envelope = Envelope::new(
            sender,
            5,
            Payload::Snapshot {
                to,
                state: SharedState::new(),
                seen: seen.clone(),
            },
        );

        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["payload"]["kind"], "snapshot");
        assert_eq!(value["payload"]["body"]["seen"][sender.to_string()], 4);

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert!(matches!(decoded.payload, Payload::Snapshot { seen: ref s, .. } if *s == seen));
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = Envelope::decode("{\"sender\": 1}").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
