//! Payloads exchanged between peers over the transport.

use crate::error::AckErrorCode;
use crate::session::AckId;
use crate::types::{CharacterSnapshot, DataHash, PeerId};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SyncMessage {
    Push(DataPush),
    Ack(AckReply),
    Heartbeat(Heartbeat),
}

impl SyncMessage {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// A full snapshot pushed to one or more peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPush {
    pub sender: PeerId,
    pub snapshot: CharacterSnapshot,
    pub hash: DataHash,
    /// Set when the sender wants to know the snapshot was applied.
    pub ack_id: Option<AckId>,
}

impl DataPush {
    pub fn new(sender: PeerId, snapshot: CharacterSnapshot, ack_id: Option<AckId>) -> Self {
        let hash = snapshot.data_hash();
        Self {
            sender,
            snapshot,
            hash,
            ack_id,
        }
    }
}

/// Sent back once a pushed snapshot has been applied, or failed to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckReply {
    pub ack_id: AckId,
    pub from: PeerId,
    pub success: bool,
    pub error_code: Option<AckErrorCode>,
    pub data_hash: Option<DataHash>,
}

impl AckReply {
    pub fn success(ack_id: AckId, from: PeerId, data_hash: DataHash) -> Self {
        Self {
            ack_id,
            from,
            success: true,
            error_code: None,
            data_hash: Some(data_hash),
        }
    }

    pub fn failure(ack_id: AckId, from: PeerId, code: AckErrorCode) -> Self {
        Self {
            ack_id,
            from,
            success: false,
            error_code: Some(code),
            data_hash: None,
        }
    }
}

/// Acknowledgment-free liveness re-send; carries the hash only, never files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: PeerId,
    pub hash: DataHash,
}
