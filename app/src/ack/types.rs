//! Records tracked by the coordinator

use crate::error::AckErrorCode;
use crate::messages::SyncMessage;
use crate::session::AckId;
use crate::types::{AckPriority, CharacterSnapshot, DataHash, PeerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::AsRefStr;

/// Lifecycle of one recipient's acknowledgment.
///
/// `Created -> {Batched, Sent} -> {Resolved, TimedOut, Retrying -> Sent} -> {Resolved, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AckStatus {
    Created,
    Batched,
    Sent,
    Retrying,
    /// Deadline passed; the watchdog owns the outcome now
    TimedOut,
    Resolved,
    Failed,
}

impl AckStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, AckStatus::Resolved | AckStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acknowledgment {
    pub id: AckId,
    pub recipient: PeerId,
    pub data_hash: DataHash,
    pub priority: AckPriority,
    pub status: AckStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_code: Option<AckErrorCode>,
}

impl Acknowledgment {
    pub fn new(
        id: AckId,
        recipient: PeerId,
        data_hash: DataHash,
        priority: AckPriority,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            recipient,
            data_hash,
            priority,
            status: AckStatus::Created,
            created_at,
            sent_at: None,
            resolved_at: None,
            retry_count: 0,
            next_retry_at: None,
            error_code: None,
        }
    }
}

/// An outstanding acknowledgment with the deadline the watchdog checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSend {
    pub acknowledgment: Acknowledgment,
    pub timeout_at: DateTime<Utc>,
}

impl PendingSend {
    pub fn key(&self) -> PendingKey {
        PendingKey {
            id: self.acknowledgment.id.clone(),
            recipient: self.acknowledgment.recipient.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub id: AckId,
    pub recipient: PeerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedOutcome {
    pub acknowledgment: Acknowledgment,
    pub cached_at: DateTime<Utc>,
}

/// What a caller hands to [`AcknowledgmentCoordinator::dispatch`](super::AcknowledgmentCoordinator::dispatch).
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub recipients: Vec<PeerId>,
    pub snapshot: CharacterSnapshot,
    pub priority: AckPriority,
    /// Queue into the priority's batch instead of sending right away
    pub batched: bool,
}

/// One push on its way to the transport, possibly after retries.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub id: AckId,
    pub recipients: Vec<PeerId>,
    pub message: SyncMessage,
    pub priority: AckPriority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}
