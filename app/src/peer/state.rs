//! Per-peer synchronization state machine
//!
//! ```text
//! Idle ──begin_build──▶ AwaitingBuild ──await_ack──▶ AwaitingAck ──resolve──▶ Resolved ──settle──▶ Idle
//!   ▲                        │                            │
//!   └──────cancel_build──────┘                            └── (newer push) await_ack
//! ```
//!
//! A build that starts while an acknowledgment is outstanding carries the
//! awaited id along, so the reply still resolves it and cancelling the
//! build goes back to waiting on it.
//!
//! The pending flag shown to the UI is derived from the state, so it is
//! impossible to be pending while also carrying a resolution for the
//! exchange being awaited.

use crate::error::{SyncError, SyncResult};
use crate::session::AckId;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PeerSyncState {
    Idle,
    /// Local data is being regenerated; the peer is known to be stale.
    /// `awaiting` holds an exchange that was still outstanding when the
    /// build began.
    AwaitingBuild {
        since: DateTime<Utc>,
        awaiting: Option<(AckId, DateTime<Utc>)>,
    },
    /// A push went out under `id`.
    AwaitingAck { id: AckId, since: DateTime<Utc> },
    Resolved {
        id: AckId,
        success: bool,
        at: DateTime<Utc>,
    },
}

impl PeerSyncState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerSyncState::Idle => "idle",
            PeerSyncState::AwaitingBuild { .. } => "awaiting_build",
            PeerSyncState::AwaitingAck { .. } => "awaiting_ack",
            PeerSyncState::Resolved { .. } => "resolved",
        }
    }
}

/// Read-only view of a peer's acknowledgment fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerAckView {
    pub pending_acknowledgment: bool,
    pub last_acknowledgment_success: Option<bool>,
    pub last_acknowledgment_time: Option<DateTime<Utc>>,
    pub last_acknowledgment_id: Option<AckId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSyncStateMachine {
    state: PeerSyncState,
    last_ack_id: Option<AckId>,
    last_ack_success: Option<bool>,
    last_ack_time: Option<DateTime<Utc>>,
}

impl Default for PeerSyncStateMachine {
    fn default() -> Self {
        Self {
            state: PeerSyncState::Idle,
            last_ack_id: None,
            last_ack_success: None,
            last_ack_time: None,
        }
    }
}

impl PeerSyncStateMachine {
    pub fn state(&self) -> &PeerSyncState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            PeerSyncState::AwaitingBuild { .. } | PeerSyncState::AwaitingAck { .. }
        )
    }

    /// Id of the exchange currently awaited, if any.
    pub fn awaited_id(&self) -> Option<&AckId> {
        match &self.state {
            PeerSyncState::AwaitingAck { id, .. } => Some(id),
            PeerSyncState::AwaitingBuild {
                awaiting: Some((id, _)),
                ..
            } => Some(id),
            _ => None,
        }
    }

    /// Regeneration started. Allowed from any state: a new build always
    /// makes the peer stale again.
    pub fn begin_build(&mut self, now: DateTime<Utc>) {
        let awaiting = match &self.state {
            PeerSyncState::AwaitingBuild { .. } => return,
            PeerSyncState::AwaitingAck { id, since } => Some((id.clone(), *since)),
            _ => None,
        };
        self.state = PeerSyncState::AwaitingBuild {
            since: now,
            awaiting,
        };
    }

    /// The build produced nothing new for this peer. Falls back to the
    /// exchange that was outstanding before the build, if any.
    pub fn cancel_build(&mut self) -> bool {
        let PeerSyncState::AwaitingBuild { awaiting, .. } = &mut self.state else {
            return false;
        };
        let previous = awaiting.take();
        self.state = match previous {
            Some((id, since)) => PeerSyncState::AwaitingAck { id, since },
            None => PeerSyncState::Idle,
        };
        true
    }

    /// A push was sent and `id` registered for this peer. A newer push
    /// supersedes whatever was awaited before.
    pub fn await_ack(&mut self, id: AckId, now: DateTime<Utc>) {
        self.state = PeerSyncState::AwaitingAck { id, since: now };
    }

    /// Records the outcome of the awaited exchange and returns to `Idle`.
    /// An exchange resolved while a build is in progress leaves the peer in
    /// `AwaitingBuild`.
    ///
    /// Fails if nothing is awaited or `id` is not the awaited exchange.
    pub fn resolve(&mut self, id: &AckId, success: bool, now: DateTime<Utc>) -> SyncResult<()> {
        if self.awaited_id() != Some(id) {
            return Err(SyncError::InvalidTransition {
                subject: id.to_string(),
                from: self.state.name().to_string(),
                to: "resolved".to_string(),
            });
        }

        self.last_ack_id = Some(id.clone());
        self.last_ack_success = Some(success);
        self.last_ack_time = Some(now);

        if let PeerSyncState::AwaitingBuild { awaiting, .. } = &mut self.state {
            *awaiting = None;
            return Ok(());
        }
        self.state = PeerSyncState::Resolved {
            id: id.clone(),
            success,
            at: now,
        };
        self.settle();
        Ok(())
    }

    fn settle(&mut self) {
        if let PeerSyncState::Resolved { .. } = self.state {
            self.state = PeerSyncState::Idle;
        }
    }

    pub fn view(&self) -> PeerAckView {
        PeerAckView {
            pending_acknowledgment: self.is_pending(),
            last_acknowledgment_success: self.last_ack_success,
            last_acknowledgment_time: self.last_ack_time,
            last_acknowledgment_id: self.last_ack_id.clone(),
        }
    }
}
