//! Contracts for the collaborators this subsystem consumes.
//!
//! None of these give delivery or ordering guarantees. Implementations live
//! outside the crate; in-memory versions for tests and the simulation binary
//! are in [`crate::testing::mocks`].

use crate::error::TransportError;
use crate::messages::SyncMessage;
use crate::session::AckId;
use crate::types::{CharacterSnapshot, DataHash, PeerId};
use async_trait::async_trait;
use std::fmt::Debug;

/// Best-effort message delivery to a set of peers. May silently drop.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(
        &self,
        recipients: &[PeerId],
        message: SyncMessage,
        ack_id: Option<&AckId>,
    ) -> Result<(), TransportError>;
}

/// Authoritative answer to "is this still the owner's current data?".
#[async_trait]
pub trait HashOracle: Send + Sync + Debug {
    async fn validate_hash(&self, owner: &PeerId, hash: &DataHash) -> Result<bool, TransportError>;
}

/// Opaque handle to a peer's rendered character.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderHandle(pub u64);

/// Live render state of visible characters.
///
/// `begin_apply` only starts application; completion is reported on the
/// [`ApplicationEvents`](crate::peer::ApplicationEvents) bus.
#[async_trait]
pub trait PlayerRenderState: Send + Sync + Debug {
    fn get_handle(&self, peer: &PeerId) -> Option<RenderHandle>;

    async fn begin_apply(
        &self,
        handle: &RenderHandle,
        peer: &PeerId,
        snapshot: &CharacterSnapshot,
    ) -> Result<(), TransportError>;
}

/// Uploads the files a snapshot references before it is pushed.
#[async_trait]
pub trait FileUploader: Send + Sync + Debug {
    async fn upload_missing(&self, snapshot: &CharacterSnapshot) -> Result<usize, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Fire-and-forget user-facing toasts. Must never affect protocol state.
pub trait NotificationSink: Send + Sync + Debug {
    fn notify(&self, notification: Notification);
}
