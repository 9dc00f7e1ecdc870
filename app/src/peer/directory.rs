//! Registry of paired peers and their synchronization state

use super::state::{PeerAckView, PeerSyncState, PeerSyncStateMachine};
use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::session::AckId;
use crate::types::{CharacterSnapshot, DataHash, PairingStatus, PeerId, UserPermissions};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::*;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub alias: Option<String>,
    pub pairing: PairingStatus,
    pub permissions: UserPermissions,
    /// Character is currently rendered nearby
    pub visible: bool,
    sync: PeerSyncStateMachine,
    pub last_received_snapshot: Option<Arc<CharacterSnapshot>>,
    pub last_applied_hash: Option<DataHash>,
    /// Hash of the last snapshot we pushed to this peer
    pub last_sent_hash: Option<DataHash>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            alias: None,
            pairing: PairingStatus::default(),
            permissions: UserPermissions::default(),
            visible: false,
            sync: PeerSyncStateMachine::default(),
            last_received_snapshot: None,
            last_applied_hash: None,
            last_sent_hash: None,
            last_seen: None,
        }
    }

    pub fn sync_state(&self) -> &PeerSyncState {
        self.sync.state()
    }

    pub fn ack_view(&self) -> PeerAckView {
        self.sync.view()
    }

    /// Paired both ways and not paused.
    pub fn is_syncable(&self) -> bool {
        self.pairing == PairingStatus::Paired && self.permissions.allows_sync()
    }
}

/// Exclusive owner of [`Peer`] records. All mutation goes through the
/// guarded transitions of [`PeerSyncStateMachine`].
#[derive(Debug)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, Peer>>,
    clock: SharedClock,
}

impl PeerDirectory {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn upsert_peer(
        &self,
        id: PeerId,
        alias: Option<String>,
        pairing: PairingStatus,
        permissions: UserPermissions,
    ) {
        let mut peers = self.peers.write();
        let peer = peers.entry(id.clone()).or_insert_with(|| Peer::new(id));
        peer.alias = alias;
        peer.pairing = pairing;
        peer.permissions = permissions;
    }

    pub fn remove_peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Returns true when the peer just became visible.
    pub fn set_visible(&self, id: &PeerId, visible: bool) -> SyncResult<bool> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownPeer(id.clone()))?;
        let newly_visible = visible && !peer.visible;
        peer.visible = visible;
        if !visible {
            // Anything we sent is gone with the rendered character.
            peer.last_sent_hash = None;
        }
        Ok(newly_visible)
    }

    /// Visible peers data should flow to, in stable order.
    pub fn visible_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.visible && p.is_syncable())
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn pending_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.sync.is_pending())
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Optimistically marks peers stale the moment regeneration begins.
    pub fn begin_build(&self, ids: &[PeerId]) -> usize {
        let now = self.clock.now();
        let mut peers = self.peers.write();
        let mut marked = 0;
        for id in ids {
            if let Some(peer) = peers.get_mut(id) {
                peer.sync.begin_build(now);
                marked += 1;
            }
        }
        trace!(marked, "Marked peers as awaiting build");
        marked
    }

    pub fn cancel_build(&self, id: &PeerId) -> bool {
        self.peers
            .write()
            .get_mut(id)
            .map(|p| p.sync.cancel_build())
            .unwrap_or(false)
    }

    /// Starts awaiting `ack_id`. A push that leaves after a newer one was
    /// already sent does not displace it.
    pub fn mark_awaiting_ack(&self, id: &PeerId, ack_id: &AckId) -> bool {
        let now = self.clock.now();
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(id) else {
            return false;
        };
        if peer.sync.awaited_id().is_some_and(|awaited| awaited > ack_id) {
            trace!(peer = %id, %ack_id, "Newer acknowledgment already awaited");
            return false;
        }
        peer.sync.await_ack(ack_id.clone(), now);
        true
    }

    /// Resolves the peer's awaited exchange. Returns false, leaving the peer
    /// untouched, when `ack_id` is not what the peer is waiting on.
    pub fn record_acknowledgment(&self, id: &PeerId, ack_id: &AckId, success: bool) -> bool {
        let now = self.clock.now();
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(id) else {
            debug!(peer = %id, %ack_id, "Acknowledgment for unknown peer");
            return false;
        };

        match peer.sync.resolve(ack_id, success, now) {
            Ok(()) => {
                if !success {
                    // Force a full push next time.
                    peer.last_sent_hash = None;
                }
                true
            }
            Err(e) => {
                trace!(peer = %id, error = %e, "Ignoring acknowledgment outcome");
                false
            }
        }
    }

    pub fn ack_view(&self, id: &PeerId) -> Option<PeerAckView> {
        self.peers.read().get(id).map(Peer::ack_view)
    }

    pub fn is_pending(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .get(id)
            .map(|p| p.sync.is_pending())
            .unwrap_or(false)
    }

    pub fn awaited_id(&self, id: &PeerId) -> Option<AckId> {
        self.peers
            .read()
            .get(id)
            .and_then(|p| p.sync.awaited_id().cloned())
    }

    pub fn last_sent_hash(&self, id: &PeerId) -> Option<DataHash> {
        self.peers
            .read()
            .get(id)
            .and_then(|p| p.last_sent_hash.clone())
    }

    pub fn set_last_sent_hash(&self, id: &PeerId, hash: Option<DataHash>) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.last_sent_hash = hash;
        }
    }

    pub fn store_received(&self, id: &PeerId, snapshot: Arc<CharacterSnapshot>) -> SyncResult<()> {
        let now = self.clock.now();
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownPeer(id.clone()))?;
        peer.last_received_snapshot = Some(snapshot);
        peer.last_seen = Some(now);
        Ok(())
    }

    pub fn last_received(&self, id: &PeerId) -> Option<Arc<CharacterSnapshot>> {
        self.peers
            .read()
            .get(id)
            .and_then(|p| p.last_received_snapshot.clone())
    }

    pub fn mark_applied(&self, id: &PeerId, hash: DataHash) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.last_applied_hash = Some(hash);
        }
    }

    pub fn last_applied_hash(&self, id: &PeerId) -> Option<DataHash> {
        self.peers
            .read()
            .get(id)
            .and_then(|p| p.last_applied_hash.clone())
    }

    /// Liveness bump from a heartbeat.
    pub fn touch(&self, id: &PeerId) -> bool {
        let now = self.clock.now();
        match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.last_seen = Some(now);
                true
            }
            None => false,
        }
    }
}
