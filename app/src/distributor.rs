//! Decides who needs our latest snapshot and pushes it

use crate::ack::{AcknowledgmentCoordinator, DispatchRequest};
use crate::error::{SyncError, SyncResult};
use crate::interfaces::{FileUploader, Transport};
use crate::messages::{Heartbeat, SyncMessage};
use crate::peer::PeerDirectory;
use crate::session::AckId;
use crate::types::{AckPriority, CharacterSnapshot, DataHash, PeerId};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::*;

#[derive(Debug, Clone)]
struct Published {
    snapshot: Arc<CharacterSnapshot>,
    hash: DataHash,
}

#[derive(Debug)]
pub struct DataDistributor {
    local_id: PeerId,
    peers: Arc<PeerDirectory>,
    coordinator: Arc<AcknowledgmentCoordinator>,
    transport: Arc<dyn Transport>,
    uploader: Arc<dyn FileUploader>,
    current: RwLock<Option<Published>>,
}

impl DataDistributor {
    pub fn new(
        local_id: PeerId,
        peers: Arc<PeerDirectory>,
        coordinator: Arc<AcknowledgmentCoordinator>,
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn FileUploader>,
    ) -> Self {
        Self {
            local_id,
            peers,
            coordinator,
            transport,
            uploader,
            current: RwLock::new(None),
        }
    }

    pub fn current_hash(&self) -> Option<DataHash> {
        self.current.read().as_ref().map(|p| p.hash.clone())
    }

    /// Local data started changing: everyone we sync with is stale until the
    /// new snapshot reaches them.
    pub fn begin_regeneration(&self) -> usize {
        let visible = self.peers.visible_peers();
        self.peers.begin_build(&visible)
    }

    /// Records `snapshot` as current and pushes it to every visible peer
    /// that does not already have it.
    pub async fn publish(&self, snapshot: CharacterSnapshot) -> SyncResult<Option<AckId>> {
        let published = Published {
            hash: snapshot.data_hash(),
            snapshot: Arc::new(snapshot),
        };
        *self.current.write() = Some(published.clone());

        let mut targets = Vec::new();
        for peer in self.peers.visible_peers() {
            if self.peers.last_sent_hash(&peer).as_ref() == Some(&published.hash) {
                self.peers.cancel_build(&peer);
            } else {
                targets.push(peer);
            }
        }

        info!(hash = %published.hash, targets = targets.len(), "Publishing snapshot");
        self.push(&published, targets, AckPriority::Medium, true).await
    }

    /// Pushes the current snapshot to a peer whose character just appeared.
    pub async fn peer_became_visible(&self, peer: &PeerId) -> SyncResult<Option<AckId>> {
        let newly_visible = self.peers.set_visible(peer, true)?;
        let Some(published) = self.current.read().clone() else {
            return Ok(None);
        };
        if !newly_visible && self.peers.last_sent_hash(peer).as_ref() == Some(&published.hash) {
            return Ok(None);
        }
        if !self.peers.visible_peers().contains(peer) {
            trace!(peer = %peer, "Visible peer is not syncable");
            return Ok(None);
        }
        self.push(&published, vec![peer.clone()], AckPriority::High, false)
            .await
    }

    /// Re-pushes the current snapshot regardless of what was sent before.
    pub async fn force_push(&self, peers: &[PeerId]) -> SyncResult<Option<AckId>> {
        let published = self.current.read().clone().ok_or(SyncError::NoSnapshot)?;
        let visible = self.peers.visible_peers();
        let targets: Vec<PeerId> = peers
            .iter()
            .filter(|p| visible.contains(p))
            .cloned()
            .collect();
        self.push(&published, targets, AckPriority::High, false).await
    }

    async fn push(
        &self,
        published: &Published,
        targets: Vec<PeerId>,
        priority: AckPriority,
        batched: bool,
    ) -> SyncResult<Option<AckId>> {
        if targets.is_empty() {
            return Ok(None);
        }

        match self.uploader.upload_missing(&published.snapshot).await {
            Ok(uploaded) => trace!(uploaded, "Uploaded missing files"),
            Err(e) => {
                warn!(error = %e, "Upload failed, not pushing");
                for peer in &targets {
                    self.peers.cancel_build(peer);
                }
                return Err(e.into());
            }
        }

        // Recorded up front so a send that fails during dispatch clears it
        // again instead of being overwritten afterwards.
        for peer in &targets {
            self.peers
                .set_last_sent_hash(peer, Some(published.hash.clone()));
        }

        let result = self
            .coordinator
            .dispatch(DispatchRequest {
                recipients: targets.clone(),
                snapshot: (*published.snapshot).clone(),
                priority,
                batched,
            })
            .await;

        if !matches!(result, Ok(Some(_))) {
            for peer in &targets {
                self.peers.set_last_sent_hash(peer, None);
            }
        }
        result
    }

    /// Silent liveness re-send to peers already holding the current hash.
    pub async fn send_heartbeats(&self) -> usize {
        let Some(hash) = self.current_hash() else {
            return 0;
        };
        let targets: Vec<PeerId> = self
            .peers
            .visible_peers()
            .into_iter()
            .filter(|p| {
                self.peers.last_sent_hash(p).as_ref() == Some(&hash) && !self.peers.is_pending(p)
            })
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let heartbeat = SyncMessage::Heartbeat(Heartbeat {
            sender: self.local_id.clone(),
            hash,
        });
        match self.transport.send(&targets, heartbeat, None).await {
            Ok(()) => {
                trace!(peers = targets.len(), "Sent heartbeats");
                targets.len()
            }
            Err(e) => {
                warn!(error = %e, "Failed to send heartbeats");
                0
            }
        }
    }
}
