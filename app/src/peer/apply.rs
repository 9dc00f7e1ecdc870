//! Receiving side: apply a pushed snapshot, then acknowledge it
//!
//! A reply is only sent once the render state reports that the snapshot was
//! actually applied to the peer's character. Every path that owes a reply
//! sends one, including timeouts and shutdown, so the sender never waits on
//! an exchange we silently abandoned.

use super::PeerDirectory;
use crate::config::ApplyConfig;
use crate::error::{AckErrorCode, SyncError, SyncResult};
use crate::interfaces::{PlayerRenderState, RenderHandle, Transport};
use crate::messages::{AckReply, DataPush, SyncMessage};
use crate::session::AckId;
use crate::types::{CharacterSnapshot, DataHash, PeerId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Raised by the render state when an application attempt finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationCompleted {
    pub peer: PeerId,
    pub hash: DataHash,
    pub success: bool,
}

/// Typed fan-out of [`ApplicationCompleted`] events.
#[derive(Debug, Clone)]
pub struct ApplicationEvents {
    tx: broadcast::Sender<ApplicationCompleted>,
}

impl ApplicationEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationCompleted> {
        self.tx.subscribe()
    }

    /// Best effort; returns how many listeners saw the event.
    pub fn publish(&self, event: ApplicationCompleted) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for ApplicationEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Hash was already on screen; nothing re-applied
    AlreadyApplied,
    Failed(AckErrorCode),
}

#[derive(Debug)]
pub struct PeerApplier {
    local_id: PeerId,
    config: ApplyConfig,
    peers: Arc<PeerDirectory>,
    render: Arc<dyn PlayerRenderState>,
    transport: Arc<dyn Transport>,
    events: ApplicationEvents,
    shutdown: CancellationToken,
}

impl PeerApplier {
    pub fn new(
        local_id: PeerId,
        config: ApplyConfig,
        peers: Arc<PeerDirectory>,
        render: Arc<dyn PlayerRenderState>,
        transport: Arc<dyn Transport>,
        events: ApplicationEvents,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local_id,
            config,
            peers,
            render,
            transport,
            events,
            shutdown,
        }
    }

    pub fn events(&self) -> &ApplicationEvents {
        &self.events
    }

    /// Applies `snapshot` pushed by `from` and acknowledges it if `ack_id`
    /// is set.
    pub async fn apply_data(
        &self,
        from: &PeerId,
        snapshot: Arc<CharacterSnapshot>,
        ack_id: Option<AckId>,
        forced: bool,
    ) -> ApplyOutcome {
        let hash = snapshot.data_hash();

        if let Err(e) = self.peers.store_received(from, snapshot.clone()) {
            warn!(peer = %from, error = %e, "Received data from unknown peer");
            return self
                .finish(from, &hash, ack_id, ApplyOutcome::Failed(e.code()))
                .await;
        }

        if !forced && self.peers.last_applied_hash(from).as_ref() == Some(&hash) {
            debug!(peer = %from, %hash, "Snapshot already applied");
            return self
                .finish(from, &hash, ack_id, ApplyOutcome::AlreadyApplied)
                .await;
        }

        let token = self.shutdown.child_token();
        let outcome = match self.apply_with_handle(from, &snapshot, &hash, &token).await {
            Ok(()) => {
                self.peers.mark_applied(from, hash.clone());
                ApplyOutcome::Applied
            }
            Err(code) => ApplyOutcome::Failed(code),
        };
        self.finish(from, &hash, ack_id, outcome).await
    }

    /// Entry point for an inbound push. Payloads whose hash does not match
    /// their content are refused.
    pub async fn apply_push(&self, push: DataPush) -> ApplyOutcome {
        let DataPush {
            sender,
            snapshot,
            hash,
            ack_id,
        } = push;

        if snapshot.data_hash() != hash {
            warn!(peer = %sender, %hash, "Pushed snapshot does not match its hash");
            return self
                .finish(&sender, &hash, ack_id, ApplyOutcome::Failed(AckErrorCode::DataCorrupted))
                .await;
        }
        self.apply_data(&sender, Arc::new(snapshot), ack_id, false).await
    }

    /// Unconditionally re-applies the last snapshot received from `peer`.
    pub async fn force_reapply(&self, peer: &PeerId) -> SyncResult<ApplyOutcome> {
        let snapshot = self.peers.last_received(peer).ok_or(SyncError::NoSnapshot)?;
        info!(peer = %peer, "Forcing re-application of last known data");
        Ok(self.apply_data(peer, snapshot, None, true).await)
    }

    async fn apply_with_handle(
        &self,
        peer: &PeerId,
        snapshot: &CharacterSnapshot,
        hash: &DataHash,
        token: &CancellationToken,
    ) -> Result<(), AckErrorCode> {
        let handle = self.wait_for_handle(peer, token).await?;

        // Subscribe first so a completion raised during begin_apply is seen.
        let mut completions = self.events.subscribe();
        self.render
            .begin_apply(&handle, peer, snapshot)
            .await
            .map_err(|e| {
                warn!(peer = %peer, error = %e, "Render state refused application");
                e.code()
            })?;

        let wait = async {
            loop {
                match completions.recv().await {
                    Ok(event) if event.peer == *peer && event.hash == *hash => {
                        return if event.success {
                            Ok(())
                        } else {
                            Err(AckErrorCode::InvalidData)
                        };
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Completion listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AckErrorCode::ServiceUnavailable)
                    }
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => Err(AckErrorCode::ServiceUnavailable),
            result = tokio::time::timeout(self.config.completion_timeout, wait) => {
                result.unwrap_or_else(|_| {
                    warn!(peer = %peer, "Timed out waiting for application to complete");
                    Err(AckErrorCode::Timeout)
                })
            }
        }
    }

    /// Polls for the peer's render handle until it shows up, the wait times
    /// out, or shutdown begins.
    async fn wait_for_handle(
        &self,
        peer: &PeerId,
        token: &CancellationToken,
    ) -> Result<RenderHandle, AckErrorCode> {
        let deadline = Instant::now() + self.config.handle_timeout;
        loop {
            if token.is_cancelled() {
                return Err(AckErrorCode::ServiceUnavailable);
            }
            if let Some(handle) = self.render.get_handle(peer) {
                return Ok(handle);
            }
            if Instant::now() >= deadline {
                warn!(peer = %peer, "Render handle never appeared, giving up");
                return Err(AckErrorCode::Timeout);
            }

            trace!(peer = %peer, "Render handle not ready, deferring");
            tokio::select! {
                _ = token.cancelled() => return Err(AckErrorCode::ServiceUnavailable),
                _ = tokio::time::sleep(self.config.handle_poll_interval) => {}
            }
        }
    }

    async fn finish(
        &self,
        from: &PeerId,
        hash: &DataHash,
        ack_id: Option<AckId>,
        outcome: ApplyOutcome,
    ) -> ApplyOutcome {
        let Some(ack_id) = ack_id else {
            return outcome;
        };

        let reply = match outcome {
            ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied => {
                AckReply::success(ack_id, self.local_id.clone(), hash.clone())
            }
            ApplyOutcome::Failed(code) => AckReply::failure(ack_id, self.local_id.clone(), code),
        };

        debug!(peer = %from, ack_id = %reply.ack_id, success = reply.success, "Acknowledging");
        if let Err(e) = self
            .transport
            .send(std::slice::from_ref(from), SyncMessage::Ack(reply), None)
            .await
        {
            warn!(peer = %from, error = %e, "Failed to send acknowledgment");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::mocks::{MockRenderState, ScriptedTransport};
    use crate::types::{PairingStatus, UserPermissions};
    use std::time::Duration;

    struct Harness {
        peers: Arc<PeerDirectory>,
        render: Arc<MockRenderState>,
        transport: Arc<ScriptedTransport>,
        shutdown: CancellationToken,
        applier: PeerApplier,
    }

    fn harness(auto_complete: bool) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let peers = Arc::new(PeerDirectory::new(clock));
        peers.upsert_peer(
            PeerId::from("sender"),
            None,
            PairingStatus::Paired,
            UserPermissions::default(),
        );
        let events = ApplicationEvents::default();
        let render = Arc::new(MockRenderState::new(events.clone(), auto_complete));
        let transport = Arc::new(ScriptedTransport::default());
        let shutdown = CancellationToken::new();
        let applier = PeerApplier::new(
            PeerId::from("me"),
            ApplyConfig::default(),
            peers.clone(),
            render.clone(),
            transport.clone(),
            events,
            shutdown.clone(),
        );
        Harness {
            peers,
            render,
            transport,
            shutdown,
            applier,
        }
    }

    fn snapshot() -> Arc<CharacterSnapshot> {
        Arc::new(CharacterSnapshot {
            manipulation_data: "glamour".into(),
            ..Default::default()
        })
    }

    fn sender() -> PeerId {
        PeerId::from("sender")
    }

    fn only_reply(transport: &ScriptedTransport) -> AckReply {
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].message {
            SyncMessage::Ack(reply) => reply.clone(),
            other => panic!("expected ack, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledges_only_after_completion() {
        let h = harness(true);
        h.render.add_handle(&sender());
        let id = AckId::compose(1, 1, 1);

        let outcome = h
            .applier
            .apply_data(&sender(), snapshot(), Some(id.clone()), false)
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let reply = only_reply(&h.transport);
        assert!(reply.success);
        assert_eq!(reply.ack_id, id);
        assert_eq!(reply.data_hash, Some(snapshot().data_hash()));
        assert_eq!(h.peers.last_applied_hash(&sender()), Some(snapshot().data_hash()));
    }

    #[tokio::test(start_paused = true)]
    async fn defers_until_handle_appears() {
        let h = harness(true);
        let render = h.render.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            render.add_handle(&PeerId::from("sender"));
        });

        let outcome = h
            .applier
            .apply_data(&sender(), snapshot(), Some(AckId::compose(1, 2, 2)), false)
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(h.render.handle_polls() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handle_still_sends_failure_ack() {
        let h = harness(true);
        let outcome = h
            .applier
            .apply_data(&sender(), snapshot(), Some(AckId::compose(1, 3, 3)), false)
            .await;
        assert_eq!(outcome, ApplyOutcome::Failed(AckErrorCode::Timeout));

        let reply = only_reply(&h.transport);
        assert!(!reply.success);
        assert_eq!(reply.error_code, Some(AckErrorCode::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_deferred_apply_with_failure_ack() {
        let h = harness(true);
        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });

        let outcome = h
            .applier
            .apply_data(&sender(), snapshot(), Some(AckId::compose(1, 4, 4)), false)
            .await;
        assert_eq!(outcome, ApplyOutcome::Failed(AckErrorCode::ServiceUnavailable));
        assert!(!only_reply(&h.transport).success);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_completion_times_out() {
        let h = harness(false);
        h.render.add_handle(&sender());
        let outcome = h
            .applier
            .apply_data(&sender(), snapshot(), Some(AckId::compose(1, 5, 5)), false)
            .await;
        assert_eq!(outcome, ApplyOutcome::Failed(AckErrorCode::Timeout));
        assert_eq!(h.render.applied().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_hash_is_not_reapplied_unless_forced() {
        let h = harness(true);
        h.render.add_handle(&sender());
        h.applier.apply_data(&sender(), snapshot(), None, false).await;

        let again = h
            .applier
            .apply_data(&sender(), snapshot(), Some(AckId::compose(1, 6, 6)), false)
            .await;
        assert_eq!(again, ApplyOutcome::AlreadyApplied);
        assert!(only_reply(&h.transport).success);
        assert_eq!(h.render.applied().len(), 1);

        let forced = h.applier.force_reapply(&sender()).await.unwrap();
        assert_eq!(forced, ApplyOutcome::Applied);
        assert_eq!(h.render.applied().len(), 2);
    }

    #[tokio::test]
    async fn tampered_push_is_refused() {
        let h = harness(true);
        h.render.add_handle(&sender());
        let mut push = DataPush::new(sender(), (*snapshot()).clone(), Some(AckId::compose(1, 7, 7)));
        push.snapshot.manipulation_data = "tampered".into();

        let outcome = h.applier.apply_push(push).await;
        assert_eq!(outcome, ApplyOutcome::Failed(AckErrorCode::DataCorrupted));
        assert_eq!(
            only_reply(&h.transport).error_code,
            Some(AckErrorCode::DataCorrupted)
        );
        assert!(h.render.applied().is_empty());
    }

    #[tokio::test]
    async fn force_reapply_needs_a_snapshot() {
        let h = harness(true);
        assert!(matches!(
            h.applier.force_reapply(&sender()).await,
            Err(SyncError::NoSnapshot)
        ));
    }
}
