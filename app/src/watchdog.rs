//! Timeout watchdog
//!
//! A missing acknowledgment has two possible causes. Either the reply got
//! lost and the peer is fine, or the peer never ended up with our data. The
//! hash oracle tells them apart: a hash that is still current settles the
//! exchange as a success, a stale one starts a second, longer timer after
//! which the peer's last known data is forcibly re-applied.
//!
//! Invalid-hash timers are kept per exchange. Every timer ends by settling
//! its exchange, either as failed when the peer still awaits it or by
//! dropping it when the peer moved on.

use crate::ack::{AcknowledgmentCoordinator, PendingKey, PendingSend};
use crate::clock::{to_chrono, SharedClock};
use crate::config::WatchdogConfig;
use crate::error::AckErrorCode;
use crate::interfaces::HashOracle;
use crate::metrics::SELF_HEAL_REAPPLIES_TOTAL;
use crate::peer::{ApplyOutcome, PeerApplier, PeerDirectory};
use crate::session::AckId;
use crate::types::PeerId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// Hash confirmed current, resolved as success
    LostReply,
    /// Hash stale or unverifiable, invalid-hash timer started
    StaleHash,
    /// Resolved by someone else before we got to it
    AlreadySettled,
}

#[derive(Debug, Clone)]
pub struct TimeoutResolution {
    pub pending: PendingSend,
    pub verdict: TimeoutVerdict,
}

#[derive(Debug, Clone)]
struct InvalidHashTimer {
    pending: PendingSend,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TimeoutWatchdog {
    config: WatchdogConfig,
    coordinator: Arc<AcknowledgmentCoordinator>,
    peers: Arc<PeerDirectory>,
    oracle: Arc<dyn HashOracle>,
    applier: Arc<PeerApplier>,
    clock: SharedClock,
    invalid_hash: Mutex<HashMap<PendingKey, InvalidHashTimer>>,
}

impl TimeoutWatchdog {
    pub fn new(
        config: WatchdogConfig,
        coordinator: Arc<AcknowledgmentCoordinator>,
        peers: Arc<PeerDirectory>,
        oracle: Arc<dyn HashOracle>,
        applier: Arc<PeerApplier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            coordinator,
            peers,
            oracle,
            applier,
            clock,
            invalid_hash: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check_acknowledgment_timeouts(&self) -> Vec<TimeoutResolution> {
        let now = self.clock.now();
        let expired = self.coordinator.take_expired(now);
        let mut resolutions = Vec::with_capacity(expired.len());

        for pending in expired {
            let peer = pending.acknowledgment.recipient.clone();
            let hash = pending.acknowledgment.data_hash.clone();

            let still_current = match self.oracle.validate_hash(&peer, &hash).await {
                Ok(valid) => valid,
                Err(e) => {
                    warn!(peer = %peer, %hash, error = %e, "Hash validation failed, treating as stale");
                    false
                }
            };

            let verdict = if still_current {
                if self.coordinator.resolve_lost_reply(&pending) {
                    TimeoutVerdict::LostReply
                } else {
                    TimeoutVerdict::AlreadySettled
                }
            } else {
                let expires_at = self.clock.now() + to_chrono(self.config.invalid_hash_timeout);
                info!(
                    peer = %peer,
                    ack_id = %pending.acknowledgment.id,
                    "Peer no longer holds the sent hash, waiting before self-heal"
                );
                self.invalid_hash.lock().insert(
                    pending.key(),
                    InvalidHashTimer {
                        pending: pending.clone(),
                        expires_at,
                    },
                );
                TimeoutVerdict::StaleHash
            };

            resolutions.push(TimeoutResolution { pending, verdict });
        }
        resolutions
    }

    /// Self-heals every peer whose invalid-hash timer ran out while it was
    /// still awaiting that exchange, and settles every due exchange.
    /// Returns how many re-applications were triggered.
    pub async fn check_invalid_hash_timeouts(&self) -> usize {
        let now = self.clock.now();
        let mut due: Vec<InvalidHashTimer> = {
            let mut timers = self.invalid_hash.lock();
            let keys: Vec<PendingKey> = timers
                .iter()
                .filter(|(_, t)| t.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| timers.remove(&k)).collect()
        };
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));

        let mut healed: HashSet<PeerId> = HashSet::new();
        for timer in due {
            let key = timer.pending.key();
            let peer = key.recipient.clone();

            if !self.coordinator.is_outstanding(&key) {
                trace!(peer = %peer, ack_id = %key.id, "Exchange settled during invalid-hash window");
                continue;
            }
            if self.peers.awaited_id(&peer).as_ref() != Some(&key.id) {
                trace!(peer = %peer, ack_id = %key.id, "Peer moved past this exchange");
                self.coordinator.discard_pending(&timer.pending);
                continue;
            }

            if healed.insert(peer.clone()) {
                warn!(peer = %peer, ack_id = %key.id, "Peer still pending after invalid-hash window, forcing re-application");
                SELF_HEAL_REAPPLIES_TOTAL.inc();
                match self.applier.force_reapply(&peer).await {
                    Ok(ApplyOutcome::Failed(code)) => {
                        warn!(peer = %peer, %code, "Forced re-application failed")
                    }
                    Ok(_) => debug!(peer = %peer, "Forced re-application done"),
                    Err(e) => warn!(peer = %peer, error = %e, "Nothing to re-apply"),
                }
            }

            self.coordinator
                .fail_pending(&timer.pending, AckErrorCode::HashVerificationFailed);
        }
        healed.len()
    }

    /// Stops the invalid-hash timer of `peer`'s exchange `id`, e.g. because
    /// its reply arrived. Timers of other exchanges keep running.
    pub fn cancel(&self, id: &AckId, peer: &PeerId) -> bool {
        let key = PendingKey {
            id: id.clone(),
            recipient: peer.clone(),
        };
        self.invalid_hash.lock().remove(&key).is_some()
    }

    pub fn pending_invalid_hash(&self, peer: &PeerId) -> bool {
        self.invalid_hash
            .lock()
            .keys()
            .any(|key| key.recipient == *peer)
    }

    pub fn invalid_hash_timers(&self) -> usize {
        self.invalid_hash.lock().len()
    }
}
