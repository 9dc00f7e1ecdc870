//! Acknowledgment coordinator
//!
//! Owns the per-priority batches and retry queues, the outstanding
//! [`PendingSend`]s, the outcome cache and the metrics. Send failures are
//! classified and handled here; nothing escapes to the periodic tasks that
//! drive it.

use super::batch::{Batch, BatchSlots};
use super::cache::OutcomeCache;
use super::retry::{retry_deadline, RetryPolicy, RetryQueue};
use super::types::*;
use crate::activity::ActivityMonitor;
use crate::clock::{elapsed_between, to_chrono, SharedClock};
use crate::config::{AcknowledgmentConfiguration, ConfigError, Validate};
use crate::error::{AckErrorCode, SyncResult, TransportError};
use crate::interfaces::{Notification, NotificationSink, Severity, Transport};
use crate::messages::{AckReply, DataPush, SyncMessage};
use crate::metrics::{AcknowledgmentMetrics, MetricEvent, ACK_PENDING};
use crate::peer::PeerDirectory;
use crate::session::{AckId, SessionTracker};
use crate::types::{AckPriority, PeerId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

/// Shared collaborators handed to the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorContext {
    pub local_id: PeerId,
    pub session: Arc<SessionTracker>,
    pub peers: Arc<PeerDirectory>,
    pub transport: Arc<dyn Transport>,
    pub notifier: Arc<dyn NotificationSink>,
    pub activity: Arc<ActivityMonitor>,
    pub clock: SharedClock,
}

#[derive(Debug)]
pub struct AcknowledgmentCoordinator {
    config: AcknowledgmentConfiguration,
    retry_policy: RetryPolicy,
    ctx: CoordinatorContext,
    /// Gate for read-modify-write on the open batches
    batches: Mutex<BatchSlots>,
    retries: Mutex<RetryQueue>,
    pending: Mutex<HashMap<PendingKey, PendingSend>>,
    cache: Mutex<OutcomeCache>,
    metrics: Mutex<AcknowledgmentMetrics>,
}

impl AcknowledgmentCoordinator {
    pub fn new(
        config: AcknowledgmentConfiguration,
        ctx: CoordinatorContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            retry_policy: RetryPolicy::from_config(&config),
            batches: Mutex::new(BatchSlots::new(config.max_batch_size, config.batch_timeout())),
            retries: Mutex::new(RetryQueue::default()),
            pending: Mutex::new(HashMap::new()),
            cache: Mutex::new(OutcomeCache::new(
                config.max_cache_size,
                config.cache_expiration(),
            )),
            metrics: Mutex::new(AcknowledgmentMetrics::default()),
            config,
            ctx,
        })
    }

    pub fn configuration(&self) -> &AcknowledgmentConfiguration {
        &self.config
    }

    pub fn metrics(&self) -> AcknowledgmentMetrics {
        self.metrics.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn queued_retries(&self) -> usize {
        self.retries.lock().len()
    }

    pub fn queued_in_batch(&self, priority: AckPriority) -> usize {
        self.batches.lock().queued(priority)
    }

    pub fn cached_outcome(&self, peer: &PeerId) -> Option<Acknowledgment> {
        self.cache
            .lock()
            .get(peer)
            .map(|entry| entry.acknowledgment.clone())
    }

    /// Whether the exchange behind `key` still awaits an outcome.
    pub fn is_outstanding(&self, key: &PendingKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Status of `peer`'s acknowledgment under `id`, outstanding or cached.
    pub fn acknowledgment_status(&self, id: &AckId, peer: &PeerId) -> Option<AckStatus> {
        let key = PendingKey {
            id: id.clone(),
            recipient: peer.clone(),
        };
        if let Some(pending) = self.pending.lock().get(&key) {
            return Some(pending.acknowledgment.status);
        }
        self.cache
            .lock()
            .get(peer)
            .filter(|entry| entry.acknowledgment.id == *id)
            .map(|entry| entry.acknowledgment.status)
    }

    /// Deadline for an acknowledgment of the given priority.
    pub fn timeout_for(&self, priority: AckPriority) -> Duration {
        self.ctx
            .activity
            .timeout_multiplier(self.config.base_timeout_for(priority))
    }

    /// Sends `request.snapshot` to its recipients and starts awaiting their
    /// acknowledgments. Returns `None` when there was nobody to send to.
    pub async fn dispatch(&self, request: DispatchRequest) -> SyncResult<Option<AckId>> {
        let DispatchRequest {
            mut recipients,
            snapshot,
            priority,
            batched,
        } = request;
        recipients.sort();
        recipients.dedup();
        if recipients.is_empty() {
            return Ok(None);
        }

        let id = self.ctx.session.generate_id();
        if !self.ctx.session.register_pending(recipients.iter().cloned(), &id) {
            warn!(ack_id = %id, "Could not register acknowledgment request");
            return Ok(None);
        }

        let push = DataPush::new(self.ctx.local_id.clone(), snapshot, Some(id.clone()));
        let now = self.ctx.clock.now();
        let timeout = self.timeout_for(priority);
        let use_batch = batched && self.config.enable_batching;

        {
            let mut pending = self.pending.lock();
            for recipient in &recipients {
                self.enforce_pending_limit(&mut pending, recipient);

                let mut acknowledgment = Acknowledgment::new(
                    id.clone(),
                    recipient.clone(),
                    push.hash.clone(),
                    priority,
                    now,
                );
                if use_batch {
                    acknowledgment.status = AckStatus::Batched;
                }
                let pending_send = PendingSend {
                    acknowledgment,
                    timeout_at: now + to_chrono(timeout),
                };
                pending.insert(pending_send.key(), pending_send);
            }
            ACK_PENDING.set(pending.len() as i64);
        }

        if self.ctx.activity.is_active() && self.ctx.activity.warn_once() {
            self.ctx.notifier.notify(Notification::new(
                Severity::Warning,
                "Delayed synchronization",
                "You are in a high-latency activity; paired players may take longer to confirm your appearance.",
            ));
        }

        debug!(
            ack_id = %id,
            priority = ?priority,
            recipients = recipients.len(),
            batched = use_batch,
            "Dispatching snapshot"
        );

        let item = Outbound {
            id: id.clone(),
            recipients,
            message: SyncMessage::Push(push),
            priority,
            created_at: now,
            retry_count: 0,
        };

        if use_batch {
            let full = self.batches.lock().push(item, now);
            if let Some(batch) = full {
                self.send_batch(batch).await;
            }
        } else {
            self.send_outbound(item).await;
        }

        Ok(Some(id))
    }

    /// Drops the oldest outstanding sends of `recipient` until one more fits.
    fn enforce_pending_limit(&self, pending: &mut HashMap<PendingKey, PendingSend>, recipient: &PeerId) {
        loop {
            let mut own: Vec<(&PendingKey, &PendingSend)> = pending
                .iter()
                .filter(|(key, _)| key.recipient == *recipient)
                .collect();
            if own.len() < self.config.max_pending_per_user {
                return;
            }
            own.sort_by(|a, b| {
                a.1.acknowledgment
                    .created_at
                    .cmp(&b.1.acknowledgment.created_at)
                    .then_with(|| a.0.id.cmp(&b.0.id))
            });
            let oldest = own[0].0.clone();
            debug!(peer = %recipient, ack_id = %oldest.id, "Evicting oldest outstanding acknowledgment");
            pending.remove(&oldest);
        }
    }

    /// Flushes every batch that is full or past its timeout.
    pub async fn flush_due_batches(&self) -> usize {
        let now = self.ctx.clock.now();
        let due = self.batches.lock().take_due(now);
        let mut sent = 0;
        for batch in due {
            sent += batch.len();
            self.send_batch(batch).await;
        }
        sent
    }

    /// Flushes `priority`'s batch regardless of age.
    pub async fn flush_priority(&self, priority: AckPriority) -> usize {
        let batch = self.batches.lock().take(priority);
        match batch {
            Some(batch) => {
                let n = batch.len();
                self.send_batch(batch).await;
                n
            }
            None => 0,
        }
    }

    pub async fn flush_all(&self) -> usize {
        let batches = self.batches.lock().take_all();
        let mut sent = 0;
        for batch in batches {
            sent += batch.len();
            self.send_batch(batch).await;
        }
        sent
    }

    async fn send_batch(&self, batch: Batch) {
        trace!(priority = ?batch.priority, items = batch.len(), "Flushing batch");
        for item in batch.items {
            self.send_outbound(item).await;
        }
    }

    /// Resends every retry whose backoff elapsed.
    pub async fn process_retries(&self) -> usize {
        let now = self.ctx.clock.now();
        let ready = self.retries.lock().take_ready(now);
        let n = ready.len();
        for item in ready {
            debug!(ack_id = %item.id, attempt = item.retry_count, "Retrying send");
            self.send_outbound(item).await;
        }
        n
    }

    async fn send_outbound(&self, item: Outbound) {
        if item.retry_count == 0 {
            self.mark_in_flight(&item);
        }

        let send_timeout = self.config.send_timeout();
        let result = match tokio::time::timeout(
            send_timeout,
            self.ctx
                .transport
                .send(&item.recipients, item.message.clone(), Some(&item.id)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(send_timeout)),
        };

        match result {
            Ok(()) => self.on_sent(&item),
            Err(e) => self.on_send_failed(item, e),
        }
    }

    /// Peers start awaiting an acknowledgment once its push leaves, so a
    /// queued batch item leaves them untouched until it is flushed.
    fn mark_in_flight(&self, item: &Outbound) {
        for recipient in &item.recipients {
            self.ctx.peers.mark_awaiting_ack(recipient, &item.id);
        }
    }

    fn on_sent(&self, item: &Outbound) {
        let now = self.ctx.clock.now();
        let deadline = now + to_chrono(self.timeout_for(item.priority));
        let mut sent = Vec::new();
        {
            let mut pending = self.pending.lock();
            for recipient in &item.recipients {
                let key = PendingKey {
                    id: item.id.clone(),
                    recipient: recipient.clone(),
                };
                if let Some(entry) = pending.get_mut(&key) {
                    entry.acknowledgment.status = AckStatus::Sent;
                    entry.acknowledgment.sent_at = Some(now);
                    entry.acknowledgment.next_retry_at = None;
                    entry.timeout_at = deadline;
                    sent.push(entry.acknowledgment.clone());
                }
            }
        }

        {
            let mut cache = self.cache.lock();
            for acknowledgment in sent {
                cache.insert(acknowledgment, now);
            }
        }

        self.record(MetricEvent::Sent(item.priority));
        trace!(ack_id = %item.id, recipients = item.recipients.len(), "Sent");
    }

    fn on_send_failed(&self, mut item: Outbound, error: TransportError) {
        let code = error.code();

        if code.is_retryable() && self.retry_policy.can_retry(item.retry_count) {
            let delay = self.retry_policy.delay(item.retry_count);
            let now = self.ctx.clock.now();
            let next_retry_at = retry_deadline(now, delay);
            item.retry_count += 1;

            warn!(
                ack_id = %item.id,
                error = %error,
                attempt = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Send failed, scheduling retry"
            );

            {
                let mut pending = self.pending.lock();
                for recipient in &item.recipients {
                    let key = PendingKey {
                        id: item.id.clone(),
                        recipient: recipient.clone(),
                    };
                    if let Some(entry) = pending.get_mut(&key) {
                        entry.acknowledgment.status = AckStatus::Retrying;
                        entry.acknowledgment.retry_count = item.retry_count;
                        entry.acknowledgment.next_retry_at = Some(next_retry_at);
                        entry.acknowledgment.error_code = Some(code);
                    }
                }
            }

            self.retries.lock().schedule(item, next_retry_at);
            self.record(MetricEvent::Retried);
            return;
        }

        if code.is_terminal() {
            error!(ack_id = %item.id, error = %error, "Send failed permanently");
        } else {
            warn!(
                ack_id = %item.id,
                error = %error,
                attempts = item.retry_count + 1,
                "Giving up on send"
            );
        }
        self.fail_exchange(&item, code);
    }

    /// Ends every recipient's acknowledgment for `item` as failed.
    fn fail_exchange(&self, item: &Outbound, code: AckErrorCode) {
        let now = self.ctx.clock.now();
        let mut failed = Vec::new();
        {
            let mut pending = self.pending.lock();
            for recipient in &item.recipients {
                let key = PendingKey {
                    id: item.id.clone(),
                    recipient: recipient.clone(),
                };
                if let Some(mut entry) = pending.remove(&key) {
                    entry.acknowledgment.status = AckStatus::Failed;
                    entry.acknowledgment.error_code = Some(code);
                    entry.acknowledgment.resolved_at = Some(now);
                    entry.acknowledgment.retry_count = item.retry_count;
                    failed.push(entry.acknowledgment);
                }
            }
            ACK_PENDING.set(pending.len() as i64);
        }

        for acknowledgment in &failed {
            self.settle(&acknowledgment.id, &acknowledgment.recipient, false);
        }
        {
            let mut cache = self.cache.lock();
            for acknowledgment in failed {
                cache.insert(acknowledgment, now);
            }
        }

        self.record(MetricEvent::Failed(code));

        if code.is_terminal() {
            self.ctx.notifier.notify(Notification::new(
                Severity::Error,
                "Synchronization failed",
                format!(
                    "Could not send your appearance to {} paired player(s): {}",
                    item.recipients.len(),
                    code
                ),
            ));
        }
    }

    /// Handles an acknowledgment reply from a peer.
    ///
    /// Replies for another session, a superseded request or a recipient
    /// that is no longer awaited are dropped without touching any state.
    pub fn process_acknowledgment(&self, reply: &AckReply) -> bool {
        let session = &self.ctx.session;
        if !session.is_current_session(&reply.ack_id) {
            debug!(ack_id = %reply.ack_id, from = %reply.from, "Acknowledgment from another session");
            return false;
        }
        let awaited = session
            .recipients_of(&reply.ack_id)
            .map(|recipients| recipients.contains(&reply.from))
            .unwrap_or(false);
        if !awaited {
            debug!(ack_id = %reply.ack_id, from = %reply.from, "Stale or duplicate acknowledgment");
            return false;
        }

        let now = self.ctx.clock.now();
        let key = PendingKey {
            id: reply.ack_id.clone(),
            recipient: reply.from.clone(),
        };
        let entry = {
            let mut pending = self.pending.lock();
            let entry = pending.remove(&key);
            ACK_PENDING.set(pending.len() as i64);
            entry
        };

        if !session.resolve_with(&reply.ack_id, &reply.from, reply.success) {
            return false;
        }
        self.record(MetricEvent::Received);

        let response_time = entry
            .as_ref()
            .and_then(|e| e.acknowledgment.sent_at.or(Some(e.acknowledgment.created_at)))
            .map(|sent| elapsed_between(sent, now))
            .unwrap_or_default();

        let code = if reply.success {
            self.record(MetricEvent::Succeeded { response_time });
            None
        } else {
            let code = reply.error_code.unwrap_or(AckErrorCode::InvalidData);
            warn!(ack_id = %reply.ack_id, from = %reply.from, %code, "Peer failed to apply snapshot");
            self.record(MetricEvent::Failed(code));
            Some(code)
        };

        if let Some(mut entry) = entry {
            entry.acknowledgment.status = if reply.success {
                AckStatus::Resolved
            } else {
                AckStatus::Failed
            };
            entry.acknowledgment.error_code = code;
            entry.acknowledgment.resolved_at = Some(now);
            self.cache.lock().insert(entry.acknowledgment, now);
        }

        debug!(
            ack_id = %reply.ack_id,
            from = %reply.from,
            success = reply.success,
            response_ms = response_time.as_millis() as u64,
            "Acknowledgment received"
        );
        true
    }

    /// Marks every sent acknowledgment past its deadline as timed out and
    /// returns them. Each deadline is reported once.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<PendingSend> {
        let expired: Vec<PendingSend> = {
            let mut pending = self.pending.lock();
            pending
                .values_mut()
                .filter(|e| e.acknowledgment.status == AckStatus::Sent && e.timeout_at <= now)
                .map(|e| {
                    e.acknowledgment.status = AckStatus::TimedOut;
                    e.clone()
                })
                .collect()
        };

        for entry in &expired {
            debug!(
                ack_id = %entry.acknowledgment.id,
                peer = %entry.acknowledgment.recipient,
                "Acknowledgment deadline passed"
            );
            self.record(MetricEvent::TimedOut);
        }
        expired
    }

    /// The reply was lost but the data arrived: settle as success without
    /// resending anything.
    pub fn resolve_lost_reply(&self, expired: &PendingSend) -> bool {
        let Some(mut entry) = self.remove_pending(&expired.key()) else {
            return false;
        };
        let now = self.ctx.clock.now();
        let acknowledgment = &mut entry.acknowledgment;
        acknowledgment.status = AckStatus::Resolved;
        acknowledgment.resolved_at = Some(now);

        let response_time = elapsed_between(
            acknowledgment.sent_at.unwrap_or(acknowledgment.created_at),
            now,
        );
        self.settle(&acknowledgment.id, &acknowledgment.recipient, true);
        self.record(MetricEvent::Succeeded { response_time });

        info!(
            ack_id = %acknowledgment.id,
            peer = %acknowledgment.recipient,
            "Hash still current, treating missing acknowledgment as lost reply"
        );
        self.cache.lock().insert(entry.acknowledgment, now);
        true
    }

    /// Ends an outstanding acknowledgment as failed with `code`.
    pub fn fail_pending(&self, expired: &PendingSend, code: AckErrorCode) -> bool {
        let Some(mut entry) = self.remove_pending(&expired.key()) else {
            return false;
        };
        let now = self.ctx.clock.now();
        entry.acknowledgment.status = AckStatus::Failed;
        entry.acknowledgment.error_code = Some(code);
        entry.acknowledgment.resolved_at = Some(now);

        self.settle(&entry.acknowledgment.id, &entry.acknowledgment.recipient, false);
        self.record(MetricEvent::Failed(code));
        self.cache.lock().insert(entry.acknowledgment, now);
        true
    }

    /// Drops an outstanding acknowledgment whose peer already settled
    /// through another exchange. No metrics are recorded.
    pub fn discard_pending(&self, expired: &PendingSend) -> bool {
        self.remove_pending(&expired.key()).is_some()
    }

    fn remove_pending(&self, key: &PendingKey) -> Option<PendingSend> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(key);
        ACK_PENDING.set(pending.len() as i64);
        entry
    }

    /// Resolves through the session when the request is still tracked,
    /// otherwise settles the peer directly. The peer only moves if it is
    /// still awaiting exactly `id`.
    fn settle(&self, id: &AckId, peer: &PeerId, success: bool) {
        if !self.ctx.session.resolve_with(id, peer, success) {
            self.ctx.peers.record_acknowledgment(peer, id, success);
        }
    }

    pub fn cleanup_cache(&self) -> usize {
        let now = self.ctx.clock.now();
        let removed = self.cache.lock().cleanup(now);
        if removed > 0 {
            debug!(removed, "Cleaned up cached outcomes");
        }
        removed
    }

    fn record(&self, event: MetricEvent) {
        let now = self.ctx.clock.now();
        self.metrics.lock().record(event, now);
    }
}
