//! In-memory collaborators
//!
//! Used by the unit and scenario tests, and by the binary's simulation mode
//! where several services talk to each other through a [`MemoryNetwork`].

use crate::error::TransportError;
use crate::interfaces::{
    FileUploader, HashOracle, Notification, NotificationSink, PlayerRenderState, RenderHandle,
    Severity, Transport,
};
use crate::messages::SyncMessage;
use crate::peer::{ApplicationCompleted, ApplicationEvents};
use crate::session::AckId;
use crate::types::{CharacterSnapshot, DataHash, PeerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::*;

/// One call made against a mock transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipients: Vec<PeerId>,
    pub message: SyncMessage,
    pub ack_id: Option<AckId>,
}

/// Transport that records every send and fails on demand.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    failures: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<SentMessage>>,
    attempts: AtomicUsize,
}

impl ScriptedTransport {
    /// Queues an error for the next send attempt.
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Successful sends, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        recipients: &[PeerId],
        message: SyncMessage,
        ack_id: Option<&AckId>,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.sent.lock().push(SentMessage {
            recipients: recipients.to_vec(),
            message,
            ack_id: ack_id.cloned(),
        });
        Ok(())
    }
}

/// Lossy in-process network. Each registered peer gets an inbox; a message
/// to several recipients is dropped independently per recipient.
#[derive(Debug)]
pub struct MemoryNetwork {
    inboxes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<SyncMessage>>>,
    drop_rate: f64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new(drop_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
            drop_rate: drop_rate.clamp(0.0, 1.0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(peer, tx);
        rx
    }

    pub fn transport_for(self: &Arc<Self>, sender: PeerId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            sender,
        })
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: &PeerId, recipients: &[PeerId], message: &SyncMessage) {
        let inboxes = self.inboxes.lock();
        let mut rng = rand::thread_rng();
        for recipient in recipients {
            if self.drop_rate > 0.0 && rng.gen_bool(self.drop_rate) {
                trace!(%from, to = %recipient, kind = message.kind(), "Dropped message");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match inboxes.get(recipient) {
                Some(inbox) if inbox.send(message.clone()).is_ok() => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// A peer's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    sender: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        recipients: &[PeerId],
        message: SyncMessage,
        _ack_id: Option<&AckId>,
    ) -> Result<(), TransportError> {
        self.network.deliver(&self.sender, recipients, &message);
        Ok(())
    }
}

/// Oracle with a fixed default answer and per-hash overrides.
#[derive(Debug)]
pub struct StaticHashOracle {
    default_valid: AtomicBool,
    overrides: Mutex<HashMap<(PeerId, DataHash), bool>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl StaticHashOracle {
    pub fn new(default_valid: bool) -> Self {
        Self {
            default_valid: AtomicBool::new(default_valid),
            overrides: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, owner: &PeerId, hash: &DataHash, valid: bool) {
        self.overrides
            .lock()
            .insert((owner.clone(), hash.clone()), valid);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HashOracle for StaticHashOracle {
    async fn validate_hash(&self, owner: &PeerId, hash: &DataHash) -> Result<bool, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        Ok(self
            .overrides
            .lock()
            .get(&(owner.clone(), hash.clone()))
            .copied()
            .unwrap_or_else(|| self.default_valid.load(Ordering::SeqCst)))
    }
}

/// Render state whose handles are added by hand. With `auto_complete` every
/// application reports success on the events bus right away.
#[derive(Debug)]
pub struct MockRenderState {
    handles: Mutex<HashMap<PeerId, RenderHandle>>,
    events: ApplicationEvents,
    auto_complete: bool,
    applied: Mutex<Vec<(PeerId, DataHash)>>,
    polls: AtomicUsize,
    next_handle: AtomicU64,
}

impl MockRenderState {
    pub fn new(events: ApplicationEvents, auto_complete: bool) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            events,
            auto_complete,
            applied: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn add_handle(&self, peer: &PeerId) -> RenderHandle {
        let handle = RenderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.handles.lock().insert(peer.clone(), handle.clone());
        handle
    }

    pub fn remove_handle(&self, peer: &PeerId) {
        self.handles.lock().remove(peer);
    }

    pub fn handle_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<(PeerId, DataHash)> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl PlayerRenderState for MockRenderState {
    fn get_handle(&self, peer: &PeerId) -> Option<RenderHandle> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().get(peer).cloned()
    }

    async fn begin_apply(
        &self,
        _handle: &RenderHandle,
        peer: &PeerId,
        snapshot: &CharacterSnapshot,
    ) -> Result<(), TransportError> {
        let hash = snapshot.data_hash();
        self.applied.lock().push((peer.clone(), hash.clone()));
        if self.auto_complete {
            self.events.publish(ApplicationCompleted {
                peer: peer.clone(),
                hash,
                success: true,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.severity == severity)
            .count()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        debug!(title = %notification.title, "{}", notification.message);
        self.notifications.lock().push(notification);
    }
}

/// Notifier for the binary: toasts become log lines.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Info => info!(title = %notification.title, "{}", notification.message),
            Severity::Warning => warn!(title = %notification.title, "{}", notification.message),
            Severity::Error => error!(title = %notification.title, "{}", notification.message),
        }
    }
}

/// Pretends every referenced file is already uploaded.
#[derive(Debug, Default)]
pub struct NoopUploader {
    uploads: AtomicUsize,
    failures: Mutex<VecDeque<TransportError>>,
}

impl NoopUploader {
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }
}

#[async_trait]
impl FileUploader for NoopUploader {
    async fn upload_missing(&self, snapshot: &CharacterSnapshot) -> Result<usize, TransportError> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot.file_count())
    }
}
