//! Wires the components together and drives them
//!
//! Each housekeeping concern runs as its own periodic task. All of them are
//! scoped by one [`CancellationToken`]; errors inside a tick are logged and
//! never end the task.

use crate::ack::{AcknowledgmentCoordinator, CoordinatorContext};
use crate::activity::ActivityMonitor;
use crate::clock::SharedClock;
use crate::config::{SyncConfig, Validate};
use crate::distributor::DataDistributor;
use crate::error::SyncResult;
use crate::interfaces::{FileUploader, HashOracle, NotificationSink, PlayerRenderState, Transport};
use crate::messages::SyncMessage;
use crate::metrics::AcknowledgmentMetrics;
use crate::peer::{ApplicationEvents, PeerAckView, PeerApplier, PeerDirectory};
use crate::session::SessionTracker;
use crate::types::PeerId;
use crate::watchdog::TimeoutWatchdog;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// External collaborators the service runs against.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub oracle: Arc<dyn HashOracle>,
    pub render: Arc<dyn PlayerRenderState>,
    pub uploader: Arc<dyn FileUploader>,
    pub notifier: Arc<dyn NotificationSink>,
    /// Bus the render state reports completed applications on
    pub events: ApplicationEvents,
}

#[derive(Debug)]
pub struct SyncService {
    local_id: PeerId,
    config: SyncConfig,
    peers: Arc<PeerDirectory>,
    session: Arc<SessionTracker>,
    activity: Arc<ActivityMonitor>,
    coordinator: Arc<AcknowledgmentCoordinator>,
    applier: Arc<PeerApplier>,
    watchdog: Arc<TimeoutWatchdog>,
    distributor: Arc<DataDistributor>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Validates `config` and builds every component. Invalid configuration
    /// is fatal.
    pub fn new(
        local_id: PeerId,
        config: SyncConfig,
        collaborators: Collaborators,
        clock: SharedClock,
    ) -> SyncResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let peers = Arc::new(PeerDirectory::new(clock.clone()));
        let session = Arc::new(SessionTracker::new(peers.clone(), clock.clone()));
        let activity = Arc::new(ActivityMonitor::new(
            config.acknowledgment.activity_timeout_multiplier,
        ));

        let coordinator = Arc::new(AcknowledgmentCoordinator::new(
            config.acknowledgment.clone(),
            CoordinatorContext {
                local_id: local_id.clone(),
                session: session.clone(),
                peers: peers.clone(),
                transport: collaborators.transport.clone(),
                notifier: collaborators.notifier.clone(),
                activity: activity.clone(),
                clock: clock.clone(),
            },
        )?);

        let applier = Arc::new(PeerApplier::new(
            local_id.clone(),
            config.apply.clone(),
            peers.clone(),
            collaborators.render.clone(),
            collaborators.transport.clone(),
            collaborators.events.clone(),
            shutdown.clone(),
        ));

        let watchdog = Arc::new(TimeoutWatchdog::new(
            config.watchdog.clone(),
            coordinator.clone(),
            peers.clone(),
            collaborators.oracle.clone(),
            applier.clone(),
            clock,
        ));

        let distributor = Arc::new(DataDistributor::new(
            local_id.clone(),
            peers.clone(),
            coordinator.clone(),
            collaborators.transport.clone(),
            collaborators.uploader.clone(),
        ));

        info!(local = %local_id, session = %session.session_id(), "Sync service ready");

        Ok(Self {
            local_id,
            config,
            peers,
            session,
            activity,
            coordinator,
            applier,
            watchdog,
            distributor,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn session(&self) -> &Arc<SessionTracker> {
        &self.session
    }

    pub fn activity(&self) -> &Arc<ActivityMonitor> {
        &self.activity
    }

    pub fn coordinator(&self) -> &Arc<AcknowledgmentCoordinator> {
        &self.coordinator
    }

    pub fn watchdog(&self) -> &Arc<TimeoutWatchdog> {
        &self.watchdog
    }

    pub fn distributor(&self) -> &Arc<DataDistributor> {
        &self.distributor
    }

    pub fn applier(&self) -> &Arc<PeerApplier> {
        &self.applier
    }

    pub fn metrics(&self) -> AcknowledgmentMetrics {
        self.coordinator.metrics()
    }

    pub fn peer_view(&self, peer: &PeerId) -> Option<PeerAckView> {
        self.peers.ack_view(peer)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns the periodic tasks.
    pub fn start(&self) {
        let maintenance = &self.config.maintenance;

        let coordinator = self.coordinator.clone();
        self.spawn_periodic("batch_sweep", maintenance.batch_sweep_interval, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.flush_due_batches().await;
            }
        });

        let coordinator = self.coordinator.clone();
        self.spawn_periodic("retry_scan", maintenance.retry_scan_interval, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.process_retries().await;
            }
        });

        let watchdog = self.watchdog.clone();
        self.spawn_periodic("timeout_check", self.config.watchdog.poll_interval, move || {
            let watchdog = watchdog.clone();
            async move {
                watchdog.check_acknowledgment_timeouts().await;
                watchdog.check_invalid_hash_timeouts().await;
            }
        });

        let coordinator = self.coordinator.clone();
        self.spawn_periodic("cache_cleanup", maintenance.cache_cleanup_interval, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.cleanup_cache();
            }
        });

        let distributor = self.distributor.clone();
        self.spawn_periodic(
            "heartbeat",
            self.config.distributor.heartbeat_interval,
            move || {
                let distributor = distributor.clone();
                async move {
                    distributor.send_heartbeats().await;
                }
            },
        );

        let session = self.session.clone();
        let max_age = maintenance.session_max_age;
        self.spawn_periodic("session_sweep", maintenance.session_sweep_interval, move || {
            let session = session.clone();
            async move {
                session.sweep(max_age);
            }
        });

        debug!(tasks = self.tasks.lock().len(), "Started periodic tasks");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        trace!(task = name, "Periodic task stopped");
                        break;
                    }
                    _ = interval.tick() => tick().await,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Pumps `inbox` into [`handle_incoming`](Self::handle_incoming) until shutdown.
    pub fn attach_inbox(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<SyncMessage>) {
        let service = self.clone();
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = inbox.recv() => match message {
                        Some(message) => service.handle_incoming(message),
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Routes one inbound message. Pushes are applied in the background.
    pub fn handle_incoming(&self, message: SyncMessage) {
        match message {
            SyncMessage::Push(push) => {
                trace!(from = %push.sender, hash = %push.hash, "Received push");
                let applier = self.applier.clone();
                let handle = tokio::spawn(async move {
                    applier.apply_push(push).await;
                });
                let mut tasks = self.tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
            SyncMessage::Ack(reply) => {
                if self.coordinator.process_acknowledgment(&reply) {
                    self.watchdog.cancel(&reply.ack_id, &reply.from);
                }
            }
            SyncMessage::Heartbeat(heartbeat) => {
                if !self.peers.touch(&heartbeat.sender) {
                    debug!(from = %heartbeat.sender, "Heartbeat from unknown peer");
                }
            }
        }
    }

    /// Stops every task and waits for them to finish. Batches still open are
    /// flushed first.
    pub async fn shutdown(&self) {
        let flushed = self.coordinator.flush_all().await;
        if flushed > 0 {
            debug!(flushed, "Flushed open batches before shutdown");
        }
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!(local = %self.local_id, "Sync service stopped");
    }
}
