//! Cross-component scenarios

mod round_trip_tests;

use crate::clock::ManualClock;
use crate::config::SyncConfig;
use crate::interfaces::Transport;
use crate::peer::ApplicationEvents;
use crate::service::{Collaborators, SyncService};
use crate::testing::mocks::*;
use crate::types::{CharacterSnapshot, PairingStatus, PeerId, UserPermissions};
use std::sync::Arc;

/// One service wired to scripted collaborators and a manual clock.
pub(crate) struct Node {
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub oracle: Arc<StaticHashOracle>,
    pub render: Arc<MockRenderState>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: Arc<SyncService>,
}

impl Node {
    pub fn new(config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let transport = Arc::new(ScriptedTransport::default());
        let oracle = Arc::new(StaticHashOracle::new(true));
        let events = ApplicationEvents::default();
        let render = Arc::new(MockRenderState::new(events.clone(), true));
        let notifier = Arc::new(RecordingNotifier::default());

        let service = SyncService::new(
            PeerId::from("me"),
            config,
            Collaborators {
                transport: transport.clone(),
                oracle: oracle.clone(),
                render: render.clone(),
                uploader: Arc::new(NoopUploader::default()),
                notifier: notifier.clone(),
                events,
            },
            clock.clone(),
        )
        .expect("valid configuration");

        Self {
            clock,
            transport,
            oracle,
            render,
            notifier,
            service: Arc::new(service),
        }
    }

    pub fn add_visible_peer(&self, name: &str) -> PeerId {
        add_visible_peer(&self.service, name)
    }
}

pub(crate) fn add_visible_peer(service: &SyncService, name: &str) -> PeerId {
    let id = PeerId::from(name);
    service.peers().upsert_peer(
        id.clone(),
        Some(name.to_uppercase()),
        PairingStatus::Paired,
        UserPermissions::default(),
    );
    service
        .peers()
        .set_visible(&id, true)
        .expect("peer was just added");
    id
}

/// Config with batching off so pushes leave immediately.
pub(crate) fn direct_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.acknowledgment.enable_batching = false;
    config
}

pub(crate) fn snapshot(tag: &str) -> CharacterSnapshot {
    let mut snapshot = CharacterSnapshot {
        manipulation_data: format!("manip-{tag}"),
        ..Default::default()
    };
    snapshot
        .file_replacements
        .insert("chara/equipment/top.mdl".into(), format!("{tag}-FILE"));
    snapshot
}

/// Builds a service on `network` under `name`, with its inbox attached.
pub(crate) fn networked_service(
    network: &Arc<MemoryNetwork>,
    name: &str,
    config: SyncConfig,
) -> (Arc<SyncService>, Arc<MockRenderState>) {
    let id = PeerId::from(name);
    let events = ApplicationEvents::default();
    let render = Arc::new(MockRenderState::new(events.clone(), true));
    let transport: Arc<dyn Transport> = network.transport_for(id.clone());

    let service = Arc::new(
        SyncService::new(
            id.clone(),
            config,
            Collaborators {
                transport,
                oracle: Arc::new(StaticHashOracle::new(true)),
                render: render.clone(),
                uploader: Arc::new(NoopUploader::default()),
                notifier: Arc::new(RecordingNotifier::default()),
                events,
            },
            Arc::new(ManualClock::starting_now()),
        )
        .expect("valid configuration"),
    );
    service.attach_inbox(network.register(id));
    (service, render)
}
