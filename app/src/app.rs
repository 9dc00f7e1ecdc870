use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigLoader, SyncConfig};
use crate::metrics;
use crate::peer::ApplicationEvents;
use crate::service::{Collaborators, SyncService};
use crate::testing::{LogNotifier, MemoryNetwork, MockRenderState, NoopUploader, StaticHashOracle};
use crate::types::{CharacterSnapshot, PairingStatus, PeerId, UserPermissions};
use clap::Parser;
use eyre::{eyre, Result};
use futures::pin_mut;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

/// Runs a group of peers over an in-memory network that loses messages,
/// pushing fresh snapshots each round and reporting acknowledgment metrics.
#[derive(Parser)]
#[command(author, about = "Peer-to-peer snapshot sync with delivery confirmation", long_about = None)]
pub struct App {
    /// TOML file with the sync configuration. Defaults with `SNAPSYNC_*`
    /// environment overrides otherwise.
    #[arg(long, env = "SNAPSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    pub peers: usize,

    /// Fraction of messages the simulated network drops
    #[arg(long = "drop-rate", default_value_t = 0.1)]
    pub drop_rate: f64,

    #[arg(long, default_value_t = 5)]
    pub rounds: u32,

    #[arg(long = "round-interval-ms", default_value_t = 2_000)]
    pub round_interval_ms: u64,

    /// Treat the whole run as a high-activity window
    #[arg(long, default_value_t = false)]
    pub activity: bool,

    #[arg(long = "metrics-port")]
    pub metrics_port: Option<u16>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("snapsync={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn load_config(&self) -> Result<SyncConfig> {
        let config = match &self.config {
            Some(path) => SyncConfig::load_from_file(path)?,
            None => SyncConfig::load_from_env()?,
        };
        Ok(config)
    }

    async fn execute(self) -> Result<()> {
        if self.peers < 2 {
            return Err(eyre!("need at least two peers, got {}", self.peers));
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(eyre!("drop rate must be within [0, 1], got {}", self.drop_rate));
        }

        let config = self.load_config()?;
        let network = MemoryNetwork::new(self.drop_rate);
        let clock: SharedClock = Arc::new(SystemClock);
        let names: Vec<PeerId> = (0..self.peers)
            .map(|i| PeerId::new(format!("peer-{i}")))
            .collect();

        let metrics_shutdown = CancellationToken::new();
        if self.metrics_port.is_some() {
            metrics::start_server(self.metrics_port, metrics_shutdown.clone()).await;
        }

        let mut nodes = Vec::with_capacity(names.len());
        for local in &names {
            let events = ApplicationEvents::default();
            let render = Arc::new(MockRenderState::new(events.clone(), true));
            let service = Arc::new(SyncService::new(
                local.clone(),
                config.clone(),
                Collaborators {
                    transport: network.transport_for(local.clone()),
                    oracle: Arc::new(StaticHashOracle::new(true)),
                    render: render.clone(),
                    uploader: Arc::new(NoopUploader::default()),
                    notifier: Arc::new(LogNotifier),
                    events,
                },
                clock.clone(),
            )?);

            for remote in names.iter().filter(|p| *p != local) {
                service.peers().upsert_peer(
                    remote.clone(),
                    None,
                    PairingStatus::Paired,
                    UserPermissions::default(),
                );
                service.peers().set_visible(remote, true)?;
                render.add_handle(remote);
            }

            service.attach_inbox(network.register(local.clone()));
            service.start();
            if self.activity {
                service.activity().enter_activity();
            }
            nodes.push(service);
        }

        info!(peers = nodes.len(), rounds = self.rounds, drop_rate = self.drop_rate, "Simulation started");

        let round_interval = Duration::from_millis(self.round_interval_ms);
        for round in 0..self.rounds {
            for node in &nodes {
                node.distributor().begin_regeneration();
                let snapshot = round_snapshot(node.local_id(), round);
                match node.distributor().publish(snapshot).await {
                    Ok(Some(id)) => debug!(local = %node.local_id(), %id, round, "Published"),
                    Ok(None) => debug!(local = %node.local_id(), round, "Nothing to publish"),
                    Err(e) => warn!(local = %node.local_id(), error = %e, round, "Publish failed"),
                }
            }
            tokio::time::sleep(round_interval).await;
        }

        // Leave room for the last round's replies and timeouts.
        tokio::time::sleep(round_interval).await;

        for node in &nodes {
            let report = serde_json::to_string(&node.metrics())?;
            info!(local = %node.local_id(), metrics = %report, "Final acknowledgment metrics");
            node.shutdown().await;
        }
        info!(
            delivered = network.delivered(),
            dropped = network.dropped(),
            "Simulation finished"
        );
        metrics_shutdown.cancel();

        Ok(())
    }
}

fn round_snapshot(owner: &PeerId, round: u32) -> CharacterSnapshot {
    let mut snapshot = CharacterSnapshot {
        manipulation_data: format!("{owner}:{round}"),
        ..Default::default()
    };
    snapshot.file_replacements.insert(
        "chara/equipment/top.mdl".to_string(),
        format!("{owner}-{round:04}"),
    );
    snapshot
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
