mod config;
mod coordinator;
mod health;
mod manager;
mod names;
mod rewards;
mod round_sync;
mod server;
mod submission;
mod sysinfo;
mod trainer;
mod transplant;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarm_protocol::{GossipConfig, GossipNode};
use tokio::signal;
use tracing::Instrument;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, RoundSyncConfig, SubmissionConfig, TrainerConfig, TransplantConfig};

#[derive(Parser)]
#[command(name = "swarm-peer", about = "Swarm training peer", version)]
struct Cli {
    /// Coordinator bridge URL (e.g. http://localhost:8545)
    #[arg(long, env = "SWARM_COORDINATOR_URL")]
    coordinator: String,

    /// Address the gossip endpoint listens on
    #[arg(long, default_value = "0.0.0.0:7435", env = "SWARM_LISTEN")]
    listen: String,

    /// Address other peers reach us at
    #[arg(long, default_value = "127.0.0.1:7435", env = "SWARM_PUBLIC_ADDR")]
    public_addr: String,

    /// Seed peers, comma separated host:port
    #[arg(long, env = "SWARM_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Shared gossip auth token
    #[arg(long, default_value = "", env = "SWARM_TOKEN")]
    token: String,

    /// Gossip interval in seconds
    #[arg(
        long,
        default_value = "30",
        env = "SWARM_GOSSIP_INTERVAL",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    gossip_interval: u64,

    /// File holding this peer's id, created on first start
    #[arg(long, default_value = "swarm.id", env = "SWARM_IDENTITY")]
    identity: PathBuf,

    #[arg(long, default_value = "logs", env = "SWARM_LOG_DIR")]
    log_dir: PathBuf,

    #[arg(long, default_value = "1000000", env = "SWARM_MAX_ROUND")]
    max_round: u64,

    /// Stages per round
    #[arg(long, default_value = "1", env = "SWARM_MAX_STAGE")]
    max_stage: u64,

    /// Hours between reward submissions
    #[arg(long, default_value = "3.0", env = "SWARM_SUBMIT_FREQUENCY")]
    submit_frequency: f64,

    /// Seconds between coordinator polls when the lookup fails
    #[arg(long, default_value = "5", env = "SWARM_CHECK_INTERVAL")]
    check_interval: u64,

    /// Minimum seconds between repeated lookup-failure logs
    #[arg(long, default_value = "10", env = "SWARM_LOG_TIMEOUT")]
    log_timeout: u64,

    /// Backoff ceiling in seconds while waiting for the next round
    #[arg(long, default_value = "300", env = "SWARM_MAX_CHECK_INTERVAL")]
    max_check_interval: u64,

    /// Give up waiting for a round after this many seconds
    #[arg(long, default_value = "2678400", env = "SWARM_TRAIN_TIMEOUT")]
    train_timeout: u64,

    /// Generations per rollout; transplants stay off when unset
    #[arg(long, env = "SWARM_EXPECTED_GENERATIONS")]
    expected_generations: Option<usize>,

    /// Rollouts transplanted per round
    #[arg(long, default_value = "1", env = "SWARM_TRANSPLANTS")]
    transplants: usize,

    #[arg(long, default_value = health::DEFAULT_HEALTH_URL, env = "SWARM_HEALTH_URL")]
    health_url: String,

    /// Do not notify the local health endpoint
    #[arg(long, default_value = "false")]
    no_health_check: bool,

    /// Trainer program, run once per stage
    #[arg(long, default_value = "python3", env = "SWARM_TRAINER")]
    trainer: String,

    /// Working directory for the trainer
    #[arg(long, env = "SWARM_TRAINER_DIR")]
    trainer_dir: Option<PathBuf>,

    /// Stage timeout in seconds
    #[arg(long, default_value = "7200", env = "SWARM_STAGE_TIMEOUT")]
    stage_timeout: u64,

    /// Arguments passed to the trainer (after `--`)
    #[arg(last = true)]
    trainer_args: Vec<String>,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            coordinator_url: self.coordinator.clone(),
            log_dir: self.log_dir.clone(),
            health_url: (!self.no_health_check).then(|| self.health_url.clone()),
            max_round: self.max_round,
            max_stage: self.max_stage,
            round_sync: RoundSyncConfig {
                check_interval: Duration::from_secs(self.check_interval),
                log_timeout: Duration::from_secs(self.log_timeout),
                max_check_interval: Duration::from_secs(self.max_check_interval),
                train_timeout: Duration::from_secs(self.train_timeout),
            },
            submission: SubmissionConfig {
                submit_frequency: config::hours(self.submit_frequency),
                ..Default::default()
            },
            transplant: TransplantConfig {
                expected_generations: self.expected_generations,
                max_transplants: self.transplants,
            },
            trainer: TrainerConfig {
                program: self.trainer.clone(),
                args: self.trainer_args.clone(),
                working_dir: self.trainer_dir.clone(),
                stage_timeout: Duration::from_secs(self.stage_timeout),
            },
        }
    }

    fn gossip_config(&self, node_id: &str) -> GossipConfig {
        GossipConfig {
            node_id: node_id.to_string(),
            listen_addr: self.listen.clone(),
            public_addr: self.public_addr.clone(),
            seed_peers: self.seeds.clone(),
            gossip_interval_secs: self.gossip_interval,
            auth_token: self.token.clone(),
            ..Default::default()
        }
    }
}

/// Log to stdout and, without colours, to `training_<name>.log`.
fn init_logging(log_dir: &Path, display_name: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Cannot create log dir {}", log_dir.display()))?;
    let path = log_dir.join(format!("training_{display_name}.log"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Cannot open {}", path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let peer_id = config::load_or_create_peer_id(&cli.identity)?;
    let display_name = names::display_name(&peer_id);
    init_logging(&cli.log_dir, &display_name)?;

    let cfg = cli.config();
    tracing::info!(
        peer = %peer_id,
        name = %display_name,
        coordinator = %cfg.coordinator_url,
        version = env!("CARGO_PKG_VERSION"),
        "Starting swarm peer"
    );

    let info = sysinfo::SystemInfo::collect();
    if info.gpus.is_empty() {
        tracing::warn!("No GPU detected, training may run on CPU");
    }
    if let Err(e) = info.write_to(&cfg.log_dir) {
        tracing::warn!("Failed to write system info: {e:#}");
    }

    let node = Arc::new(GossipNode::new(cli.gossip_config(&peer_id)));

    let listener = tokio::net::TcpListener::bind(&node.config.listen_addr)
        .await
        .with_context(|| format!("Cannot listen on {}", node.config.listen_addr))?;
    tracing::info!("Gossip endpoint listening on {}", node.config.listen_addr);
    let app = server::create_router(Arc::new(server::ServerState {
        node: node.clone(),
        display_name: display_name.clone(),
        started_at: chrono::Utc::now(),
    }));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Gossip endpoint stopped: {e}");
        }
    });

    node.bootstrap().await?;
    let gossip = node.clone();
    tokio::spawn(async move { gossip.run_gossip_loop().await });

    let mut manager = manager::SwarmManager::new(
        &cfg,
        coordinator::HttpCoordinator::new(&cfg.coordinator_url),
        node,
        trainer::CommandTrainer::new(cfg.trainer.clone()),
        health::HealthNotifier::new(cfg.health_url.clone()),
    );

    let span = tracing::info_span!("peer", name = %display_name);
    tokio::select! {
        result = manager.run().instrument(span) => result?,
        _ = shutdown_signal() => tracing::info!("Shutting down gracefully"),
    }

    tracing::info!("Peer shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
