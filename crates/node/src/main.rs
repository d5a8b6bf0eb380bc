//! L2 Consensus Node
//!
//! Runs the consensus gossip protocol over the proposer snapshot database. With a
//! signer key configured the node also acts as batch scheduler: it opens and closes
//! batch periods on a timer and rotates the producer at each period boundary.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::NodeConfig;
use l2_consensus::{
    Address, Authority, BatchScheduler, BatchSchedulerBuilder, ConsensusProtocol, EventBus,
    KeyValueStore, ProducerSource, RotationEngine, SigningKey, SledStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tss_coordinator::{
    FailureClass, HttpSignerTransport, SlashRequest, SlashType, ThresholdSignatureCoordinator,
};

#[derive(Parser, Debug)]
#[command(name = "l2-consensus")]
#[command(about = "L2 sequencer rotation and batch-period gossip node")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the config
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default)
    Run(RunArgs),
    /// Ask the signer cluster for a slash transaction against a sequencer
    Slash(SlashArgs),
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Gossip bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Peer to dial at startup, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Hex signer key; enables the batch scheduler
    #[arg(long)]
    signer_key: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SlashArgs {
    /// Sequencer to slash
    #[arg(long)]
    address: Address,

    /// Batch in which the offence happened
    #[arg(long)]
    batch_index: u64,

    #[arg(long, value_enum, default_value = "liveness")]
    kind: SlashKind,

    /// Signer cluster endpoint, overrides the config
    #[arg(long)]
    tss_url: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SlashKind {
    Liveness,
    Culprit,
}

impl From<SlashKind> for SlashType {
    fn from(kind: SlashKind) -> Self {
        match kind {
            SlashKind::Liveness => SlashType::Liveness,
            SlashKind::Culprit => SlashType::Culprit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Some(Command::Slash(slash)) => run_slash(config, slash).await,
        Some(Command::Run(run)) => run_node(config, run).await,
        None => run_node(config, RunArgs::default()).await,
    }
}

async fn run_node(mut config: NodeConfig, args: RunArgs) -> Result<()> {
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    config.peers.extend(args.peers);
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if args.signer_key.is_some() {
        config.signer_key = args.signer_key;
    }

    let key = config
        .signer_key
        .as_deref()
        .map(SigningKey::from_hex)
        .transpose()
        .context("invalid signer key")?;

    let scheduler_address = match (config.scheduler_address, &key) {
        (Some(addr), _) => addr,
        (None, Some(key)) => key.address(),
        (None, None) => bail!("scheduler_address must be set when no signer key is configured"),
    };

    let network_key = match (&config.node_key, &key) {
        (Some(hex_key), _) => SigningKey::from_hex(hex_key).context("invalid node key")?,
        (None, Some(key)) => key.clone(),
        (None, None) => SigningKey::random(),
    };
    let node_id = network_key.address().to_string();

    tracing::info!("Starting L2 consensus node");
    tracing::info!("Node id: {}", node_id);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Scheduler: {}", scheduler_address);
    tracing::info!("Data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;
    let sled = Arc::new(SledStore::open(config.data_dir.join("proposers"))?);
    let store: Arc<dyn KeyValueStore> = sled.clone();

    let genesis = config.genesis_snapshot(scheduler_address)?;
    let engine = Arc::new(RotationEngine::open(store, genesis)?);
    let snapshot = engine.snapshot();
    tracing::info!(
        "Proposer snapshot at height {} (index {}, {} sequencers)",
        snapshot.number,
        snapshot.index,
        snapshot.sequencer_set.len()
    );

    let events = EventBus::new(config.consensus.event_capacity);
    let authority: Arc<dyn Authority> = engine.clone();
    let protocol = Arc::new(ConsensusProtocol::new(
        config.consensus.clone(),
        node_id,
        authority,
        events.clone(),
    ));

    let mut tasks = protocol.start_broadcast_loops();
    tasks.push(protocol.start(&config.listen_addr, network_key.clone()).await?);

    for peer in &config.peers {
        match protocol.dial(peer, &network_key).await {
            Ok(handle) => tasks.push(handle),
            Err(e) => tracing::warn!("Failed to dial {}: {}", peer, e),
        }
    }

    tasks.push(tokio::spawn(log_events(events.clone())));

    if let Some(key) = key {
        let producers: Arc<dyn ProducerSource> = engine.clone();
        let scheduler = Arc::new(
            BatchSchedulerBuilder::new()
                .period_span(config.consensus.epoch)
                .period_timeout(config.batch_interval_secs.saturating_mul(2))
                .build(key, producers, events.clone()),
        );
        tracing::info!("Batch scheduler enabled as {}", scheduler.address());

        let interval = Duration::from_secs(config.batch_interval_secs.max(1));
        let span = config.consensus.epoch.max(1);
        tasks.push(tokio::spawn(run_scheduler(
            scheduler,
            engine.clone(),
            interval,
            span,
        )));
    }

    let stats_protocol = protocol.clone();
    let stats_engine = engine.clone();
    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        loop {
            ticker.tick().await;
            let stats = stats_protocol.stats();
            let snapshot = stats_engine.snapshot();
            tracing::info!(
                "Stats: peers={}, received={}, accepted={}, rejected={}, broadcast={}, dropped={}, height={}, index={}",
                stats.connected_peers,
                stats.messages_received,
                stats.messages_accepted,
                stats.messages_rejected,
                stats.messages_broadcast,
                stats.messages_dropped,
                snapshot.number,
                snapshot.index
            );
        }
    }));

    tracing::info!("Node running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    protocol.shutdown();
    for task in tasks {
        task.abort();
    }
    sled.flush()?;

    Ok(())
}

/// Opens a period, closes it on the next tick and rotates the producer for the next one
async fn run_scheduler(
    scheduler: Arc<BatchScheduler>,
    engine: Arc<RotationEngine>,
    interval: Duration,
    span: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut start_height = engine.snapshot().number + 1;

    loop {
        ticker.tick().await;

        if scheduler.current_period().is_some() {
            let end_height = start_height + span - 1;
            if let Err(e) = scheduler.end_batch_period(end_height, Vec::new()) {
                tracing::error!("Failed to end batch period: {}", e);
                continue;
            }
            match engine.rotate(end_height, 1) {
                Ok(next) => tracing::info!("Next producer: {}", next.address),
                Err(e) => {
                    tracing::error!("Producer rotation failed: {}", e);
                    continue;
                }
            }
            start_height = end_height + 1;
        }

        if let Err(e) = scheduler.begin_batch_period(start_height) {
            tracing::error!("Failed to begin batch period at {}: {}", start_height, e);
        }
    }
}

/// Logs every accepted batch-period message
async fn log_events(events: EventBus) {
    let mut start = events.subscribe_start();
    let mut end = events.subscribe_end();
    let mut fraud = events.subscribe_fraud_proof_reorg();

    loop {
        tokio::select! {
            ev = start.recv() => match ev {
                Ok(ev) => tracing::info!(
                    batch_index = ev.msg.batch_index,
                    "Batch period start at {} by {}",
                    ev.msg.start_height,
                    ev.msg.miner_address
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event log lagged by {} start events", n),
                Err(RecvError::Closed) => break,
            },
            ev = end.recv() => match ev {
                Ok(ev) => tracing::info!(
                    batch_index = ev.msg.batch_index,
                    "Batch period end: heights {}..{}",
                    ev.msg.start_height,
                    ev.msg.end_height
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event log lagged by {} end events", n),
                Err(RecvError::Closed) => break,
            },
            ev = fraud.recv() => match ev {
                Ok(ev) => tracing::warn!(
                    reorg_index = ev.msg.reorg_index,
                    "Fraud proof reorg to height {}",
                    ev.msg.reorg_to_height
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event log lagged by {} reorg events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn run_slash(config: NodeConfig, args: SlashArgs) -> Result<()> {
    let url = match args.tss_url.or(config.tss_url) {
        Some(url) => url,
        None => bail!("no signer cluster endpoint configured (tss_url)"),
    };
    let transport =
        HttpSignerTransport::new(&url, Duration::from_secs(config.tss_timeout_secs.max(1)))?;
    let coordinator = ThresholdSignatureCoordinator::new(transport);

    let req = SlashRequest {
        address: args.address,
        batch_index: args.batch_index,
        sign_type: args.kind.into(),
    };

    if !coordinator.ask_slash(&req).await? {
        tracing::info!("Signer cluster declined to slash {}", req.address);
        return Ok(());
    }

    match coordinator.sign_slash(&req).await {
        Ok(resp) if resp.has_slash_tx() => {
            tracing::info!(
                "Slash transaction for {} (gas price {:?})",
                req.address,
                resp.slash_gas_price()
            );
            println!("0x{}", hex::encode(&resp.slash_tx_bytes));
            Ok(())
        }
        Ok(_) => {
            tracing::warn!("Signer cluster returned no slash transaction");
            Ok(())
        }
        Err(e) => match e.classify() {
            FailureClass::Escalate => {
                tracing::error!("Signing sabotaged: {}", e);
                bail!("culprits reported: {}", e)
            }
            FailureClass::Retryable => bail!("slash request failed, retry later: {}", e),
            FailureClass::Fatal => bail!("slash request rejected: {}", e),
        },
    }
}
