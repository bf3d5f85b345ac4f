//! AdWeave — event-driven orchestrator for the ad creative pipeline.
//!
//! Main entry point: wires the entity store, change feed, and stage
//! invoker together, starts the orchestrator, and serves the placement
//! planner over NATS request/reply.

use adweave_core::config::AppConfig;
use adweave_core::stage::Stage;
use adweave_orchestrator::{NatsInvoker, Orchestrator};
use adweave_planner::{plan, PlannerRequest};
use adweave_store::{EntityStore, MemoryStore, NatsChangeFeed, RedisStore};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "adweave")]
#[command(about = "Event-driven orchestrator for the ad creative pipeline")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "ADWEAVE__NODE_ID")]
    node_id: Option<String>,

    /// NATS server URL (overrides config)
    #[arg(long)]
    nats_url: Option<String>,

    /// Redis server URL (overrides config)
    #[arg(long)]
    redis_url: Option<String>,

    /// Recovery sweep interval in seconds (overrides config)
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Use the in-memory entity store instead of Redis (local development)
    #[arg(long, default_value_t = false)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adweave=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("AdWeave starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(url) = cli.nats_url {
        config.nats.urls = vec![url];
    }
    if let Some(url) = cli.redis_url {
        config.redis.urls = vec![url];
    }
    if let Some(secs) = cli.sweep_interval {
        config.orchestrator.sweep_interval_secs = secs;
    }

    info!(
        node_id = %config.node_id,
        nats_urls = ?config.nats.urls,
        subject_prefix = %config.nats.subject_prefix,
        sweep_interval_secs = config.orchestrator.sweep_interval_secs,
        "Configuration loaded"
    );

    // Connect NATS; the client reconnects on its own within the budget.
    let nats_client = async_nats::ConnectOptions::new()
        .max_reconnects(config.nats.max_reconnects)
        // Stage handlers run for tens of minutes; the invoker bounds each
        // request itself, so the client-level 10s default must not apply.
        .request_timeout(None)
        .name(config.node_id.clone())
        .connect(config.nats.urls.join(","))
        .await?;
    info!("NATS connection established");

    // Entity store: Redis in production, in-memory for local development.
    let store: Arc<dyn EntityStore> = if cli.memory {
        warn!("Using in-memory entity store, state is volatile");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::new(&config.redis).await?)
    };

    let feed = NatsChangeFeed::subscribe(&nats_client, &config.nats.subject_prefix).await?;
    let invoker = Arc::new(NatsInvoker::new(
        nats_client.clone(),
        config.nats.subject_prefix.clone(),
        Duration::from_secs(config.orchestrator.handler_timeout_secs),
    ));

    // The placement planner is pure computation; serve it in-process as a
    // queue-subscribed responder alongside the orchestrator.
    let planner_handle = tokio::spawn(serve_planner(
        nats_client.clone(),
        config.nats.subject_prefix.clone(),
    ));

    let orchestrator = Orchestrator::start(store, Box::new(feed), invoker, &config.orchestrator);
    info!("AdWeave is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    orchestrator.stop().await;
    planner_handle.abort();
    info!("AdWeave shut down");
    Ok(())
}

/// Answer placement-planning requests over NATS request/reply.
async fn serve_planner(client: async_nats::Client, subject_prefix: String) -> anyhow::Result<()> {
    let subject = format!("{subject_prefix}.{}", Stage::Planner.handler_subject());
    let mut requests = client
        .queue_subscribe(subject.clone(), "adweave-planner".to_string())
        .await?;
    info!(subject = %subject, "Placement planner serving");

    while let Some(msg) = requests.next().await {
        let request: PlannerRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed planner request, skipping");
                metrics::counter!("planner.decode_errors").increment(1);
                continue;
            }
        };

        let response = plan(&request);
        metrics::counter!("planner.requests").increment(1);

        let Some(reply) = msg.reply else {
            warn!("Planner request without reply subject, dropping response");
            continue;
        };
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize planner response");
                continue;
            }
        };
        if let Err(e) = client.publish(reply, bytes.into()).await {
            warn!(error = %e, "Failed to publish planner response");
        }
    }
    warn!("Planner subscription ended");
    Ok(())
}
