use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulwark::config::BulwarkConfig;
use bulwark::http::{router, AppState, HttpServer, RateLimitState};
use bulwark::mesh::{spawn_membership_sync, Cluster};
use bulwark::ratelimit::{
    spawn_cleanup, CounterAdapter, DistributedRateLimiter, LocalRateLimiter, MemoryCounterAdapter,
    RateLimiterBackend,
};
use bulwark::sharding::ConsistentHashRing;
use bulwark::tasks::PeriodicTask;
use bulwark::upstream::RpcUpstream;

/// Request admission and resilience layer for the facilitator service.
#[derive(Parser, Debug)]
#[command(name = "bulwark", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Bulwark");

    let config = BulwarkConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        algorithm = ?config.rate_limiting.algorithm,
        distributed = config.rate_limiting.distributed,
        cluster = config.cluster.enabled,
        "Configuration loaded"
    );

    let mut tasks: Vec<PeriodicTask> = Vec::new();

    let cluster = if config.cluster.enabled {
        Some(Arc::new(Cluster::start(config.cluster.to_cluster_config()).await?))
    } else {
        None
    };

    let node_id = match &cluster {
        Some(cluster) => cluster.node_id().to_string(),
        None => config
            .cluster
            .node_id
            .clone()
            .unwrap_or_else(|| "local".to_string()),
    };

    let ring = Arc::new(RwLock::new(ConsistentHashRing::new(config.sharding.virtual_nodes)));
    ring.write().add_node(&node_id);
    if let Some(cluster) = &cluster {
        tasks.push(spawn_membership_sync(
            Arc::clone(cluster),
            Arc::clone(&ring),
            config.cluster.membership_sync_interval(),
        ));
    }

    let limit = config.rate_limiting.limit();
    let cleanup_interval = config.rate_limiting.cleanup_interval();
    let backend: Arc<dyn RateLimiterBackend> = if config.rate_limiting.distributed {
        let adapter: Arc<dyn CounterAdapter> = match &cluster {
            Some(cluster) => {
                tasks.push(cluster.spawn_counter_expiry(cleanup_interval));
                Arc::clone(cluster) as Arc<dyn CounterAdapter>
            }
            None => {
                let memory = MemoryCounterAdapter::new(config.store.max_entries);
                tasks.push(memory.store().spawn_sweeper(config.store.sweep_interval()));
                Arc::new(memory)
            }
        };

        let limiter = Arc::new(DistributedRateLimiter::with_category(
            adapter,
            limit,
            config.rate_limiting.category.clone(),
        ));
        let cleanup = Arc::clone(&limiter);
        tasks.push(PeriodicTask::spawn("distributed-limiter-cleanup", cleanup_interval, move || {
            let limiter = Arc::clone(&cleanup);
            async move {
                limiter.cleanup();
            }
        }));
        info!(category = %limiter.category(), "Using distributed rate limiter");
        limiter
    } else {
        let limiter = Arc::new(LocalRateLimiter::new(config.rate_limiting.algorithm, limit));
        tasks.push(spawn_cleanup(Arc::clone(&limiter), cleanup_interval));
        info!(algorithm = ?limiter.algorithm(), "Using local rate limiter");
        limiter
    };

    let upstream = RpcUpstream::from_config(&config.upstream, &config.resilience)?.map(Arc::new);

    let state = AppState {
        node_id,
        ring,
        upstream,
        replicas: config.sharding.replicas,
    };
    let app = router(state, RateLimitState::new(backend));

    let server = HttpServer::bind(config.server.http_addr).await?;
    let served = server.serve_with_shutdown(app, shutdown_signal()).await;

    for task in tasks {
        task.shutdown().await;
    }
    let left = match cluster {
        Some(cluster) => cluster.shutdown().await,
        None => Ok(()),
    };
    served?;
    left?;

    info!("Bulwark stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
