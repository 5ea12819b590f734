use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tailgate_core::Config;
use tailgate_gateway::auth::HeaderAuth;
use tailgate_gateway::ratelimit::RateLimiter;
use tailgate_gateway::{config, router, AppState};
use tailgate_kubehub::{KubeDiscovery, KubeLogSource};
use tailgate_stream::{LogBroker, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "tailgate", version, about = "Kubernetes log-streaming gateway")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the listen address from the config
    #[arg(long = "listen")]
    listen: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("TAILGATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg: Config = config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }

    let metrics_addr = cfg
        .metrics_addr
        .clone()
        .or_else(|| std::env::var("TAILGATE_METRICS_ADDR").ok());
    if let Some(addr) = metrics_addr {
        let sock: std::net::SocketAddr =
            addr.parse().with_context(|| format!("metrics addr {addr}"))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(sock)
            .install()
            .context("starting metrics exporter")?;
        info!(addr = %addr, "metrics exporter started");
    }

    let client = kube::Client::try_default()
        .await
        .context("building kube client")?;
    let source = Arc::new(KubeLogSource::new(client.clone()));
    let discovery = Arc::new(KubeDiscovery::new(client));
    let broker: Option<Arc<dyn LogBroker>> = match cfg.broker.clone() {
        Some(bcfg) => {
            info!(url = %bcfg.url, "shared-broker mode enabled");
            Some(Arc::new(
                tailgate_broker::RedisLogBroker::connect(bcfg)
                    .await
                    .context("connecting broker")?,
            ))
        }
        None => None,
    };

    let pool = WorkerPool::new(cfg.clone(), source, broker);
    let state = Arc::new(AppState {
        pool: Arc::clone(&pool),
        discovery,
        auth: Arc::new(HeaderAuth::default()),
        limiter: RateLimiter::new(cfg.rate_limit_per_minute, cfg.rate_limit_burst),
    });
    let app = router(state);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_terminate(cancel.clone()));

    info!(listen = %cfg.listen, cluster = %cfg.cluster, "gateway listening");
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    // Long-lived streams: serve with no write deadline and drain on signal.
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("serving")?;

    pool.shutdown(Duration::from_secs(10)).await;
    info!("gateway stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then cancel the root token.
async fn cancel_on_terminate(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        error!("could not install SIGTERM handler; shutting down");
        cancel.cancel();
        return;
    };
    select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, starting shutdown"),
        _ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
    }
    cancel.cancel();
}
