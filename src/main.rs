use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blog_api::http::{self, AppState};
use blog_api::scheduler::{PostScheduler, SchedulerConfig, SqlitePostSource};
use blog_api::throttle::AuthThrottle;
use blog_api::{config, db};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    if cfg.scheduler.backlog_warn_threshold >= cfg.scheduler.queue_capacity {
        warn!(
            threshold = cfg.scheduler.backlog_warn_threshold,
            capacity = cfg.scheduler.queue_capacity,
            "backlog warning threshold is not below queue capacity; it will never fire"
        );
    }

    let pool = db::init_pool(&cfg.database.url).await?;
    db::run_migrations(&pool).await?;

    let scheduler = PostScheduler::new(
        Arc::new(SqlitePostSource::new(pool.clone())),
        SchedulerConfig::from(&cfg.scheduler),
    );
    let throttle = AuthThrottle::from_config(&cfg.throttle);
    let state = Arc::new(AppState::new(
        pool.clone(),
        &cfg,
        throttle,
        scheduler.stats(),
    ));

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr()).await?;
    info!(addr = %listener.local_addr()?, "blog api listening");

    let shutdown_timeout = Duration::from_secs(cfg.server.shutdown_timeout_secs);
    axum::serve(
        listener,
        http::build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
        await_scheduler(scheduler_task, shutdown_timeout).await;
    })
    .await?;

    pool.close().await;
    info!("blog api stopped");
    Ok(())
}

async fn await_scheduler(task: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(?err, "scheduler task failed"),
        Err(_) => warn!(?timeout, "scheduler did not stop in time"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
