//! ydl-dl - Download service entry point
//!
//! Wires the resolver, fetcher, tag repair, batch orchestrator and status
//! ledger together, runs the scheduler hooks and serves the HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ydl_common::config::{self as common_config, ROOT_FOLDER_ENV};
use ydl_common::events::EventBus;

use ydl_dl::config::{ApiKeys, DownloaderConfig};
use ydl_dl::services::scheduler::SCHEDULE_FILE_NAME;
use ydl_dl::services::tags::{ItunesCatalog, MusicCatalog, SpotifyCatalog};
use ydl_dl::services::{
    BatchOrchestrator, Downloads, Executor, ItemFetcher, LogNotifier, MediaDownloader, Resolver,
    Schedule, Scheduler, SoundCloudSite, TagRepairer, TagWriter, YouTubeApi, YtDlp,
};
use ydl_dl::AppState;

/// Command-line arguments for ydl-dl
#[derive(Parser, Debug)]
#[command(name = "ydl-dl")]
#[command(about = "Batch audio download service")]
#[command(version)]
struct Args {
    /// Root folder holding the database, schedule and downloads
    #[arg(short, long, env = "YDL_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// Configuration file (defaults to the platform location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configured one
    #[arg(short, long)]
    bind: Option<String>,

    /// yt-dlp executable
    #[arg(long, default_value = "yt-dlp", env = "YDL_YTDLP_BINARY")]
    ytdlp: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = match &args.config {
        Some(path) => common_config::load_toml_config(path)?,
        None => common_config::load_default_toml_config()?,
    };

    tracing_subscriber::registry()
        .with(common_config::env_filter(&toml_config.logging))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ydl-dl version {}", env!("CARGO_PKG_VERSION"));

    let root_folder = common_config::resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        Some(&toml_config),
    );
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    info!("Root folder: {}", root_folder.display());

    let mut config = DownloaderConfig::resolve(&root_folder, &toml_config)?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    tokio::fs::create_dir_all(&config.download_path)
        .await
        .context("Failed to create download directory")?;

    let db_path = root_folder.join("ydl.db");
    info!("Database: {}", db_path.display());
    let db = ydl_dl::db::init_database_pool(&db_path).await?;
    let event_bus = EventBus::new(100);

    // Remote lookups
    let keys = ApiKeys::resolve(&toml_config);
    let downloader: Arc<dyn MediaDownloader> = Arc::new(YtDlp::new(args.ytdlp));
    let resolver = Arc::new(Resolver::new(
        Arc::new(YouTubeApi::new(keys.youtube_api_key.clone())?),
        Arc::new(SoundCloudSite::new(Arc::clone(&downloader))?),
    ));

    let mut catalogs: Vec<Arc<dyn MusicCatalog>> = Vec::new();
    if let Some((id, secret)) = keys.spotify_credentials() {
        catalogs.push(Arc::new(SpotifyCatalog::new(id, secret)?));
    }
    catalogs.push(Arc::new(ItunesCatalog::new()?));

    let fetcher = Arc::new(ItemFetcher::new(
        resolver,
        downloader,
        Arc::new(TagRepairer::new(catalogs)),
        Arc::new(TagWriter::new()?),
        config.allowed_duration_minutes,
    ));

    let orchestrator = Arc::new(BatchOrchestrator::new(
        db.clone(),
        event_bus.clone(),
        Arc::clone(&fetcher),
        Arc::new(LogNotifier),
        config.download_path.clone(),
        config.item_delay,
    ));
    let executor = Arc::new(Executor::new(config.execution, config.workers));
    info!(mode = ?config.execution, workers = config.workers, "Executor ready");

    let downloads = Arc::new(Downloads::new(
        db.clone(),
        event_bus.clone(),
        fetcher,
        Arc::clone(&orchestrator),
        Arc::clone(&executor),
    ));

    let schedule = Schedule::load_or_init(
        &root_folder.join(SCHEDULE_FILE_NAME),
        Schedule::standard(Duration::from_secs(config.main_timer_minutes * 60)),
    )
    .await?;
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        orchestrator,
        executor,
        Duration::from_secs(config.playlist_live_time_minutes * 60),
        Duration::from_secs(config.single_task_grace_seconds),
        schedule,
    ));

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address))?;
    let state = AppState::new(db, event_bus, downloads, config);
    let app = ydl_dl::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    // Start hooks only touch tasks created before the scheduler existed
    let on_start = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run_on_start().await }
    });
    let cancel = CancellationToken::new();
    let timers = scheduler.spawn_timers(cancel.clone());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Err(e) = on_start.await {
        warn!(error = %e, "Start hooks ended abnormally");
    }
    for timer in timers {
        if let Err(e) = timer.await {
            warn!(error = %e, "Timer loop ended abnormally");
        }
    }
    scheduler.run_on_exit().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
