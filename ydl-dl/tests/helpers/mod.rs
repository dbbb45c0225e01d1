//! Shared fakes and harness for ydl-dl integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use ydl_common::events::EventBus;

use ydl_dl::config::{DownloaderConfig, ExecutionMode};
use ydl_dl::models::{AudioQuality, Owner, RawTrackInfo};
use ydl_dl::services::fetcher::{FetchError, FetchStage, MediaProbe};
use ydl_dl::services::resolver::{AudioTrack, PlaylistPage, ResolveError};
use ydl_dl::services::{
    AudioPlatform, BatchOrchestrator, Downloads, Executor, ItemFetcher, MediaDownloader, Notifier,
    Resolver, TagRepairer, TagWriter, VideoPlatform,
};
use ydl_dl::AppState;

/// Playlist id served by [`FakeVideos`]
pub const PLAYLIST_ID: &str = "PLfake";
pub const PLAYLIST_URL: &str = "https://www.youtube.com/playlist?list=PLfake";

/// Video id the platform knows nothing about
pub const UNKNOWN_ID: &str = "zzzzzzzzzzz";
/// Video id longer than any allowed duration
pub const LONG_ID: &str = "lllllllllll";

/// Eleven-character ids `vid00000001`, `vid00000002`, ...
pub fn video_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("vid{:08}", i)).collect()
}

pub struct FakeVideos {
    pub playlist: Vec<String>,
}

#[async_trait]
impl VideoPlatform for FakeVideos {
    async fn video_duration(&self, video_id: &str) -> Result<String, ResolveError> {
        match video_id {
            UNKNOWN_ID => Err(ResolveError::BadResource("No information about this video.".to_string())),
            LONG_ID => Ok("PT1H2M3S".to_string()),
            _ => Ok("PT3M5S".to_string()),
        }
    }

    async fn video_snippet(&self, video_id: &str) -> Result<RawTrackInfo, ResolveError> {
        Ok(RawTrackInfo {
            uploader: "Some Channel".to_string(),
            title: format!("Artist - Song {}", video_id),
            thumbnail: None,
        })
    }

    async fn playlist_page(
        &self,
        list_id: &str,
        _page_token: Option<&str>,
    ) -> Result<PlaylistPage, ResolveError> {
        if list_id != PLAYLIST_ID {
            return Err(ResolveError::BadResource("Playlist not found.".to_string()));
        }
        Ok(PlaylistPage {
            total_results: self.playlist.len() as i64,
            item_ids: self.playlist.clone(),
            next_page_token: None,
        })
    }
}

pub struct NoAudio;

#[async_trait]
impl AudioPlatform for NoAudio {
    async fn track(&self, _url: &str) -> Result<AudioTrack, ResolveError> {
        Err(ResolveError::BadResource("Url does not lead to audio.".to_string()))
    }

    async fn set_tracks(&self, _url: &str) -> Result<Vec<String>, ResolveError> {
        Err(ResolveError::BadResource("Url does not lead to audio.".to_string()))
    }
}

/// Writes `{id}.mp3` with fixed content and counts downloads per id
#[derive(Default)]
pub struct FakeDownloader {
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl FakeDownloader {
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

pub fn fake_audio(id: &str) -> Vec<u8> {
    format!("ID3 fake audio for {}", id).into_bytes()
}

#[async_trait]
impl MediaDownloader for FakeDownloader {
    async fn download_audio(
        &self,
        url: &str,
        dest_dir: &Path,
        _quality: AudioQuality,
        progress: mpsc::UnboundedSender<FetchStage>,
    ) -> Result<PathBuf, FetchError> {
        let id = url.rsplit('=').next().unwrap_or(url).to_string();
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(id.clone()).or_insert(0) += 1;

        let _ = progress.send(FetchStage::Downloading {
            percent: 100.0,
            speed: None,
        });
        let _ = progress.send(FetchStage::Converting);

        let path = dest_dir.join(format!("{}.mp3", id));
        tokio::fs::write(&path, fake_audio(&id)).await?;
        Ok(path)
    }

    async fn probe(&self, _url: &str) -> Result<MediaProbe, FetchError> {
        Err(FetchError::DownloadFailure("probe unsupported".to_string()))
    }
}

/// Records notices; with `stall` set, a ready notice never completes
#[derive(Default)]
pub struct RecordingNotifier {
    pub ready: Mutex<Vec<(Owner, Vec<String>)>>,
    pub failed: Mutex<Vec<Owner>>,
    pub stall: AtomicBool,
}

impl RecordingNotifier {
    /// Ready notices once at least `count` arrived (or after ~2 s)
    pub async fn wait_ready(&self, count: usize) -> Vec<(Owner, Vec<String>)> {
        for _ in 0..200 {
            let seen = self.ready.lock().unwrap().clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.ready.lock().unwrap().clone()
    }

    /// Failure notices once at least `count` arrived (or after ~2 s)
    pub async fn wait_failed(&self, count: usize) -> Vec<Owner> {
        for _ in 0..200 {
            let seen = self.failed.lock().unwrap().clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_ready(&self, owner: &Owner, errors: &[String]) {
        self.ready.lock().unwrap().push((owner.clone(), errors.to_vec()));
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn notify_failed(&self, owner: &Owner) {
        self.failed.lock().unwrap().push(owner.clone());
    }
}

/// Fully wired engine over fakes, rooted in a temporary directory
pub struct Harness {
    pub root: TempDir,
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub downloader: Arc<FakeDownloader>,
    pub notifier: Arc<RecordingNotifier>,
    pub fetcher: Arc<ItemFetcher>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub executor: Arc<Executor>,
    pub downloads: Arc<Downloads>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = ydl_dl::db::init_memory_pool().await.unwrap();
        Self::with_pool(db, ExecutionMode::Inline).await
    }

    pub async fn with_pool(db: SqlitePool, mode: ExecutionMode) -> Self {
        Self::build(db, mode, Duration::ZERO).await
    }

    /// Inline harness pacing batch items by `item_delay`
    pub async fn with_item_delay(item_delay: Duration) -> Self {
        let db = ydl_dl::db::init_memory_pool().await.unwrap();
        Self::build(db, ExecutionMode::Inline, item_delay).await
    }

    async fn build(db: SqlitePool, mode: ExecutionMode, item_delay: Duration) -> Self {
        let root = TempDir::new().unwrap();
        let event_bus = EventBus::new(1000);
        let downloader = Arc::new(FakeDownloader::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let resolver = Arc::new(Resolver::new(
            Arc::new(FakeVideos {
                playlist: video_ids(7),
            }),
            Arc::new(NoAudio),
        ));
        let fetcher = Arc::new(ItemFetcher::new(
            resolver,
            downloader.clone(),
            Arc::new(TagRepairer::offline()),
            Arc::new(TagWriter::new().unwrap()),
            20,
        ));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            db.clone(),
            event_bus.clone(),
            fetcher.clone(),
            notifier.clone(),
            root.path().join("downloads"),
            item_delay,
        ));
        let executor = Arc::new(Executor::new(mode, 2));
        let downloads = Arc::new(Downloads::new(
            db.clone(),
            event_bus.clone(),
            fetcher.clone(),
            orchestrator.clone(),
            executor.clone(),
        ));

        Self {
            root,
            db,
            event_bus,
            downloader,
            notifier,
            fetcher,
            orchestrator,
            executor,
            downloads,
        }
    }

    pub fn download_root(&self) -> PathBuf {
        self.root.path().join("downloads")
    }

    pub fn config(&self) -> DownloaderConfig {
        let mut config = DownloaderConfig::with_root(self.root.path());
        config.execution = self.executor.mode();
        config.item_delay = Duration::ZERO;
        config.playlist_part_size = 2;
        config
    }

    pub fn app(&self) -> axum::Router {
        let state = AppState::new(
            self.db.clone(),
            self.event_bus.clone(),
            self.downloads.clone(),
            self.config(),
        );
        ydl_dl::build_router(state)
    }
}
