//! Single-item fetcher
//!
//! Downloads one remote item, converts it to MP3 at the requested bitrate
//! and optionally repairs its tags. The actual retrieval and transcoding is
//! delegated to a [`MediaDownloader`]; the production implementation drives
//! the `yt-dlp` binary (which in turn uses ffmpeg).

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ydl_common::events::{DownloadEvent, EventBus};

use crate::db::tasks;
use crate::models::task::progress;
use crate::models::AudioQuality;
use crate::services::resolver::{ItemInfo, ResolveError, Resolver};
use crate::services::tags::{TagRepairer, TagWriter};

/// Extension of every produced file
pub const OUTPUT_EXTENSION: &str = "mp3";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Duration not allowed: {0}")]
    DurationNotAllowed(String),

    /// Retrieval or transcoding failed for this item
    #[error("Download failed: {0}")]
    DownloadFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress reported by a downloader while it works
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStage {
    Downloading { percent: f32, speed: Option<String> },
    Converting,
}

/// Metadata read without downloading
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub uploader: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<u64>,
    /// Entry URLs when the probed link is a set/playlist
    pub entries: Vec<String>,
}

/// Black-box retrieval and transcoding
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Download `url` and convert it to MP3 at `quality`, placing the result
    /// under `dest_dir`. Stages are reported on `progress` as they happen.
    async fn download_audio(
        &self,
        url: &str,
        dest_dir: &Path,
        quality: AudioQuality,
        progress: mpsc::UnboundedSender<FetchStage>,
    ) -> Result<PathBuf, FetchError>;

    async fn probe(&self, url: &str) -> Result<MediaProbe, FetchError>;
}

/// Task the fetch reports its progress to
#[derive(Clone)]
pub struct TaskContext {
    pub db: SqlitePool,
    pub task_id: i64,
    pub event_bus: EventBus,
}

impl TaskContext {
    async fn report(&self, text: &str) {
        if let Err(e) = tasks::update_progress(&self.db, self.task_id, text).await {
            warn!(task_id = self.task_id, error = %e, "Failed to update task progress");
        }
        self.event_bus.emit_lossy(DownloadEvent::TaskProgress {
            task_id: self.task_id,
            progress: text.to_string(),
            timestamp: ydl_common::time::now(),
        });
    }
}

/// Fetches single items: download, convert, optional tag repair
pub struct ItemFetcher {
    resolver: Arc<Resolver>,
    downloader: Arc<dyn MediaDownloader>,
    repairer: Arc<TagRepairer>,
    writer: Arc<TagWriter>,
    allowed_duration_minutes: u64,
}

impl ItemFetcher {
    pub fn new(
        resolver: Arc<Resolver>,
        downloader: Arc<dyn MediaDownloader>,
        repairer: Arc<TagRepairer>,
        writer: Arc<TagWriter>,
        allowed_duration_minutes: u64,
    ) -> Self {
        Self {
            resolver,
            downloader,
            repairer,
            writer,
            allowed_duration_minutes,
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn allowed_duration_minutes(&self) -> u64 {
        self.allowed_duration_minutes
    }

    /// Resolve, check duration, then fetch `url`
    pub async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        quality: AudioQuality,
        repair_tags: bool,
        task: Option<&TaskContext>,
    ) -> Result<PathBuf, FetchError> {
        let info = self.resolver.resolve_item(url).await?;
        if !Resolver::resolve_duration_allowed(&info, self.allowed_duration_minutes)? {
            return Err(FetchError::DurationNotAllowed(format!(
                "{} is longer than {} minutes",
                url, self.allowed_duration_minutes
            )));
        }
        self.fetch_item(&info, dest_dir, quality, repair_tags, task).await
    }

    /// Fetch an already resolved item
    pub async fn fetch_item(
        &self,
        info: &ItemInfo,
        dest_dir: &Path,
        quality: AudioQuality,
        repair_tags: bool,
        task: Option<&TaskContext>,
    ) -> Result<PathBuf, FetchError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        if let Some(ctx) = task {
            ctx.report(progress::DOWNLOADING_PREFIX).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let download = self
            .downloader
            .download_audio(&info.url, dest_dir, quality, tx);

        let drain = async {
            let mut last_decile = -1i32;
            while let Some(stage) = rx.recv().await {
                match stage {
                    FetchStage::Downloading { percent, speed } => {
                        debug!(url = %info.url, percent, speed = ?speed, "Download progress");
                        let decile = (percent / 10.0) as i32;
                        if let Some(ctx) = task {
                            if decile > last_decile {
                                last_decile = decile;
                                ctx.report(&progress::downloading_percent(percent, speed.as_deref()))
                                    .await;
                            }
                        }
                    }
                    FetchStage::Converting => {
                        debug!(url = %info.url, "Done downloading, now converting");
                        if let Some(ctx) = task {
                            ctx.report(progress::CONVERTING).await;
                        }
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(download, drain);
        let path = result?;
        info!(url = %info.url, path = %path.display(), "Item converted");

        if repair_tags {
            self.repair_tags(info, &path).await;
        }

        Ok(path)
    }

    /// Repair and write tags; failures leave the file untouched
    async fn repair_tags(&self, info: &ItemInfo, path: &Path) {
        let raw = match self.resolver.raw_track_info(info).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(url = %info.url, error = %e, "No source metadata for tag repair");
                return;
            }
        };

        let tags = self.repairer.repair(&raw).await;
        if let Err(e) = self.writer.write(path, &tags).await {
            warn!(path = %path.display(), error = %e, "Failed to write repaired tags");
        }
    }
}

// ============================================================================
// yt-dlp backed downloader
// ============================================================================

/// Parse one `--newline` progress line of yt-dlp
pub fn parse_progress_line(line: &str) -> Option<FetchStage> {
    let line = line.trim();
    if line.starts_with("[ExtractAudio]") {
        return Some(FetchStage::Converting);
    }

    let rest = line.strip_prefix("[download]")?.trim_start();
    let (percent, tail) = rest.split_once('%')?;
    let percent = percent.trim().parse::<f32>().ok()?;
    let speed = tail
        .split_once(" at ")
        .map(|(_, after)| after.split_whitespace().next().unwrap_or_default().to_string())
        .filter(|s| !s.is_empty() && !s.starts_with("Unknown"));

    Some(FetchStage::Downloading { percent, speed })
}

#[derive(Deserialize)]
struct ProbeJson {
    uploader: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    entries: Vec<ProbeEntry>,
}

#[derive(Deserialize)]
struct ProbeEntry {
    url: Option<String>,
    webpage_url: Option<String>,
}

/// Downloader driving the `yt-dlp` executable
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Move the converted file from the scratch directory to `dest_dir`
    async fn collect_output(scratch: &Path, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let mut entries = tokio::fs::read_dir(scratch).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(OUTPUT_EXTENSION) {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .ok_or_else(|| FetchError::DownloadFailure("Output has no file name".to_string()))?;
                let target = unique_path(dest_dir, &file_name.to_string_lossy()).await;
                tokio::fs::rename(&path, &target).await?;
                return Ok(target);
            }
        }
        Err(FetchError::DownloadFailure("No audio file found after conversion".to_string()))
    }

    async fn run_download(
        &self,
        url: &str,
        scratch: &Path,
        dest_dir: &Path,
        quality: AudioQuality,
        progress: mpsc::UnboundedSender<FetchStage>,
    ) -> Result<PathBuf, FetchError> {
        let output_template = scratch.join("%(title)s.%(ext)s");
        let mut child = Command::new(&self.binary)
            .arg("--format")
            .arg("bestaudio/best")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg(OUTPUT_EXTENSION)
            .arg("--audio-quality")
            .arg(format!("{}K", quality.kbps()))
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--output")
            .arg(&output_template)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::DownloadFailure(format!("Failed to start yt-dlp: {}", e)))?;

        // Both pipes are drained together; a full stderr pipe would stall yt-dlp
        let stderr = child.stderr.take();
        let collect_stderr = async {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    debug!(error = %e, "yt-dlp stderr unreadable");
                }
            }
            buf
        };

        let stdout = child.stdout.take();
        let follow_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(stage) = parse_progress_line(&line) {
                        let _ = progress.send(stage);
                    }
                }
            }
        };

        let (stderr, ()) = tokio::join!(collect_stderr, follow_stdout);
        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::DownloadFailure(format!("yt-dlp did not finish: {}", e)))?;

        if !status.success() {
            return Err(FetchError::DownloadFailure(format!(
                "yt-dlp exited with {}: {}",
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        Self::collect_output(scratch, dest_dir).await
    }
}

/// `dir/name`, or `dir/stem (n).ext` when taken
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{}", ext)),
        None => (name.to_string(), String::new()),
    };
    let mut n = 2;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn download_audio(
        &self,
        url: &str,
        dest_dir: &Path,
        quality: AudioQuality,
        progress: mpsc::UnboundedSender<FetchStage>,
    ) -> Result<PathBuf, FetchError> {
        // Private scratch dir so concurrent downloads never see each other's files
        let scratch = dest_dir.join(format!(".fetch-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self
            .run_download(url, &scratch, dest_dir, quality, progress)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!(dir = %scratch.display(), error = %e, "Failed to remove scratch dir");
        }
        result
    }

    async fn probe(&self, url: &str) -> Result<MediaProbe, FetchError> {
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg(url)
            .output()
            .await
            .map_err(|e| FetchError::DownloadFailure(format!("Failed to start yt-dlp: {}", e)))?;

        if !output.status.success() {
            return Err(FetchError::DownloadFailure(format!(
                "yt-dlp probe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let json: ProbeJson = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::DownloadFailure(format!("Unreadable probe output: {}", e)))?;

        Ok(MediaProbe {
            uploader: json.uploader,
            title: json.title,
            thumbnail: json.thumbnail,
            duration_seconds: json.duration.map(|d| d.round() as u64),
            entries: json
                .entries
                .into_iter()
                .filter_map(|e| e.webpage_url.or(e.url))
                .collect(),
        })
    }
}
