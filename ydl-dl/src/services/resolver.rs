//! Remote info resolver
//!
//! Turns user-supplied links into item metadata and enumerates playlists.
//! Link shapes are validated locally before any network call; remote
//! platforms sit behind [`VideoPlatform`] and [`AudioPlatform`] so the
//! orchestrator can be exercised without network access.
//!
//! Supported shapes:
//! - `https://www.youtube.com/watch?v=<id>` and `https://youtu.be/<id>` (video)
//! - `https://www.youtube.com/playlist?list=<id>` or `watch?v=..&list=<id>` (playlist)
//! - `https://soundcloud.com/<user>/<track>` (track)
//! - `https://soundcloud.com/<user>/sets/<set>` (set, batch only)

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::models::RawTrackInfo;
use crate::services::fetcher::MediaDownloader;

/// Maximum page size of the video platform's playlist API
pub const PLAYLIST_PAGE_SIZE: u32 = 50;

const YOUTUBE_API_URL: &str = "https://www.googleapis.com/youtube/v3";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Input is structurally invalid or the remote says it does not exist
    #[error("Bad resource: {0}")]
    BadResource(String),

    /// Transient or remote-side failure; safe to retry
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// Requested playlist range does not fit the playlist
    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),
}

impl ResolveError {
    fn from_status(status: StatusCode, what: &str) -> Self {
        if status.is_client_error() {
            ResolveError::BadResource(format!("{} rejected the request ({})", what, status))
        } else {
            ResolveError::ConnectionFailure(format!("{} answered {}", what, status))
        }
    }
}

/// A recognised link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLink {
    Video { id: String },
    Playlist { list_id: String },
    Track { url: String },
    TrackSet { url: String },
}

fn is_video_id(id: &str) -> bool {
    id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_url(raw: &str) -> Result<Url, ResolveError> {
    let url = Url::parse(raw.trim())
        .map_err(|_| ResolveError::BadResource(format!("Not a URL: {}", raw)))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ResolveError::BadResource(format!("Unsupported scheme: {}", raw)));
    }
    Ok(url)
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn soundcloud_link(url: &Url) -> Result<ResourceLink, ResolveError> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let canonical = format!("https://soundcloud.com/{}", segments.join("/"));

    match segments.as_slice() {
        [_, track] if *track != "sets" => Ok(ResourceLink::Track { url: canonical }),
        [_, "sets", _] => Ok(ResourceLink::TrackSet { url: canonical }),
        _ => Err(ResolveError::BadResource("Url does not lead to audio.".to_string())),
    }
}

/// Recognise a single-item link
pub fn parse_item_link(raw: &str) -> Result<ResourceLink, ResolveError> {
    let url = parse_url(raw)?;
    let host = url.host_str().unwrap_or_default().trim_start_matches("www.");

    match host {
        "youtube.com" | "m.youtube.com" if url.path() == "/watch" => query_param(&url, "v")
            .filter(|id| is_video_id(id))
            .map(|id| ResourceLink::Video { id })
            .ok_or_else(|| ResolveError::BadResource("Url does not lead to a video.".to_string())),
        "youtu.be" => {
            let id = url.path().trim_start_matches('/');
            if is_video_id(id) {
                Ok(ResourceLink::Video { id: id.to_string() })
            } else {
                Err(ResolveError::BadResource("Url does not lead to a video.".to_string()))
            }
        }
        "soundcloud.com" => soundcloud_link(&url),
        _ => Err(ResolveError::BadResource(format!(
            "Url does not belong to a supported platform: {}",
            raw
        ))),
    }
}

/// Recognise a playlist link
pub fn parse_playlist_link(raw: &str) -> Result<ResourceLink, ResolveError> {
    let url = parse_url(raw)?;
    let host = url.host_str().unwrap_or_default().trim_start_matches("www.");

    match host {
        "youtube.com" | "m.youtube.com" if url.path() == "/playlist" || url.path() == "/watch" => {
            query_param(&url, "list")
                .map(|list_id| ResourceLink::Playlist { list_id })
                .ok_or_else(|| {
                    ResolveError::BadResource("Url does not lead to a playlist.".to_string())
                })
        }
        "soundcloud.com" => match soundcloud_link(&url)? {
            set @ ResourceLink::TrackSet { .. } => Ok(set),
            _ => Err(ResolveError::BadResource("Url does not lead to a set.".to_string())),
        },
        _ => Err(ResolveError::BadResource(format!(
            "Url does not lead to a playlist: {}",
            raw
        ))),
    }
}

/// Link for a batch item id: full URLs pass through, bare ids are videos
pub fn item_url(item_id: &str) -> String {
    if item_id.starts_with("http://") || item_id.starts_with("https://") {
        item_id.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", item_id)
    }
}

/// Duration as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDuration {
    /// ISO-8601 duration, e.g. `PT4M13S`
    Iso8601(String),
    Seconds(u64),
}

/// Canonical metadata of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub link: ResourceLink,
    /// Canonical URL handed to the downloader
    pub url: String,
    pub duration: ItemDuration,
    /// Uploader/title, when the lookup already produced them
    pub raw: Option<RawTrackInfo>,
}

/// One page of a playlist listing
#[derive(Debug, Clone, Default)]
pub struct PlaylistPage {
    pub total_results: i64,
    pub item_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Video platform metadata API
#[async_trait]
pub trait VideoPlatform: Send + Sync {
    /// ISO-8601 duration of a video; `BadResource` when unknown
    async fn video_duration(&self, video_id: &str) -> Result<String, ResolveError>;

    /// Channel title, video title and default thumbnail
    async fn video_snippet(&self, video_id: &str) -> Result<RawTrackInfo, ResolveError>;

    async fn playlist_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ResolveError>;
}

/// Track looked up on the audio platform
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub duration_seconds: u64,
    pub raw: RawTrackInfo,
}

/// Audio platform lookup
#[async_trait]
pub trait AudioPlatform: Send + Sync {
    async fn track(&self, url: &str) -> Result<AudioTrack, ResolveError>;

    /// Track URLs of a set, in set order
    async fn set_tracks(&self, url: &str) -> Result<Vec<String>, ResolveError>;
}

/// Pure duration rule for ISO-8601 strings
///
/// Anything with an hour (or day) component is rejected regardless of
/// `max_minutes`; otherwise the minutes component must not exceed it.
/// Seconds are ignored.
pub fn iso_duration_allowed(duration: &str, max_minutes: u64) -> Result<bool, ResolveError> {
    let malformed = || ResolveError::BadResource(format!("Malformed duration: {}", duration));

    if !duration.starts_with('P') {
        return Err(malformed());
    }
    if duration.contains('H') || duration.contains('D') {
        return Ok(false);
    }

    let body = duration.strip_prefix("PT").ok_or_else(malformed)?;
    match body.find('M') {
        None => Ok(true),
        Some(m_index) => body[..m_index]
            .parse::<u64>()
            .map(|minutes| minutes <= max_minutes)
            .map_err(|_| malformed()),
    }
}

/// Resolves links against the configured platforms
pub struct Resolver {
    video: Arc<dyn VideoPlatform>,
    audio: Arc<dyn AudioPlatform>,
}

impl Resolver {
    pub fn new(video: Arc<dyn VideoPlatform>, audio: Arc<dyn AudioPlatform>) -> Self {
        Self { video, audio }
    }

    /// Canonical metadata for a single-item link
    pub async fn resolve_item(&self, url: &str) -> Result<ItemInfo, ResolveError> {
        match parse_item_link(url)? {
            ResourceLink::Video { id } => {
                let duration = self.video.video_duration(&id).await?;
                debug!(video_id = %id, duration = %duration, "Video resolved");
                Ok(ItemInfo {
                    url: item_url(&id),
                    link: ResourceLink::Video { id },
                    duration: ItemDuration::Iso8601(duration),
                    raw: None,
                })
            }
            ResourceLink::Track { url } => {
                let track = self.audio.track(&url).await?;
                Ok(ItemInfo {
                    link: ResourceLink::Track { url: url.clone() },
                    url,
                    duration: ItemDuration::Seconds(track.duration_seconds),
                    raw: Some(track.raw),
                })
            }
            ResourceLink::Playlist { .. } | ResourceLink::TrackSet { .. } => Err(
                ResolveError::BadResource("Url leads to a playlist, not a single item.".to_string()),
            ),
        }
    }

    /// Whether the item's duration is within `max_minutes`
    pub fn resolve_duration_allowed(info: &ItemInfo, max_minutes: u64) -> Result<bool, ResolveError> {
        match &info.duration {
            ItemDuration::Iso8601(raw) => iso_duration_allowed(raw, max_minutes),
            ItemDuration::Seconds(seconds) => Ok(*seconds <= max_minutes * 60),
        }
    }

    /// Uploader/title of an item for tag repair
    pub async fn raw_track_info(&self, info: &ItemInfo) -> Result<RawTrackInfo, ResolveError> {
        if let Some(raw) = &info.raw {
            return Ok(raw.clone());
        }
        match &info.link {
            ResourceLink::Video { id } => self.video.video_snippet(id).await,
            ResourceLink::Track { url } => Ok(self.audio.track(url).await?.raw),
            _ => Err(ResolveError::BadResource("Not a single item.".to_string())),
        }
    }

    /// Item ids of the half-open range `[start_index, end_index)` of a playlist
    ///
    /// `end_index` past the end is clamped to the playlist length.
    pub async fn enumerate_playlist(
        &self,
        url: &str,
        start_index: i64,
        end_index: i64,
    ) -> Result<Vec<String>, ResolveError> {
        if start_index < 0 {
            return Err(ResolveError::IndexOutOfRange("First index is out of range.".to_string()));
        }
        if end_index < start_index {
            return Err(ResolveError::IndexOutOfRange("End index is out of range.".to_string()));
        }

        match parse_playlist_link(url)? {
            ResourceLink::Playlist { list_id } => {
                self.enumerate_video_playlist(&list_id, start_index, end_index)
                    .await
            }
            ResourceLink::TrackSet { url } => {
                let tracks = self.audio.set_tracks(&url).await?;
                slice_range(tracks, start_index, end_index)
            }
            _ => Err(ResolveError::BadResource("Url does not lead to a playlist.".to_string())),
        }
    }

    async fn enumerate_video_playlist(
        &self,
        list_id: &str,
        start_index: i64,
        end_index: i64,
    ) -> Result<Vec<String>, ResolveError> {
        let first = self.video.playlist_page(list_id, None).await?;
        let total = first.total_results;
        check_range(total, start_index)?;
        let end_index = end_index.min(total);

        let mut ids = first.item_ids;
        let mut token = first.next_page_token;
        while (ids.len() as i64) < end_index {
            let Some(page_token) = token.take() else { break };
            let page = self.video.playlist_page(list_id, Some(&page_token)).await?;
            ids.extend(page.item_ids);
            token = page.next_page_token;
        }

        debug!(list_id, total, fetched = ids.len(), "Playlist enumerated");
        Ok(take_range(ids, start_index, end_index))
    }
}

fn check_range(total: i64, start_index: i64) -> Result<(), ResolveError> {
    if total == 0 {
        return Err(ResolveError::BadResource("Given playlist is empty.".to_string()));
    }
    if start_index > total - 1 {
        return Err(ResolveError::IndexOutOfRange("First index is out of range.".to_string()));
    }
    Ok(())
}

fn slice_range(items: Vec<String>, start_index: i64, end_index: i64) -> Result<Vec<String>, ResolveError> {
    let total = items.len() as i64;
    check_range(total, start_index)?;
    Ok(take_range(items, start_index, end_index.min(total)))
}

fn take_range(items: Vec<String>, start_index: i64, end_index: i64) -> Vec<String> {
    let end = (end_index.max(0) as usize).min(items.len());
    let start = (start_index.max(0) as usize).min(end);
    items.into_iter().skip(start).take(end - start).collect()
}

// ============================================================================
// Video platform: YouTube Data API v3
// ============================================================================

#[derive(Deserialize)]
struct VideoListResponse {
    kind: Option<String>,
    #[serde(default)]
    items: Vec<VideoResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    content_details: Option<VideoContentDetails>,
    snippet: Option<VideoSnippet>,
}

#[derive(Deserialize)]
struct VideoContentDetails {
    duration: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    channel_title: String,
    thumbnails: Option<Thumbnails>,
}

#[derive(Deserialize)]
struct Thumbnails {
    default: Option<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    page_info: PageInfo,
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    total_results: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: PlaylistItemDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    video_id: String,
}

/// YouTube Data API client
pub struct YouTubeApi {
    http_client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl YouTubeApi {
    pub fn new(api_key: Option<String>) -> Result<Self, ResolveError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ResolveError::ConnectionFailure(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            api_key,
            base_url: YOUTUBE_API_URL.to_string(),
        })
    }

    fn key(&self) -> Result<&str, ResolveError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ResolveError::ConnectionFailure("YouTube API key not configured".to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ResolveError> {
        let key = self.key()?;
        let response = self
            .http_client
            .get(format!("{}/{}", self.base_url, endpoint))
            .query(params)
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|e| ResolveError::ConnectionFailure(format!("YouTube API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::from_status(status, "YouTube API"));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ResolveError::ConnectionFailure(format!("YouTube API body: {}", e)))
    }

    async fn video(&self, video_id: &str, part: &str) -> Result<VideoResource, ResolveError> {
        let response: VideoListResponse = self
            .get_json("videos", &[("part", part), ("id", video_id)])
            .await?;

        if response.kind.as_deref() != Some("youtube#videoListResponse") {
            return Err(ResolveError::BadResource("No information about this video.".to_string()));
        }
        response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::BadResource("No information about this video.".to_string()))
    }
}

#[async_trait]
impl VideoPlatform for YouTubeApi {
    async fn video_duration(&self, video_id: &str) -> Result<String, ResolveError> {
        self.video(video_id, "contentDetails")
            .await?
            .content_details
            .map(|details| details.duration)
            .ok_or_else(|| ResolveError::BadResource("No duration for this video.".to_string()))
    }

    async fn video_snippet(&self, video_id: &str) -> Result<RawTrackInfo, ResolveError> {
        let snippet = self
            .video(video_id, "snippet")
            .await?
            .snippet
            .ok_or_else(|| ResolveError::BadResource("No snippet for this video.".to_string()))?;

        Ok(RawTrackInfo {
            uploader: snippet.channel_title,
            title: snippet.title,
            thumbnail: snippet.thumbnails.and_then(|t| t.default).map(|t| t.url),
        })
    }

    async fn playlist_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ResolveError> {
        let page_size = PLAYLIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "id,contentDetails"),
            ("maxResults", page_size.as_str()),
            ("playlistId", list_id),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response: PlaylistItemsResponse = self.get_json("playlistItems", &params).await?;
        Ok(PlaylistPage {
            total_results: response.page_info.total_results,
            item_ids: response
                .items
                .into_iter()
                .map(|item| item.content_details.video_id)
                .collect(),
            next_page_token: response.next_page_token,
        })
    }
}

// ============================================================================
// Audio platform: SoundCloud pages + downloader probe
// ============================================================================

/// SoundCloud lookup: page existence over HTTP, metadata via the downloader's probe
pub struct SoundCloudSite {
    http_client: Client,
    prober: Arc<dyn MediaDownloader>,
}

impl SoundCloudSite {
    pub fn new(prober: Arc<dyn MediaDownloader>) -> Result<Self, ResolveError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ResolveError::ConnectionFailure(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            prober,
        })
    }

    async fn ensure_exists(&self, url: &str) -> Result<(), ResolveError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::ConnectionFailure(format!("SoundCloud: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ResolveError::BadResource("Audio not found.".to_string())),
            status if status.is_success() => Ok(()),
            status => Err(ResolveError::from_status(status, "SoundCloud")),
        }
    }
}

#[async_trait]
impl AudioPlatform for SoundCloudSite {
    async fn track(&self, url: &str) -> Result<AudioTrack, ResolveError> {
        self.ensure_exists(url).await?;
        let probe = self
            .prober
            .probe(url)
            .await
            .map_err(|e| ResolveError::BadResource(format!("Info is not processed: {}", e)))?;

        let duration_seconds = probe
            .duration_seconds
            .ok_or_else(|| ResolveError::BadResource("Track has no duration.".to_string()))?;

        Ok(AudioTrack {
            duration_seconds,
            raw: RawTrackInfo {
                uploader: probe.uploader.unwrap_or_default(),
                title: probe.title.unwrap_or_default(),
                thumbnail: probe.thumbnail,
            },
        })
    }

    async fn set_tracks(&self, url: &str) -> Result<Vec<String>, ResolveError> {
        self.ensure_exists(url).await?;
        let probe = self
            .prober
            .probe(url)
            .await
            .map_err(|e| ResolveError::BadResource(format!("Info is not processed: {}", e)))?;
        Ok(probe.entries)
    }
}
