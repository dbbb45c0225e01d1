//! Music catalog clients used to enrich normalized tags
//!
//! Spotify (client-credentials flow) is the primary catalog; iTunes search
//! is the keyless secondary one.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";
const ITUNES_SEARCH_URL: &str = "https://itunes.apple.com/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Tokens are refreshed this long before their stated expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to find such track")]
    NoMatch,

    #[error("Catalog request failed: {0}")]
    Request(String),

    #[error("Catalog authorization failed: {0}")]
    Auth(String),

    #[error("Catalog response not understood: {0}")]
    Decode(String),
}

/// One search hit, already mapped onto tag fields
///
/// `album` and `track_number` are only set when the hit belongs to a full
/// album release.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogTrack {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub image: Option<String>,
    pub release_date: Option<String>,
    pub track_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogArtist {
    pub name: String,
    pub image: Option<String>,
}

#[async_trait]
pub trait MusicCatalog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Search tracks by artist and title, best match first
    async fn search_tracks(
        &self,
        artist: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, CatalogError>;

    /// Look an artist up by name; catalogs without artist search return `None`
    async fn search_artist(&self, _artist: &str) -> Result<Option<CatalogArtist>, CatalogError> {
        Ok(None)
    }
}

fn build_client() -> Result<Client, CatalogError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| CatalogError::Request(format!("HTTP client: {}", e)))
}

fn per_second(n: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

// ============================================================================
// Spotify
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct SpotifySearch {
    tracks: Option<SpotifyPaging<SpotifyTrack>>,
    artists: Option<SpotifyPaging<SpotifyArtist>>,
}

#[derive(Debug, Deserialize)]
struct SpotifyPaging<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    track_number: Option<u32>,
    album: SpotifyAlbum,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    name: String,
    album_type: String,
    #[serde(default)]
    artists: Vec<SpotifyNamed>,
    #[serde(default)]
    images: Vec<SpotifyImage>,
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

impl SpotifyTrack {
    fn into_catalog_track(self) -> CatalogTrack {
        let full_album = self.album.album_type == "album";
        let artist = self
            .album
            .artists
            .into_iter()
            .next()
            .map(|a| a.name)
            .unwrap_or_default();

        CatalogTrack {
            artist,
            title: self.name,
            album: full_album.then_some(self.album.name),
            image: self.album.images.into_iter().next().map(|i| i.url),
            release_date: self.album.release_date,
            track_number: if full_album { self.track_number } else { None },
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifyCatalog {
    http_client: Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    rate_limiter: DirectLimiter,
}

impl SpotifyCatalog {
    pub fn new(client_id: String, client_secret: String) -> Result<Self, CatalogError> {
        Ok(Self {
            http_client: build_client()?,
            client_id,
            client_secret,
            token: Mutex::new(None),
            rate_limiter: RateLimiter::direct(per_second(10)),
        })
    }

    /// Cached bearer token, fetched again once close to expiry
    async fn access_token(&self) -> Result<String, CatalogError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let credentials = BASE64.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http_client
            .post(SPOTIFY_TOKEN_URL)
            .header("Authorization", format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CatalogError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Auth(format!("token endpoint returned {}", response.status())));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Auth(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!("Spotify access token refreshed");

        Ok(token.access_token)
    }

    async fn search(&self, query: &str, kind: &str, limit: usize) -> Result<SpotifySearch, CatalogError> {
        let token = self.access_token().await?;
        self.rate_limiter.until_ready().await;

        let limit = limit.to_string();
        let response = self
            .http_client
            .get(format!("{}/search", SPOTIFY_API_URL))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(&[("q", query), ("type", kind), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| CatalogError::Request(format!("Spotify: {}", e)))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("Spotify returned {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Decode(format!("Spotify: {}", e)))
    }
}

#[async_trait]
impl MusicCatalog for SpotifyCatalog {
    fn name(&self) -> &'static str {
        "spotify"
    }

    async fn search_tracks(
        &self,
        artist: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, CatalogError> {
        let query = format!("artist:{} track:{}", artist, title);
        let result = self.search(&query, "track", limit).await?;
        Ok(result
            .tracks
            .map(|page| page.items)
            .unwrap_or_default()
            .into_iter()
            .map(SpotifyTrack::into_catalog_track)
            .collect())
    }

    async fn search_artist(&self, artist: &str) -> Result<Option<CatalogArtist>, CatalogError> {
        let query = format!("artist:{}", artist);
        let result = self.search(&query, "artist", 1).await?;
        Ok(result
            .artists
            .and_then(|page| page.items.into_iter().next())
            .map(|found| CatalogArtist {
                name: artist.to_string(),
                image: found.images.into_iter().next().map(|i| i.url),
            }))
    }
}

// ============================================================================
// iTunes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItunesSearch {
    #[serde(default)]
    results: Vec<ItunesTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItunesTrack {
    artist_name: String,
    track_name: String,
    collection_name: Option<String>,
    artwork_url100: Option<String>,
    release_date: Option<String>,
    track_number: Option<u32>,
}

impl ItunesTrack {
    fn into_catalog_track(self) -> CatalogTrack {
        let album = self
            .collection_name
            .filter(|name| !name.ends_with("Single"));
        let full_album = album.is_some();

        CatalogTrack {
            artist: self.artist_name,
            title: self.track_name,
            album,
            image: self.artwork_url100,
            release_date: self.release_date,
            track_number: if full_album { self.track_number } else { None },
        }
    }
}

pub struct ItunesCatalog {
    http_client: Client,
    search_url: String,
    retry_delay: Duration,
    rate_limiter: DirectLimiter,
}

impl ItunesCatalog {
    pub fn new() -> Result<Self, CatalogError> {
        Self::with_endpoint(ITUNES_SEARCH_URL.to_string(), Duration::from_secs(2))
    }

    /// Catalog against a specific search endpoint
    pub fn with_endpoint(search_url: String, retry_delay: Duration) -> Result<Self, CatalogError> {
        Ok(Self {
            http_client: build_client()?,
            search_url,
            retry_delay,
            rate_limiter: RateLimiter::direct(per_second(1)),
        })
    }

    async fn fetch_text(&self, term: &str, limit: &str) -> Result<String, CatalogError> {
        self.rate_limiter.until_ready().await;
        let response = self
            .http_client
            .get(&self.search_url)
            .query(&[("term", term), ("media", "music"), ("limit", limit)])
            .send()
            .await
            .map_err(|e| CatalogError::Request(format!("iTunes: {}", e)))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("iTunes returned {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| CatalogError::Request(format!("iTunes: {}", e)))
    }

    /// The search endpoint intermittently answers with a non-JSON body;
    /// one retry after `retry_delay` is made before giving up.
    async fn search_json<T: DeserializeOwned>(&self, term: &str, limit: usize) -> Result<T, CatalogError> {
        let limit = limit.to_string();
        let body = self.fetch_text(term, &limit).await?;
        match serde_json::from_str(&body) {
            Ok(parsed) => Ok(parsed),
            Err(first) => {
                debug!(error = %first, "iTunes body not JSON, retrying");
                tokio::time::sleep(self.retry_delay).await;
                let body = self.fetch_text(term, &limit).await?;
                serde_json::from_str(&body).map_err(|e| CatalogError::Decode(format!("iTunes: {}", e)))
            }
        }
    }
}

#[async_trait]
impl MusicCatalog for ItunesCatalog {
    fn name(&self) -> &'static str {
        "itunes"
    }

    async fn search_tracks(
        &self,
        artist: &str,
        title: &str,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, CatalogError> {
        let term = format!("{} {}", artist, title);
        let result: ItunesSearch = self.search_json(&term, limit).await?;
        Ok(result
            .results
            .into_iter()
            .map(ItunesTrack::into_catalog_track)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spotify_album_track_keeps_album_fields() {
        let json = r#"{
            "tracks": {"items": [{
                "name": "Perfect Machine",
                "track_number": 4,
                "album": {
                    "name": "Vessels",
                    "album_type": "album",
                    "artists": [{"name": "Starset"}],
                    "images": [{"url": "https://img/large"}, {"url": "https://img/small"}],
                    "release_date": "2017-01-20"
                }
            }]}
        }"#;
        let search: SpotifySearch = serde_json::from_str(json).unwrap();
        let track = search.tracks.unwrap().items.into_iter().next().unwrap().into_catalog_track();

        assert_eq!(track.artist, "Starset");
        assert_eq!(track.title, "Perfect Machine");
        assert_eq!(track.album.as_deref(), Some("Vessels"));
        assert_eq!(track.image.as_deref(), Some("https://img/large"));
        assert_eq!(track.release_date.as_deref(), Some("2017-01-20"));
        assert_eq!(track.track_number, Some(4));
    }

    #[test]
    fn test_spotify_single_drops_album_and_number() {
        let json = r#"{
            "tracks": {"items": [{
                "name": "Halo",
                "track_number": 1,
                "album": {"name": "Halo", "album_type": "single", "artists": [{"name": "X"}], "images": []}
            }]}
        }"#;
        let search: SpotifySearch = serde_json::from_str(json).unwrap();
        let track = search.tracks.unwrap().items.into_iter().next().unwrap().into_catalog_track();

        assert_eq!(track.album, None);
        assert_eq!(track.track_number, None);
        assert_eq!(track.image, None);
    }

    #[test]
    fn test_itunes_single_collection_is_not_an_album() {
        let json = r#"{
            "resultCount": 2,
            "results": [
                {"artistName": "A", "trackName": "T", "collectionName": "T - Single",
                 "artworkUrl100": "https://art", "releaseDate": "2020-01-01T08:00:00Z", "trackNumber": 1},
                {"artistName": "A", "trackName": "U", "collectionName": "Record",
                 "trackNumber": 7}
            ]
        }"#;
        let search: ItunesSearch = serde_json::from_str(json).unwrap();
        let tracks: Vec<_> = search.results.into_iter().map(ItunesTrack::into_catalog_track).collect();

        assert_eq!(tracks[0].album, None);
        assert_eq!(tracks[0].track_number, None);
        assert_eq!(tracks[0].image.as_deref(), Some("https://art"));
        assert_eq!(tracks[1].album.as_deref(), Some("Record"));
        assert_eq!(tracks[1].track_number, Some(7));
    }

    async fn flaky_search(State(hits): State<Arc<AtomicUsize>>) -> String {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            "<html>busy</html>".to_string()
        } else {
            r#"{"resultCount":1,"results":[{"artistName":"Muse","trackName":"Uprising","collectionName":"The Resistance","trackNumber":1}]}"#
                .to_string()
        }
    }

    #[tokio::test]
    async fn test_itunes_retries_once_on_garbled_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/search", get(flaky_search))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let catalog = ItunesCatalog::with_endpoint(
            format!("http://{}/search", addr),
            Duration::from_millis(10),
        )
        .unwrap();

        let tracks = catalog.search_tracks("Muse", "Uprising", 1).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].album.as_deref(), Some("The Resistance"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
