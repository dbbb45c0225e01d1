//! ID3 tag writing for downloaded MP3 files

use id3::frame::{Picture, PictureType};
use id3::{ErrorKind, Tag, TagLike, Version};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::TagSet;

const COVER_MIME: &str = "image/jpeg";
const COVER_DESCRIPTION: &str = "Front cover";

#[derive(Debug, Error)]
pub enum TagWriteError {
    #[error("ID3 error: {0}")]
    Id3(#[from] id3::Error),

    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Tag writer task failed: {0}")]
    Join(String),
}

pub struct TagWriter {
    http_client: Client,
}

impl TagWriter {
    pub fn new() -> Result<Self, TagWriteError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| TagWriteError::Client(e.to_string()))?;
        Ok(Self { http_client })
    }

    /// Write `tags` into the file, creating a tag when the file has none
    ///
    /// Cover art that cannot be fetched is skipped; the textual fields are
    /// still written.
    pub async fn write(&self, path: &Path, tags: &TagSet) -> Result<(), TagWriteError> {
        let cover = match tags.image.as_deref() {
            Some(url) => self.fetch_image(url).await,
            None => None,
        };

        let path: PathBuf = path.to_path_buf();
        let tags = tags.clone();
        tokio::task::spawn_blocking(move || apply_tags(&path, &tags, cover))
            .await
            .map_err(|e| TagWriteError::Join(e.to_string()))?
    }

    async fn fetch_image(&self, url: &str) -> Option<Vec<u8>> {
        let response = match self.http_client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(url, status = %response.status(), "Cover image request rejected");
                return None;
            }
            Err(e) => {
                warn!(url, error = %e, "Cover image request failed");
                return None;
            }
        };

        match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(e) => {
                warn!(url, error = %e, "Cover image body unreadable");
                None
            }
        }
    }
}

/// Synchronous tag update; run on the blocking pool
pub fn apply_tags(path: &Path, tags: &TagSet, cover: Option<Vec<u8>>) -> Result<(), TagWriteError> {
    let mut tag = match Tag::read_from_path(path) {
        Ok(tag) => tag,
        Err(e) if matches!(e.kind, ErrorKind::NoTag) => Tag::new(),
        Err(e) => return Err(e.into()),
    };

    if let Some(album) = &tags.album {
        tag.set_album(album.as_str());
    }
    tag.set_artist(tags.artist.as_str());
    tag.set_title(tags.title.as_str());

    if let Some(data) = cover {
        tag.add_frame(Picture {
            mime_type: COVER_MIME.to_string(),
            picture_type: PictureType::CoverFront,
            description: COVER_DESCRIPTION.to_string(),
            data,
        });
    }

    if let Some(date) = &tags.release_date {
        tag.set_text("TDRC", date.as_str());
    }
    if let Some(number) = tags.track_number {
        tag.set_track(number);
    }

    tag.write_to_path(path, Version::Id3v24)?;
    debug!(path = %path.display(), artist = %tags.artist, title = %tags.title, "Tags written");
    Ok(())
}
