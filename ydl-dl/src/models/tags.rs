//! Tag data flowing through the repair engine

use serde::{Deserialize, Serialize};

/// Uploader/title pair as published on the source platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrackInfo {
    pub uploader: String,
    pub title: String,
    /// Source thumbnail, used as cover when no catalog matches
    pub thumbnail: Option<String>,
}

/// Tags to merge into an audio file
///
/// `artist` and `title` are always present; every other key is written
/// only when set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    /// Cover image URL, fetched as raw bytes at write time
    pub image: Option<String>,
    pub release_date: Option<String>,
    pub track_number: Option<u32>,
}

impl TagSet {
    pub fn basic(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}
