//! Tag repair engine
//!
//! Raw platform metadata is normalized into an artist/title pair, then
//! enriched from music catalogs in priority order:
//!
//! 1. each catalog's track search (top hit, then a 50-hit scan)
//! 2. each catalog's artist search, keeping the normalized title
//! 3. the normalized pair with the source thumbnail as cover
//!
//! Repair never fails; catalog errors only move the chain forward.

pub mod catalog;
pub mod normalize;
pub mod writer;

use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{RawTrackInfo, TagSet};

pub use catalog::{CatalogArtist, CatalogError, CatalogTrack, ItunesCatalog, MusicCatalog, SpotifyCatalog};
pub use normalize::repair;
pub use writer::{TagWriteError, TagWriter};

/// Hits fetched when the top hit's title does not match
const SCAN_LIMIT: usize = 50;

fn title_matches(candidate: &str, wanted: &str) -> bool {
    candidate.to_lowercase().contains(&wanted.to_lowercase())
}

pub struct TagRepairer {
    catalogs: Vec<Arc<dyn MusicCatalog>>,
}

impl TagRepairer {
    /// Catalogs are consulted in the given order
    pub fn new(catalogs: Vec<Arc<dyn MusicCatalog>>) -> Self {
        Self { catalogs }
    }

    /// Repairer without catalogs; only normalization applies
    pub fn offline() -> Self {
        Self::new(Vec::new())
    }

    /// Full repair of a source item's metadata
    pub async fn repair(&self, raw: &RawTrackInfo) -> TagSet {
        let (artist, title) = normalize::repair(&raw.uploader, &raw.title);

        if let Some(tags) = self.enrich(&artist, &title).await {
            return tags;
        }

        debug!(%artist, %title, "No catalog match, using normalized tags");
        TagSet {
            image: raw.thumbnail.clone(),
            ..TagSet::basic(artist, title)
        }
    }

    /// Catalog enrichment of a normalized pair; `None` when nothing matched
    pub async fn enrich(&self, artist: &str, title: &str) -> Option<TagSet> {
        for catalog in &self.catalogs {
            match match_track(catalog.as_ref(), artist, title).await {
                Ok(tags) => {
                    info!(catalog = catalog.name(), artist = %tags.artist, title = %tags.title, "Track matched");
                    return Some(tags);
                }
                Err(e) => debug!(catalog = catalog.name(), error = %e, "Track search gave nothing"),
            }
        }

        for catalog in &self.catalogs {
            match catalog.search_artist(artist).await {
                Ok(Some(found)) => {
                    info!(catalog = catalog.name(), artist = %found.name, "Artist matched");
                    return Some(TagSet {
                        image: found.image,
                        ..TagSet::basic(found.name, title)
                    });
                }
                Ok(None) => {}
                Err(e) => debug!(catalog = catalog.name(), error = %e, "Artist search failed"),
            }
        }

        None
    }
}

/// Top hit when its title matches (or it is not from a full album),
/// otherwise the first matching hit of a wider search
///
/// For the wider search the album and artist still come from the top hit.
async fn match_track(
    catalog: &dyn MusicCatalog,
    artist: &str,
    title: &str,
) -> Result<TagSet, CatalogError> {
    let top = catalog
        .search_tracks(artist, title, 1)
        .await?
        .into_iter()
        .next()
        .ok_or(CatalogError::NoMatch)?;

    if top.album.is_none() || title_matches(&top.title, title) {
        return Ok(into_tags(top));
    }

    let found = catalog
        .search_tracks(artist, title, SCAN_LIMIT)
        .await?
        .into_iter()
        .find(|candidate| title_matches(&candidate.title, title))
        .ok_or(CatalogError::NoMatch)?;

    Ok(TagSet {
        artist: top.artist,
        album: top.album,
        ..into_tags(found)
    })
}

fn into_tags(track: CatalogTrack) -> TagSet {
    TagSet {
        artist: track.artist,
        title: track.title,
        album: track.album,
        image: track.image,
        release_date: track.release_date,
        track_number: track.track_number,
    }
}
