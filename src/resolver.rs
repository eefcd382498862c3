//! Maps catalog records to internal entity IDs.

use std::collections::HashSet;

use serde::Serialize;

use crate::catalog::{is_valid_external_id, AlbumDetail, CatalogArtist};
use crate::error::ResolveError;
use crate::store::CatalogStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "id", rename_all = "lowercase")]
pub enum Resolution {
    Existing(String),
    New,
}

impl Resolution {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtist {
    pub external_id: String,
    pub name: String,
    pub resolution: Resolution,
    /// Matched a placeholder artist by name rather than by external ID.
    pub adopts_placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAlbum {
    pub external_id: String,
    pub title: String,
    pub release: Resolution,
    /// Album artists first, then track-only artists.
    pub artists: Vec<ResolvedArtist>,
    pub tracks: usize,
}

impl ResolvedAlbum {
    pub fn new_artists(&self) -> usize {
        self.artists.iter().filter(|a| a.resolution.is_new()).count()
    }
}

/// Reject the album if any release, artist or track ID is malformed.
pub fn validate_album(album: &AlbumDetail) -> Result<(), ResolveError> {
    let invalid = |entity: &'static str, id: &str| ResolveError::InvalidExternalId {
        entity,
        id: id.to_string(),
    };

    if !is_valid_external_id(&album.external_id) {
        return Err(invalid("release", &album.external_id));
    }
    for artist in album.all_artists() {
        if !is_valid_external_id(&artist.external_id) {
            return Err(invalid("artist", &artist.external_id));
        }
    }
    for track in &album.tracks {
        if !is_valid_external_id(&track.external_id) {
            return Err(invalid("track", &track.external_id));
        }
    }
    Ok(())
}

pub struct IdentityResolver<'a> {
    store: &'a dyn CatalogStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn CatalogStore) -> Self {
        Self { store }
    }

    /// External ID first, then a placeholder artist with the same name
    /// (case-insensitive), else new.
    pub async fn resolve_artist(&self, artist: &CatalogArtist) -> Result<Resolution, ResolveError> {
        Ok(self.resolve_artist_excluding(artist, &HashSet::new()).await?.0)
    }

    async fn resolve_artist_excluding(
        &self,
        artist: &CatalogArtist,
        claimed: &HashSet<String>,
    ) -> Result<(Resolution, bool), ResolveError> {
        if !is_valid_external_id(&artist.external_id) {
            return Err(ResolveError::InvalidExternalId {
                entity: "artist",
                id: artist.external_id.clone(),
            });
        }
        if let Some(found) = self.store.find_artist_by_external_id(&artist.external_id).await? {
            return Ok((Resolution::Existing(found.id), false));
        }
        match self.store.find_placeholder_artist_by_name(&artist.name).await? {
            Some(found) if !claimed.contains(&found.id) => {
                Ok((Resolution::Existing(found.id), true))
            }
            _ => Ok((Resolution::New, false)),
        }
    }

    /// Strictly by external ID. Titles are never used to match releases.
    pub async fn resolve_release(&self, album: &AlbumDetail) -> Result<Resolution, ResolveError> {
        if !is_valid_external_id(&album.external_id) {
            return Err(ResolveError::InvalidExternalId {
                entity: "release",
                id: album.external_id.clone(),
            });
        }
        Ok(self
            .store
            .find_release_by_external_id(&album.external_id)
            .await?
            .map_or(Resolution::New, |r| Resolution::Existing(r.id)))
    }

    /// Validate and resolve a whole album. A placeholder can be adopted by
    /// only one catalog artist per album.
    pub async fn resolve_album(&self, album: &AlbumDetail) -> Result<ResolvedAlbum, ResolveError> {
        validate_album(album)?;
        let release = self.resolve_release(album).await?;

        let mut claimed = HashSet::new();
        let mut artists = Vec::new();
        for artist in album.all_artists() {
            let (resolution, adopts_placeholder) =
                self.resolve_artist_excluding(artist, &claimed).await?;
            if adopts_placeholder {
                if let Resolution::Existing(id) = &resolution {
                    claimed.insert(id.clone());
                }
            }
            artists.push(ResolvedArtist {
                external_id: artist.external_id.clone(),
                name: artist.name.clone(),
                resolution,
                adopts_placeholder,
            });
        }

        Ok(ResolvedAlbum {
            external_id: album.external_id.clone(),
            title: album.title.clone(),
            release,
            artists,
            tracks: album.tracks.len(),
        })
    }
}
