//! Per-album persistence of releases, artists, tracks and their links.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{AlbumDetail, CatalogArtist};
use crate::error::StoreError;
use crate::model::ArtistRole;
use crate::store::{AlbumTx, CatalogStore};

/// An artist, track or link that could not be written. The album itself
/// was still committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub entity: &'static str,
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AlbumWrite {
    pub release_id: String,
    pub release_created: bool,
    pub new_artists: usize,
    pub new_tracks: usize,
    pub new_links: usize,
    pub item_failures: Vec<ItemFailure>,
}

#[derive(Error, Debug)]
pub enum AlbumWriteError {
    /// The release (or the primary artist it needs) could not be written;
    /// nothing from this album was kept.
    #[error("album not written: {0}")]
    Album(String),

    /// The store itself is unreachable; later albums would fail too.
    #[error("store unavailable: {0}")]
    Connection(StoreError),
}

fn album_error(what: &str, e: StoreError) -> AlbumWriteError {
    if e.is_transient() {
        AlbumWriteError::Connection(e)
    } else {
        AlbumWriteError::Album(format!("{}: {}", what, e))
    }
}

pub struct UpsertWriter<'a> {
    store: &'a dyn CatalogStore,
}

/// Write state for one open album transaction.
struct AlbumWork<'t> {
    tx: &'t mut Box<dyn AlbumTx>,
    label_id: &'t str,
    artist_ids: HashMap<String, String>,
    result: AlbumWrite,
}

impl AlbumWork<'_> {
    /// Record an item failure, or escalate when the store went away.
    fn item_failed(
        &mut self,
        entity: &'static str,
        external_id: &str,
        e: StoreError,
    ) -> Result<(), AlbumWriteError> {
        if e.is_transient() {
            return Err(AlbumWriteError::Connection(e));
        }
        warn!("Skipping {} {}: {}", entity, external_id, e);
        self.result.item_failures.push(ItemFailure {
            entity,
            external_id: external_id.to_string(),
            reason: e.to_string(),
        });
        Ok(())
    }

    /// Internal ID for `artist`, writing it on first use within the album.
    async fn artist_id(
        &mut self,
        artist: &CatalogArtist,
    ) -> Result<Option<String>, AlbumWriteError> {
        if let Some(id) = self.artist_ids.get(&artist.external_id) {
            return Ok(Some(id.clone()));
        }
        match self.tx.upsert_artist(artist, self.label_id).await {
            Ok(up) => {
                if up.created {
                    self.result.new_artists += 1;
                }
                self.artist_ids.insert(artist.external_id.clone(), up.id.clone());
                Ok(Some(up.id))
            }
            Err(e) => {
                self.item_failed("artist", &artist.external_id, e)?;
                Ok(None)
            }
        }
    }
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a dyn CatalogStore) -> Self {
        Self { store }
    }

    /// Persist `album` under `label_id` in one transaction.
    ///
    /// Order: primary artist, release, remaining album artists and their
    /// links, then tracks with their credits. Failing to write the primary
    /// artist or the release aborts the album; any later item failure is
    /// recorded and the album continues.
    pub async fn write_album(
        &self,
        album: &AlbumDetail,
        label_id: &str,
    ) -> Result<AlbumWrite, AlbumWriteError> {
        let primary = album
            .artists
            .first()
            .ok_or_else(|| AlbumWriteError::Album("album has no artists".into()))?;

        let mut tx = self
            .store
            .begin_album()
            .await
            .map_err(|e| album_error("begin", e))?;

        let primary_up = tx
            .upsert_artist(primary, label_id)
            .await
            .map_err(|e| album_error("primary artist", e))?;
        let release = tx
            .upsert_release(album, label_id, &primary_up.id)
            .await
            .map_err(|e| album_error("release", e))?;

        let mut work = AlbumWork {
            tx: &mut tx,
            label_id,
            artist_ids: HashMap::from([(primary.external_id.clone(), primary_up.id.clone())]),
            result: AlbumWrite {
                release_id: release.id.clone(),
                release_created: release.created,
                new_artists: usize::from(primary_up.created),
                ..Default::default()
            },
        };

        for (position, artist) in album.artists.iter().enumerate() {
            let Some(artist_id) = work.artist_id(artist).await? else {
                continue;
            };
            let role = ArtistRole::for_position(position);
            match work.tx.link_release_artist(&release.id, &artist_id, role).await {
                Ok(true) => work.result.new_links += 1,
                Ok(false) => {}
                Err(e) => work.item_failed("release artist link", &artist.external_id, e)?,
            }
        }

        for track in &album.tracks {
            let track_up = match work.tx.upsert_track(track, &release.id).await {
                Ok(up) => up,
                Err(e) => {
                    work.item_failed("track", &track.external_id, e)?;
                    continue;
                }
            };
            if track_up.created {
                work.result.new_tracks += 1;
            }

            for (position, artist) in track.artists.iter().enumerate() {
                let Some(artist_id) = work.artist_id(artist).await? else {
                    continue;
                };
                let role = ArtistRole::for_position(position);
                match work.tx.link_track_artist(&track_up.id, &artist_id, role).await {
                    Ok(true) => work.result.new_links += 1,
                    Ok(false) => {}
                    Err(e) => work.item_failed("track artist link", &track.external_id, e)?,
                }
            }
        }

        let result = work.result;
        tx.commit().await.map_err(|e| album_error("commit", e))?;

        debug!(
            "Wrote album {} (release {}, {} new artists, {} new tracks, {} item failures)",
            album.external_id,
            result.release_id,
            result.new_artists,
            result.new_tracks,
            result.item_failures.len()
        );
        Ok(result)
    }
}
