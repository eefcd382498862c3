//! In-memory `CatalogStore` used by unit tests.
//!
//! An album transaction works on a private copy of the state and swaps it in
//! on commit. Runs are sequential in tests, so last commit wins.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AlbumTx, CatalogStore};
use crate::catalog::{AlbumDetail, CatalogArtist, CatalogTrack};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    Artist, ArtistRole, CatalogCounts, Label, ReassignRule, Reassignment, Release,
    ReleaseForReview, Track, Upserted,
};

type Link = (String, String, ArtistRole);

#[derive(Debug, Clone, Default)]
struct State {
    labels: Vec<Label>,
    /// Insertion order doubles as creation order.
    artists: Vec<Artist>,
    releases: Vec<Release>,
    tracks: Vec<Track>,
    release_artists: BTreeSet<Link>,
    track_artists: BTreeSet<Link>,
    reassignments: Vec<(Reassignment, ReassignRule)>,
}

#[derive(Debug, Clone, Default)]
struct Failures {
    artists: HashSet<String>,
    releases: HashSet<String>,
    tracks: HashSet<String>,
    connection: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    failures: Arc<Mutex<Failures>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- failure injection --------------------------------------------------

    pub fn fail_artist(&self, external_id: &str) {
        self.failures.lock().unwrap().artists.insert(external_id.to_string());
    }

    pub fn fail_release(&self, external_id: &str) {
        self.failures.lock().unwrap().releases.insert(external_id.to_string());
    }

    pub fn fail_track(&self, external_id: &str) {
        self.failures.lock().unwrap().tracks.insert(external_id.to_string());
    }

    /// Make every subsequent `begin_album` fail as if the pool went away.
    pub fn fail_connection(&self) {
        self.failures.lock().unwrap().connection = true;
    }

    // -- seeding ------------------------------------------------------------

    /// Insert an artist without an external ID.
    pub fn insert_placeholder_artist(&self, name: &str, label_id: &str) -> String {
        let id = cuid2::create_id();
        self.state.lock().unwrap().artists.push(Artist {
            id: id.clone(),
            external_id: None,
            name: name.to_string(),
            image_url: None,
            spotify_url: None,
            label_id: label_id.to_string(),
        });
        id
    }

    /// Insert a release credited to placeholder artists named `artists`.
    /// With no artists the release is an orphan; its primary artist is then a
    /// fresh placeholder that is not linked.
    pub fn seed_release(
        &self,
        external_id: &str,
        title: &str,
        label_id: &str,
        artists: &[&str],
    ) -> String {
        let artist_ids: Vec<String> = if artists.is_empty() {
            vec![self.insert_placeholder_artist("Unlinked", label_id)]
        } else {
            artists
                .iter()
                .map(|name| self.insert_placeholder_artist(name, label_id))
                .collect()
        };
        let release_id = cuid2::create_id();
        let mut state = self.state.lock().unwrap();
        state.releases.push(Release {
            id: release_id.clone(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            release_date: None,
            artwork_url: None,
            external_url: None,
            label_id: label_id.to_string(),
            release_type: "album".to_string(),
            primary_artist_id: artist_ids[0].clone(),
            genres: Vec::new(),
        });
        if !artists.is_empty() {
            for (position, artist_id) in artist_ids.iter().enumerate() {
                state.release_artists.insert((
                    release_id.clone(),
                    artist_id.clone(),
                    ArtistRole::for_position(position),
                ));
            }
        }
        release_id
    }

    /// Put a track under a label other than its release's.
    pub fn set_track_label(&self, track_external_id: &str, label_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(track) = state
            .tracks
            .iter_mut()
            .find(|t| t.external_id == track_external_id)
        {
            track.label_id = label_id.to_string();
        }
    }

    // -- inspection ---------------------------------------------------------

    pub fn labels(&self) -> Vec<Label> {
        self.state.lock().unwrap().labels.clone()
    }

    pub fn artists(&self) -> Vec<Artist> {
        self.state.lock().unwrap().artists.clone()
    }

    pub fn releases(&self) -> Vec<Release> {
        self.state.lock().unwrap().releases.clone()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn release_artists(&self) -> Vec<Link> {
        self.state.lock().unwrap().release_artists.iter().cloned().collect()
    }

    pub fn track_artists(&self) -> Vec<Link> {
        self.state.lock().unwrap().track_artists.iter().cloned().collect()
    }

    pub fn reassignments(&self) -> Vec<(Reassignment, ReassignRule)> {
        self.state.lock().unwrap().reassignments.clone()
    }

    pub fn release(&self, external_id: &str) -> Option<Release> {
        self.releases().into_iter().find(|r| r.external_id == external_id)
    }
}

fn missing(entity: &'static str, id: &str) -> StoreError {
    StoreError::MissingParent {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn ensure_label(&self, name: &str, slug: &str) -> StoreResult<Label> {
        let mut state = self.state.lock().unwrap();
        if let Some(label) = state.labels.iter().find(|l| l.slug == slug) {
            return Ok(label.clone());
        }
        if let Some(label) = state.labels.iter_mut().find(|l| l.name == name) {
            label.slug = slug.to_string();
            return Ok(label.clone());
        }
        let label = Label {
            id: cuid2::create_id(),
            name: name.to_string(),
            slug: slug.to_string(),
        };
        state.labels.push(label.clone());
        Ok(label)
    }

    async fn find_label(&self, name: &str, slug: &str) -> StoreResult<Option<Label>> {
        let labels = self.labels();
        Ok(labels
            .iter()
            .find(|l| l.slug == slug)
            .or_else(|| labels.iter().find(|l| l.name == name))
            .cloned())
    }

    async fn find_artist_by_external_id(&self, external_id: &str) -> StoreResult<Option<Artist>> {
        Ok(self
            .artists()
            .into_iter()
            .find(|a| a.external_id.as_deref() == Some(external_id)))
    }

    async fn find_placeholder_artist_by_name(&self, name: &str) -> StoreResult<Option<Artist>> {
        let wanted = name.to_lowercase();
        Ok(self
            .artists()
            .into_iter()
            .find(|a| a.external_id.is_none() && a.name.to_lowercase() == wanted))
    }

    async fn find_release_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Release>> {
        Ok(self.release(external_id))
    }

    async fn releases_by_external_ids(&self, external_ids: &[String]) -> StoreResult<Vec<Release>> {
        Ok(self
            .releases()
            .into_iter()
            .filter(|r| external_ids.contains(&r.external_id))
            .collect())
    }

    async fn begin_album(&self) -> StoreResult<Box<dyn AlbumTx>> {
        let failures = self.failures.lock().unwrap().clone();
        if failures.connection {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        let staged = self.state.lock().unwrap().clone();
        Ok(Box::new(MemoryAlbumTx {
            shared: Arc::clone(&self.state),
            staged,
            failures,
        }))
    }

    async fn reassign_release(
        &self,
        release_id: &str,
        new_label_id: &str,
        rule: ReassignRule,
    ) -> StoreResult<Reassignment> {
        let mut state = self.state.lock().unwrap();
        let release = state
            .releases
            .iter_mut()
            .find(|r| r.id == release_id)
            .ok_or_else(|| missing("release", release_id))?;
        let from_label_id = std::mem::replace(&mut release.label_id, new_label_id.to_string());

        let mut tracks_updated = 0;
        for track in state.tracks.iter_mut().filter(|t| t.release_id == release_id) {
            track.label_id = new_label_id.to_string();
            tracks_updated += 1;
        }

        let reassignment = Reassignment {
            release_id: release_id.to_string(),
            from_label_id,
            to_label_id: new_label_id.to_string(),
            tracks_updated,
        };
        state.reassignments.push((reassignment.clone(), rule));
        Ok(reassignment)
    }

    async fn find_orphan_releases(&self, label_id: Option<&str>) -> StoreResult<Vec<Release>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .releases
            .iter()
            .filter(|r| label_id.map_or(true, |l| r.label_id == l))
            .filter(|r| !state.release_artists.iter().any(|(rid, _, _)| *rid == r.id))
            .cloned()
            .collect())
    }

    async fn releases_for_review(&self, label_id: &str) -> StoreResult<Vec<ReleaseForReview>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<ReleaseForReview> = state
            .releases
            .iter()
            .filter(|r| r.label_id == label_id)
            .map(|release| {
                let mut credits: Vec<(ArtistRole, String)> = state
                    .release_artists
                    .iter()
                    .filter(|(rid, _, _)| *rid == release.id)
                    .filter_map(|(_, aid, role)| {
                        state
                            .artists
                            .iter()
                            .find(|a| a.id == *aid)
                            .map(|a| (*role, a.name.clone()))
                    })
                    .collect();
                credits.sort();
                ReleaseForReview {
                    release: release.clone(),
                    artist_names: credits.into_iter().map(|(_, name)| name).collect(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.release.title.cmp(&b.release.title));
        Ok(out)
    }

    async fn restore_track_labels(&self, label_id: Option<&str>) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        let State {
            releases, tracks, ..
        } = &mut *state;
        let mut changed = 0;
        for track in tracks.iter_mut() {
            let Some(release) = releases.iter().find(|r| r.id == track.release_id) else {
                continue;
            };
            if label_id.map_or(false, |l| release.label_id != l) {
                continue;
            }
            if track.label_id != release.label_id {
                track.label_id = release.label_id.clone();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn count_releases(&self, label_id: &str) -> StoreResult<i64> {
        Ok(self
            .releases()
            .iter()
            .filter(|r| r.label_id == label_id)
            .count() as i64)
    }

    async fn counts(&self) -> StoreResult<CatalogCounts> {
        let state = self.state.lock().unwrap();
        Ok(CatalogCounts {
            labels: state.labels.len() as i64,
            artists: state.artists.len() as i64,
            releases: state.releases.len() as i64,
            tracks: state.tracks.len() as i64,
            release_artists: state.release_artists.len() as i64,
            track_artists: state.track_artists.len() as i64,
        })
    }
}

struct MemoryAlbumTx {
    shared: Arc<Mutex<State>>,
    staged: State,
    failures: Failures,
}

#[async_trait]
impl AlbumTx for MemoryAlbumTx {
    async fn upsert_artist(
        &mut self,
        artist: &CatalogArtist,
        label_id: &str,
    ) -> StoreResult<Upserted> {
        if self.failures.artists.contains(&artist.external_id) {
            return Err(StoreError::Injected(format!(
                "artist {} write failed",
                artist.external_id
            )));
        }
        let artists = &mut self.staged.artists;
        let existing = artists
            .iter()
            .position(|a| a.external_id.as_deref() == Some(artist.external_id.as_str()))
            .or_else(|| {
                let wanted = artist.name.to_lowercase();
                artists
                    .iter()
                    .position(|a| a.external_id.is_none() && a.name.to_lowercase() == wanted)
            });

        if let Some(index) = existing {
            let row = &mut artists[index];
            row.external_id = Some(artist.external_id.clone());
            row.name = artist.name.clone();
            if artist.image_url.is_some() {
                row.image_url = artist.image_url.clone();
            }
            if artist.spotify_url.is_some() {
                row.spotify_url = artist.spotify_url.clone();
            }
            return Ok(Upserted {
                id: row.id.clone(),
                created: false,
            });
        }

        let id = cuid2::create_id();
        artists.push(Artist {
            id: id.clone(),
            external_id: Some(artist.external_id.clone()),
            name: artist.name.clone(),
            image_url: artist.image_url.clone(),
            spotify_url: artist.spotify_url.clone(),
            label_id: label_id.to_string(),
        });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_release(
        &mut self,
        album: &AlbumDetail,
        label_id: &str,
        primary_artist_id: &str,
    ) -> StoreResult<Upserted> {
        if self.failures.releases.contains(&album.external_id) {
            return Err(StoreError::Injected(format!(
                "release {} write failed",
                album.external_id
            )));
        }
        if let Some(row) = self
            .staged
            .releases
            .iter_mut()
            .find(|r| r.external_id == album.external_id)
        {
            row.title = album.title.clone();
            if album.artwork_url.is_some() {
                row.artwork_url = album.artwork_url.clone();
            }
            if album.release_date.is_some() {
                row.release_date = album.release_date.clone();
            }
            if !album.genres.is_empty() {
                row.genres = album.genres.clone();
            }
            return Ok(Upserted {
                id: row.id.clone(),
                created: false,
            });
        }
        if !self.staged.artists.iter().any(|a| a.id == primary_artist_id) {
            return Err(missing("artist", primary_artist_id));
        }

        let id = cuid2::create_id();
        self.staged.releases.push(Release {
            id: id.clone(),
            external_id: album.external_id.clone(),
            title: album.title.clone(),
            release_date: album.release_date.clone(),
            artwork_url: album.artwork_url.clone(),
            external_url: album.external_url.clone(),
            label_id: label_id.to_string(),
            release_type: album.release_type.clone(),
            primary_artist_id: primary_artist_id.to_string(),
            genres: album.genres.clone(),
        });
        Ok(Upserted { id, created: true })
    }

    async fn link_release_artist(
        &mut self,
        release_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool> {
        if !self.staged.releases.iter().any(|r| r.id == release_id) {
            return Err(missing("release", release_id));
        }
        if !self.staged.artists.iter().any(|a| a.id == artist_id) {
            return Err(missing("artist", artist_id));
        }
        Ok(self
            .staged
            .release_artists
            .insert((release_id.to_string(), artist_id.to_string(), role)))
    }

    async fn upsert_track(
        &mut self,
        track: &CatalogTrack,
        release_id: &str,
    ) -> StoreResult<Upserted> {
        if self.failures.tracks.contains(&track.external_id) {
            return Err(StoreError::Injected(format!(
                "track {} write failed",
                track.external_id
            )));
        }
        let label_id = self
            .staged
            .releases
            .iter()
            .find(|r| r.id == release_id)
            .map(|r| r.label_id.clone())
            .ok_or_else(|| missing("release", release_id))?;

        if let Some(row) = self
            .staged
            .tracks
            .iter_mut()
            .find(|t| t.external_id == track.external_id)
        {
            if row.release_id != release_id {
                return Err(StoreError::Conflict(format!(
                    "track {} belongs to another release",
                    track.external_id
                )));
            }
            row.title = track.title.clone();
            row.duration_ms = track.duration_ms;
            row.track_number = track.track_number;
            row.disc_number = track.disc_number;
            row.preview_url = track.preview_url.clone();
            row.external_url = track.external_url.clone();
            row.label_id = label_id;
            return Ok(Upserted {
                id: row.id.clone(),
                created: false,
            });
        }

        let id = cuid2::create_id();
        self.staged.tracks.push(Track {
            id: id.clone(),
            external_id: track.external_id.clone(),
            title: track.title.clone(),
            duration_ms: track.duration_ms,
            track_number: track.track_number,
            disc_number: track.disc_number,
            preview_url: track.preview_url.clone(),
            external_url: track.external_url.clone(),
            release_id: release_id.to_string(),
            label_id,
        });
        Ok(Upserted { id, created: true })
    }

    async fn link_track_artist(
        &mut self,
        track_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool> {
        if !self.staged.tracks.iter().any(|t| t.id == track_id) {
            return Err(missing("track", track_id));
        }
        if !self.staged.artists.iter().any(|a| a.id == artist_id) {
            return Err(missing("artist", artist_id));
        }
        Ok(self
            .staged
            .track_artists
            .insert((track_id.to_string(), artist_id.to_string(), role)))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryAlbumTx { shared, staged, .. } = *self;
        *shared.lock().unwrap() = staged;
        Ok(())
    }
}
