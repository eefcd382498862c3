//! Scriptable `CatalogSource` for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    is_valid_external_id, AccessToken, AlbumDetail, AlbumSummary, CatalogArtist, CatalogSource,
    CatalogTrack, SearchPage,
};
use crate::error::CatalogError;

/// Pad a short tag into a well-formed 22-character catalog ID.
pub fn ext_id(tag: &str) -> String {
    format!("{:0>22}", tag)
}

pub fn artist(tag: &str, name: &str) -> CatalogArtist {
    CatalogArtist {
        external_id: ext_id(tag),
        name: name.to_string(),
        spotify_url: Some(format!("https://open.spotify.com/artist/{}", ext_id(tag))),
        image_url: None,
    }
}

pub fn track(tag: &str, number: i32, artists: &[CatalogArtist]) -> CatalogTrack {
    CatalogTrack {
        external_id: ext_id(tag),
        title: format!("Track {}", number),
        duration_ms: 200_000 + number * 1000,
        track_number: number,
        disc_number: 1,
        preview_url: None,
        external_url: None,
        artists: artists.to_vec(),
    }
}

pub fn album(
    tag: &str,
    title: &str,
    artists: Vec<CatalogArtist>,
    tracks: Vec<CatalogTrack>,
) -> AlbumDetail {
    AlbumDetail {
        external_id: ext_id(tag),
        title: title.to_string(),
        release_date: Some("2021-03-05".to_string()),
        release_type: "album".to_string(),
        artwork_url: Some(format!("https://i.scdn.co/image/{}", tag)),
        external_url: None,
        catalog_label: None,
        genres: Vec::new(),
        artists,
        tracks,
    }
}

#[derive(Clone)]
enum Entry {
    Album(AlbumSummary),
    Null,
    Malformed(String),
}

#[derive(Default)]
struct Inner {
    /// Search entries per lowercased label.
    listings: HashMap<String, Vec<Entry>>,
    details: HashMap<String, AlbumDetail>,
    artist_images: HashMap<String, String>,
    failing_offsets: HashSet<u32>,
    reject_auth: bool,
    fail_artist_lookup: bool,
    search_calls: u32,
    detail_calls: u32,
}

#[derive(Default)]
pub struct FakeCatalog {
    inner: Mutex<Inner>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// List `album` under `label` and serve its detail.
    pub fn publish(&self, label: &str, album: AlbumDetail) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .listings
            .entry(label.to_lowercase())
            .or_default()
            .push(Entry::Album(AlbumSummary {
                external_id: album.external_id.clone(),
                title: album.title.clone(),
            }));
        inner.details.insert(album.external_id.clone(), album);
    }

    /// List an ID under `label` without serving any detail for it.
    pub fn list_only(&self, label: &str, external_id: &str, title: &str) {
        self.inner
            .lock()
            .unwrap()
            .listings
            .entry(label.to_lowercase())
            .or_default()
            .push(Entry::Album(AlbumSummary {
                external_id: external_id.to_string(),
                title: title.to_string(),
            }));
    }

    pub fn push_null(&self, label: &str) {
        self.inner
            .lock()
            .unwrap()
            .listings
            .entry(label.to_lowercase())
            .or_default()
            .push(Entry::Null);
    }

    /// A search entry that fails to parse, with `reason` as the error.
    pub fn push_malformed(&self, label: &str, reason: &str) {
        self.inner
            .lock()
            .unwrap()
            .listings
            .entry(label.to_lowercase())
            .or_default()
            .push(Entry::Malformed(reason.to_string()));
    }

    pub fn set_artist_image(&self, tag: &str, url: &str) {
        self.inner
            .lock()
            .unwrap()
            .artist_images
            .insert(ext_id(tag), url.to_string());
    }

    /// Answer the search page starting at `offset` with a 429.
    pub fn fail_search_at(&self, offset: u32) {
        self.inner.lock().unwrap().failing_offsets.insert(offset);
    }

    pub fn reject_auth(&self) {
        self.inner.lock().unwrap().reject_auth = true;
    }

    pub fn fail_artist_lookup(&self) {
        self.inner.lock().unwrap().fail_artist_lookup = true;
    }

    pub fn search_calls(&self) -> u32 {
        self.inner.lock().unwrap().search_calls
    }

    pub fn detail_calls(&self) -> u32 {
        self.inner.lock().unwrap().detail_calls
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn authenticate(&self) -> Result<AccessToken, CatalogError> {
        if self.inner.lock().unwrap().reject_auth {
            return Err(CatalogError::Auth("invalid_client".into()));
        }
        Ok(AccessToken {
            value: "fake-token".into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        })
    }

    async fn search_albums_by_label(
        &self,
        label_name: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SearchPage, CatalogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.search_calls += 1;
        if inner.reject_auth {
            return Err(CatalogError::Auth("invalid_client".into()));
        }
        if inner.failing_offsets.contains(&offset) {
            return Err(CatalogError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            });
        }

        let entries = inner
            .listings
            .get(&label_name.to_lowercase())
            .cloned()
            .unwrap_or_default();
        let mut page = SearchPage {
            total: entries.len() as u32,
            ..Default::default()
        };
        for entry in entries.into_iter().skip(offset as usize).take(limit as usize) {
            match entry {
                Entry::Album(summary) => page.items.push(summary),
                Entry::Null => page.null_items += 1,
                Entry::Malformed(reason) => page
                    .malformed_items
                    .push(CatalogError::malformed("search result", reason).to_string()),
            }
        }
        Ok(page)
    }

    async fn get_album_detail(&self, external_id: &str) -> Result<AlbumDetail, CatalogError> {
        if !is_valid_external_id(external_id) {
            return Err(CatalogError::InvalidIdFormat(external_id.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.detail_calls += 1;
        inner
            .details
            .get(external_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("album {}", external_id)))
    }

    async fn get_artists(&self, external_ids: &[String]) -> Result<Vec<CatalogArtist>, CatalogError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_artist_lookup {
            return Err(CatalogError::Status {
                status: 503,
                url: "/artists".into(),
            });
        }
        let mut found: Vec<CatalogArtist> = Vec::new();
        for detail in inner.details.values() {
            for credit in detail.all_artists() {
                if external_ids.contains(&credit.external_id)
                    && !found.iter().any(|a| a.external_id == credit.external_id)
                {
                    let mut full = credit.clone();
                    full.image_url = inner.artist_images.get(&credit.external_id).cloned();
                    found.push(full);
                }
            }
        }
        Ok(found)
    }
}
