//! Catalog records, and the wire shapes they are parsed from.
//!
//! The wire structs mirror the catalog's JSON loosely (everything optional);
//! the `into_*` conversions are the single place where missing or mistyped
//! fields are turned into `MalformedPayload`.

use serde::Deserialize;

use crate::error::CatalogError;

// ---------------------------------------------------------------------------
// Parsed records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumSummary {
    pub external_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub items: Vec<AlbumSummary>,
    /// Only meaningful on the first page.
    pub total: u32,
    /// `null` entries the catalog returned in place of albums.
    pub null_items: u32,
    /// Entries that could not be parsed, with the reason.
    pub malformed_items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogArtist {
    pub external_id: String,
    pub name: String,
    pub spotify_url: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrack {
    pub external_id: String,
    pub title: String,
    pub duration_ms: i32,
    pub track_number: i32,
    pub disc_number: i32,
    pub preview_url: Option<String>,
    pub external_url: Option<String>,
    pub artists: Vec<CatalogArtist>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumDetail {
    pub external_id: String,
    pub title: String,
    pub release_date: Option<String>,
    pub release_type: String,
    pub artwork_url: Option<String>,
    pub external_url: Option<String>,
    /// Label string the catalog reports for the album.
    pub catalog_label: Option<String>,
    pub genres: Vec<String>,
    /// Album-level credits, primary artist first.
    pub artists: Vec<CatalogArtist>,
    pub tracks: Vec<CatalogTrack>,
}

impl AlbumDetail {
    /// Album artists followed by any track-only artists, first occurrence wins.
    pub fn all_artists(&self) -> Vec<&CatalogArtist> {
        let mut seen = std::collections::HashSet::new();
        self.artists
            .iter()
            .chain(self.tracks.iter().flat_map(|t| t.artists.iter()))
            .filter(|a| seen.insert(a.external_id.as_str()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Paging<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    pub total: Option<u32>,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    pub albums: Option<Paging<Option<WireAlbumRef>>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAlbumRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireImage {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExternalUrls {
    pub spotify: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireArtist {
    pub id: Option<String>,
    pub name: Option<String>,
    pub external_urls: Option<ExternalUrls>,
    pub images: Option<Vec<WireImage>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTrack {
    pub id: Option<String>,
    pub name: Option<String>,
    pub duration_ms: Option<u64>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub preview_url: Option<String>,
    pub external_urls: Option<ExternalUrls>,
    pub artists: Option<Vec<WireArtist>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAlbum {
    pub id: Option<String>,
    pub name: Option<String>,
    pub album_type: Option<String>,
    pub release_date: Option<String>,
    pub images: Option<Vec<WireImage>>,
    pub external_urls: Option<ExternalUrls>,
    pub artists: Option<Vec<WireArtist>>,
    pub tracks: Option<Paging<Option<WireTrack>>>,
    pub label: Option<String>,
    pub genres: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ArtistsResponse {
    #[serde(default)]
    pub artists: Vec<Option<WireArtist>>,
}

// ---------------------------------------------------------------------------
// Parse step
// ---------------------------------------------------------------------------

fn required(value: Option<String>, context: &str, field: &str) -> Result<String, CatalogError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CatalogError::malformed(context, format!("missing {}", field))),
    }
}

fn first_image(images: Option<Vec<WireImage>>) -> Option<String> {
    images?.into_iter().find_map(|i| i.url)
}

fn to_i32(value: u64, context: &str, field: &str) -> Result<i32, CatalogError> {
    i32::try_from(value)
        .map_err(|_| CatalogError::malformed(context, format!("{} out of range: {}", field, value)))
}

impl WireAlbumRef {
    /// The title is display-only and falls back to the ID.
    pub fn into_summary(self) -> Result<AlbumSummary, CatalogError> {
        let external_id = required(self.id, "search result", "id")?;
        let title = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => external_id.clone(),
        };
        Ok(AlbumSummary { external_id, title })
    }
}

impl WireArtist {
    pub fn into_artist(self, context: &str) -> Result<CatalogArtist, CatalogError> {
        Ok(CatalogArtist {
            external_id: required(self.id, context, "artist id")?,
            name: required(self.name, context, "artist name")?,
            spotify_url: self.external_urls.and_then(|u| u.spotify),
            image_url: first_image(self.images),
        })
    }
}

impl WireTrack {
    pub fn into_track(self, album_id: &str) -> Result<CatalogTrack, CatalogError> {
        let context = format!("track on album {}", album_id);
        let external_id = required(self.id, &context, "id")?;
        let title = required(self.name, &context, "name")?;
        let duration_ms = self
            .duration_ms
            .ok_or_else(|| CatalogError::malformed(&context, "missing duration_ms"))?;
        let track_number = self
            .track_number
            .ok_or_else(|| CatalogError::malformed(&context, "missing track_number"))?;
        let artists = self
            .artists
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.into_artist(&context))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CatalogTrack {
            external_id,
            title,
            duration_ms: to_i32(duration_ms, &context, "duration_ms")?,
            track_number: to_i32(track_number.into(), &context, "track_number")?,
            disc_number: to_i32(self.disc_number.unwrap_or(1).into(), &context, "disc_number")?,
            preview_url: self.preview_url,
            external_url: self.external_urls.and_then(|u| u.spotify),
            artists,
        })
    }
}

impl WireAlbum {
    /// Parse into an `AlbumDetail`. `extra_tracks` are items from follow-up
    /// track pages, appended after the embedded first page.
    pub fn into_detail(
        self,
        extra_tracks: Vec<Option<WireTrack>>,
    ) -> Result<AlbumDetail, CatalogError> {
        let external_id = required(self.id, "album", "id")?;
        let context = format!("album {}", external_id);
        let title = required(self.name, &context, "name")?;

        let artists = self
            .artists
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.into_artist(&context))
            .collect::<Result<Vec<_>, _>>()?;
        if artists.is_empty() {
            return Err(CatalogError::malformed(&context, "no artists"));
        }

        let first_page = self
            .tracks
            .ok_or_else(|| CatalogError::malformed(&context, "missing tracks"))?;
        let tracks = first_page
            .items
            .into_iter()
            .chain(extra_tracks)
            .map(|t| match t {
                Some(t) => t.into_track(&external_id),
                None => Err(CatalogError::malformed(&context, "null track entry")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AlbumDetail {
            title,
            release_date: self.release_date,
            release_type: self.album_type.unwrap_or_else(|| "album".to_string()),
            artwork_url: first_image(self.images),
            external_url: self.external_urls.and_then(|u| u.spotify),
            catalog_label: self.label,
            genres: self.genres.unwrap_or_default(),
            artists,
            tracks,
            external_id,
        })
    }
}
