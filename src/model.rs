//! Rows of the relational catalog.

use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub slug: String,
}

impl Label {
    /// A configured label with no row yet. Only dry runs see these.
    pub fn unsaved(name: &str, slug: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            slug: slug.to_string(),
        }
    }

    pub fn is_stored(&self) -> bool {
        !self.id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Artist {
    pub id: String,
    pub external_id: Option<String>,
    pub name: String,
    pub image_url: Option<String>,
    pub spotify_url: Option<String>,
    pub label_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Release {
    pub id: String,
    pub external_id: String,
    pub title: String,
    pub release_date: Option<String>,
    pub artwork_url: Option<String>,
    pub external_url: Option<String>,
    pub label_id: String,
    pub release_type: String,
    pub primary_artist_id: String,
    /// Genres as reported by the catalog; empty when it reports none.
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Track {
    pub id: String,
    pub external_id: String,
    pub title: String,
    pub duration_ms: i32,
    pub track_number: i32,
    pub disc_number: i32,
    pub preview_url: Option<String>,
    pub external_url: Option<String>,
    pub release_id: String,
    pub label_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtistRole {
    Primary,
    Featured,
}

impl ArtistRole {
    /// Credit position 0 is the primary artist.
    pub fn for_position(position: usize) -> Self {
        if position == 0 {
            Self::Primary
        } else {
            Self::Featured
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Featured => "featured",
        }
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReassignRule {
    /// The catalog lists the release under the target label.
    CatalogLabel,
    /// The label keyword table matched exactly one label.
    Keyword,
}

impl ReassignRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogLabel => "catalog-label",
            Self::Keyword => "keyword",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reassignment {
    pub release_id: String,
    pub from_label_id: String,
    pub to_label_id: String,
    pub tracks_updated: u64,
}

/// A release plus the names of its credited artists, as input to
/// keyword classification alongside its title and genres.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseForReview {
    pub release: Release,
    pub artist_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub labels: i64,
    pub artists: i64,
    pub releases: i64,
    pub tracks: i64,
    pub release_artists: i64,
    pub track_artists: i64,
}
