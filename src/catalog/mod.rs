//! External music catalog access.

mod client;
#[cfg(test)]
pub mod fake;
pub mod ids;
pub mod listing;
pub mod types;

use async_trait::async_trait;

pub use client::{AccessToken, SpotifyClient};
pub use ids::is_valid_external_id;
pub use listing::{collect_listing, FailedPage, LabelListing, MalformedEntry};
pub use types::{AlbumDetail, AlbumSummary, CatalogArtist, CatalogTrack, SearchPage};

use crate::error::CatalogError;

/// Read access to the external catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Obtain (and cache) an access token.
    async fn authenticate(&self) -> Result<AccessToken, CatalogError>;

    /// One page of albums published under `label_name`.
    async fn search_albums_by_label(
        &self,
        label_name: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SearchPage, CatalogError>;

    /// Full album detail including every track.
    async fn get_album_detail(&self, external_id: &str) -> Result<AlbumDetail, CatalogError>;

    /// Full artist objects (with images) for the given IDs.
    async fn get_artists(&self, external_ids: &[String]) -> Result<Vec<CatalogArtist>, CatalogError>;
}
