//! Relational catalog storage.
//!
//! `CatalogStore` covers lookups and the reconciler's writes. Sync writes go
//! through an `AlbumTx`, one per album: every call on it is isolated, so a
//! failed call rolls back its own effects and leaves the transaction usable
//! for the next item. Nothing is visible to readers until `commit`.

#[cfg(test)]
pub mod memory;
mod postgres;

use async_trait::async_trait;

pub use postgres::PgStore;

use crate::catalog::{AlbumDetail, CatalogArtist, CatalogTrack};
use crate::config::LabelSpec;
use crate::error::StoreResult;
use crate::model::{
    Artist, ArtistRole, CatalogCounts, Label, ReassignRule, Reassignment, Release,
    ReleaseForReview, Upserted,
};

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // =========================================================================
    // Labels
    // =========================================================================

    /// Return the label stored under `slug`. A label stored under `name`
    /// with another slug takes the new slug; otherwise a row is inserted.
    async fn ensure_label(&self, name: &str, slug: &str) -> StoreResult<Label>;

    /// Read-only counterpart of `ensure_label`: by slug, then by name.
    async fn find_label(&self, name: &str, slug: &str) -> StoreResult<Option<Label>>;

    // =========================================================================
    // Identity lookups
    // =========================================================================

    async fn find_artist_by_external_id(&self, external_id: &str) -> StoreResult<Option<Artist>>;

    /// Oldest artist without an external ID whose name matches
    /// case-insensitively.
    async fn find_placeholder_artist_by_name(&self, name: &str) -> StoreResult<Option<Artist>>;

    async fn find_release_by_external_id(&self, external_id: &str)
        -> StoreResult<Option<Release>>;

    async fn releases_by_external_ids(&self, external_ids: &[String]) -> StoreResult<Vec<Release>>;

    // =========================================================================
    // Sync writes
    // =========================================================================

    async fn begin_album(&self) -> StoreResult<Box<dyn AlbumTx>>;

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Move a release and all of its tracks to `new_label_id` in one
    /// transaction, recording the change in the reassignment audit table.
    async fn reassign_release(
        &self,
        release_id: &str,
        new_label_id: &str,
        rule: ReassignRule,
    ) -> StoreResult<Reassignment>;

    /// Releases without any release/artist link, optionally for one label.
    async fn find_orphan_releases(&self, label_id: Option<&str>) -> StoreResult<Vec<Release>>;

    /// Releases under `label_id` with their credited artist names.
    async fn releases_for_review(&self, label_id: &str) -> StoreResult<Vec<ReleaseForReview>>;

    /// Copy each release's label onto tracks that disagree with it.
    /// Returns the number of tracks changed.
    async fn restore_track_labels(&self, label_id: Option<&str>) -> StoreResult<u64>;

    async fn count_releases(&self, label_id: &str) -> StoreResult<i64>;

    async fn counts(&self) -> StoreResult<CatalogCounts>;
}

/// Stored rows for the configured labels, in config order.
///
/// Dry runs never write: a label without a row comes back as
/// `Label::unsaved`.
pub async fn load_labels(
    store: &dyn CatalogStore,
    specs: &[LabelSpec],
    dry_run: bool,
) -> StoreResult<Vec<Label>> {
    let mut labels = Vec::with_capacity(specs.len());
    for spec in specs {
        let slug = spec.slug();
        let label = if dry_run {
            store
                .find_label(&spec.name, &slug)
                .await?
                .unwrap_or_else(|| Label::unsaved(&spec.name, &slug))
        } else {
            store.ensure_label(&spec.name, &slug).await?
        };
        labels.push(label);
    }
    Ok(labels)
}

/// Writes for a single album.
#[async_trait]
pub trait AlbumTx: Send {
    /// Match by external ID, then adopt a same-named placeholder artist, then
    /// insert. `label_id` is only used when inserting.
    async fn upsert_artist(&mut self, artist: &CatalogArtist, label_id: &str)
        -> StoreResult<Upserted>;

    /// Insert by external ID, or refresh title, artwork, release date and
    /// genres; artwork, date and genres are kept when the catalog omits them.
    /// Label and primary artist of an existing release are never changed.
    async fn upsert_release(
        &mut self,
        album: &AlbumDetail,
        label_id: &str,
        primary_artist_id: &str,
    ) -> StoreResult<Upserted>;

    /// Returns false when the link already existed.
    async fn link_release_artist(
        &mut self,
        release_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool>;

    /// Insert or refresh a track; its label is copied from the parent release.
    async fn upsert_track(&mut self, track: &CatalogTrack, release_id: &str)
        -> StoreResult<Upserted>;

    async fn link_track_artist(
        &mut self,
        track_id: &str,
        artist_id: &str,
        role: ArtistRole,
    ) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
