//! Per-label sync run.
//!
//! `Idle -> Authenticating -> Paginating -> (Resolving -> Upserting)* ->
//! Reconciling -> Done | Failed`. Albums are processed one at a time; the
//! cancel token is checked between albums only.

use std::collections::HashMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{collect_listing, AlbumDetail, AlbumSummary, CatalogSource};
use crate::error::{CatalogError, ResolveError, RunError};
use crate::model::Label;
use crate::reconcile::normalize;
use crate::report::{
    ErrorLog, LabelMismatch, Progress, RunOutcome, SkipReason, SkippedItem, SyncReport,
};
use crate::resolver::IdentityResolver;
use crate::store::CatalogStore;
use crate::writer::{AlbumWriteError, UpsertWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Authenticating,
    Paginating,
    Resolving,
    Upserting,
    Reconciling,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub page_size: u32,
    pub max_pages: u32,
    /// Resolve only; nothing is written.
    pub dry_run: bool,
}

fn skip_reason(e: &CatalogError) -> SkipReason {
    match e {
        CatalogError::InvalidIdFormat(_) => SkipReason::InvalidExternalId,
        CatalogError::NotFound(_) => SkipReason::NotFound,
        CatalogError::RateLimited { .. } => SkipReason::RateLimited,
        CatalogError::MalformedPayload { .. } => SkipReason::MalformedPayload,
        _ => SkipReason::CatalogError,
    }
}

pub struct SyncOrchestrator<'a> {
    catalog: &'a dyn CatalogSource,
    store: &'a dyn CatalogStore,
    error_log: &'a ErrorLog,
    options: SyncOptions,
    progress: Progress,
    cancel: CancellationToken,
    phase: SyncPhase,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        catalog: &'a dyn CatalogSource,
        store: &'a dyn CatalogStore,
        error_log: &'a ErrorLog,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            store,
            error_log,
            options,
            progress: Progress::silent(),
            cancel,
            phase: SyncPhase::Idle,
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn enter(&mut self, next: SyncPhase, label: &str) {
        debug!("[{}] {:?} -> {:?}", label, self.phase, next);
        self.phase = next;
    }

    /// Sync one label end to end. Run-level errors are folded into the
    /// report (outcome `Failed`); the run never panics on catalog data.
    pub async fn run_sync(&mut self, label: &Label) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(&label.name, self.options.dry_run);
        self.phase = SyncPhase::Idle;
        self.progress
            .header("Catalog Sync", &label.name, self.options.dry_run);

        match self.run(label, &mut report).await {
            Ok(()) => {
                self.enter(SyncPhase::Done, &label.name);
                info!(
                    "Sync of {:?} {:?}: {} new, {} existing, {} failed",
                    label.name,
                    report.outcome,
                    report.new_releases,
                    report.existing_releases,
                    report.failed_releases
                );
            }
            Err(e) => {
                self.enter(SyncPhase::Failed, &label.name);
                warn!("Sync of {:?} failed: {}", label.name, e);
                self.error_log
                    .sync(&format!("Label '{}' sync failed: {}", label.name, e));
                report.outcome = RunOutcome::Failed;
                report.error = Some(e.to_string());
            }
        }
        report.set_elapsed(started.elapsed());
        report
    }

    async fn run(&mut self, label: &Label, report: &mut SyncReport) -> Result<(), RunError> {
        self.enter(SyncPhase::Authenticating, &label.name);
        self.catalog.authenticate().await?;

        self.enter(SyncPhase::Paginating, &label.name);
        let listing = collect_listing(
            self.catalog,
            &label.name,
            self.options.page_size,
            self.options.max_pages,
        )
        .await?;
        report.catalog_total = listing.total;
        report.albums_listed = listing.albums.len();
        report.null_items = listing.null_items;
        for page in &listing.failed_pages {
            self.record(report, SkippedItem::from_page(page));
        }
        for entry in &listing.malformed {
            self.record(report, SkippedItem::from_entry(entry));
        }
        for dup in &listing.duplicates {
            report.skipped.push(SkippedItem::new(
                SkipReason::DuplicateInRun,
                "album",
                dup.external_id.clone(),
                format!("'{}' listed more than once", dup.title),
            ));
        }
        info!(
            "{:?}: {} albums listed (catalog total {:?})",
            label.name,
            listing.albums.len(),
            listing.total
        );

        let total = listing.albums.len();
        for (index, summary) in listing.albums.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    "Sync of {:?} cancelled after {} of {} albums",
                    label.name, index, total
                );
                report.outcome = RunOutcome::Cancelled;
                return Ok(());
            }
            self.progress.album(index + 1, total, &summary.title);
            self.sync_album(label, summary, report).await?;
        }

        if self.options.dry_run {
            return Ok(());
        }

        self.enter(SyncPhase::Reconciling, &label.name);
        report.tracks_relabeled = self
            .store
            .restore_track_labels(Some(label.id.as_str()))
            .await?;
        report.orphan_releases = self
            .store
            .find_orphan_releases(Some(label.id.as_str()))
            .await?
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        if !report.orphan_releases.is_empty() {
            warn!(
                "{:?}: {} releases have no artists",
                label.name,
                report.orphan_releases.len()
            );
        }
        Ok(())
    }

    /// Resolve and write one album. Only run-level failures are returned.
    async fn sync_album(
        &mut self,
        label: &Label,
        summary: &AlbumSummary,
        report: &mut SyncReport,
    ) -> Result<(), RunError> {
        self.enter(SyncPhase::Resolving, &label.name);
        let album = match self.catalog.get_album_detail(&summary.external_id).await {
            Ok(album) => album,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                self.fail_album(report, skip_reason(&e), summary, e.to_string());
                return Ok(());
            }
        };
        if let Some(reported) = album
            .catalog_label
            .as_deref()
            .filter(|l| normalize(l) != normalize(&label.name))
        {
            debug!(
                "Album {} listed under {:?} but labelled {:?}",
                album.external_id, label.name, reported
            );
            report.label_mismatches.push(LabelMismatch {
                external_id: album.external_id.clone(),
                title: album.title.clone(),
                catalog_label: reported.to_string(),
            });
        }

        let resolved = match IdentityResolver::new(self.store).resolve_album(&album).await {
            Ok(resolved) => resolved,
            Err(e @ ResolveError::InvalidExternalId { .. }) => {
                self.fail_album(report, SkipReason::InvalidExternalId, summary, e.to_string());
                return Ok(());
            }
            Err(ResolveError::Store(e)) if e.is_transient() => return Err(e.into()),
            Err(ResolveError::Store(e)) => {
                self.fail_album(report, SkipReason::PartialAlbumFailure, summary, e.to_string());
                return Ok(());
            }
        };

        if self.options.dry_run {
            self.progress.ok(&format!(
                "would write ({} release, {} new artists, {} tracks)",
                if resolved.release.is_new() { "new" } else { "existing" },
                resolved.new_artists(),
                resolved.tracks
            ));
            report.planned.push(resolved);
            return Ok(());
        }

        self.enter(SyncPhase::Upserting, &label.name);
        let album = self.with_artist_images(album, report).await?;
        match UpsertWriter::new(self.store).write_album(&album, &label.id).await {
            Ok(written) => {
                if written.release_created {
                    report.new_releases += 1;
                } else {
                    report.existing_releases += 1;
                }
                report.new_artists += written.new_artists;
                report.new_tracks += written.new_tracks;
                for failure in &written.item_failures {
                    self.record(report, SkippedItem::from_item(&album.external_id, failure));
                }
                if written.item_failures.is_empty() {
                    self.progress.ok(&format!(
                        "{} ({} tracks)",
                        if written.release_created { "created" } else { "updated" },
                        album.tracks.len()
                    ));
                } else {
                    self.progress.warn(&format!(
                        "written with {} item failures",
                        written.item_failures.len()
                    ));
                }
            }
            Err(AlbumWriteError::Album(reason)) => {
                self.fail_album(report, SkipReason::PartialAlbumFailure, summary, reason);
            }
            Err(AlbumWriteError::Connection(e)) => return Err(e.into()),
        }
        Ok(())
    }

    /// Fill in artist images from the full artist objects. A lookup failure
    /// is reported and the album is written without them.
    async fn with_artist_images(
        &self,
        mut album: AlbumDetail,
        report: &mut SyncReport,
    ) -> Result<AlbumDetail, RunError> {
        let ids: Vec<String> = album
            .all_artists()
            .iter()
            .map(|a| a.external_id.clone())
            .collect();

        let images: HashMap<String, String> = match self.catalog.get_artists(&ids).await {
            Ok(full) => full
                .into_iter()
                .filter_map(|a| a.image_url.map(|url| (a.external_id, url)))
                .collect(),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Artist images for album {} unavailable: {}", album.external_id, e);
                report.skipped.push(SkippedItem::new(
                    SkipReason::ArtistImagesUnavailable,
                    "album",
                    album.external_id.clone(),
                    e.to_string(),
                ));
                return Ok(album);
            }
        };

        let credits = album
            .artists
            .iter_mut()
            .chain(album.tracks.iter_mut().flat_map(|t| t.artists.iter_mut()));
        for artist in credits {
            if let Some(url) = images.get(&artist.external_id) {
                artist.image_url = Some(url.clone());
            }
        }
        Ok(album)
    }

    fn fail_album(
        &self,
        report: &mut SyncReport,
        reason: SkipReason,
        summary: &AlbumSummary,
        detail: String,
    ) {
        report.failed_releases += 1;
        self.progress.fail(&detail);
        self.record(
            report,
            SkippedItem::new(reason, "album", summary.external_id.clone(), detail),
        );
    }

    fn record(&self, report: &mut SyncReport, item: SkippedItem) {
        warn!("Skipped {} {}: {}", item.entity, item.external_id, item.detail);
        self.error_log.sync(&format!(
            "Label '{}' {} {} skipped: {}",
            report.label, item.entity, item.external_id, item.detail
        ));
        report.skipped.push(item);
    }
}
