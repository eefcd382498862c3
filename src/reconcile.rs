//! Label reconciliation: deterministic, audited corrections of release
//! label assignments.
//!
//! Rules run in a fixed order and every decision ends up in the
//! `ReconcileReport`:
//!
//! 1. track labels that drifted from their release are restored
//! 2. `catalog-label`: a stored release the catalog lists under the label
//!    is moved to it
//! 3. `keyword`: only when the catalog listing is complete, releases under
//!    the label that the catalog does not list are classified by keyword;
//!    a single other label means reassignment, anything else is reported
//! 4. orphan releases are reported, never deleted

use std::collections::{BTreeSet, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{collect_listing, CatalogSource};
use crate::config::LabelSpec;
use crate::error::{RunError, StoreResult};
use crate::model::{Label, ReassignRule, Reassignment, Release, ReleaseForReview};
use crate::report::{
    ErrorLog, ReassignmentEntry, ReconcileReport, ReviewEntry, RunOutcome, SkippedItem,
};
use crate::store::CatalogStore;

// ---------------------------------------------------------------------------
// Keyword classification
// ---------------------------------------------------------------------------

/// Lowercase, punctuation folded to spaces, padded so whole-phrase matches
/// can use `contains(" kw ")`.
pub(crate) fn normalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    let words: Vec<&str> = folded.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

/// Canonical label → keyword table.
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    /// (normalized keyword, label slug)
    entries: Vec<(String, String)>,
}

impl KeywordTable {
    pub fn from_labels(labels: &[LabelSpec]) -> Self {
        let mut table = Self::default();
        for label in labels {
            let slug = label.slug();
            for keyword in &label.keywords {
                table.insert(keyword, &slug);
            }
        }
        table
    }

    pub fn insert(&mut self, keyword: &str, label_slug: &str) {
        let kw = normalize(keyword);
        if kw.trim().is_empty() {
            return;
        }
        self.entries.push((kw, label_slug.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Exactly one label's keywords matched.
    Label(String),
    Unknown,
    /// Keywords of several labels matched, sorted by slug.
    Ambiguous(Vec<String>),
}

/// Match the release title, genres and credited artist names against the
/// table.
pub fn classify_by_rule(release: &ReleaseForReview, table: &KeywordTable) -> Classification {
    let mut haystack = String::from(&release.release.title);
    for name in release.release.genres.iter().chain(&release.artist_names) {
        haystack.push_str(" | ");
        haystack.push_str(name);
    }
    let haystack = normalize(&haystack);

    let matched: BTreeSet<&str> = table
        .entries
        .iter()
        .filter(|(kw, _)| haystack.contains(kw.as_str()))
        .map(|(_, slug)| slug.as_str())
        .collect();
    let mut slugs: Vec<String> = matched.into_iter().map(str::to_string).collect();

    match slugs.len() {
        0 => Classification::Unknown,
        1 => Classification::Label(slugs.remove(0)),
        _ => Classification::Ambiguous(slugs),
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub page_size: u32,
    pub max_pages: u32,
    pub dry_run: bool,
}

pub struct Reconciler<'a> {
    store: &'a dyn CatalogStore,
    error_log: &'a ErrorLog,
}

fn review(release: &Release, candidates: Vec<String>) -> ReviewEntry {
    ReviewEntry {
        external_id: release.external_id.clone(),
        title: release.title.clone(),
        candidates,
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn CatalogStore, error_log: &'a ErrorLog) -> Self {
        Self { store, error_log }
    }

    /// Move a release and its tracks to `new_label_id` in one transaction.
    pub async fn reassign_release(
        &self,
        release_id: &str,
        new_label_id: &str,
        rule: ReassignRule,
    ) -> StoreResult<Reassignment> {
        let done = self
            .store
            .reassign_release(release_id, new_label_id, rule)
            .await?;
        info!(
            "Reassigned release {} from {} to {} ({}, {} tracks)",
            release_id,
            done.from_label_id,
            new_label_id,
            rule.as_str(),
            done.tracks_updated
        );
        Ok(done)
    }

    /// Releases with no credited artist. Reported only.
    pub async fn find_orphan_releases(&self, label_id: Option<&str>) -> StoreResult<Vec<Release>> {
        self.store.find_orphan_releases(label_id).await
    }

    pub async fn restore_track_labels(&self, label_id: Option<&str>) -> StoreResult<u64> {
        let changed = self.store.restore_track_labels(label_id).await?;
        if changed > 0 {
            info!("Restored label on {} tracks", changed);
        }
        Ok(changed)
    }

    /// Full reconciliation pass for `target`. Never fails: run-level errors
    /// end up in the report with outcome `Failed`.
    pub async fn reconcile_label(
        &self,
        catalog: &dyn CatalogSource,
        target: &Label,
        labels: &[Label],
        table: &KeywordTable,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let started = std::time::Instant::now();
        let mut report = ReconcileReport::new(&target.name, options.dry_run);

        if let Err(e) = self
            .run(catalog, target, labels, table, options, cancel, &mut report)
            .await
        {
            warn!("Reconcile of {:?} failed: {}", target.name, e);
            self.error_log
                .reconcile(&format!("Label '{}' reconcile failed: {}", target.name, e));
            report.outcome = RunOutcome::Failed;
            report.error = Some(e.to_string());
        }
        report.set_elapsed(started.elapsed());
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        catalog: &dyn CatalogSource,
        target: &Label,
        labels: &[Label],
        table: &KeywordTable,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), RunError> {
        let by_slug: HashMap<&str, &Label> = labels.iter().map(|l| (l.slug.as_str(), l)).collect();
        let by_id: HashMap<&str, &Label> = labels.iter().map(|l| (l.id.as_str(), l)).collect();
        let label_name = |id: &str| {
            by_id
                .get(id)
                .map(|l| l.slug.clone())
                .unwrap_or_else(|| id.to_string())
        };

        // 1. track labels
        if !options.dry_run {
            report.tracks_relabeled = self.restore_track_labels(None).await?;
        }

        // 2. authoritative listing
        catalog.authenticate().await?;
        let listing =
            collect_listing(catalog, &target.name, options.page_size, options.max_pages).await?;
        report.catalog_total = listing.total;
        report.listing_complete = listing.is_complete();
        let skipped = listing
            .failed_pages
            .iter()
            .map(SkippedItem::from_page)
            .chain(listing.malformed.iter().map(SkippedItem::from_entry));
        for item in skipped {
            self.error_log.reconcile(&format!(
                "Label '{}' {} at {} skipped: {}",
                target.name, item.entity, item.external_id, item.detail
            ));
            report.skipped.push(item);
        }
        debug!(
            "Catalog lists {} albums under {:?} (complete: {})",
            listing.albums.len(),
            target.name,
            report.listing_complete
        );

        // 3. catalog-label rule
        let listed: Vec<String> = listing.albums.iter().map(|a| a.external_id.clone()).collect();
        for release in self.store.releases_by_external_ids(&listed).await? {
            if cancel.is_cancelled() {
                report.outcome = RunOutcome::Cancelled;
                return Ok(());
            }
            if release.label_id == target.id {
                continue;
            }
            self.apply(&release, target, ReassignRule::CatalogLabel, options, report, &label_name)
                .await?;
        }

        // 4. keyword rule
        if report.listing_complete {
            for candidate in self.store.releases_for_review(&target.id).await? {
                if cancel.is_cancelled() {
                    report.outcome = RunOutcome::Cancelled;
                    return Ok(());
                }
                let release = &candidate.release;
                if listing.contains(&release.external_id) {
                    continue;
                }
                match classify_by_rule(&candidate, table) {
                    Classification::Label(slug) if slug == target.slug => {}
                    Classification::Label(slug) => match by_slug.get(slug.as_str()) {
                        Some(to) => {
                            self.apply(release, to, ReassignRule::Keyword, options, report, &label_name)
                                .await?;
                        }
                        None => report.unknown.push(review(release, vec![slug])),
                    },
                    Classification::Unknown => report.unknown.push(review(release, Vec::new())),
                    Classification::Ambiguous(candidates) => {
                        self.error_log.reconcile(&format!(
                            "Release '{}' ({}) ambiguous between {}",
                            release.title,
                            release.external_id,
                            candidates.join(", ")
                        ));
                        report.ambiguous.push(review(release, candidates));
                    }
                }
            }
        } else {
            warn!(
                "Catalog listing for {:?} incomplete, keyword rule skipped",
                target.name
            );
        }

        // 5. orphans
        for orphan in self.find_orphan_releases(Some(target.id.as_str())).await? {
            self.error_log.reconcile(&format!(
                "Release '{}' ({}) has no artists",
                orphan.title, orphan.external_id
            ));
            report.orphans.push(review(&orphan, Vec::new()));
        }

        // 6. distribution
        report.stored_releases = self.store.count_releases(&target.id).await?;
        if let Some(gap) = report.distribution_gap().filter(|g| *g != 0) {
            info!(
                "{:?}: {} releases stored vs {} in catalog ({:+})",
                target.name,
                report.stored_releases,
                report.catalog_total.unwrap_or_default(),
                gap
            );
        }
        Ok(())
    }

    async fn apply(
        &self,
        release: &Release,
        to: &Label,
        rule: ReassignRule,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
        label_name: &impl Fn(&str) -> String,
    ) -> Result<(), RunError> {
        let tracks_updated = if options.dry_run {
            0
        } else {
            self.reassign_release(&release.id, &to.id, rule).await?.tracks_updated
        };
        report.reassigned.push(ReassignmentEntry {
            external_id: release.external_id.clone(),
            title: release.title.clone(),
            from_label: label_name(&release.label_id),
            to_label: to.slug.clone(),
            rule,
            tracks_updated,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::{album, artist, ext_id, track, FakeCatalog};
    use crate::store::memory::MemoryStore;
    use crate::writer::UpsertWriter;

    struct Fixture {
        store: MemoryStore,
        deep: Label,
        bright: Label,
        dub: Label,
        table: KeywordTable,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let deep = store.ensure_label("Acme Deep", "acme-deep").await.unwrap();
        let bright = store.ensure_label("Acme Bright", "acme-bright").await.unwrap();
        let dub = store.ensure_label("Acme Dub", "acme-dub").await.unwrap();
        let mut table = KeywordTable::default();
        table.insert("deep house", "acme-deep");
        table.insert("disco", "acme-bright");
        table.insert("Dub Techno", "acme-dub");
        Fixture {
            store,
            deep,
            bright,
            dub,
            table,
        }
    }

    fn options(dry_run: bool) -> ReconcileOptions {
        ReconcileOptions {
            page_size: 50,
            max_pages: 20,
            dry_run,
        }
    }

    fn for_review(title: &str, artists: &[&str]) -> ReleaseForReview {
        ReleaseForReview {
            release: Release {
                id: "r".into(),
                external_id: ext_id("r"),
                title: title.into(),
                release_date: None,
                artwork_url: None,
                external_url: None,
                label_id: "l".into(),
                release_type: "album".into(),
                primary_artist_id: "a".into(),
                genres: Vec::new(),
            },
            artist_names: artists.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn classify_matches_whole_phrases_only() {
        let f = fixture().await;
        assert_eq!(
            classify_by_rule(&for_review("Late Night Disco Edits", &["Ana"]), &f.table),
            Classification::Label("acme-bright".into())
        );
        assert_eq!(
            classify_by_rule(&for_review("Discotheque", &["Ana"]), &f.table),
            Classification::Unknown
        );
        assert_eq!(
            classify_by_rule(&for_review("Drift", &["DUB-TECHNO Collective"]), &f.table),
            Classification::Label("acme-dub".into())
        );
        assert_eq!(
            classify_by_rule(&for_review("Disco Dub Techno", &[]), &f.table),
            Classification::Ambiguous(vec!["acme-bright".into(), "acme-dub".into()])
        );
    }

    #[tokio::test]
    async fn genre_alone_can_classify() {
        let f = fixture().await;
        let mut release = for_review("Untitled", &["Ana"]);
        assert_eq!(classify_by_rule(&release, &f.table), Classification::Unknown);
        release.release.genres = vec!["Nu-Disco".into(), "Disco".into()];
        assert_eq!(
            classify_by_rule(&release, &f.table),
            Classification::Label("acme-bright".into())
        );
    }

    #[test]
    fn table_built_from_label_specs() {
        let specs = vec![LabelSpec {
            name: "Acme Deep".into(),
            slug: None,
            keywords: vec!["Deep".into(), " ".into()],
        }];
        let table = KeywordTable::from_labels(&specs);
        assert!(!table.is_empty());
        assert_eq!(
            classify_by_rule(&for_review("So deep", &[]), &table),
            Classification::Label("acme-deep".into())
        );
    }

    #[tokio::test]
    async fn reassign_moves_release_and_every_track_in_place() {
        let f = fixture().await;
        let ana = artist("ana", "Ana");
        let tracks: Vec<_> = (1..=4)
            .map(|n| track(&format!("t{}", n), n, &[ana.clone()]))
            .collect();
        let drift = album("drift", "Drift", vec![ana], tracks);
        UpsertWriter::new(&f.store)
            .write_album(&drift, &f.deep.id)
            .await
            .unwrap();

        let release_before = f.store.release(&ext_id("drift")).unwrap();
        let track_ids_before: Vec<_> = f.store.tracks().into_iter().map(|t| t.id).collect();

        let log = ErrorLog::disabled();
        let done = Reconciler::new(&f.store, &log)
            .reassign_release(&release_before.id, &f.bright.id, ReassignRule::CatalogLabel)
            .await
            .unwrap();

        assert_eq!(done.tracks_updated, 4);
        assert_eq!(done.from_label_id, f.deep.id);
        let release_after = f.store.release(&ext_id("drift")).unwrap();
        assert_eq!(release_after.id, release_before.id);
        assert_eq!(release_after.label_id, f.bright.id);
        let tracks_after = f.store.tracks();
        assert_eq!(
            tracks_after.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            track_ids_before
        );
        assert!(tracks_after.iter().all(|t| t.label_id == f.bright.id));
        assert_eq!(f.store.reassignments().len(), 1);
    }

    #[tokio::test]
    async fn reassign_unknown_release_fails() {
        let f = fixture().await;
        let log = ErrorLog::disabled();
        let err = Reconciler::new(&f.store, &log)
            .reassign_release("missing", &f.bright.id, ReassignRule::Keyword)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn restore_fixes_drifted_tracks() {
        let f = fixture().await;
        let ana = artist("ana", "Ana");
        let drift = album(
            "drift",
            "Drift",
            vec![ana.clone()],
            vec![track("t1", 1, &[ana.clone()]), track("t2", 2, &[ana])],
        );
        UpsertWriter::new(&f.store)
            .write_album(&drift, &f.deep.id)
            .await
            .unwrap();
        f.store.set_track_label(&ext_id("t2"), &f.dub.id);

        let log = ErrorLog::disabled();
        let reconciler = Reconciler::new(&f.store, &log);
        assert_eq!(reconciler.restore_track_labels(None).await.unwrap(), 1);
        assert!(f.store.tracks().iter().all(|t| t.label_id == f.deep.id));
        assert_eq!(reconciler.restore_track_labels(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_applies_rules_in_order() {
        let f = fixture().await;
        let catalog = FakeCatalog::new();
        let writer = UpsertWriter::new(&f.store);
        let ana = artist("ana", "Ana");

        // listed under Deep by the catalog but stored under Bright
        let listed = album("listed", "Listed", vec![ana.clone()], vec![track("l1", 1, &[ana.clone()])]);
        writer.write_album(&listed, &f.bright.id).await.unwrap();
        catalog.publish("Acme Deep", listed);
        // stored under Deep, not listed, disco keyword
        f.store.seed_release(&ext_id("disco"), "Disco Fever", &f.deep.id, &["Ben"]);
        // stored under Deep, not listed, no keyword
        f.store.seed_release(&ext_id("plain"), "Plain", &f.deep.id, &["Cy"]);
        // ambiguous
        f.store.seed_release(&ext_id("mixed"), "Disco Dub Techno", &f.deep.id, &["Dee"]);
        // orphan
        f.store.seed_release(&ext_id("orphan"), "Orphan", &f.deep.id, &[]);

        let labels = vec![f.deep.clone(), f.bright.clone(), f.dub.clone()];
        let log = ErrorLog::disabled();
        let report = Reconciler::new(&f.store, &log)
            .reconcile_label(
                &catalog,
                &f.deep,
                &labels,
                &f.table,
                &options(false),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.listing_complete);
        assert_eq!(report.catalog_total, Some(1));
        assert_eq!(report.reassigned.len(), 2);
        assert_eq!(report.reassigned[0].rule, ReassignRule::CatalogLabel);
        assert_eq!(report.reassigned[0].from_label, "acme-bright");
        assert_eq!(report.reassigned[0].tracks_updated, 1);
        assert_eq!(report.reassigned[1].rule, ReassignRule::Keyword);
        assert_eq!(report.reassigned[1].to_label, "acme-bright");

        let unknown: Vec<_> = report.unknown.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(unknown, vec!["Orphan", "Plain"]);
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].candidates, vec!["acme-bright", "acme-dub"]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].title, "Orphan");

        assert_eq!(f.store.release(&ext_id("listed")).unwrap().label_id, f.deep.id);
        assert_eq!(f.store.release(&ext_id("disco")).unwrap().label_id, f.bright.id);
        assert_eq!(f.store.release(&ext_id("mixed")).unwrap().label_id, f.deep.id);
        // listed + plain + mixed + orphan
        assert_eq!(report.stored_releases, 4);
        assert_eq!(report.distribution_gap(), Some(3));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(f.store.reassignments().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let f = fixture().await;
        let catalog = FakeCatalog::new();
        f.store.seed_release(&ext_id("disco"), "Disco Fever", &f.deep.id, &["Ben"]);

        let labels = vec![f.deep.clone(), f.bright.clone(), f.dub.clone()];
        let log = ErrorLog::disabled();
        let report = Reconciler::new(&f.store, &log)
            .reconcile_label(
                &catalog,
                &f.deep,
                &labels,
                &f.table,
                &options(true),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.reassigned.len(), 1);
        assert_eq!(report.reassigned[0].tracks_updated, 0);
        assert_eq!(f.store.release(&ext_id("disco")).unwrap().label_id, f.deep.id);
        assert!(f.store.reassignments().is_empty());
    }

    #[tokio::test]
    async fn incomplete_listing_skips_keyword_rule() {
        let f = fixture().await;
        let catalog = FakeCatalog::new();
        catalog.fail_search_at(0);
        f.store.seed_release(&ext_id("disco"), "Disco Fever", &f.deep.id, &["Ben"]);

        let labels = vec![f.deep.clone(), f.bright.clone(), f.dub.clone()];
        let log = ErrorLog::disabled();
        let report = Reconciler::new(&f.store, &log)
            .reconcile_label(
                &catalog,
                &f.deep,
                &labels,
                &f.table,
                &options(false),
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.listing_complete);
        assert!(report.reassigned.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(f.store.release(&ext_id("disco")).unwrap().label_id, f.deep.id);
    }

    #[tokio::test]
    async fn malformed_search_entry_keeps_keyword_rule_active() {
        let f = fixture().await;
        let catalog = FakeCatalog::new();
        catalog.push_malformed("Acme Deep", "missing id");
        f.store.seed_release(&ext_id("disco"), "Disco Fever", &f.deep.id, &["Ben"]);

        let labels = vec![f.deep.clone(), f.bright.clone(), f.dub.clone()];
        let log = ErrorLog::disabled();
        let report = Reconciler::new(&f.store, &log)
            .reconcile_label(
                &catalog,
                &f.deep,
                &labels,
                &f.table,
                &options(false),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.listing_complete);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.reassigned.len(), 1);
        assert_eq!(f.store.release(&ext_id("disco")).unwrap().label_id, f.bright.id);
    }

    #[tokio::test]
    async fn auth_failure_fails_the_run() {
        let f = fixture().await;
        let catalog = FakeCatalog::new();
        catalog.reject_auth();

        let labels = vec![f.deep.clone()];
        let log = ErrorLog::disabled();
        let report = Reconciler::new(&f.store, &log)
            .reconcile_label(
                &catalog,
                &f.deep,
                &labels,
                &f.table,
                &options(false),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(report.error.unwrap().contains("Authentication"));
    }
}
