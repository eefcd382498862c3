//! Run reports, operator output and the error log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use colored::*;
use serde::Serialize;

use crate::catalog::{FailedPage, MalformedEntry};
use crate::model::ReassignRule;
use crate::resolver::ResolvedAlbum;
use crate::writer::ItemFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    InvalidExternalId,
    NotFound,
    RateLimited,
    MalformedPayload,
    CatalogError,
    PartialAlbumFailure,
    ItemWriteFailed,
    SearchPageFailed,
    DuplicateInRun,
    ArtistImagesUnavailable,
}

impl SkipReason {
    /// Whether the entry represents lost data. Repeats and missing artist
    /// images do not.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::DuplicateInRun | Self::ArtistImagesUnavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub reason: SkipReason,
    pub entity: String,
    pub external_id: String,
    pub detail: String,
}

impl SkippedItem {
    pub fn new(
        reason: SkipReason,
        entity: impl Into<String>,
        external_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            entity: entity.into(),
            external_id: external_id.into(),
            detail: detail.into(),
        }
    }

    pub fn from_page(page: &FailedPage) -> Self {
        Self::new(
            SkipReason::SearchPageFailed,
            "search page",
            format!("offset {}", page.offset),
            page.reason.clone(),
        )
    }

    pub fn from_entry(entry: &MalformedEntry) -> Self {
        Self::new(
            SkipReason::MalformedPayload,
            "search item",
            format!("offset {}", entry.offset),
            entry.reason.clone(),
        )
    }

    pub fn from_item(album_id: &str, failure: &ItemFailure) -> Self {
        Self::new(
            SkipReason::ItemWriteFailed,
            failure.entity,
            failure.external_id.clone(),
            format!("{} (album {})", failure.reason, album_id),
        )
    }
}

fn exit_code(outcome: RunOutcome, has_failures: bool) -> u8 {
    match outcome {
        RunOutcome::Failed => 1,
        RunOutcome::Cancelled => 130,
        RunOutcome::Completed if has_failures => 2,
        RunOutcome::Completed => 0,
    }
}

// ---------------------------------------------------------------------------
// Sync report
// ---------------------------------------------------------------------------

/// An album whose own label string differs from the label it was listed
/// under. Reported only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelMismatch {
    pub external_id: String,
    pub title: String,
    pub catalog_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub label: String,
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub new_releases: usize,
    pub existing_releases: usize,
    pub failed_releases: usize,
    pub new_artists: usize,
    pub new_tracks: usize,
    pub catalog_total: Option<u32>,
    pub albums_listed: usize,
    pub null_items: u32,
    pub tracks_relabeled: u64,
    /// External IDs of releases under the label with no credited artist.
    pub orphan_releases: Vec<String>,
    pub label_mismatches: Vec<LabelMismatch>,
    /// Would-write plan, filled only on dry runs.
    pub planned: Vec<ResolvedAlbum>,
    pub skipped: Vec<SkippedItem>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl SyncReport {
    pub fn new(label: &str, dry_run: bool) -> Self {
        Self {
            label: label.to_string(),
            outcome: RunOutcome::Completed,
            dry_run,
            new_releases: 0,
            existing_releases: 0,
            failed_releases: 0,
            new_artists: 0,
            new_tracks: 0,
            catalog_total: None,
            albums_listed: 0,
            null_items: 0,
            tracks_relabeled: 0,
            orphan_releases: Vec::new(),
            label_mismatches: Vec::new(),
            planned: Vec::new(),
            skipped: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_releases > 0 || self.skipped.iter().any(|s| s.reason.is_failure())
    }

    pub fn exit_code(&self) -> u8 {
        exit_code(self.outcome, self.has_failures())
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
    }

    pub fn print_summary(&self) {
        println!();
        println!("{}", "═".repeat(60).bright_black());
        println!();
        println!(
            "{} {} {:.1}s",
            self.label.bright_cyan().bold(),
            outcome_label(self.outcome, self.dry_run),
            self.elapsed_ms as f64 / 1000.0
        );
        if let Some(total) = self.catalog_total {
            println!("  {} {} ({} listed)", "Catalog:".white(), total, self.albums_listed);
        }
        if self.dry_run {
            let new_releases = self.planned.iter().filter(|p| p.release.is_new()).count();
            let new_artists: usize = self.planned.iter().map(|p| p.new_artists()).sum();
            println!("  {} {}", "Would create releases:".green(), new_releases);
            println!("  {} {}", "Would create artists:".green(), new_artists);
            println!(
                "  {} {}",
                "Already stored:".white(),
                self.planned.len() - new_releases
            );
        } else {
            println!("  {} {}", "New releases:".green(), self.new_releases);
            println!("  {} {}", "Existing:".white(), self.existing_releases);
            if self.failed_releases > 0 {
                println!("  {} {}", "Failed:".red(), self.failed_releases);
            }
            println!("  {} {}", "New artists:".green(), self.new_artists);
            println!("  {} {}", "New tracks:".green(), self.new_tracks);
            if self.tracks_relabeled > 0 {
                println!("  {} {}", "Tracks relabeled:".yellow(), self.tracks_relabeled);
            }
        }
        if self.null_items > 0 {
            println!("  {} {}", "Null search items:".yellow(), self.null_items);
        }
        if !self.orphan_releases.is_empty() {
            println!();
            println!("{}", "Orphan releases (no artists, review manually):".yellow().bold());
            for id in &self.orphan_releases {
                println!("  {} {}", "?".yellow(), id.bright_white());
            }
        }
        if !self.label_mismatches.is_empty() {
            println!();
            println!("{}", "Listed here but labelled otherwise by the catalog:".yellow().bold());
            for m in &self.label_mismatches {
                println!(
                    "  {} {} {}",
                    "?".yellow(),
                    m.title.bright_white(),
                    format!("({})", m.catalog_label).bright_black()
                );
            }
        }
        print_skipped(&self.skipped);
        if let Some(e) = &self.error {
            println!();
            println!("{} {}", "Run failed:".red().bold(), e.bright_red());
        }
    }
}

fn outcome_label(outcome: RunOutcome, dry_run: bool) -> ColoredString {
    match (outcome, dry_run) {
        (RunOutcome::Completed, true) => "dry run completed in".green().bold(),
        (RunOutcome::Completed, false) => "completed in".green().bold(),
        (RunOutcome::Cancelled, _) => "cancelled after".yellow().bold(),
        (RunOutcome::Failed, _) => "failed after".red().bold(),
    }
}

fn print_skipped(skipped: &[SkippedItem]) {
    if skipped.is_empty() {
        return;
    }
    println!();
    println!("{}", "Skipped / failed:".red().bold());
    for item in skipped {
        let mark = if item.reason.is_failure() {
            "✗".red()
        } else {
            "-".bright_black()
        };
        println!(
            "  {} {} {} [{}] {}",
            mark,
            item.entity,
            item.external_id.bright_white(),
            serde_json::to_value(item.reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            item.detail.bright_black()
        );
    }
}

// ---------------------------------------------------------------------------
// Reconcile report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReassignmentEntry {
    pub external_id: String,
    pub title: String,
    pub from_label: String,
    pub to_label: String,
    pub rule: ReassignRule,
    /// Zero on dry runs.
    pub tracks_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewEntry {
    pub external_id: String,
    pub title: String,
    /// Candidate labels for ambiguous classifications.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub label: String,
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub tracks_relabeled: u64,
    pub catalog_total: Option<u32>,
    pub listing_complete: bool,
    pub reassigned: Vec<ReassignmentEntry>,
    /// No keyword matched; left under the label.
    pub unknown: Vec<ReviewEntry>,
    /// Keywords of several labels matched; no write was made.
    pub ambiguous: Vec<ReviewEntry>,
    pub orphans: Vec<ReviewEntry>,
    pub stored_releases: i64,
    pub skipped: Vec<SkippedItem>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ReconcileReport {
    pub fn new(label: &str, dry_run: bool) -> Self {
        Self {
            label: label.to_string(),
            outcome: RunOutcome::Completed,
            dry_run,
            tracks_relabeled: 0,
            catalog_total: None,
            listing_complete: false,
            reassigned: Vec::new(),
            unknown: Vec::new(),
            ambiguous: Vec::new(),
            orphans: Vec::new(),
            stored_releases: 0,
            skipped: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }

    /// Stored minus catalog count, when the catalog reported a total.
    pub fn distribution_gap(&self) -> Option<i64> {
        self.catalog_total
            .map(|total| self.stored_releases - i64::from(total))
    }

    pub fn has_failures(&self) -> bool {
        !self.ambiguous.is_empty() || self.skipped.iter().any(|s| s.reason.is_failure())
    }

    pub fn exit_code(&self) -> u8 {
        exit_code(self.outcome, self.has_failures())
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
    }

    pub fn print_summary(&self) {
        println!();
        println!("{}", "═".repeat(60).bright_black());
        println!();
        println!(
            "{} {} {:.1}s",
            self.label.bright_cyan().bold(),
            outcome_label(self.outcome, self.dry_run),
            self.elapsed_ms as f64 / 1000.0
        );
        let verb = if self.dry_run { "Would reassign:" } else { "Reassigned:" };
        println!("  {} {}", verb.green(), self.reassigned.len());
        for r in &self.reassigned {
            println!(
                "    {} {} {} → {} ({}, {} tracks)",
                "↻".green(),
                r.title.bright_white(),
                r.from_label.bright_black(),
                r.to_label.bright_cyan(),
                r.rule.as_str(),
                r.tracks_updated
            );
        }
        if self.tracks_relabeled > 0 {
            println!("  {} {}", "Tracks relabeled:".yellow(), self.tracks_relabeled);
        }
        if !self.listing_complete {
            println!(
                "  {} catalog listing incomplete, keyword rule not applied",
                "⚠".yellow()
            );
        }
        match (self.catalog_total, self.distribution_gap()) {
            (Some(total), Some(0)) => {
                println!("  {} {} stored, {} in catalog", "Distribution:".white(), self.stored_releases, total)
            }
            (Some(total), Some(gap)) => println!(
                "  {} {} stored, {} in catalog ({:+})",
                "Distribution:".yellow(),
                self.stored_releases,
                total,
                gap
            ),
            _ => println!("  {} {} stored", "Distribution:".white(), self.stored_releases),
        }

        print_review("Unknown (no keyword matched):", &self.unknown);
        print_review("Ambiguous (needs manual review):", &self.ambiguous);
        print_review("Orphan releases (no artists):", &self.orphans);
        print_skipped(&self.skipped);
        if let Some(e) = &self.error {
            println!();
            println!("{} {}", "Run failed:".red().bold(), e.bright_red());
        }
    }
}

fn print_review(heading: &str, entries: &[ReviewEntry]) {
    if entries.is_empty() {
        return;
    }
    println!();
    println!("{}", heading.yellow().bold());
    for e in entries {
        if e.candidates.is_empty() {
            println!("  {} {} {}", "?".yellow(), e.title.bright_white(), e.external_id.bright_black());
        } else {
            println!(
                "  {} {} {} [{}]",
                "?".yellow(),
                e.title.bright_white(),
                e.external_id.bright_black(),
                e.candidates.join(", ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Progress output
// ---------------------------------------------------------------------------

/// Per-album progress lines for interactive runs. Disabled for `--json`.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    enabled: bool,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn silent() -> Self {
        Self { enabled: false }
    }

    pub fn header(&self, title: &str, label: &str, dry_run: bool) {
        if !self.enabled {
            return;
        }
        println!("{}", title);
        println!("{}", "=".repeat(title.chars().count()));
        println!("Label     : {}", label);
        if dry_run {
            println!("Mode      : dry run (nothing is written)");
        }
        println!();
    }

    pub fn album(&self, index: usize, total: usize, title: &str) {
        if self.enabled {
            println!(
                "{} {}",
                format!("[{}/{}]", index, total).bright_blue().bold(),
                title.bright_cyan()
            );
        }
    }

    pub fn ok(&self, message: &str) {
        if self.enabled {
            println!("  {} {}", "✓".green(), message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled {
            println!("  {} {}", "⚠".yellow(), message.yellow());
        }
    }

    pub fn fail(&self, message: &str) {
        if self.enabled {
            println!("  {} {}", "✗".red(), message.bright_red());
        }
    }
}

// ---------------------------------------------------------------------------
// Error log
// ---------------------------------------------------------------------------

/// Append-only log of every skipped or failed item.
pub struct ErrorLog {
    file: Option<Mutex<File>>,
}

impl ErrorLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn write(&self, prefix: &str, message: &str) {
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                writeln!(f, "{} [{}] {}", chrono::Utc::now().to_rfc3339(), prefix, message).ok();
            }
        }
    }

    pub fn sync(&self, message: &str) {
        self.write("SYNC", message);
    }

    pub fn reconcile(&self, message: &str) {
        self.write("RECONCILE", message);
    }
}
