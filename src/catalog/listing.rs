//! Label-scoped pagination over catalog search.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use super::{AlbumSummary, CatalogSource};
use crate::error::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPage {
    pub offset: u32,
    pub reason: String,
}

/// A search entry that could not be parsed into an album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedEntry {
    /// Offset of the page it came from.
    pub offset: u32,
    pub reason: String,
}

/// Every album the catalog lists under one label, in listing order.
#[derive(Debug, Clone, Default)]
pub struct LabelListing {
    pub albums: Vec<AlbumSummary>,
    /// Albums seen again on a later page.
    pub duplicates: Vec<AlbumSummary>,
    /// Total reported by the first page.
    pub total: Option<u32>,
    pub pages_fetched: u32,
    pub failed_pages: Vec<FailedPage>,
    pub null_items: u32,
    pub malformed: Vec<MalformedEntry>,
    /// Stopped at `max_pages` while more results were expected.
    pub cap_hit: bool,
}

impl LabelListing {
    /// True when every page was fetched and the safety cap was not reached.
    pub fn is_complete(&self) -> bool {
        self.failed_pages.is_empty() && !self.cap_hit
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.albums.iter().any(|a| a.external_id == external_id)
    }
}

/// Page through `search_albums_by_label` until a short page, the reported
/// total, or `max_pages` is reached.
///
/// A failed page is recorded and skipped only when the total from an
/// earlier page says there is more to fetch; otherwise pagination stops.
/// Fatal errors (authentication) are returned as-is.
pub async fn collect_listing(
    source: &dyn CatalogSource,
    label_name: &str,
    page_size: u32,
    max_pages: u32,
) -> Result<LabelListing, CatalogError> {
    let page_size = page_size.max(1);
    let mut listing = LabelListing::default();
    let mut seen = HashSet::new();
    let mut offset = 0u32;
    let mut attempts = 0u32;

    loop {
        if attempts >= max_pages {
            listing.cap_hit = true;
            warn!(
                "Page cap of {} reached for {:?} at offset {}",
                max_pages, label_name, offset
            );
            break;
        }
        attempts += 1;

        match source.search_albums_by_label(label_name, offset, page_size).await {
            Ok(page) => {
                listing.pages_fetched += 1;
                if listing.total.is_none() {
                    listing.total = Some(page.total);
                }
                listing.null_items += page.null_items;
                let received =
                    (page.items.len() + page.malformed_items.len()) as u32 + page.null_items;
                debug!(
                    "Search page offset={} returned {} items ({} null, {} malformed)",
                    offset,
                    received,
                    page.null_items,
                    page.malformed_items.len()
                );
                listing
                    .malformed
                    .extend(page.malformed_items.into_iter().map(|reason| MalformedEntry {
                        offset,
                        reason,
                    }));

                for album in page.items {
                    if seen.insert(album.external_id.clone()) {
                        listing.albums.push(album);
                    } else {
                        listing.duplicates.push(album);
                    }
                }

                if received < page_size {
                    break;
                }
                offset += page_size;
                if listing.total.is_some_and(|total| offset >= total) {
                    break;
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Search page at offset {} failed: {}", offset, e);
                listing.failed_pages.push(FailedPage {
                    offset,
                    reason: e.to_string(),
                });
                offset += page_size;
                match listing.total {
                    Some(total) if offset < total => continue,
                    _ => break,
                }
            }
        }
    }

    Ok(listing)
}
