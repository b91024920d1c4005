//! Paginated window fetcher.
//!
//! Requests page 1 of a date window, learns the total page count, fetches the
//! remaining pages, and only then persists anything. Upstream pages may
//! overlap, so records are deduplicated by notice id (last-seen wins by fetch
//! order) before a single bulk upsert transaction. The caller advances the
//! fetch watermark only after this function returns `Ok`.

use rustc_hash::FxHashMap;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::entity::BuyerProfileCache;
use crate::errors::{PipelineError, Result};
use crate::source::{DateWindow, FetchMode, RawNotice, RegistryClient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub pages: u32,
    /// Records received across all pages, before deduplication.
    pub fetched: usize,
    /// Rows actually written: new records plus records whose payload changed.
    pub upserted: usize,
    /// Malformed records skipped during parsing.
    pub skipped: usize,
}

pub struct WindowFetcher {
    pool: PgPool,
    client: RegistryClient,
    buyers: BuyerProfileCache,
}

impl WindowFetcher {
    pub fn new(pool: PgPool, client: RegistryClient) -> Self {
        let buyers = BuyerProfileCache::new(pool.clone(), client.clone());
        Self {
            pool,
            client,
            buyers,
        }
    }

    /// Fetches, dedups, and upserts every record of `window`.
    ///
    /// Any error after collection rolls the transaction back and leaves the
    /// watermark untouched, so the whole window is safely retryable.
    #[instrument(skip(self), fields(window = %window))]
    pub async fn fetch_window(&self, window: DateWindow, mode: FetchMode) -> Result<FetchSummary> {
        let started = std::time::Instant::now();

        let first = match self.client.fetch_page(window, mode, 1).await {
            Ok(page) => page,
            // An empty window is normal pagination termination, not an error.
            Err(PipelineError::NotFound) => {
                info!("window has no records upstream");
                return Ok(FetchSummary::default());
            }
            Err(e) => return Err(e),
        };

        let total_pages = first.total_pages;
        let mut skipped = first.skipped;
        let mut collected = first.notices;
        for page in 2..=total_pages {
            match self.client.fetch_page(window, mode, page).await {
                Ok(p) => {
                    skipped += p.skipped;
                    collected.extend(p.notices);
                }
                // The registry 404s pages past the true end when the window
                // shrinks between requests; treat it as the end of pagination.
                Err(PipelineError::NotFound) => break,
                Err(e) => return Err(e),
            }
        }

        let fetched = collected.len();
        let deduped = dedup_last_wins(collected);
        let upserted = self.upsert_all(&deduped).await?;

        let buyer_ids: Vec<String> = {
            let mut seen = FxHashMap::default();
            deduped
                .iter()
                .filter_map(|n| n.buyer_id.clone())
                .filter(|id| seen.insert(id.clone(), ()).is_none())
                .collect()
        };
        let refreshed = self.buyers.refresh_missing(buyer_ids).await;

        info!(
            pages = total_pages,
            fetched,
            upserted,
            skipped,
            buyer_profiles = refreshed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "window ingested"
        );
        Ok(FetchSummary {
            pages: total_pages,
            fetched,
            upserted,
            skipped,
        })
    }

    /// Bulk upsert inside one transaction. The conflict action only rewrites
    /// a row when the payload actually differs, so re-running an unchanged
    /// window touches zero rows and reports zero upserted.
    async fn upsert_all(&self, notices: &[RawNotice]) -> Result<usize> {
        if notices.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for notice in notices {
            let result = sqlx::query(
                r#"
                INSERT INTO notices
                    (notice_id, title, description, buyer_id, published_at, updated_at, raw)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (notice_id) DO UPDATE SET
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    buyer_id = EXCLUDED.buyer_id,
                    updated_at = EXCLUDED.updated_at,
                    raw = EXCLUDED.raw
                WHERE notices.raw IS DISTINCT FROM EXCLUDED.raw
                "#,
            )
            .bind(&notice.notice_id)
            .bind(&notice.title)
            .bind(&notice.description)
            .bind(&notice.buyer_id)
            .bind(notice.published_at)
            .bind(notice.updated_at)
            .bind(&notice.raw)
            .execute(&mut *tx)
            .await;
            match result {
                Ok(done) => written += done.rows_affected() as usize,
                Err(e) => {
                    warn!(notice_id = %notice.notice_id, error = %e, "upsert failed, rolling back window");
                    tx.rollback().await.ok();
                    return Err(e.into());
                }
            }
        }
        tx.commit().await?;
        Ok(written)
    }
}

/// Collapses duplicate notice ids across pages; the later occurrence wins.
///
/// The registry gives no ordering guarantee when two pages disagree on a
/// field for the same key, so "last write wins by fetch order" mirrors the
/// observed upstream behavior rather than a documented contract.
pub fn dedup_last_wins(notices: Vec<RawNotice>) -> Vec<RawNotice> {
    let mut by_key: FxHashMap<String, usize> = FxHashMap::default();
    let mut kept: Vec<Option<RawNotice>> = Vec::with_capacity(notices.len());
    for notice in notices {
        match by_key.get(&notice.notice_id) {
            Some(&slot) => kept[slot] = Some(notice),
            None => {
                by_key.insert(notice.notice_id.clone(), kept.len());
                kept.push(Some(notice));
            }
        }
    }
    kept.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn notice(id: &str, title: &str) -> RawNotice {
        RawNotice {
            notice_id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            buyer_id: None,
            published_at: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            raw: json!({"id": id, "title": title}),
        }
    }

    #[test]
    fn dedup_keeps_the_last_occurrence() {
        let deduped = dedup_last_wins(vec![
            notice("a", "first"),
            notice("b", "only"),
            notice("a", "second"),
        ]);
        assert_eq!(deduped.len(), 2);
        let a = deduped.iter().find(|n| n.notice_id == "a").unwrap();
        assert_eq!(a.title, "second");
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let deduped = dedup_last_wins(vec![
            notice("x", "1"),
            notice("y", "2"),
            notice("x", "3"),
            notice("z", "4"),
        ]);
        let ids: Vec<&str> = deduped.iter().map(|n| n.notice_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn dedup_of_unique_input_is_identity() {
        let deduped = dedup_last_wins(vec![notice("a", "1"), notice("b", "2")]);
        assert_eq!(deduped.len(), 2);
    }
}
