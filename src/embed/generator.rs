//! The embedding stage.
//!
//! Selection covers both the NEW path (no embedding row yet) and the BACKFILL
//! path (row exists, target vector column is NULL) with one query and one
//! code path. Batches run concurrently up to the worker bound; each batch is
//! its own retry unit and its own transaction, so one failed batch never
//! blocks or poisons the others.

use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt};
use pgvector::Vector;
use sqlx::{PgPool, Row};
use tracing::{error, info, instrument};

use crate::embed::provider::EmbeddingProvider;
use crate::embed::Precision;
use crate::errors::Result;
use crate::ratelimit::{retry, Backoff, RetryPolicy};
use crate::settings::MAX_EMBED_CHARS;
use crate::source::DateWindow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedSummary {
    pub pending: usize,
    pub embedded: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl EmbedSummary {
    /// A window commits only when every one of its batches committed.
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0
    }
}

#[derive(Debug, Clone)]
struct PendingNotice {
    notice_id: String,
    text: String,
}

struct BatchOutcome {
    embedded: usize,
    failed: bool,
}

pub struct EmbeddingGenerator {
    pool: PgPool,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    workers: usize,
    targets: Vec<Precision>,
    retry_policy: RetryPolicy,
}

impl EmbeddingGenerator {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        workers: usize,
    ) -> Self {
        Self {
            pool,
            provider,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            targets: vec![Precision::Full, Precision::Half],
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_secs(1),
                backoff: Backoff::Exponential,
                ..Default::default()
            },
        }
    }

    /// Restricts which vector representations this run fills. Populated
    /// columns outside the target set are never read or written.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<Precision>) -> Self {
        assert!(!targets.is_empty(), "at least one target representation");
        self.targets = targets;
        self
    }

    /// Embeds every pending notice published on `day`.
    pub async fn embed_day(&self, day: NaiveDate) -> Result<EmbedSummary> {
        self.embed_window(DateWindow::single_day(day)).await
    }

    /// Embeds every pending notice published inside `window`.
    ///
    /// A window with zero pending records is a successful no-op, so the
    /// caller still advances the watermark and never re-scans it.
    #[instrument(skip(self), fields(window = %window))]
    pub async fn embed_window(&self, window: DateWindow) -> Result<EmbedSummary> {
        let started = std::time::Instant::now();
        let pending = self.pending_in(window).await?;
        if pending.is_empty() {
            info!("no pending notices, no-op window");
            return Ok(EmbedSummary::default());
        }

        let batches: Vec<Vec<PendingNotice>> = pending
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let batch_count = batches.len();

        let outcomes: Vec<BatchOutcome> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| self.process_batch(index, batch))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let summary = EmbedSummary {
            pending: pending.len(),
            embedded: outcomes.iter().map(|o| o.embedded).sum(),
            batches: batch_count,
            failed_batches: outcomes.iter().filter(|o| o.failed).count(),
        };
        info!(
            pending = summary.pending,
            embedded = summary.embedded,
            batches = summary.batches,
            failed_batches = summary.failed_batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding window finished"
        );
        Ok(summary)
    }

    /// One query serves both NEW and BACKFILL: a notice qualifies when its
    /// embedding row is missing or any *targeted* vector column is NULL.
    async fn pending_in(&self, window: DateWindow) -> Result<Vec<PendingNotice>> {
        let null_predicate = self
            .targets
            .iter()
            .map(|t| format!("e.{} IS NULL", t.notice_column()))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT n.notice_id, n.title, n.description \
             FROM notices n \
             LEFT JOIN notice_embeddings e ON e.notice_id = n.notice_id \
             WHERE n.published_at BETWEEN $1 AND $2 \
               AND btrim(n.title || E'\\n' || n.description) <> '' \
               AND (e.notice_id IS NULL OR {null_predicate}) \
             ORDER BY n.notice_id"
        );

        let rows = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let title: String = row.get("title");
                let description: String = row.get("description");
                PendingNotice {
                    notice_id: row.get("notice_id"),
                    text: prepare_text(&title, &description),
                }
            })
            .collect())
    }

    async fn process_batch(&self, index: usize, batch: Vec<PendingNotice>) -> BatchOutcome {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let vectors = retry(&self.retry_policy, "embedding batch", |_| {
            let texts = &texts;
            async move { self.provider.embed_batch(texts).await }
        })
        .await;

        let vectors = match vectors {
            Ok(v) => v,
            Err(e) => {
                error!(batch = index, size = batch.len(), error = %e, "batch permanently failed");
                return BatchOutcome {
                    embedded: 0,
                    failed: true,
                };
            }
        };

        match self.persist_batch(&batch, vectors).await {
            Ok(written) => BatchOutcome {
                embedded: written,
                failed: false,
            },
            Err(e) => {
                error!(batch = index, error = %e, "batch persistence failed, rolled back");
                BatchOutcome {
                    embedded: 0,
                    failed: true,
                }
            }
        }
    }

    /// Writes one batch in a single transaction. Only the targeted columns
    /// appear in the statement, and every vector column fills only if still
    /// NULL, so concurrent or repeated runs never clobber an existing vector.
    async fn persist_batch(
        &self,
        batch: &[PendingNotice],
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize> {
        let mut columns = vec!["notice_id", "model", "meta", "embedded_at"];
        let mut values = vec![
            "$1".to_string(),
            "$2".to_string(),
            "$3".to_string(),
            "now()".to_string(),
        ];
        let mut updates = vec![
            "model = COALESCE(notice_embeddings.model, EXCLUDED.model)".to_string(),
            "embedded_at = COALESCE(notice_embeddings.embedded_at, EXCLUDED.embedded_at)"
                .to_string(),
        ];
        for (offset, target) in self.targets.iter().enumerate() {
            let column = target.notice_column();
            let param = offset + 4;
            columns.push(column);
            match target {
                Precision::Full => values.push(format!("${param}")),
                Precision::Half => values.push(format!("${param}::halfvec")),
            }
            updates.push(format!(
                "{column} = COALESCE(notice_embeddings.{column}, EXCLUDED.{column})"
            ));
        }
        let sql = format!(
            "INSERT INTO notice_embeddings ({}) VALUES ({}) \
             ON CONFLICT (notice_id) DO UPDATE SET {}",
            columns.join(", "),
            values.join(", "),
            updates.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for (pending, vector) in batch.iter().zip(vectors) {
            let meta = serde_json::json!({ "chars": pending.text.chars().count() });
            let mut query = sqlx::query(&sql)
                .bind(&pending.notice_id)
                .bind(self.provider.model())
                .bind(meta);
            for _ in &self.targets {
                query = query.bind(Vector::from(vector.clone()));
            }
            query.execute(&mut *tx).await?;
            written += 1;
        }
        tx.commit().await?;
        Ok(written)
    }
}

/// Trims, joins, and truncates the free text to the provider's hard
/// character ceiling, respecting char boundaries.
fn prepare_text(title: &str, description: &str) -> String {
    let joined = format!("{}\n{}", title.trim(), description.trim());
    let trimmed = joined.trim();
    match trimmed.char_indices().nth(MAX_EMBED_CHARS) {
        Some((byte_index, _)) => trimmed[..byte_index].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_text_joins_and_trims() {
        assert_eq!(prepare_text("  Title  ", "  Body  "), "Title\nBody");
        assert_eq!(prepare_text("Only title", ""), "Only title");
        assert_eq!(prepare_text("", ""), "");
    }

    #[test]
    fn prepare_text_truncates_to_the_char_ceiling() {
        let long = "x".repeat(MAX_EMBED_CHARS + 500);
        let prepared = prepare_text(&long, "");
        assert_eq!(prepared.chars().count(), MAX_EMBED_CHARS);
    }

    #[test]
    fn prepare_text_truncation_is_char_safe() {
        // Multi-byte chars around the ceiling must not split.
        let long = "ü".repeat(MAX_EMBED_CHARS + 10);
        let prepared = prepare_text(&long, "");
        assert_eq!(prepared.chars().count(), MAX_EMBED_CHARS);
        assert!(prepared.chars().all(|c| c == 'ü'));
    }
}
