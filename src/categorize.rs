//! CPV categorization of embedded notices.
//!
//! For every embedding row lacking category results, the categorizer asks the
//! storage engine for the top-K nearest reference categories and persists the
//! ordered codes, the ordered similarities, and one confidence scalar. The
//! update is conditional (`WHERE cpv_codes IS NULL`), so re-running a batch is
//! a no-op the second time.

use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt};
use sqlx::{PgPool, Row};
use tracing::{error, info, instrument};

use crate::embed::Precision;
use crate::errors::{PipelineError, Result};
use crate::source::DateWindow;

/// Neighbor-search strategy for the top-K category query.
///
/// All three produce results through the identical query contract; only the
/// per-transaction session setup differs. This keeps throughput/accuracy
/// tradeoff studies a matter of configuration, not code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Exact linear scan over every category vector.
    ExactScan,
    /// IVFFlat approximate index; `probes` is the candidate-list size.
    IvfFlat { probes: u32 },
    /// HNSW approximate graph index; `ef_search` is the search breadth.
    Hnsw { ef_search: u32 },
}

/// One configured way to run categorization: a search strategy paired with a
/// vector representation, which together pick the columns and the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorizationStrategy {
    pub search: SearchStrategy,
    pub precision: Precision,
}

impl Default for CategorizationStrategy {
    fn default() -> Self {
        Self {
            search: SearchStrategy::ExactScan,
            precision: Precision::Full,
        }
    }
}

impl CategorizationStrategy {
    /// Parses a strategy label: `exact`, `ivfflat:<probes>`, `hnsw:<ef>`,
    /// each with an optional trailing `:half` for the reduced precision,
    /// e.g. `hnsw:40:half`.
    pub fn parse(label: &str) -> Result<Self> {
        let mut parts: Vec<&str> = label.trim().split(':').collect();
        let precision = if parts.last() == Some(&"half") {
            parts.pop();
            Precision::Half
        } else {
            Precision::Full
        };
        let search = match parts.as_slice() {
            ["exact"] => SearchStrategy::ExactScan,
            ["ivfflat", probes] => SearchStrategy::IvfFlat {
                probes: parse_tuning(label, probes)?,
            },
            ["hnsw", ef_search] => SearchStrategy::Hnsw {
                ef_search: parse_tuning(label, ef_search)?,
            },
            _ => {
                return Err(PipelineError::Config(format!(
                    "unknown categorization strategy '{label}'"
                )));
            }
        };
        Ok(Self { search, precision })
    }

    /// Parses a comma-separated list of strategy labels, preserving order.
    /// Deployments iterate this list for benchmark runs.
    pub fn parse_list(labels: &str) -> Result<Vec<Self>> {
        labels.split(',').map(Self::parse).collect()
    }

    /// Session setup executed inside the query's transaction.
    fn session_setup(&self) -> String {
        match self.search {
            // Disabling index scans forces the planner into the exact path.
            SearchStrategy::ExactScan => "SET LOCAL enable_indexscan = off".to_string(),
            SearchStrategy::IvfFlat { probes } => {
                format!("SET LOCAL ivfflat.probes = {probes}")
            }
            SearchStrategy::Hnsw { ef_search } => {
                format!("SET LOCAL hnsw.ef_search = {ef_search}")
            }
        }
    }
}

impl std::fmt::Display for CategorizationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.search {
            SearchStrategy::ExactScan => write!(f, "exact")?,
            SearchStrategy::IvfFlat { probes } => write!(f, "ivfflat:{probes}")?,
            SearchStrategy::Hnsw { ef_search } => write!(f, "hnsw:{ef_search}")?,
        }
        if self.precision == Precision::Half {
            write!(f, ":half")?;
        }
        Ok(())
    }
}

fn parse_tuning(label: &str, raw: &str) -> Result<u32> {
    raw.parse().map_err(|e| {
        PipelineError::Config(format!("invalid tuning parameter in '{label}': {e}"))
    })
}

/// Confidence that the top category match is unambiguous.
///
/// With s1..sK sorted descending: gap_i = s1 - s_i weighted by 1/(i-1),
/// normalized by s1, then squashed through `1 - e^(-10x)` and rounded to four
/// decimals. A large front-loaded gap between the best match and the rest
/// maps close to 1; a flat field maps close to 0.
pub fn confidence(similarities: &[f32]) -> f32 {
    if similarities.len() < 2 {
        return 0.0;
    }
    let s1 = similarities[0] as f64;
    if s1 == 0.0 {
        return 0.0;
    }
    let mut weighted = 0.0f64;
    for (index, s) in similarities.iter().enumerate().skip(1) {
        let gap = s1 - *s as f64;
        weighted += gap / index as f64;
    }
    let weighted_gap = weighted / s1;
    let raw = (1.0 - (-10.0 * weighted_gap).exp()).clamp(0.0, 1.0);
    ((raw * 10_000.0).round() / 10_000.0) as f32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorizeSummary {
    pub pending: usize,
    pub categorized: usize,
    /// Rows already categorized by a concurrent run (conditional update hit 0 rows).
    pub already_done: usize,
    pub failed: usize,
}

impl CategorizeSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct Categorizer {
    pool: PgPool,
    top_k: usize,
    workers: usize,
    strategy: CategorizationStrategy,
}

impl Categorizer {
    pub fn new(pool: PgPool, top_k: usize, workers: usize) -> Self {
        Self {
            pool,
            top_k: top_k.max(1),
            workers: workers.max(1),
            strategy: CategorizationStrategy::default(),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: CategorizationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Categorizes every embedded-but-uncategorized notice published on `day`.
    pub async fn categorize_day(&self, day: NaiveDate) -> Result<CategorizeSummary> {
        self.categorize_window(DateWindow::single_day(day)).await
    }

    /// Categorizes every embedded-but-uncategorized notice inside `window`.
    #[instrument(skip(self), fields(window = %window, strategy = %self.strategy))]
    pub async fn categorize_window(&self, window: DateWindow) -> Result<CategorizeSummary> {
        let started = std::time::Instant::now();
        let pending = self.pending_in(window).await?;
        if pending.is_empty() {
            info!("nothing to categorize, no-op window");
            return Ok(CategorizeSummary::default());
        }

        let results: Vec<Result<bool>> = stream::iter(pending.iter())
            .map(|notice_id| self.categorize_one(notice_id))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut summary = CategorizeSummary {
            pending: pending.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(true) => summary.categorized += 1,
                Ok(false) => summary.already_done += 1,
                Err(e) => {
                    error!(error = %e, "categorization failed for one notice");
                    summary.failed += 1;
                }
            }
        }
        info!(
            pending = summary.pending,
            categorized = summary.categorized,
            already_done = summary.already_done,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "categorization window finished"
        );
        Ok(summary)
    }

    async fn pending_in(&self, window: DateWindow) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT e.notice_id \
             FROM notice_embeddings e \
             JOIN notices n ON n.notice_id = e.notice_id \
             WHERE n.published_at BETWEEN $1 AND $2 \
               AND e.cpv_codes IS NULL \
               AND e.{} IS NOT NULL \
             ORDER BY e.notice_id",
            self.strategy.precision.notice_column()
        );
        let rows = sqlx::query(&sql)
            .bind(window.from)
            .bind(window.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("notice_id")).collect())
    }

    /// Runs the top-K query and the conditional update in one transaction.
    /// Returns `false` when another run already categorized the row.
    async fn categorize_one(&self, notice_id: &str) -> Result<bool> {
        let notice_column = self.strategy.precision.notice_column();
        let category_column = self.strategy.precision.category_column();
        // The query contract is identical across strategies; only the
        // SET LOCAL differs, and it is scoped to this transaction.
        let top_k_sql = format!(
            "SELECT c.code, \
                    1 - (c.{category_column} <=> \
                         (SELECT {notice_column} FROM notice_embeddings WHERE notice_id = $1)) \
                        AS similarity \
             FROM cpv_categories c \
             ORDER BY c.{category_column} <=> \
                      (SELECT {notice_column} FROM notice_embeddings WHERE notice_id = $1) \
             LIMIT $2"
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.strategy.session_setup())
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(&top_k_sql)
            .bind(notice_id)
            .bind(self.top_k as i64)
            .fetch_all(&mut *tx)
            .await?;

        let codes: Vec<String> = rows.iter().map(|r| r.get("code")).collect();
        let similarities: Vec<f32> = rows
            .iter()
            .map(|r| r.get::<f64, _>("similarity") as f32)
            .collect();
        let score = confidence(&similarities);

        let updated = sqlx::query(
            r#"
            UPDATE notice_embeddings
            SET cpv_codes = $2,
                cpv_similarities = $3,
                cpv_confidence = $4,
                categorized_at = now()
            WHERE notice_id = $1 AND cpv_codes IS NULL
            "#,
        )
        .bind(notice_id)
        .bind(&codes)
        .bind(&similarities)
        .bind(score)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(updated > 0)
    }
}
