//! Durable per-stage checkpoints.
//!
//! A watermark is the last date for which a stage's work is known to be fully
//! committed. Watermarks live in the generic `pipeline_state` key/value table
//! under `watermark:<stage>` and are monotonically non-decreasing: `set`
//! rejects regressions, and every write is followed by a mandatory read-back.
//! A read-back mismatch means the persistence layer is silently losing
//! progress, which is fatal for the whole run.

use chrono::NaiveDate;
use sqlx::PgPool;
use tracing::instrument;

use crate::errors::{PipelineError, Result};

const DATE_FMT: &str = "%Y-%m-%d";

/// The three pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetch,
    Embed,
    Categorize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Embed => "embed",
            Stage::Categorize => "categorize",
        }
    }

    fn state_key(&self) -> String {
        format!("watermark:{}", self.as_str())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct WatermarkStore {
    pool: PgPool,
    /// Returned by `get` when a stage has never committed anything.
    default: NaiveDate,
}

impl WatermarkStore {
    pub fn new(pool: PgPool, default: NaiveDate) -> Self {
        Self { pool, default }
    }

    /// Last fully-committed date for `stage`, or the configured default.
    #[instrument(skip(self))]
    pub async fn get(&self, stage: Stage) -> Result<NaiveDate> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM pipeline_state WHERE key = $1")
                .bind(stage.state_key())
                .fetch_optional(&self.pool)
                .await?;
        match value {
            Some(raw) => NaiveDate::parse_from_str(&raw, DATE_FMT).map_err(|e| {
                PipelineError::Schema(format!("corrupt watermark for stage {stage}: {raw} ({e})"))
            }),
            None => Ok(self.default),
        }
    }

    /// Advances the watermark for `stage` to `date`.
    ///
    /// Rejects regressions, then upserts and immediately reads the value back.
    /// Any mismatch between what was written and what is read is fatal.
    #[instrument(skip(self), err)]
    pub async fn set(&self, stage: Stage, date: NaiveDate) -> Result<()> {
        let current = self.get(stage).await?;
        if date < current {
            return Err(PipelineError::WatermarkRegression {
                stage: stage.as_str(),
                stored: current.format(DATE_FMT).to_string(),
                requested: date.format(DATE_FMT).to_string(),
            });
        }

        let wrote = date.format(DATE_FMT).to_string();
        sqlx::query(
            r#"
            INSERT INTO pipeline_state (key, value, description, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    description = EXCLUDED.description,
                    updated_at = now()
            "#,
        )
        .bind(stage.state_key())
        .bind(&wrote)
        .bind(format!("last committed day of the {stage} stage"))
        .execute(&self.pool)
        .await?;

        // Mandatory read-back: verify the persistence layer actually holds
        // what we just wrote before the caller treats the window as done.
        let read: Option<String> =
            sqlx::query_scalar("SELECT value FROM pipeline_state WHERE key = $1")
                .bind(stage.state_key())
                .fetch_optional(&self.pool)
                .await?;
        match read {
            Some(ref r) if *r == wrote => Ok(()),
            other => Err(PipelineError::WatermarkReadback {
                stage: stage.as_str(),
                wrote,
                read: other.unwrap_or_else(|| "<missing>".into()),
            }),
        }
    }
}
