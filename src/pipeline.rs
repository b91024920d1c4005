//! Stage orchestration.
//!
//! Each stage's work window derives from the watermarks as
//! `(own_watermark, min(today, upstream_watermark)]`: the categorizer never
//! runs ahead of the embedder, which never runs ahead of the fetcher. Windows
//! execute day by day (the default, advancing the watermark after each
//! committed day) or as one whole-window call that advances the watermark
//! once at the end; either way the watermark never moves past a failed day.
//! Window derivation is a pure function so it is testable without any I/O.

use chrono::{NaiveDate, Utc};
use tracing::{error, info, instrument, warn};

use crate::categorize::Categorizer;
use crate::embed::EmbeddingGenerator;
use crate::errors::Result;
use crate::fetcher::WindowFetcher;
use crate::source::{DateWindow, FetchMode};
use crate::watermark::{Stage, WatermarkStore};

/// Explicit CLI bounds; `None` means "derive from watermarks".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowOverride {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// How a derived window is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Granularity {
    /// One day at a time, advancing the watermark after each committed day.
    #[default]
    DayByDay,
    /// The whole window in one call, advancing the watermark once after it
    /// commits. Cheaper for large backfills; a failure forfeits the whole
    /// window's watermark progress instead of just the failed day's.
    WholeWindow,
}

/// Derives the concrete inclusive day range a stage should process.
///
/// Without overrides this is `(own, min(today, upstream)]`. Overrides replace
/// the corresponding bound. Returns `None` when there is nothing to do.
pub fn stage_window(
    own: NaiveDate,
    upstream_cap: Option<NaiveDate>,
    today: NaiveDate,
    overrides: WindowOverride,
) -> Option<DateWindow> {
    let from = overrides.from.unwrap_or_else(|| own.succ_opt().unwrap_or(own));
    let derived_to = match upstream_cap {
        Some(upstream) => today.min(upstream),
        None => today,
    };
    let to = overrides.to.unwrap_or(derived_to);
    if from > to {
        return None;
    }
    Some(DateWindow { from, to })
}

/// Per-stage outcome of one run, feeding the final summary and exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub days: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Last day committed by this run, if any.
    pub advanced_to: Option<NaiveDate>,
}

impl StageReport {
    fn empty(stage: Stage) -> Self {
        Self {
            stage,
            days: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            advanced_to: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct Orchestrator {
    watermarks: WatermarkStore,
    fetcher: WindowFetcher,
    embedder: EmbeddingGenerator,
    categorizer: Categorizer,
    mode: FetchMode,
    granularity: Granularity,
}

impl Orchestrator {
    pub fn new(
        watermarks: WatermarkStore,
        fetcher: WindowFetcher,
        embedder: EmbeddingGenerator,
        categorizer: Categorizer,
        mode: FetchMode,
    ) -> Self {
        Self {
            watermarks,
            fetcher,
            embedder,
            categorizer,
            mode,
            granularity: Granularity::default(),
        }
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Runs ingestion over its derived (or overridden) window, day by day.
    #[instrument(skip(self))]
    pub async fn run_fetch(&self, overrides: WindowOverride) -> Result<StageReport> {
        let own = self.watermarks.get(Stage::Fetch).await?;
        let Some(window) = stage_window(own, None, today(), overrides) else {
            info!(stage = %Stage::Fetch, "watermark is current, nothing to do");
            return Ok(StageReport::empty(Stage::Fetch));
        };

        let mut report = StageReport::empty(Stage::Fetch);
        match self.granularity {
            Granularity::DayByDay => {
                for day in days_of(window) {
                    let summary = self
                        .fetcher
                        .fetch_window(DateWindow::single_day(day), self.mode)
                        .await?;
                    report.days += 1;
                    report.processed += summary.fetched as u64;
                    report.succeeded += summary.upserted as u64;
                    self.advance(Stage::Fetch, day, &mut report).await?;
                }
            }
            Granularity::WholeWindow => {
                let summary = self.fetcher.fetch_window(window, self.mode).await?;
                report.days = days_of(window).count();
                report.processed = summary.fetched as u64;
                report.succeeded = summary.upserted as u64;
                self.advance(Stage::Fetch, window.to, &mut report).await?;
            }
        }
        Ok(report)
    }

    /// Runs embedding up to the fetch watermark.
    #[instrument(skip(self))]
    pub async fn run_embed(&self, overrides: WindowOverride) -> Result<StageReport> {
        let own = self.watermarks.get(Stage::Embed).await?;
        let upstream = self.watermarks.get(Stage::Fetch).await?;
        let Some(window) = stage_window(own, Some(upstream), today(), overrides) else {
            info!(stage = %Stage::Embed, "watermark is current, nothing to do");
            return Ok(StageReport::empty(Stage::Embed));
        };

        let mut report = StageReport::empty(Stage::Embed);
        match self.granularity {
            Granularity::DayByDay => {
                for day in days_of(window) {
                    let summary = self.embedder.embed_day(day).await?;
                    report.days += 1;
                    report.processed += summary.pending as u64;
                    report.succeeded += summary.embedded as u64;
                    report.failed += summary.failed_batches as u64;
                    if !summary.is_clean() {
                        // Skipped batches stay pending; a later run re-derives
                        // them from the NULL columns, so the watermark must
                        // not move.
                        warn!(stage = %Stage::Embed, day = %day, "day had failed batches, stopping before watermark");
                        break;
                    }
                    self.advance(Stage::Embed, day, &mut report).await?;
                }
            }
            Granularity::WholeWindow => {
                let summary = self.embedder.embed_window(window).await?;
                report.days = days_of(window).count();
                report.processed = summary.pending as u64;
                report.succeeded = summary.embedded as u64;
                report.failed = summary.failed_batches as u64;
                if summary.is_clean() {
                    self.advance(Stage::Embed, window.to, &mut report).await?;
                } else {
                    warn!(stage = %Stage::Embed, window = %window, "window had failed batches, watermark not advanced");
                }
            }
        }
        Ok(report)
    }

    /// Runs categorization up to the embed watermark.
    #[instrument(skip(self))]
    pub async fn run_categorize(&self, overrides: WindowOverride) -> Result<StageReport> {
        let own = self.watermarks.get(Stage::Categorize).await?;
        let upstream = self.watermarks.get(Stage::Embed).await?;
        let Some(window) = stage_window(own, Some(upstream), today(), overrides) else {
            info!(stage = %Stage::Categorize, "watermark is current, nothing to do");
            return Ok(StageReport::empty(Stage::Categorize));
        };

        let mut report = StageReport::empty(Stage::Categorize);
        match self.granularity {
            Granularity::DayByDay => {
                for day in days_of(window) {
                    let summary = self.categorizer.categorize_day(day).await?;
                    report.days += 1;
                    report.processed += summary.pending as u64;
                    report.succeeded += (summary.categorized + summary.already_done) as u64;
                    report.failed += summary.failed as u64;
                    if !summary.is_clean() {
                        warn!(stage = %Stage::Categorize, day = %day, "day had failures, stopping before watermark");
                        break;
                    }
                    self.advance(Stage::Categorize, day, &mut report).await?;
                }
            }
            Granularity::WholeWindow => {
                let summary = self.categorizer.categorize_window(window).await?;
                report.days = days_of(window).count();
                report.processed = summary.pending as u64;
                report.succeeded = (summary.categorized + summary.already_done) as u64;
                report.failed = summary.failed as u64;
                if summary.is_clean() {
                    self.advance(Stage::Categorize, window.to, &mut report).await?;
                } else {
                    warn!(stage = %Stage::Categorize, window = %window, "window had failures, watermark not advanced");
                }
            }
        }
        Ok(report)
    }

    /// Runs all three stages in dependency order. A non-fatal stage failure
    /// is recorded in that stage's report and does not stop the downstream
    /// stages from processing whatever their watermarks allow.
    pub async fn run_all(&self, overrides: WindowOverride) -> Result<Vec<StageReport>> {
        let fetch = recover(Stage::Fetch, self.run_fetch(overrides).await)?;
        let embed = recover(Stage::Embed, self.run_embed(overrides).await)?;
        let categorize = recover(Stage::Categorize, self.run_categorize(overrides).await)?;
        Ok(vec![fetch, embed, categorize])
    }

    /// Advances a stage's watermark after a committed day. Explicit re-runs
    /// of historical windows land here with a day at or before the stored
    /// watermark; those are fine and simply leave the watermark in place.
    async fn advance(&self, stage: Stage, day: NaiveDate, report: &mut StageReport) -> Result<()> {
        let current = self.watermarks.get(stage).await?;
        if day > current {
            self.watermarks.set(stage, day).await?;
        }
        report.advanced_to = Some(day.max(current));
        Ok(())
    }
}

/// Converts a non-fatal stage error into a failed report so `run_all` can
/// continue downstream; fatal errors still abort the whole run.
fn recover(stage: Stage, result: Result<StageReport>) -> Result<StageReport> {
    match result {
        Ok(report) => Ok(report),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!(stage = %stage, error = %e, "stage failed, continuing with downstream stages");
            let mut report = StageReport::empty(stage);
            report.failed = 1;
            Ok(report)
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn days_of(window: DateWindow) -> impl Iterator<Item = NaiveDate> {
    window
        .from
        .iter_days()
        .take_while(move |day| *day <= window.to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_starts_after_the_own_watermark() {
        let window = stage_window(
            date(2025, 1, 10),
            None,
            date(2025, 1, 15),
            WindowOverride::default(),
        )
        .unwrap();
        assert_eq!(window.from, date(2025, 1, 11));
        assert_eq!(window.to, date(2025, 1, 15));
    }

    #[test]
    fn window_is_capped_by_the_upstream_watermark() {
        let window = stage_window(
            date(2025, 1, 10),
            Some(date(2025, 1, 12)),
            date(2025, 1, 15),
            WindowOverride::default(),
        )
        .unwrap();
        assert_eq!(window.to, date(2025, 1, 12));
    }

    #[test]
    fn upstream_past_today_is_capped_by_today() {
        let window = stage_window(
            date(2025, 1, 10),
            Some(date(2025, 2, 1)),
            date(2025, 1, 15),
            WindowOverride::default(),
        )
        .unwrap();
        assert_eq!(window.to, date(2025, 1, 15));
    }

    #[test]
    fn caught_up_stage_gets_no_window() {
        assert_eq!(
            stage_window(
                date(2025, 1, 15),
                Some(date(2025, 1, 15)),
                date(2025, 1, 15),
                WindowOverride::default(),
            ),
            None
        );
        // Categorizer ahead of a stalled embedder: still nothing to do.
        assert_eq!(
            stage_window(
                date(2025, 1, 15),
                Some(date(2025, 1, 10)),
                date(2025, 1, 20),
                WindowOverride::default(),
            ),
            None
        );
    }

    #[test]
    fn overrides_replace_the_derived_bounds() {
        let window = stage_window(
            date(2025, 1, 10),
            Some(date(2025, 1, 12)),
            date(2025, 1, 15),
            WindowOverride {
                from: Some(date(2024, 12, 1)),
                to: Some(date(2024, 12, 31)),
            },
        )
        .unwrap();
        assert_eq!(window.from, date(2024, 12, 1));
        assert_eq!(window.to, date(2024, 12, 31));
    }

    #[test]
    fn inverted_override_yields_no_window() {
        assert_eq!(
            stage_window(
                date(2025, 1, 10),
                None,
                date(2025, 1, 15),
                WindowOverride {
                    from: Some(date(2025, 1, 20)),
                    to: Some(date(2025, 1, 1)),
                },
            ),
            None
        );
    }

    #[test]
    fn nonfatal_stage_errors_become_failed_reports() {
        let report = recover(
            Stage::Fetch,
            Err(crate::errors::PipelineError::Exhausted {
                attempts: 3,
                last: Box::new(crate::errors::PipelineError::Server { status: 503 }),
            }),
        )
        .unwrap();
        assert_eq!(report.stage, Stage::Fetch);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn fatal_stage_errors_still_abort() {
        let result = recover(
            Stage::Embed,
            Err(crate::errors::PipelineError::Config("missing key".into())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn days_of_iterates_the_inclusive_range() {
        let days: Vec<NaiveDate> = days_of(DateWindow {
            from: date(2025, 1, 30),
            to: date(2025, 2, 2),
        })
        .collect();
        assert_eq!(
            days,
            vec![
                date(2025, 1, 30),
                date(2025, 1, 31),
                date(2025, 2, 1),
                date(2025, 2, 2),
            ]
        );
    }
}
