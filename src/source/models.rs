//! Wire models for the registry API.
//!
//! The registry is lenient about its own schema, so each record is parsed
//! individually: a malformed element becomes a per-record error that the
//! caller logs and skips, leaving the rest of the page intact.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::errors::{PipelineError, Result};

/// Inclusive date range, as sent to the registry's range query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn single_day(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Which timestamp the registry filters the window on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    #[default]
    ByPublication,
    ByUpdate,
}

impl FetchMode {
    /// Query parameter names for the window bounds.
    pub fn query_params(&self) -> (&'static str, &'static str) {
        match self {
            FetchMode::ByPublication => ("published_from", "published_to"),
            FetchMode::ByUpdate => ("updated_from", "updated_to"),
        }
    }
}

/// One page of the registry response, with records already parsed.
#[derive(Debug, Clone)]
pub struct NoticePage {
    pub total_pages: u32,
    pub notices: Vec<RawNotice>,
    /// Records on this page that failed per-record parsing.
    pub skipped: usize,
}

/// A parsed procurement notice, plus its raw payload for auditing.
#[derive(Debug, Clone)]
pub struct RawNotice {
    pub notice_id: String,
    pub title: String,
    pub description: String,
    pub buyer_id: Option<String>,
    pub published_at: NaiveDate,
    pub updated_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

impl RawNotice {
    /// The free text fed to the embedding provider.
    pub fn embed_text(&self) -> String {
        format!("{}\n{}", self.title.trim(), self.description.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageWire {
    pub total_pages: u32,
    #[serde(default)]
    pub notices: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NoticeWire {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    buyer_id: Option<String>,
    published_at: String,
    #[serde(default)]
    updated_at: Option<String>,
}

impl RawNotice {
    /// Parses one element of the page's `notices` array.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let wire: NoticeWire =
            serde_json::from_value(value.clone()).map_err(|e| PipelineError::Record {
                notice_id: value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<unknown>")
                    .to_string(),
                message: format!("malformed notice element: {e}"),
            })?;

        if wire.id.trim().is_empty() {
            return Err(PipelineError::Record {
                notice_id: "<empty>".into(),
                message: "empty notice id".into(),
            });
        }

        let published_at = NaiveDate::parse_from_str(&wire.published_at, "%Y-%m-%d")
            .map_err(|e| PipelineError::Record {
                notice_id: wire.id.clone(),
                message: format!("unparseable published_at '{}': {e}", wire.published_at),
            })?;

        let updated_at = match &wire.updated_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| PipelineError::Record {
                    notice_id: wire.id.clone(),
                    message: format!("unparseable updated_at '{raw}': {e}"),
                })?,
            // Registry omits updated_at for never-amended notices.
            None => published_at
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc(),
        };

        Ok(Self {
            notice_id: wire.id,
            title: wire.title.unwrap_or_default(),
            description: wire.description.unwrap_or_default(),
            buyer_id: wire.buyer_id,
            published_at,
            updated_at,
            raw: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_complete_notice() {
        let notice = RawNotice::from_value(json!({
            "id": "2025/S 001-000123",
            "title": "Road maintenance",
            "description": "Winter road maintenance, district 4",
            "buyer_id": "ORG-42",
            "published_at": "2025-01-01",
            "updated_at": "2025-01-02T08:30:00Z",
        }))
        .unwrap();
        assert_eq!(notice.notice_id, "2025/S 001-000123");
        assert_eq!(
            notice.published_at,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
        );
        assert_eq!(notice.buyer_id.as_deref(), Some("ORG-42"));
        assert!(notice.embed_text().starts_with("Road maintenance\n"));
    }

    #[test]
    fn missing_updated_at_defaults_to_publication_midnight() {
        let notice = RawNotice::from_value(json!({
            "id": "n-1",
            "published_at": "2025-03-10",
        }))
        .unwrap();
        assert_eq!(notice.updated_at.date_naive(), notice.published_at);
        assert!(notice.embed_text().is_empty());
    }

    #[test]
    fn malformed_date_is_a_record_error() {
        let err = RawNotice::from_value(json!({
            "id": "n-2",
            "published_at": "01.02.2025",
        }))
        .unwrap_err();
        match err {
            PipelineError::Record { notice_id, .. } => assert_eq!(notice_id, "n-2"),
            other => panic!("expected record error, got {other:?}"),
        }
    }

    #[test]
    fn empty_id_is_rejected() {
        let err = RawNotice::from_value(json!({
            "id": "  ",
            "published_at": "2025-01-01",
        }))
        .unwrap_err();
        assert!(matches!(err, PipelineError::Record { .. }));
    }
}
