//! Paced HTTP client for the registry API.
//!
//! Every call goes through the shared [`AdaptiveLimiter`] (acquire a slot,
//! report the outcome) and through the generic retry helper, so callers see
//! only final results: a page, a profile, or an error already classified per
//! the taxonomy in [`crate::errors`].

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::errors::{PipelineError, Result};
use crate::ratelimit::{AdaptiveLimiter, Outcome, RetryPolicy, retry};
use crate::settings::Settings;
use crate::source::models::{DateWindow, FetchMode, NoticePage, PageWire, RawNotice};

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
    limiter: Arc<AdaptiveLimiter>,
    retry_policy: RetryPolicy,
}

impl RegistryClient {
    pub fn new(settings: &Settings, limiter: Arc<AdaptiveLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: settings.registry_base_url.trim_end_matches('/').to_string(),
            page_size: settings.page_size,
            limiter,
            retry_policy: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Fetches one page of notices for the window. Page numbers are 1-based;
    /// the response carries the total page count for the window.
    #[instrument(skip(self), fields(window = %window, page))]
    pub async fn fetch_page(
        &self,
        window: DateWindow,
        mode: FetchMode,
        page: u32,
    ) -> Result<NoticePage> {
        retry(&self.retry_policy, "registry page", |_| async move {
            self.limiter.acquire_slot().await;
            let result = self.fetch_page_once(window, mode, page).await;
            self.limiter.report_outcome(Outcome::from_result(&result)).await;
            result
        })
        .await
    }

    async fn fetch_page_once(
        &self,
        window: DateWindow,
        mode: FetchMode,
        page: u32,
    ) -> Result<NoticePage> {
        let (from_param, to_param) = mode.query_params();
        let url = format!("{}/notices", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                (from_param, window.from.format("%Y-%m-%d").to_string()),
                (to_param, window.to.format("%Y-%m-%d").to_string()),
                ("page", page.to_string()),
                ("page_size", self.page_size.to_string()),
            ])
            .send()
            .await?;

        let wire: PageWire = check_status(response.status())
            .map(|_| response)?
            .json()
            .await?;

        let mut notices = Vec::with_capacity(wire.notices.len());
        let mut skipped = 0usize;
        for value in wire.notices {
            match RawNotice::from_value(value) {
                Ok(notice) => notices.push(notice),
                Err(e) => {
                    warn!(error = %e, "skipping malformed notice element");
                    skipped += 1;
                }
            }
        }
        debug!(
            page,
            total_pages = wire.total_pages,
            parsed = notices.len(),
            skipped,
            "fetched registry page"
        );
        Ok(NoticePage {
            total_pages: wire.total_pages,
            notices,
            skipped,
        })
    }

    /// Fetches one buyer-organization profile by registry key.
    ///
    /// Used opportunistically by the fetcher; a 404 is propagated as
    /// [`PipelineError::NotFound`] so the caller can simply skip the buyer.
    #[instrument(skip(self))]
    pub async fn fetch_buyer(&self, buyer_id: &str) -> Result<serde_json::Value> {
        retry(&self.retry_policy, "buyer profile", |_| async move {
            self.limiter.acquire_slot().await;
            let result = self.fetch_buyer_once(buyer_id).await;
            self.limiter.report_outcome(Outcome::from_result(&result)).await;
            result
        })
        .await
    }

    async fn fetch_buyer_once(&self, buyer_id: &str) -> Result<serde_json::Value> {
        let url = format!("{}/buyers/{}", self.base_url, buyer_id);
        let response = self.http.get(&url).send().await?;
        let response = check_status(response.status()).map(|_| response)?;
        Ok(response.json().await?)
    }
}

/// Maps an HTTP status onto the error taxonomy; 2xx passes through.
fn check_status(status: StatusCode) -> Result<()> {
    match Outcome::from_status(status.as_u16()) {
        Outcome::Success => Ok(()),
        Outcome::NotFound => Err(PipelineError::NotFound),
        Outcome::RateLimited => Err(PipelineError::RateLimited {
            status: status.as_u16(),
        }),
        Outcome::Forbidden => Err(PipelineError::Forbidden {
            status: status.as_u16(),
        }),
        Outcome::ServerError => Err(PipelineError::Server {
            status: status.as_u16(),
        }),
        Outcome::Other => Err(PipelineError::Provider(format!(
            "unexpected registry status {status}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(PipelineError::NotFound)
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(PipelineError::RateLimited { status: 429 })
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN),
            Err(PipelineError::Forbidden { status: 403 })
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY),
            Err(PipelineError::Server { status: 502 })
        ));
    }
}
