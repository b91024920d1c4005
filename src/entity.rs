//! Opportunistic cache of buyer-organization registry lookups.
//!
//! Profiles are nice-to-have context, not pipeline state: lookups run after
//! the window's transaction has committed, and every failure is logged and
//! swallowed so they can never fail or stall a stage.

use sqlx::PgPool;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::source::RegistryClient;

#[derive(Clone)]
pub struct BuyerProfileCache {
    pool: PgPool,
    client: RegistryClient,
}

impl BuyerProfileCache {
    pub fn new(pool: PgPool, client: RegistryClient) -> Self {
        Self { pool, client }
    }

    /// Fetches and upserts profiles for any of `buyer_ids` not cached yet.
    /// Returns the number of profiles actually refreshed.
    pub async fn refresh_missing<I>(&self, buyer_ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut refreshed = 0;
        for buyer_id in buyer_ids {
            match self.refresh_one(&buyer_id).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(buyer_id, error = %e, "buyer profile lookup failed, continuing");
                }
            }
        }
        refreshed
    }

    async fn refresh_one(&self, buyer_id: &str) -> Result<bool> {
        let cached: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM buyer_profiles WHERE buyer_id = $1)")
                .bind(buyer_id)
                .fetch_one(&self.pool)
                .await?;
        if cached {
            return Ok(false);
        }

        let payload = match self.client.fetch_buyer(buyer_id).await {
            Ok(payload) => payload,
            Err(crate::errors::PipelineError::NotFound) => {
                debug!(buyer_id, "buyer not present in registry");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let label = payload
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO buyer_profiles (buyer_id, label, raw, fetched_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (buyer_id) DO UPDATE
                SET label = EXCLUDED.label,
                    raw = EXCLUDED.raw,
                    fetched_at = now()
            "#,
        )
        .bind(buyer_id)
        .bind(label)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }
}
