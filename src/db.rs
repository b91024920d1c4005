//! Database connection and schema preflight.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::instrument;

use crate::errors::{PipelineError, Result};

/// Connect (or create) the pipeline database at `database_url` and run
/// embedded migrations (idempotent).
#[instrument(skip(database_url))]
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Verifies the storage schema the pipeline cannot run without: the pgvector
/// extension and the vector columns on `notice_embeddings`. A miss here is
/// fatal and aborts the run before any work starts.
pub async fn preflight(pool: &PgPool) -> Result<()> {
    let has_vector: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'vector')")
            .fetch_one(pool)
            .await?;
    if !has_vector {
        return Err(PipelineError::Schema(
            "pgvector extension is not installed".into(),
        ));
    }

    for column in ["embedding", "embedding_half"] {
        let present: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_name = 'notice_embeddings' AND column_name = $1)",
        )
        .bind(column)
        .fetch_one(pool)
        .await?;
        if !present {
            return Err(PipelineError::Schema(format!(
                "notice_embeddings.{column} column is missing"
            )));
        }
    }
    Ok(())
}
