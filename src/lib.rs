//! ```text
//! registry API ──► source::RegistryClient ──► fetcher::WindowFetcher ──► notices
//!                        │ (paced by ratelimit::AdaptiveLimiter)
//!                        └─► entity::BuyerProfileCache (opportunistic)
//!
//! notices ──► embed::EmbeddingGenerator ──► notice_embeddings (vector columns)
//!                        │
//!                        └─► embed::EmbeddingProvider (batch HTTP)
//!
//! notice_embeddings ──► categorize::Categorizer ──► cpv codes + confidence
//!
//! pipeline::Orchestrator derives per-stage date windows from
//! watermark::WatermarkStore and runs the stages in strict order.
//! ```

pub mod categorize;
pub mod db;
pub mod embed;
pub mod entity;
pub mod errors;
pub mod fetcher;
pub mod pipeline;
pub mod ratelimit;
pub mod settings;
pub mod source;
pub mod telemetry;
pub mod watermark;

pub use errors::PipelineError;
pub use settings::Settings;
