//! Embedding generation for pending notices.
//!
//! * [`provider`] — the batch embedding API (HTTP implementation + a
//!   deterministic mock for tests).
//! * [`generator`] — the pipeline stage: selects pending records, batches
//!   text, and persists vectors with fill-only-if-null semantics.

pub mod generator;
pub mod provider;

pub use generator::{EmbedSummary, EmbeddingGenerator};
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider};

/// Vector representation stored for a notice or category.
///
/// `Full` is the provider's native f32 vector; `Half` is the reduced-precision
/// variant kept for cheaper ANN search. Each maps to its own column pair, and
/// each can be (back)filled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Full,
    Half,
}

impl Precision {
    /// Column on `notice_embeddings` holding this representation.
    pub fn notice_column(&self) -> &'static str {
        match self {
            Precision::Full => "embedding",
            Precision::Half => "embedding_half",
        }
    }

    /// Column on `cpv_categories` holding this representation.
    pub fn category_column(&self) -> &'static str {
        match self {
            Precision::Full => "embedding",
            Precision::Half => "embedding_half",
        }
    }
}
