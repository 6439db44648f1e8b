//! # Embeddings
//!
//! Semantic code embeddings for legacy-code analysis: snippets of source
//! code are normalized, embedded by an external model, cached, and ranked
//! against each other by cosine similarity.
//!
//! ## Features
//!
//! - **Preprocessing**: whitespace normalization and length bounding
//! - **Caching**: at most one provider call per `(text, kind)` key
//! - **Similarity Search**: clamped cosine similarity and stable top-k
//! - **Records**: embedded snippets with provenance and a lossless map form
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  text + kind ──► preprocess ──► CacheKey ──► EmbeddingCache     │
//! │                                                  │              │
//! │                                   miss ──► EmbeddingProvider    │
//! │                                                  │              │
//! │                                                  ▼              │
//! │              SimilarityEngine ◄── Embedding ──► CodeEmbedding-  │
//! │                                                 Record          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reengine_embeddings::{EmbedderConfig, EmbeddingCache, HashingProvider, SimilarityEngine};
//!
//! let config = EmbedderConfig::default();
//! let cache = EmbeddingCache::new(HashingProvider::from_config(&config), &config)?;
//!
//! let add = cache.get_or_compute("int add(int a, int b)", Some("method"), true).await?;
//! let sum = cache.get_or_compute("int sum(int x, int y)", Some("method"), true).await?;
//!
//! let engine = SimilarityEngine::new(cache.provider().embedding_dim());
//! let score = engine.similarity(&add, &sum)?;
//! ```

pub mod cache;
pub mod collection;
pub mod config;
pub mod error;
pub mod preprocess;
pub mod provider;
pub mod record;
pub mod similarity;
pub mod vector;

pub use cache::{CacheKey, CacheStats, EmbeddingCache};
pub use collection::{CodeEmbeddingCollection, SearchHit};
pub use config::{CacheConfig, Device, EmbedderConfig, EvictionPolicy};
pub use error::{EmbeddingError, ProviderError, ProviderResult, Result};
pub use preprocess::{TRUNCATION_MARKER, preprocess};
pub use provider::{
    DEFAULT_CODE_KIND, EmbeddingProvider, EmbeddingRequest, HashingProvider, OpenAiProvider,
};
pub use record::{CodeEmbeddingRecord, Metadata};
pub use similarity::{SimilarityEngine, SimilarityMatch, cosine_similarity};
pub use vector::Embedding;
