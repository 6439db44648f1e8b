//! Embedding cache for avoiding redundant provider calls.
//!
//! Entries are keyed by [`CacheKey`], a SHA-256 digest of the preprocessed
//! text and the code kind. By default the cache is unbounded and lives as
//! long as the [`EmbeddingCache`] instance; a capacity with an eviction
//! policy can be configured through [`CacheConfig`](crate::CacheConfig).
//!
//! Concurrent misses on the same key are not coalesced: the entry map is
//! locked only around lookups and inserts, never across a provider call, so
//! two tasks racing on a missing key may both invoke the provider. Callers
//! that need at most one computation per key must serialize
//! [`EmbeddingCache::get_or_compute`] themselves.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Embedding;
use crate::config::{CacheConfig, EmbedderConfig, EvictionPolicy};
use crate::error::{EmbeddingError, ProviderError, Result};
use crate::preprocess::preprocess;
use crate::provider::{DEFAULT_CODE_KIND, EmbeddingProvider, EmbeddingRequest};
use crate::record::{CodeEmbeddingRecord, Metadata};

/// Deterministic cache key.
///
/// Lowercase hex SHA-256 over `len(kind)` (u64, little endian), the kind
/// bytes, then the preprocessed text bytes. The length prefix keeps
/// `("ab", "c")` and `("a", "bc")` apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for already preprocessed text.
    pub fn derive(preprocessed: &str, kind: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((kind.len() as u64).to_le_bytes());
        hasher.update(kind.as_bytes());
        hasher.update(preprocessed.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache.
    pub cache_size: usize,

    /// Whether lookups and inserts are enabled.
    pub cache_enabled: bool,

    /// Dimension of every cached vector.
    pub embedding_dimension: usize,

    /// Model behind the provider.
    pub model_name: String,

    /// Device the model runs on.
    pub device: String,
}

/// On-disk form of the cache used by [`EmbeddingCache::save_snapshot`].
#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    model_name: String,
    embedding_dim: usize,
    created_at: DateTime<Utc>,
    entries: BTreeMap<String, Embedding>,
}

/// A miss waiting for the provider, with every request position it fills.
struct PendingEmbedding {
    key: CacheKey,
    request: EmbeddingRequest,
    positions: Vec<usize>,
}

/// Provider wrapper that caches embeddings by [`CacheKey`].
pub struct EmbeddingCache<P> {
    provider: P,

    /// In-memory entries.
    entries: Mutex<LruCache<CacheKey, Embedding>>,

    config: CacheConfig,
    max_length: usize,
    batch_size: usize,
}

impl<P> EmbeddingCache<P>
where
    P: EmbeddingProvider,
{
    /// Create a new cache in front of `provider`.
    pub fn new(provider: P, config: &EmbedderConfig) -> Result<Self> {
        config.validate()?;

        let entries = match config.cache.capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };

        Ok(Self {
            provider,
            entries: Mutex::new(entries),
            config: config.cache.clone(),
            max_length: config.max_length,
            batch_size: config.batch_size,
        })
    }

    /// Get the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Key under which `text` of the given kind is stored.
    pub fn key_for(&self, text: &str, kind: Option<&str>) -> CacheKey {
        CacheKey::derive(
            &preprocess(text, self.max_length),
            kind.unwrap_or(DEFAULT_CODE_KIND),
        )
    }

    /// Return the embedding for `text`, invoking the provider on a miss.
    ///
    /// `kind` defaults to [`DEFAULT_CODE_KIND`]. With `use_cache == false`
    /// the cache is bypassed in both directions: nothing is read and the
    /// fresh result is not stored.
    pub async fn get_or_compute(
        &self,
        text: &str,
        kind: Option<&str>,
        use_cache: bool,
    ) -> Result<Embedding> {
        let kind = kind.unwrap_or(DEFAULT_CODE_KIND);
        let processed = preprocess(text, self.max_length);
        let key = CacheKey::derive(&processed, kind);
        let caching = use_cache && self.config.enabled;

        if caching {
            if let Some(embedding) = self.lookup(&key).await {
                debug!("Cache hit for {kind} embedding");
                return Ok(embedding);
            }
        }

        let embedding = self.provider.encode_single(&processed, kind).await?;
        self.check_output(&embedding)?;

        if caching {
            self.store(key, embedding.clone()).await;
        }
        debug!("Generated {kind} embedding ({} chars)", processed.chars().count());

        Ok(embedding)
    }

    /// Embed several texts, serving hits from the cache.
    ///
    /// Output order matches `requests`. Misses are deduplicated by key and
    /// sent to the provider in chunks of at most `batch_size`.
    pub async fn get_or_compute_batch(
        &self,
        requests: &[EmbeddingRequest],
        use_cache: bool,
    ) -> Result<Vec<Embedding>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let caching = use_cache && self.config.enabled;
        let mut slots: Vec<Option<Embedding>> = vec![None; requests.len()];
        let mut pending: Vec<PendingEmbedding> = Vec::new();
        let mut pending_by_key: HashMap<CacheKey, usize> = HashMap::new();

        for (position, request) in requests.iter().enumerate() {
            let processed = preprocess(&request.text, self.max_length);
            let key = CacheKey::derive(&processed, &request.kind);

            if caching {
                if let Some(embedding) = self.lookup(&key).await {
                    slots[position] = Some(embedding);
                    continue;
                }
            }

            match pending_by_key.get(&key) {
                Some(&slot) => pending[slot].positions.push(position),
                None => {
                    pending_by_key.insert(key.clone(), pending.len());
                    pending.push(PendingEmbedding {
                        key,
                        request: EmbeddingRequest::new(processed).with_kind(request.kind.clone()),
                        positions: vec![position],
                    });
                }
            }
        }

        debug!(
            "Batch of {}: {} cached, {} to compute",
            requests.len(),
            requests.len() - pending.iter().map(|p| p.positions.len()).sum::<usize>(),
            pending.len()
        );

        for chunk in pending.chunks(self.batch_size) {
            let batch: Vec<EmbeddingRequest> = chunk.iter().map(|p| p.request.clone()).collect();
            let embeddings = self.provider.encode_batch(&batch).await?;

            if embeddings.len() != batch.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                ))
                .into());
            }

            for (item, embedding) in chunk.iter().zip(embeddings) {
                self.check_output(&embedding)?;
                for &position in &item.positions {
                    slots[position] = Some(embedding.clone());
                }
                if caching {
                    self.store(item.key.clone(), embedding).await;
                }
            }
        }

        slots.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            EmbeddingError::from(ProviderError::InvalidResponse(
                "batch left positions unfilled".to_string(),
            ))
        })
    }

    /// Embed `code` and wrap it in a record.
    ///
    /// The record keeps the original, unprocessed text; the cache is used
    /// with `code_type` as the kind.
    pub async fn create_record(
        &self,
        code: &str,
        code_id: impl Into<String>,
        code_type: &str,
        file_path: Option<&str>,
        metadata: Metadata,
    ) -> Result<CodeEmbeddingRecord> {
        let embedding = self.get_or_compute(code, Some(code_type), true).await?;
        let mut record =
            CodeEmbeddingRecord::new(code_id, code, embedding, code_type).with_metadata(metadata);
        if let Some(file_path) = file_path {
            record = record.with_file_path(file_path);
        }
        Ok(record)
    }

    /// Check if an embedding is cached, without touching recency.
    pub async fn contains(&self, text: &str, kind: Option<&str>) -> bool {
        let key = self.key_for(text, kind);
        self.entries.lock().await.contains(&key)
    }

    /// Number of cached embeddings.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Clear the entire cache.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        info!("Cleared embedding cache");
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            cache_size: self.len().await,
            cache_enabled: self.config.enabled,
            embedding_dimension: self.provider.embedding_dim(),
            model_name: self.provider.model_name().to_string(),
            device: self.provider.device().to_string(),
        }
    }

    /// Write every entry to `path` as JSON. Returns the number written.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let snapshot = {
            let entries = self.entries.lock().await;
            CacheSnapshot {
                model_name: self.provider.model_name().to_string(),
                embedding_dim: self.provider.embedding_dim(),
                created_at: Utc::now(),
                entries: entries
                    .iter()
                    .map(|(key, embedding)| (key.0.clone(), embedding.clone()))
                    .collect(),
            }
        };
        let content = serde_json::to_string_pretty(&snapshot)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, content).await?;
        info!(
            "Saved {} cache entries to {}",
            snapshot.entries.len(),
            path.display()
        );
        Ok(snapshot.entries.len())
    }

    /// Merge the entries of a snapshot written by [`Self::save_snapshot`].
    ///
    /// A snapshot from another model or dimension is skipped and 0 is
    /// returned. Returns the number of entries loaded.
    pub async fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let snapshot: CacheSnapshot = serde_json::from_str(&content)?;

        if snapshot.model_name != self.provider.model_name() {
            warn!(
                "Snapshot {} was written by model {}, skipping",
                path.display(),
                snapshot.model_name
            );
            return Ok(0);
        }

        let dimension = self.provider.embedding_dim();
        if snapshot.embedding_dim != dimension {
            warn!(
                "Snapshot {} has dimension {}, expected {dimension}, skipping",
                path.display(),
                snapshot.embedding_dim
            );
            return Ok(0);
        }

        for embedding in snapshot.entries.values() {
            embedding.ensure_dimension(dimension)?;
        }

        let count = snapshot.entries.len();
        let mut entries = self.entries.lock().await;
        for (key, embedding) in snapshot.entries {
            entries.push(CacheKey(key), embedding);
        }

        info!("Loaded {count} cache entries from {}", path.display());
        Ok(count)
    }

    /// Reject provider output of the wrong length or with non-finite
    /// components before it reaches the cache.
    fn check_output(&self, embedding: &Embedding) -> Result<()> {
        embedding.ensure_dimension(self.provider.embedding_dim())?;
        if !embedding.is_finite() {
            return Err(ProviderError::InvalidResponse(
                "embedding has non-finite components".to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn lookup(&self, key: &CacheKey) -> Option<Embedding> {
        let mut entries = self.entries.lock().await;
        match self.config.eviction {
            EvictionPolicy::Lru => entries.get(key).cloned(),
            EvictionPolicy::Fifo => entries.peek(key).cloned(),
        }
    }

    async fn store(&self, key: CacheKey, embedding: Embedding) {
        let mut entries = self.entries.lock().await;
        if let Some((evicted, _)) = entries.push(key.clone(), embedding) {
            if evicted != key {
                debug!("Evicted cache entry {evicted}");
            }
        }
    }
}
