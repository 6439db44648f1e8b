//! In-memory collection of code embedding records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EmbeddingError, Result};
use crate::record::CodeEmbeddingRecord;
use crate::similarity::SimilarityEngine;

/// A record matched by a collection search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub code_id: String,
    pub code_type: String,
    pub file_path: Option<String>,

    /// Similarity score in `[0, 1]`.
    pub score: f32,
}

/// Records keyed by `code_id`, kept in insertion order.
///
/// Every record must match the collection dimension. Searches rank records
/// with [`SimilarityEngine::find_similar`], so equal scores come back in
/// insertion order.
pub struct CodeEmbeddingCollection {
    records: IndexMap<String, CodeEmbeddingRecord>,
    engine: SimilarityEngine,
}

impl CodeEmbeddingCollection {
    /// Create an empty collection for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            records: IndexMap::new(),
            engine: SimilarityEngine::new(dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.engine.dimension()
    }

    /// Add a record, replacing any record with the same `code_id`.
    ///
    /// A replaced record keeps its original position. Records with the wrong
    /// dimension or non-finite components are rejected.
    pub fn insert(&mut self, record: CodeEmbeddingRecord) -> Result<Option<CodeEmbeddingRecord>> {
        record.ensure_dimension(self.dimension())?;
        record.ensure_finite()?;
        debug!("Added embedding to collection: {}", record.code_id);
        Ok(self.records.insert(record.code_id.clone(), record))
    }

    /// Remove a record.
    pub fn remove(&mut self, code_id: &str) -> Option<CodeEmbeddingRecord> {
        self.records.shift_remove(code_id)
    }

    /// Get a record by ID.
    pub fn get(&self, code_id: &str) -> Option<&CodeEmbeddingRecord> {
        self.records.get(code_id)
    }

    /// Check if an ID exists in the collection.
    pub fn contains(&self, code_id: &str) -> bool {
        self.records.contains_key(code_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &CodeEmbeddingRecord> {
        self.records.values()
    }

    /// Clear the collection.
    pub fn clear(&mut self) {
        self.records.clear();
        info!("Cleared embedding collection");
    }

    /// Search for the `top_k` records most similar to `query`, dropping
    /// any scoring below `min_score`.
    pub fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<SearchHit>> {
        let candidates: Vec<&[f32]> = self
            .records
            .values()
            .map(|record| record.embedding.as_slice())
            .collect();

        let matches = self.engine.find_similar(query, &candidates, top_k)?;

        Ok(matches
            .into_iter()
            .filter(|m| m.score >= min_score)
            .filter_map(|m| {
                self.records.get_index(m.index).map(|(_, record)| SearchHit {
                    code_id: record.code_id.clone(),
                    code_type: record.code_type.clone(),
                    file_path: record.file_path.clone(),
                    score: m.score,
                })
            })
            .collect())
    }

    /// Records most similar to the record stored under `code_id`, excluding
    /// that record itself.
    pub fn similar_to(&self, code_id: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let record = self
            .records
            .get(code_id)
            .ok_or_else(|| EmbeddingError::NotFound(code_id.to_string()))?;

        let mut hits = self.search(record.embedding.as_slice(), top_k.saturating_add(1), 0.0)?;
        hits.retain(|hit| hit.code_id != code_id);
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Serialize every record, in insertion order, as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        let records: Vec<Value> = self
            .records
            .values()
            .map(|record| Value::Object(record.to_map()))
            .collect();
        Ok(serde_json::to_string(&records)?)
    }

    /// Load a collection from [`Self::to_json`] output.
    pub fn from_json(json: &str, dimension: usize) -> Result<Self> {
        let values: Vec<Value> = serde_json::from_str(json)?;

        let mut collection = Self::new(dimension);
        for value in values {
            let Value::Object(map) = value else {
                return Err(EmbeddingError::Schema(
                    "collection entries must be JSON objects".to_string(),
                ));
            };
            collection.insert(CodeEmbeddingRecord::from_map(&map)?)?;
        }

        info!("Loaded {} records into embedding collection", collection.len());
        Ok(collection)
    }
}
