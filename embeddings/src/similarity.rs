//! Similarity computation for embeddings.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical direction
/// - 0.0 means orthogonal vectors (or a zero vector)
/// - -1.0 means opposite vectors
///
/// Sums are accumulated in `f64`, where squares of finite `f32` components
/// neither overflow nor underflow. Vectors with non-finite components score
/// 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot_product = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let cosine = dot_product / (norm_a.sqrt() * norm_b.sqrt());
    if !cosine.is_finite() {
        return Ok(0.0);
    }

    Ok(cosine.clamp(-1.0, 1.0) as f32)
}

/// One ranked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    /// Position within the candidate slice.
    pub index: usize,

    /// Similarity score in `[0, 1]`.
    pub score: f32,
}

/// Pairwise similarity and top-k ranking over vectors of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityEngine {
    dimension: usize,
}

impl SimilarityEngine {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    /// Cosine similarity with negative values reported as 0. Always in
    /// `[0, 1]`, never NaN.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.check(a)?;
        self.check(b)?;
        Ok(cosine_similarity(a, b)?.clamp(0.0, 1.0))
    }

    /// Rank `candidates` against `query`.
    ///
    /// Returns the `min(top_k, candidates.len())` best matches, score
    /// descending; equal scores keep ascending candidate order.
    pub fn find_similar<V>(
        &self,
        query: &[f32],
        candidates: &[V],
        top_k: usize,
    ) -> Result<Vec<SimilarityMatch>>
    where
        V: AsRef<[f32]>,
    {
        self.check(query)?;

        let mut scores: Vec<(OrderedFloat<f32>, usize)> = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            let score = self.similarity(query, candidate.as_ref())?;
            scores.push((OrderedFloat(score), index));
        }

        scores.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(scores
            .into_iter()
            .take(top_k)
            .map(|(score, index)| SimilarityMatch {
                index,
                score: score.0,
            })
            .collect())
    }
}
