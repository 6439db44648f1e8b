//! Embedding providers.
//!
//! The model that turns code into vectors lives outside this crate. The
//! [`EmbeddingProvider`] trait is the narrow boundary the cache talks to;
//! [`OpenAiProvider`] talks to an OpenAI-compatible HTTP endpoint and
//! [`HashingProvider`] is a deterministic offline stand-in.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Embedding;
use crate::config::{Device, EmbedderConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::preprocess::TRUNCATION_MARKER;

/// Kind used when the caller does not name one.
pub const DEFAULT_CODE_KIND: &str = "snippet";

/// A single text to embed together with its code kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Code kind, e.g. `method`, `class` or `field`.
    pub kind: String,
}

impl EmbeddingRequest {
    /// Create a new embedding request with the default kind.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: DEFAULT_CODE_KIND.to_string(),
        }
    }

    /// Set the code kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// Trait for embedding providers.
///
/// `embedding_dim`, `model_name` and `device` are fixed once the provider is
/// constructed. Implementations do not retry; a failed call surfaces as a
/// [`ProviderError`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier.
    fn model_name(&self) -> &str;

    /// Device the model runs on.
    fn device(&self) -> Device;

    /// Length of every vector this provider returns.
    fn embedding_dim(&self) -> usize;

    /// Generate an embedding for one preprocessed text.
    async fn encode_single(&self, text: &str, kind: &str) -> ProviderResult<Embedding>;

    /// Generate embeddings for several texts.
    ///
    /// The output has the same length and order as `requests`.
    async fn encode_batch(&self, requests: &[EmbeddingRequest]) -> ProviderResult<Vec<Embedding>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.encode_single(&request.text, &request.kind).await?);
        }
        Ok(results)
    }
}

#[async_trait]
impl<P> EmbeddingProvider for Arc<P>
where
    P: EmbeddingProvider + ?Sized,
{
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn device(&self) -> Device {
        (**self).device()
    }

    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }

    async fn encode_single(&self, text: &str, kind: &str) -> ProviderResult<Embedding> {
        (**self).encode_single(text, kind).await
    }

    async fn encode_batch(&self, requests: &[EmbeddingRequest]) -> ProviderResult<Vec<Embedding>> {
        (**self).encode_batch(requests).await
    }
}

/// OpenAI-compatible embedding provider.
pub struct OpenAiProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    model: String,
    device: Device,
    dimension: usize,

    /// Dimension sent with each request, if configured explicitly.
    requested_dimensions: Option<usize>,

    batch_size: usize,
    max_length: usize,
}

impl OpenAiProvider {
    /// Create a provider from shared construction parameters.
    ///
    /// The API key is read from `OPENAI_API_KEY`.
    pub fn from_config(config: &EmbedderConfig) -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model: config.model_name.clone(),
            device: config.device,
            dimension: config
                .dimensions
                .unwrap_or_else(|| default_dimension(&config.model_name)),
            requested_dimensions: config.dimensions,
            batch_size: config.batch_size.max(1),
            max_length: config.max_length,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Check if an API key is set.
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Embed one chunk of inputs with a single HTTP request.
    async fn request(&self, inputs: &[&str]) -> ProviderResult<Vec<Embedding>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(ProviderError::NotConfigured)?;

        // Preprocessed text never exceeds the budget, except for the marker
        // itself when the budget is tiny.
        let limit = self.max_length.max(TRUNCATION_MARKER.len());
        if let Some(length) = inputs
            .iter()
            .map(|text| text.chars().count())
            .find(|&length| length > limit)
        {
            return Err(ProviderError::TextTooLong {
                length,
                max_length: limit,
            });
        }

        let mut body = serde_json::json!({
            "input": inputs,
            "model": self.model,
        });
        if let Some(dims) = self.requested_dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiRequest(format!(
                "{status}: {error_text}"
            )));
        }

        let mut result: OpenAiEmbeddingResponse = response.json().await?;

        if result.data.len() != inputs.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                result.data.len()
            )));
        }

        // The API may return items out of order; `index` is authoritative.
        result.data.sort_by_key(|item| item.index);
        if result
            .data
            .iter()
            .enumerate()
            .any(|(position, item)| item.index != position)
        {
            return Err(ProviderError::InvalidResponse(
                "embedding indices do not cover the request".to_string(),
            ));
        }

        if let Some(usage) = result.usage {
            debug!(
                "Embedding request used {} tokens ({} prompt)",
                usage.total_tokens, usage.prompt_tokens
            );
        }

        Ok(result
            .data
            .into_iter()
            .map(|item| Embedding::from(item.embedding))
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn device(&self) -> Device {
        self.device
    }

    fn embedding_dim(&self) -> usize {
        self.dimension
    }

    async fn encode_single(&self, text: &str, kind: &str) -> ProviderResult<Embedding> {
        debug!("Generating {kind} embedding with model: {}", self.model);

        self.request(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No embedding in response".to_string()))
    }

    async fn encode_batch(&self, requests: &[EmbeddingRequest]) -> ProviderResult<Vec<Embedding>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings = Vec::with_capacity(requests.len());
        for (batch, chunk) in requests.chunks(self.batch_size).enumerate() {
            let texts: Vec<&str> = chunk.iter().map(|r| r.text.as_str()).collect();
            debug!(
                "Generating batch {} ({} texts) with model: {}",
                batch + 1,
                texts.len(),
                self.model
            );
            embeddings.extend(self.request(&texts).await?);
        }

        info!("Generated {} batch embeddings", embeddings.len());
        Ok(embeddings)
    }
}

/// Native output size of well-known embedding models.
fn default_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        "microsoft/codebert-base" | "microsoft/unixcoder-base" => 768,
        "all-MiniLM-L6-v2" => 384,
        _ => 1536,
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    total_tokens: u64,
}

/// Deterministic provider based on feature hashing.
///
/// Identifier tokens are lowercased, hashed into one of `dimension` buckets
/// and counted; the counts are scaled to unit length. Texts that share
/// vocabulary end up close to each other, which is enough for offline runs
/// and tests. The code kind does not influence the vector.
pub struct HashingProvider {
    model: String,
    device: Device,
    dimension: usize,
}

impl HashingProvider {
    /// Default output size, matching CodeBERT.
    pub const DEFAULT_DIMENSION: usize = 768;

    pub fn new(dimension: usize) -> Self {
        Self {
            model: "feature-hashing".to_string(),
            device: Device::Cpu,
            dimension: dimension.max(1),
        }
    }

    pub fn from_config(config: &EmbedderConfig) -> Self {
        Self {
            model: config.model_name.clone(),
            device: config.device,
            dimension: config.dimensions.unwrap_or(Self::DEFAULT_DIMENSION).max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dimension as u64) as usize
    }

    fn embed(&self, text: &str) -> Embedding {
        let mut counts = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|token| !token.is_empty())
        {
            counts[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let mut embedding = Embedding::from(counts);
        embedding.normalize();
        embedding
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn device(&self) -> Device {
        self.device
    }

    fn embedding_dim(&self) -> usize {
        self.dimension
    }

    async fn encode_single(&self, text: &str, kind: &str) -> ProviderResult<Embedding> {
        debug!("Hashing {kind} text of {} bytes", text.len());
        Ok(self.embed(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai_provider(server: &MockServer, config: &EmbedderConfig) -> OpenAiProvider {
        OpenAiProvider::from_config(config)
            .with_api_key("test-key")
            .with_base_url(server.uri())
    }

    #[test]
    fn test_embedding_request() {
        let request = EmbeddingRequest::new("int x;");
        assert_eq!(request.kind, DEFAULT_CODE_KIND);

        let request = request.with_kind("field");
        assert_eq!(request.text, "int x;");
        assert_eq!(request.kind, "field");
    }

    #[test]
    fn test_openai_provider_dimensions() {
        let provider = OpenAiProvider::from_config(&EmbedderConfig::new("text-embedding-3-large"));
        assert_eq!(provider.embedding_dim(), 3072);

        let provider = OpenAiProvider::from_config(
            &EmbedderConfig::new("text-embedding-3-large").with_dimensions(256),
        );
        assert_eq!(provider.embedding_dim(), 256);
    }

    #[tokio::test]
    async fn test_hashing_provider_is_deterministic() {
        let provider = HashingProvider::new(64);
        let a = provider.encode_single("return a + b;", "method").await.unwrap();
        let b = provider.encode_single("return a + b;", "class").await.unwrap();

        assert_eq!(a.dimension(), 64);
        assert_eq!(a, b);
        assert!((a.magnitude() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_hashing_provider_empty_text_is_zero_vector() {
        let provider = HashingProvider::new(16);
        let v = provider.encode_single("", DEFAULT_CODE_KIND).await.unwrap();
        assert_eq!(v, Embedding::zeros(16));
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let provider = HashingProvider::new(32);
        let requests = vec![
            EmbeddingRequest::new("class Foo {}"),
            EmbeddingRequest::new("int bar;").with_kind("field"),
        ];

        let batch = provider.encode_batch(&requests).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], provider.encode_single("class Foo {}", "class").await.unwrap());
        assert_eq!(batch[1], provider.encode_single("int bar;", "field").await.unwrap());
    }

    #[tokio::test]
    async fn test_openai_single() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "model": "text-embedding-3-small" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3], "index": 0 }],
                "model": "text-embedding-3-small",
                "usage": { "prompt_tokens": 4, "total_tokens": 4 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = openai_provider(&server, &EmbedderConfig::new("text-embedding-3-small"));
        let embedding = provider.encode_single("int x = 1;", "field").await.unwrap();
        assert_eq!(embedding.as_slice(), &[0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_openai_batch_reorders_by_index_and_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({ "input": ["a", "b"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "embedding": [2.0], "index": 1 },
                    { "embedding": [1.0], "index": 0 }
                ],
                "model": "m"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({ "input": ["c"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [3.0], "index": 0 }],
                "model": "m"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = EmbedderConfig::new("m").with_batch_size(2).with_dimensions(1);
        let provider = openai_provider(&server, &config);
        let requests: Vec<_> = ["a", "b", "c"].into_iter().map(EmbeddingRequest::new).collect();

        let embeddings = provider.encode_batch(&requests).await.unwrap();
        let firsts: Vec<f32> = embeddings.iter().map(|e| e[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_openai_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = openai_provider(&server, &EmbedderConfig::default());
        let err = provider.encode_single("x", "snippet").await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn test_openai_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let provider = openai_provider(&server, &EmbedderConfig::default());
        let err = provider.encode_single("x", "snippet").await.unwrap_err();
        match err {
            ProviderError::ApiRequest(message) => assert!(message.contains("model overloaded")),
            other => panic!("expected ApiRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_openai_without_key() {
        let provider = OpenAiProvider {
            api_key: None,
            ..OpenAiProvider::from_config(&EmbedderConfig::default())
        };
        assert!(!provider.is_available());

        let err = provider.encode_single("x", "snippet").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }

    #[tokio::test]
    async fn test_openai_rejects_overlong_input() {
        let server = MockServer::start().await;
        let config = EmbedderConfig::default().with_max_length(10);
        let provider = openai_provider(&server, &config);

        let err = provider
            .encode_single("this text is far too long", "snippet")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::TextTooLong {
                length: 25,
                max_length: 10
            }
        ));
    }
}
