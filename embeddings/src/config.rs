//! Configuration for embedding providers and the embedding cache.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{EmbeddingError, Result};

/// Construction parameters shared by every provider plus cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Model identifier (provider-specific).
    pub model_name: String,

    /// Where the model runs.
    pub device: Device,

    /// Character budget applied by [`preprocess`](crate::preprocess()).
    pub max_length: usize,

    /// Largest number of texts sent to the provider in one call.
    pub batch_size: usize,

    /// Requested output dimension (None = provider default).
    pub dimensions: Option<usize>,

    /// Cache settings.
    pub cache: CacheConfig,
}

impl EmbedderConfig {
    /// Create a configuration for the given model with default values.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set the preprocessing character budget.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EmbeddingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }

    /// Check the invariants every provider relies on.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbeddingError::Config("model_name must not be empty".into()));
        }
        if self.max_length == 0 {
            return Err(EmbeddingError::Config("max_length must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(EmbeddingError::Config("batch_size must be > 0".into()));
        }
        if self.dimensions == Some(0) {
            return Err(EmbeddingError::Config("dimensions must be > 0".into()));
        }
        if self.cache.capacity == Some(0) {
            return Err(EmbeddingError::Config("cache.capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model_name: "microsoft/codebert-base".to_string(),
            device: Device::Cpu,
            max_length: 2048,
            batch_size: 16,
            dimensions: None,
            cache: CacheConfig::default(),
        }
    }
}

/// Configuration for the embedding cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether to cache embeddings at all.
    pub enabled: bool,

    /// Maximum number of entries (None = unbounded).
    pub capacity: Option<usize>,

    /// Which entry to drop once `capacity` is reached.
    pub eviction: EvictionPolicy,
}

impl CacheConfig {
    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Bound the cache to `capacity` entries.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the eviction policy.
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: None,
            eviction: EvictionPolicy::Lru,
        }
    }
}

/// Eviction strategy for a bounded cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop the least recently used entry.
    #[default]
    Lru,
    /// Drop the oldest inserted entry; hits do not refresh it.
    Fifo,
}

/// Compute device for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    /// GPU with the given ordinal.
    Gpu(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::Cpu);
        }
        s.strip_prefix("gpu:")
            .and_then(|ordinal| ordinal.parse().ok())
            .map(Self::Gpu)
            .ok_or_else(|| {
                EmbeddingError::Config(format!("invalid device {s:?}, expected \"cpu\" or \"gpu:<n>\""))
            })
    }
}

impl TryFrom<String> for Device {
    type Error = EmbeddingError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}
