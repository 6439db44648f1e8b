//! Code embedding records and their map/JSON form.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Free-form metadata attached to a record.
pub type Metadata = BTreeMap<String, Value>;

/// Fields `from_map` refuses to default.
const REQUIRED_FIELDS: [&str; 4] = ["code_id", "code_text", "embedding", "code_type"];

/// An embedded code snippet together with where it came from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CodeEmbeddingRecord {
    /// Caller-assigned identifier, unique within a collection.
    pub code_id: String,

    /// Original, unprocessed text.
    pub code_text: String,

    pub embedding: Embedding,

    /// Code kind such as `method`, `class` or `field`.
    pub code_type: String,

    #[serde(default)]
    pub file_path: Option<String>,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default = "Utc::now", deserialize_with = "created_at_or_now")]
    pub created_at: DateTime<Utc>,
}

impl CodeEmbeddingRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        code_id: impl Into<String>,
        code_text: impl Into<String>,
        embedding: Embedding,
        code_type: impl Into<String>,
    ) -> Self {
        Self {
            code_id: code_id.into(),
            code_text: code_text.into(),
            embedding,
            code_type: code_type.into(),
            file_path: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the source file.
    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Fail unless the embedding has `dimension` components.
    pub fn ensure_dimension(&self, dimension: usize) -> Result<()> {
        self.embedding.ensure_dimension(dimension)
    }

    /// Fail with [`EmbeddingError::Schema`] if any embedding component is
    /// NaN or infinite. Such values have no JSON number form.
    pub fn ensure_finite(&self) -> Result<()> {
        if !self.embedding.is_finite() {
            return Err(EmbeddingError::Schema(format!(
                "embedding of `{}` has non-finite components",
                self.code_id
            )));
        }
        Ok(())
    }

    /// Convert to a JSON-compatible map.
    ///
    /// `file_path` is `null` when absent and `created_at` is an RFC 3339
    /// string in UTC. JSON has no NaN or infinity, so non-finite embedding
    /// components come out as `null` and the map will not load back; check
    /// [`Self::ensure_finite`] first, as [`Self::to_json`] does.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("code_id".into(), self.code_id.clone().into());
        map.insert("code_text".into(), self.code_text.clone().into());
        map.insert(
            "embedding".into(),
            self.embedding.iter().copied().map(Value::from).collect(),
        );
        map.insert("code_type".into(), self.code_type.clone().into());
        map.insert("file_path".into(), self.file_path.clone().into());
        map.insert(
            "metadata".into(),
            Value::Object(self.metadata.clone().into_iter().collect()),
        );
        map.insert(
            "created_at".into(),
            self.created_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                .into(),
        );
        map
    }

    /// Rebuild a record from [`Self::to_map`] output.
    ///
    /// Missing `file_path`, `metadata` or `created_at` fall back to none,
    /// empty and now. Anything else missing or malformed is a
    /// [`EmbeddingError::Schema`].
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        if let Some(field) = REQUIRED_FIELDS.iter().find(|f| !map.contains_key(**f)) {
            return Err(EmbeddingError::Schema(format!(
                "missing required field `{field}`"
            )));
        }

        Self::deserialize(Value::Object(map.clone()))
            .map_err(|e| EmbeddingError::Schema(e.to_string()))
    }

    /// Serialize to a JSON object string.
    pub fn to_json(&self) -> Result<String> {
        self.ensure_finite()?;
        Ok(serde_json::to_string(&self.to_map())?)
    }

    /// Parse a JSON object string.
    pub fn from_json(json: &str) -> Result<Self> {
        match serde_json::from_str(json)? {
            Value::Object(map) => Self::from_map(&map),
            other => Err(EmbeddingError::Schema(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

/// Accept RFC 3339 or a naive ISO-8601 timestamp (taken as UTC); `null`
/// means now.
fn created_at_or_now<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(Utc::now());
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid created_at {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> CodeEmbeddingRecord {
        let mut metadata = Metadata::new();
        metadata.insert("class".to_string(), json!("Calculator"));
        metadata.insert("lines".to_string(), json!(3));
        metadata.insert("deprecated".to_string(), json!(false));

        CodeEmbeddingRecord::new(
            "Calculator#add",
            "public int add(int a, int b) {\n    return a + b;\n}",
            Embedding::from(vec![0.1, -0.25, 3.5e-7, 1.0]),
            "method",
        )
        .with_file_path("src/main/java/Calculator.java")
        .with_metadata(metadata)
        .with_created_at(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap())
    }

    fn assert_same_record(actual: &CodeEmbeddingRecord, expected: &CodeEmbeddingRecord) {
        assert_eq!(actual.code_id, expected.code_id);
        assert_eq!(actual.code_text, expected.code_text);
        assert_eq!(actual.code_type, expected.code_type);
        assert_eq!(actual.file_path, expected.file_path);
        assert_eq!(actual.metadata, expected.metadata);
        assert_eq!(actual.created_at, expected.created_at);
        assert_eq!(actual.embedding.dimension(), expected.embedding.dimension());
        for (a, b) in actual.embedding.iter().zip(expected.embedding.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_to_map_shape() {
        let map = sample().to_map();
        let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "code_id",
                "code_text",
                "code_type",
                "created_at",
                "embedding",
                "file_path",
                "metadata"
            ]
        );
        assert_eq!(map["created_at"], json!("2024-03-01T09:30:00Z"));
        assert_eq!(map["embedding"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn test_map_round_trip() {
        let record = sample();
        let restored = CodeEmbeddingRecord::from_map(&record.to_map()).unwrap();
        assert_same_record(&restored, &record);
    }

    #[test]
    fn test_json_round_trip_preserves_sub_second_time() {
        let record = sample().with_created_at(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap() + Duration::nanoseconds(123_456_789),
        );
        let restored = CodeEmbeddingRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_same_record(&restored, &record);
    }

    #[test]
    fn test_absent_file_path_is_null() {
        let record = CodeEmbeddingRecord::new("id", "x", Embedding::zeros(2), "field");
        let map = record.to_map();
        assert_eq!(map["file_path"], Value::Null);

        let restored = CodeEmbeddingRecord::from_map(&map).unwrap();
        assert_eq!(restored.file_path, None);
        assert!(restored.metadata.is_empty());
    }

    #[test]
    fn test_missing_code_id_is_schema_error() {
        let mut map = sample().to_map();
        map.remove("code_id");

        match CodeEmbeddingRecord::from_map(&map) {
            Err(EmbeddingError::Schema(message)) => assert!(message.contains("code_id")),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_every_required_field_is_enforced() {
        for field in REQUIRED_FIELDS {
            let mut map = sample().to_map();
            map.remove(field);
            assert!(
                matches!(CodeEmbeddingRecord::from_map(&map), Err(EmbeddingError::Schema(_))),
                "{field} should be required"
            );
        }
    }

    #[test]
    fn test_non_numeric_embedding_is_schema_error() {
        let mut map = sample().to_map();
        map.insert("embedding".into(), json!(["a", "b"]));
        assert!(matches!(
            CodeEmbeddingRecord::from_map(&map),
            Err(EmbeddingError::Schema(_))
        ));

        map.insert("embedding".into(), json!("0.1,0.2"));
        assert!(matches!(
            CodeEmbeddingRecord::from_map(&map),
            Err(EmbeddingError::Schema(_))
        ));
    }

    #[test]
    fn test_optional_fields_default() {
        let before = Utc::now();
        let map = json!({
            "code_id": "Foo",
            "code_text": "class Foo {}",
            "embedding": [1.0, 0.0],
            "code_type": "class",
            "created_at": null
        });
        let Value::Object(map) = map else {
            panic!("object literal");
        };

        let record = CodeEmbeddingRecord::from_map(&map).unwrap();
        assert_eq!(record.file_path, None);
        assert!(record.metadata.is_empty());
        assert!(record.created_at >= before);
    }

    #[test]
    fn test_naive_timestamp_is_read_as_utc() {
        let mut map = sample().to_map();
        map.insert("created_at".into(), json!("2024-03-01T09:30:00.250000"));

        let record = CodeEmbeddingRecord::from_map(&map).unwrap();
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap() + Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_bad_timestamp_is_schema_error() {
        let mut map = sample().to_map();
        map.insert("created_at".into(), json!("yesterday"));
        assert!(matches!(
            CodeEmbeddingRecord::from_map(&map),
            Err(EmbeddingError::Schema(_))
        ));
    }

    #[test]
    fn test_non_finite_embedding_is_not_serialized() {
        let mut record = sample();
        record.embedding = Embedding::from(vec![0.1, f32::NAN, 0.3, 0.4]);

        assert!(matches!(record.to_json(), Err(EmbeddingError::Schema(_))));
        assert_eq!(record.to_map()["embedding"][1], Value::Null);
        assert!(sample().ensure_finite().is_ok());
    }

    #[test]
    fn test_nested_metadata_round_trips() {
        let mut metadata = Metadata::new();
        metadata.insert("annotations".to_string(), json!(["Override", "Deprecated"]));
        metadata.insert("span".to_string(), json!({ "start": 10, "end": 14 }));
        metadata.insert("owner".to_string(), Value::Null);
        let record = sample().with_metadata(metadata);

        let restored = CodeEmbeddingRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(restored.metadata, record.metadata);
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(matches!(
            CodeEmbeddingRecord::from_json("[1, 2]"),
            Err(EmbeddingError::Schema(_))
        ));
    }
}
