//! RAG retrieval contract: documents, metadata filters, vector stores and
//! embedders.
//!
//! A [`VectorStore`] holds named collections of embedded documents and ranks
//! them by cosine distance. An [`Embedder`] turns text into vectors; stores
//! never call a model themselves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProviderError, StoreError};

/// A document to upsert into a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique within the collection; upserting the same id replaces.
    pub id: String,

    pub page_content: String,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Precomputed embedding; computed by the collection when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    pub fn new(id: impl Into<String>, page_content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            page_content: page_content.into(),
            metadata: Map::new(),
            embedding: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A query hit. Lower distance = more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub distance: f32,
}

/// Equality / set-membership filter over metadata keys.
///
/// Accepts the familiar `where` JSON shape:
/// `{"topic": "law"}`, `{"topic": {"$in": ["law", "cloud"]}}`; several keys
/// are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    Eq { key: String, value: Value },
    In { key: String, values: Vec<Value> },
    And(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn one_of(key: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            key: key.into(),
            values,
        }
    }

    /// Whether a document's metadata satisfies this filter.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            Self::Eq { key, value } => metadata.get(key) == Some(value),
            Self::In { key, values } => metadata.get(key).is_some_and(|v| values.contains(v)),
            Self::And(filters) => filters.iter().all(|f| f.matches(metadata)),
        }
    }

    /// Parse the `where` JSON shape.
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let Value::Object(map) = value else {
            return Err(StoreError::QueryFailed("where filter must be a JSON object".into()));
        };

        let mut filters = Vec::with_capacity(map.len());
        for (key, cond) in map {
            match cond {
                Value::Object(op) => {
                    if let Some(Value::Array(values)) = op.get("$in") {
                        filters.push(Self::one_of(key.clone(), values.clone()));
                    } else if let Some(v) = op.get("$eq") {
                        filters.push(Self::eq(key.clone(), v.clone()));
                    } else {
                        return Err(StoreError::QueryFailed(format!(
                            "unsupported operator for key '{key}'"
                        )));
                    }
                }
                scalar => filters.push(Self::eq(key.clone(), scalar.clone())),
            }
        }

        Ok(match filters.len() {
            1 => filters.remove(0),
            _ => Self::And(filters),
        })
    }
}

/// A stored record: document plus its (required) embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub embedding: Vec<f32>,
}

/// Vector storage with named collections.
///
/// Implementations: in-memory (tests, ephemeral) and SQLite (persistent).
/// Upserts and queries may interleave; readers see a consistent snapshot.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name (e.g. "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Insert or replace records by id.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError>;

    /// The `k` nearest records by cosine distance, ascending; ties by id.
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>, StoreError>;

    /// Number of records in the collection.
    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Remove records by id; returns how many were removed.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError>;

    /// Remove every record (and the fixed dimension) of the collection.
    async fn clear(&self, collection: &str) -> Result<(), StoreError>;

    /// Swap the collection's contents for `records` in one step. Readers see
    /// either the old contents or the new ones, never an empty collection in
    /// between. The dimension is re-fixed from `records`.
    async fn replace(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError>;
}

/// Turns text into embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (stored alongside collections for diagnostics).
    fn model(&self) -> &str;

    /// Embed each input; output order matches input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn eq_filter_matches() {
        let f = MetadataFilter::eq("topic", "law");
        assert!(f.matches(&meta(json!({"topic": "law"}))));
        assert!(!f.matches(&meta(json!({"topic": "maps"}))));
        assert!(!f.matches(&meta(json!({}))));
    }

    #[test]
    fn in_filter_matches() {
        let f = MetadataFilter::one_of("year", vec![json!(2023), json!(2024)]);
        assert!(f.matches(&meta(json!({"year": 2024}))));
        assert!(!f.matches(&meta(json!({"year": 2020}))));
    }

    #[test]
    fn parse_where_json() {
        let f = MetadataFilter::from_json(&json!({"topic": "law", "lang": {"$in": ["ja", "en"]}})).unwrap();
        assert!(f.matches(&meta(json!({"topic": "law", "lang": "ja"}))));
        assert!(!f.matches(&meta(json!({"topic": "law", "lang": "fr"}))));

        let single = MetadataFilter::from_json(&json!({"word": {"$eq": "佐川急便"}})).unwrap();
        assert_eq!(single, MetadataFilter::eq("word", "佐川急便"));
    }

    #[test]
    fn parse_rejects_unknown_operator() {
        assert!(MetadataFilter::from_json(&json!({"n": {"$gt": 3}})).is_err());
        assert!(MetadataFilter::from_json(&json!(["x"])).is_err());
    }

    #[test]
    fn document_builder() {
        let doc = Document::new("word_0", "佐川急便")
            .with_metadata("word", "佐川急便")
            .with_embedding(vec![1.0, 0.0]);
        assert_eq!(doc.metadata["word"], json!("佐川急便"));
        assert_eq!(doc.embedding.as_deref(), Some(&[1.0, 0.0][..]));
    }
}
