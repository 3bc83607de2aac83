//! In-memory vector store, for tests and ephemeral sessions.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use rondo_core::error::StoreError;
use rondo_core::rag::{MetadataFilter, ScoredDocument, VectorRecord, VectorStore};
use tokio::sync::RwLock;

use crate::vector;

#[derive(Default)]
struct Collection {
    dimension: Option<usize>,
    records: BTreeMap<String, VectorRecord>,
}

/// Collections held in a map behind one `RwLock`; a query sees a consistent
/// snapshot of its collection.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Check every record against the collection's fixed dimension (or the first
/// record's, for an empty collection).
pub(crate) fn check_dimension(
    collection: &str,
    fixed: Option<usize>,
    records: &[VectorRecord],
) -> Result<Option<usize>, StoreError> {
    let mut expected = fixed;
    for r in records {
        match expected {
            Some(d) if d != r.embedding.len() => {
                return Err(StoreError::DimensionMismatch {
                    collection: collection.into(),
                    expected: d,
                    actual: r.embedding.len(),
                });
            }
            Some(_) => {}
            None => expected = Some(r.embedding.len()),
        }
    }
    Ok(expected)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();

        entry.dimension = check_dimension(collection, entry.dimension, &records)?;
        for r in records {
            entry.records.insert(r.id.clone(), r);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if let Some(d) = entry.dimension.filter(|d| *d != embedding.len()) {
            return Err(StoreError::DimensionMismatch {
                collection: collection.into(),
                expected: d,
                actual: embedding.len(),
            });
        }
        Ok(vector::rank(entry.records.values(), embedding, k, filter))
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, |c| c.records.len()))
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| entry.records.remove(*id).is_some()).count())
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn replace(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        let dimension = check_dimension(collection, None, &records)?;
        let replacement = Collection {
            dimension,
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        };

        let mut collections = self.collections.write().await;
        if replacement.records.is_empty() {
            collections.remove(collection);
        } else {
            collections.insert(collection.to_string(), replacement);
        }
        Ok(())
    }
}
