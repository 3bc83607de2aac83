//! A named collection: a vector store plus the embedder that feeds it.

use std::sync::Arc;

use rondo_core::error::StoreError;
use rondo_core::rag::{Document, Embedder, MetadataFilter, ScoredDocument, VectorRecord, VectorStore};
use tracing::debug;

/// Text-level access to one collection of a [`VectorStore`].
///
/// Documents without an embedding are embedded on upsert; queries embed the
/// query text with the same embedder.
#[derive(Clone)]
pub struct RagCollection {
    name: String,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl RagCollection {
    pub fn new(name: impl Into<String>, store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            name: name.into(),
            store,
            embedder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The same store and embedder under another collection name.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.store.clone(), self.embedder.clone())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        self.embedder
            .embed(texts)
            .await
            .map_err(|e| StoreError::EmbeddingFailed(e.to_string()))
    }

    /// Embed whatever documents lack a vector. Runs before any write.
    async fn to_records(&self, documents: Vec<Document>) -> Result<Vec<VectorRecord>, StoreError> {
        let missing: Vec<String> = documents
            .iter()
            .filter(|d| d.embedding.is_none())
            .map(|d| d.page_content.clone())
            .collect();

        let mut computed = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            let vectors = self.embed(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(StoreError::EmbeddingFailed(format!(
                    "embedder returned {} vectors for {} documents",
                    vectors.len(),
                    missing.len()
                )));
            }
            vectors.into_iter()
        };

        let mut records = Vec::with_capacity(documents.len());
        for doc in documents {
            let embedding = match doc.embedding {
                Some(e) => e,
                None => computed
                    .next()
                    .ok_or_else(|| StoreError::EmbeddingFailed("embedding missing".into()))?,
            };
            records.push(VectorRecord {
                id: doc.id,
                content: doc.page_content,
                metadata: doc.metadata,
                embedding,
            });
        }

        Ok(records)
    }

    /// Insert or replace documents by id.
    pub async fn upsert(&self, documents: Vec<Document>) -> Result<(), StoreError> {
        let records = self.to_records(documents).await?;
        debug!(collection = %self.name, count = records.len(), "Upserting documents");
        self.store.upsert(&self.name, records).await
    }

    /// Swap the whole collection for `documents`. Embeddings are computed
    /// first; queries keep seeing the previous contents until the swap.
    pub async fn replace(&self, documents: Vec<Document>) -> Result<(), StoreError> {
        let records = self.to_records(documents).await?;
        debug!(collection = %self.name, count = records.len(), "Replacing collection");
        self.store.replace(&self.name, records).await
    }

    /// The `k` documents nearest to `text`, distance ascending.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| StoreError::EmbeddingFailed("no embedding for query".into()))?;
        self.store.query(&self.name, &embedding, k, filter).await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count(&self.name).await
    }

    pub async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        self.store.delete(&self.name, ids).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryVectorStore;
    use async_trait::async_trait;
    use rondo_core::error::ProviderError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps known texts to fixed vectors; counts calls.
    struct TableEmbedder {
        table: HashMap<&'static str, Vec<f32>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for TableEmbedder {
        fn model(&self) -> &str {
            "table"
        }

        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            inputs
                .iter()
                .map(|t| {
                    self.table
                        .get(t.as_str())
                        .cloned()
                        .ok_or_else(|| ProviderError::Network(format!("no vector for {t}")))
                })
                .collect()
        }
    }

    fn collection() -> (RagCollection, Arc<TableEmbedder>) {
        let embedder = Arc::new(TableEmbedder {
            table: HashMap::from([
                ("cloud law", vec![1.0, 0.0]),
                ("maps", vec![0.0, 1.0]),
                ("law?", vec![0.9, 0.1]),
            ]),
            calls: AtomicUsize::new(0),
        });
        let c = RagCollection::new("knowledge", Arc::new(InMemoryVectorStore::new()), embedder.clone());
        (c, embedder)
    }

    #[tokio::test]
    async fn upsert_embeds_missing_and_query_ranks() {
        let (c, _) = collection();
        c.upsert(vec![
            Document::new("1", "cloud law"),
            Document::new("2", "maps"),
            Document::new("3", "precomputed").with_embedding(vec![0.7, 0.7]),
        ])
        .await
        .unwrap();
        assert_eq!(c.count().await.unwrap(), 3);

        let hits = c.query("law?", 3, None).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
    }

    #[tokio::test]
    async fn fully_embedded_upsert_skips_embedder() {
        let (c, embedder) = collection();
        c.upsert(vec![Document::new("x", "anything").with_embedding(vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn embedder_failure_is_embedding_error() {
        let (c, _) = collection();
        let err = c.upsert(vec![Document::new("1", "unknown text")]).await.unwrap_err();
        assert!(matches!(err, StoreError::EmbeddingFailed(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn sibling_shares_store() {
        let (c, _) = collection();
        let words = c.sibling("forbidden_words");
        words.upsert(vec![Document::new("word_0", "maps")]).await.unwrap();
        assert_eq!(words.count().await.unwrap(), 1);
        assert_eq!(c.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_embedding_leaves_collection_untouched() {
        let (c, _) = collection();
        c.upsert(vec![Document::new("1", "cloud law")]).await.unwrap();
        let err = c.replace(vec![Document::new("2", "unknown text")]).await.unwrap_err();
        assert!(matches!(err, StoreError::EmbeddingFailed(_)));

        let hits = c.query("law?", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "1");
    }
}
