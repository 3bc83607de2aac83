//! Vector math shared by the store backends.

use std::cmp::Ordering;

use rondo_core::rag::{Document, MetadataFilter, ScoredDocument, VectorRecord};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ or either vector is empty or all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// `1 - cosine_similarity`, in [0, 2]. Lower = more similar.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Filter, score, and keep the `k` nearest records: distance ascending, ties
/// broken by id ascending.
pub fn rank<'a>(
    records: impl IntoIterator<Item = &'a VectorRecord>,
    query: &[f32],
    k: usize,
    filter: Option<&MetadataFilter>,
) -> Vec<ScoredDocument> {
    let mut scored: Vec<(f32, &VectorRecord)> = records
        .into_iter()
        .filter(|r| filter.is_none_or(|f| f.matches(&r.metadata)))
        .map(|r| (cosine_distance(&r.embedding, query), r))
        .collect();

    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    scored.truncate(k);

    scored
        .into_iter()
        .map(|(distance, r)| ScoredDocument {
            document: Document {
                id: r.id.clone(),
                page_content: r.content.clone(),
                metadata: r.metadata.clone(),
                embedding: Some(r.embedding.clone()),
            },
            distance,
        })
        .collect()
}

/// Serialize an embedding vector to little-endian bytes.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`embedding_to_blob`]; trailing partial chunks are ignored.
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
