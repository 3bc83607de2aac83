//! Offline embedder: hashed character n-grams.
//!
//! Each lower-cased character unigram and bigram is hashed with SHA-256 into a
//! bucket and a sign; the resulting vector is L2-normalized. Deterministic
//! and dependency-free at runtime, so texts sharing many n-grams land close
//! together. Useful without network access and in tests.

use async_trait::async_trait;
use rondo_core::error::ProviderError;
use rondo_core::rag::Embedder;
use sha2::{Digest, Sha256};

pub const HASHING_MODEL: &str = "hashing";

pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed one text.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let chars: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let mut add = |feature: &str| {
            let digest = Sha256::digest(feature.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
            ]) as usize
                % self.dimensions;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        };

        for c in &chars {
            add(&c.to_string());
        }
        for pair in chars.windows(2) {
            let bigram: String = pair.iter().collect();
            add(&bigram);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        HASHING_MODEL
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_distance;

    #[test]
    fn deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_text("クラウド法");
        assert_eq!(a, e.embed_text("クラウド法"));
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_text_has_zero_distance() {
        let e = HashingEmbedder::default();
        let d = cosine_distance(&e.embed_text("佐川急便"), &e.embed_text("佐川急便"));
        assert!(d.abs() < 1e-5);
    }

    #[test]
    fn similar_text_is_closer_than_unrelated() {
        let e = HashingEmbedder::default();
        let base = e.embed_text("少子化対策と子育て支援");
        let near = e.embed_text("少子化と子育て");
        let far = e.embed_text("Google Maps directions");
        assert!(cosine_distance(&base, &near) < cosine_distance(&base, &far));
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        let e = HashingEmbedder::default();
        assert_eq!(e.embed_text("Cloud Act"), e.embed_text("cloudact"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8);
        assert!(e.embed_text("").iter().all(|x| *x == 0.0));
    }
}
