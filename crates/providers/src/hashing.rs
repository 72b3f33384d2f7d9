//! Offline embedding provider based on feature hashing.
//!
//! Every token is hashed with blake3 into one of `dimensions` buckets with a
//! +/-1 sign, and the resulting bag-of-words vector is L2-normalized. Vectors
//! are deterministic across runs and platforms, which makes the provider
//! usable without network access and as a stable embedder in tests.

use crate::{EmbedResponse, EmbeddingProvider, ProviderError};

pub const DEFAULT_DIMENSIONS: usize = 1024;

#[derive(Debug, Clone)]
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

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let digest = blake3::hash(token.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest.as_bytes()[..8]);
            let h = u64::from_le_bytes(bytes);
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut vector {
                *v *= inv;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

/// Lowercased word tokens. Dots, dashes and underscores stay inside a token
/// so that file names like `a.md` survive as one token.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-')))
        .map(|t| t.trim_matches(|c| matches!(c, '.' | '-' | '_')))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        Ok(EmbedResponse {
            vectors: texts.iter().map(|t| self.embed_one(t)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn tokenize_keeps_file_names() {
        let tokens: Vec<String> = tokenize("What does a.md contain?").collect();
        assert_eq!(tokens, vec!["what", "does", "a.md", "contain"]);
    }

    #[test]
    fn tokenize_trims_sentence_punctuation() {
        let tokens: Vec<String> = tokenize("Alpha. -- Beta_").collect();
        assert_eq!(tokens, vec!["alpha", "beta"]);
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(256);
        let a = embedder.embed_one("hello world");
        let b = embedder.embed_one("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm = dot(&a, &a).sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "got norm {norm}");
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_one("  ?! ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn shared_tokens_score_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_one("rust borrow checker");
        let related = embedder.embed_one("the borrow checker in rust");
        let unrelated = embedder.embed_one("gardening tips for spring");
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[tokio::test]
    async fn embed_batch_keeps_order() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["one".to_string(), "two".to_string()];
        let resp = embedder.embed(&texts).await.unwrap();
        assert_eq!(resp.vectors.len(), 2);
        assert_eq!(resp.vectors[0], embedder.embed_one("one"));
        assert_eq!(resp.vectors[1], embedder.embed_one("two"));
    }

    #[test]
    fn zero_dimensions_is_clamped() {
        assert_eq!(HashingEmbedder::new(0).dimensions(), 1);
    }
}
