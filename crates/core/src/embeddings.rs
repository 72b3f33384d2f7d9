use providers::{EmbeddingProvider, ProviderError};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BATCH_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider returned {got} vectors for {expected} texts")]
    CountMismatch { expected: usize, got: usize },
    #[error("provider returned vectors of {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Embeds `texts` in batches of `batch_size`, preserving order.
///
/// Fails on the first provider error; no partial result is returned.
pub async fn embed_batched(
    texts: &[String],
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for (i, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        let resp = embedder.embed(batch).await?;
        if resp.vectors.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                got: resp.vectors.len(),
            });
        }
        debug!("embedded batch {} ({} texts)", i, batch.len());
        vectors.extend(resp.vectors);
    }
    if let Some(first) = vectors.first() {
        let dims = first.len();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims || v.is_empty()) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dims,
                got: bad.len(),
            });
        }
    }
    Ok(vectors)
}

pub async fn embed_query(
    question: &str,
    embedder: &dyn EmbeddingProvider,
) -> Result<Vec<f32>, EmbeddingError> {
    let resp = embedder.embed(&[question.to_string()]).await?;
    let got = resp.vectors.len();
    resp.vectors
        .into_iter()
        .next()
        .filter(|_| got == 1)
        .ok_or(EmbeddingError::CountMismatch { expected: 1, got })
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
