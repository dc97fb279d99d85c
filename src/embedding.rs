use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::EmbedError;
use crate::models::{truncate_chars, EMBEDDING_DIM};

/// Text in, fixed-length vector out. Implementations embed at most
/// `max_chars` characters of `text` and must return `EMBEDDING_DIM` values.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str, max_chars: usize) -> Result<Vec<f32>, EmbedError>;
}

/// Rejects vectors of the wrong length or with NaN/inf components. Those
/// cannot be stored as JSON numbers or compared.
pub fn check_embedding(embedding: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(EmbedError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: embedding.len(),
        });
    }
    if !embedding.iter().all(|x| x.is_finite()) {
        return Err(EmbedError::NonFinite);
    }
    Ok(embedding)
}

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// `timeout` bounds each request end to end; keep it below the job lease.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, EmbedError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(OllamaEmbedder {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str, max_chars: usize) -> Result<Vec<f32>, EmbedError> {
        let input = truncate_chars(text, max_chars);
        if input.trim().is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: &self.model,
            input,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status { status, body });
        }

        let embed_response: EmbedResponse = response.json().await?;

        let embedding = embed_response
            .embeddings
            .into_iter()
            .next()
            .ok_or(EmbedError::EmptyResponse)?;
        check_embedding(embedding)
    }
}

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Deterministic bag-of-words embedder: every lowercase token hashes to one
/// dimension with a sign taken from the hash. Lexical, not semantic, but it
/// needs no model and is used offline and in tests.
#[derive(Debug, Clone, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; EMBEDDING_DIM];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let index = (hash % EMBEDDING_DIM as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }

        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str, max_chars: usize) -> Result<Vec<f32>, EmbedError> {
        let input = truncate_chars(text, max_chars);
        if input.trim().is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        Ok(self.embed_sync(input))
    }
}
