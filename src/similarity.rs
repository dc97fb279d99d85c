//! Cosine similarity and brute-force top-k ranking over embeddings.
//!
//! Candidate sets are one owner's completed tasks, so a linear scan is
//! enough; there is no index structure here.

use crate::error::SimilarityError;

/// Cosine similarity remapped from `[-1, 1]` to `[0, 1]`, so that 1 is the
/// same direction and 0 the opposite. A zero-norm vector scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Err(SimilarityError::EmptyVector);
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let cosine = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    Ok(((cosine + 1.0) / 2.0) as f32)
}

/// Scores every candidate against `query` and returns the best `k`,
/// highest first. Equal scores keep candidate input order.
pub fn top_k_similar<I>(
    query: &[f32],
    candidates: I,
    k: usize,
) -> Result<Vec<(String, f32)>, SimilarityError>
where
    I: IntoIterator,
    I::Item: Candidate,
{
    let mut scored = Vec::new();
    for candidate in candidates {
        let score = cosine_similarity(query, candidate.vector())?;
        scored.push((candidate.into_id(), score));
    }

    // stable: ties stay in input order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    Ok(scored)
}

/// Something that can be ranked: an identifier plus its embedding.
pub trait Candidate {
    fn vector(&self) -> &[f32];
    fn into_id(self) -> String;
}

impl Candidate for (String, Vec<f32>) {
    fn vector(&self) -> &[f32] {
        &self.1
    }

    fn into_id(self) -> String {
        self.0
    }
}

impl<'a> Candidate for (&'a str, &'a [f32]) {
    fn vector(&self) -> &[f32] {
        self.1
    }

    fn into_id(self) -> String {
        self.0.to_string()
    }
}

/// Human-readable band for a similarity score.
pub fn interpret_score(score: f32) -> &'static str {
    if score >= 0.9 {
        "Nearly identical content"
    } else if score >= 0.75 {
        "Very similar content"
    } else if score >= 0.6 {
        "Similar content"
    } else if score >= 0.4 {
        "Somewhat similar content"
    } else {
        "Different content"
    }
}
