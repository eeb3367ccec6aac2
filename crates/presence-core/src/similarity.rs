//! Cosine similarity between descriptor vectors.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Compute cosine similarity `dot(a, b) / (|a| * |b|)`.
///
/// Returns a value in [-1, 1]. If either vector has zero norm the result is
/// 0.0. Self-similarity comes out as exactly 1.0. Scores are reported as
/// f32, the precision thresholds are configured in.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f32, DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    // zero, NaN or infinite
    if !denom.is_normal() {
        return Ok(0.0);
    }

    Ok((dot / denom).clamp(-1.0, 1.0) as f32)
}
