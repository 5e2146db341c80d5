//! Embedding vector helpers: sanitization, cosine distance, and the packed
//! little-endian `f32` layout used for the `embedding` column.

use crate::{Result, VaultError};

/// Largest cosine distance (opposite directions, or a degenerate zero vector).
pub const MAX_COSINE_DISTANCE: f32 = 2.0;

/// Normalize a raw model output into its canonical storage form.
///
/// Applied element-wise, in order: `-0.0` becomes `+0.0`, then `NaN` becomes
/// `0.0`. Other values, including infinities, pass through unchanged.
#[must_use]
pub fn sanitize(raw: &[f32]) -> Vec<f32> {
    raw.iter().copied().map(sanitize_value).collect()
}

#[inline]
fn sanitize_value(value: f32) -> f32 {
    // `-0.0 == 0.0`, so this also rewrites `+0.0` to itself.
    let value = if value == 0.0 { 0.0 } else { value };
    if value.is_nan() { 0.0 } else { value }
}

/// Cosine distance `1 - dot(a,b) / (|a||b|)`, clamped to `[0, 2]`.
///
/// A zero vector on either side (or mismatched lengths) yields
/// [`MAX_COSINE_DISTANCE`] instead of dividing by zero.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return MAX_COSINE_DISTANCE;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom <= f64::EPSILON {
        return MAX_COSINE_DISTANCE;
    }
    let distance = 1.0 - dot / denom;
    if distance.is_nan() {
        return MAX_COSINE_DISTANCE;
    }
    (distance as f32).clamp(0.0, MAX_COSINE_DISTANCE)
}

/// Pack a vector into little-endian `f32` bytes.
#[must_use]
pub fn pack(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian `f32` bytes. A length that is not a multiple of four
/// means a torn or foreign blob and is rejected.
pub fn unpack(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(VaultError::Storage {
            reason: format!("embedding blob has {} bytes, not a multiple of 4", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
