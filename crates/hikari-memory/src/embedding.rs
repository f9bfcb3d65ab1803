//! Hashed character-bigram fingerprints.
//!
//! Turns free text into a fixed-size, L2-normalised `f32` vector without any
//! model: the lower-cased text is cut into overlapping two-character windows,
//! each distinct bigram is hashed with a polynomial rolling hash
//! (`h = h * 31 + code`, wrapping at 32 bits) and its count is accumulated
//! into `vector[hash mod dimension]`.
//!
//! ```text
//! "Happy" -> ["ha", "ap", "pp", "py"] -> fold into D buckets -> normalise
//! ```
//!
//! Texts shorter than two characters have no bigrams and map to the zero
//! vector, which is never normalised.

use std::collections::HashMap;

/// Default fingerprint width.
pub const DEFAULT_DIMENSION: usize = 256;

/// Polynomial hash of a string, reduced to a non-negative integer.
pub fn bigram_hash(s: &str) -> u32 {
    let mut h: i32 = 0;
    for c in s.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    h.unsigned_abs()
}

/// Compute the fingerprint of `text` with `dimension` buckets.
///
/// Returns an empty vector when `dimension` is zero.
pub fn text_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    if dimension == 0 {
        return vector;
    }

    let chars: Vec<char> = text.to_lowercase().chars().collect();
    let mut counts: HashMap<String, u32> = HashMap::new();
    for pair in chars.windows(2) {
        let bigram: String = pair.iter().collect();
        *counts.entry(bigram).or_insert(0) += 1;
    }

    for (bigram, count) in &counts {
        let slot = bigram_hash(bigram) as usize % dimension;
        vector[slot] += *count as f32;
    }

    normalize(&mut vector);
    vector
}

/// Scale `vector` to unit length in place. A zero vector is left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` when either vector has zero norm or the lengths differ;
/// such pairs are treated as non-comparable rather than as an error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn magnitude(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn hash_matches_rolling_formula() {
        // 'a' = 97, 'b' = 98 -> 97 * 31 + 98
        assert_eq!(bigram_hash("ab"), 97 * 31 + 98);
        assert_eq!(bigram_hash(""), 0);
    }

    #[test]
    fn hash_stays_non_negative_on_overflow() {
        let long = "香菜".repeat(40);
        let _ = bigram_hash(&long);
        let expected = ('香' as i32).wrapping_mul(31).wrapping_add('菜' as i32);
        assert_eq!(bigram_hash("香菜"), expected.unsigned_abs());
    }

    #[test]
    fn embedding_has_requested_dimension_and_unit_norm() {
        let v = text_embedding("a red heart sticker", DEFAULT_DIMENSION);
        assert_eq!(v.len(), DEFAULT_DIMENSION);
        assert!((magnitude(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_and_single_char_text_is_zero_vector() {
        assert!(text_embedding("", 64).iter().all(|x| *x == 0.0));
        assert!(text_embedding("x", 64).iter().all(|x| *x == 0.0));
    }

    #[test]
    fn embedding_is_case_insensitive_and_deterministic() {
        let a = text_embedding("Happy Birthday", 128);
        let b = text_embedding("happy birthday", 128);
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn repeated_bigrams_accumulate() {
        // "aaa" has the bigram "aa" twice, so a single bucket is hot.
        let v = text_embedding("aaa", 16);
        let hot = bigram_hash("aa") as usize % 16;
        assert!((v[hot] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_dimension_yields_empty_vector() {
        assert!(text_embedding("anything", 0).is_empty());
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let base = text_embedding("smiling happily", 256);
        let near = text_embedding("smiling happy", 256);
        let far = text_embedding("thunderstorm at night", 256);
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![0.0f32, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_returns_zero() {
        let a = vec![0.0f32, 0.0];
        let b = vec![1.0f32, 2.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_length_mismatch_returns_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }
}
