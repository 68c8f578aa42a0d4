//! Deterministic text-to-vector feature generation.
//!
//! Feature-hashing scheme: word tokens from a weighted concatenation of
//! title, keywords and a bounded body prefix are hashed with several
//! independent seeds into vector positions, with log-frequency weights and
//! hash-derived signs. Character trigrams of the title add a small
//! contribution so near-duplicate titles land close together.
//!
//! The same inputs always produce bit-identical output: token accumulation
//! iterates in sorted order and all hashing is fixed-width wrapping u64
//! arithmetic, with the norm accumulated in f64.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashSet};

/// Default output dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Body text beyond this prefix does not contribute.
const BODY_PREFIX_CHARS: usize = 2048;

const TITLE_WEIGHT: usize = 3;
const KEYWORD_WEIGHT: usize = 2;
const BODY_WEIGHT: usize = 1;

/// Independent FNV-1a offset bases, one per projection of each token.
const HASH_SEEDS: [u64; 3] = [
    0xcbf2_9ce4_8422_2325,
    0x9e37_79b9_7f4a_7c15,
    0x517c_c1b7_2722_0a95,
];

const TRIGRAM_SEED: u64 = 0x2545_f491_4f6c_dd1d;
const TRIGRAM_WEIGHT: f32 = 0.5;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "are", "was", "were", "been", "being", "for", "with", "from",
        "and", "but", "not", "this", "that", "these", "those", "its", "has",
        "had", "have", "will", "would", "can", "could", "you", "your", "our",
    ]
    .into_iter()
    .collect()
});

/// Lowercase word tokens of length >= 3, stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.len() >= 3 && !STOP_WORDS.contains(s.as_str()))
        .collect()
}

fn fnv1a64(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn sign_of(hash: u64) -> f32 {
    if hash & (1 << 63) == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Normalize to unit L2 norm in place.
///
/// A zero (or non-finite) vector becomes the first basis vector so callers
/// never divide by zero downstream. Already-unit vectors are left untouched,
/// which makes the operation exactly idempotent.
pub fn normalize(components: &mut [f32]) {
    let norm = components
        .iter()
        .map(|c| f64::from(*c) * f64::from(*c))
        .sum::<f64>()
        .sqrt();

    if !norm.is_finite() || norm < f64::EPSILON {
        components.fill(0.0);
        if let Some(first) = components.first_mut() {
            *first = 1.0;
        }
        return;
    }

    if (norm - 1.0).abs() < 1e-7 {
        return;
    }

    for c in components.iter_mut() {
        *c = (f64::from(*c) / norm) as f32;
    }
}

/// Pure, deterministic feature generator. Needs no model files or network;
/// the only state is the configured dimensionality.
#[derive(Debug, Clone)]
pub struct FeatureGenerator {
    dimensions: usize,
}

impl FeatureGenerator {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Stable identifier of the hashing scheme, recorded next to persisted
    /// vectors so files from an incompatible scheme are rejected on load.
    pub fn model_tag(&self) -> String {
        format!("feature-hash-v1-{}", self.dimensions)
    }

    /// Produce the unit feature vector for one record's text.
    pub fn generate(&self, title: &str, body: &str, keywords: &[String]) -> Vec<f32> {
        // sorted map so float accumulation order is reproducible
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        for token in tokenize(title) {
            *counts.entry(token).or_insert(0) += TITLE_WEIGHT;
        }
        for keyword in keywords {
            for token in tokenize(keyword) {
                *counts.entry(token).or_insert(0) += KEYWORD_WEIGHT;
            }
        }
        let body_prefix: String = body.chars().take(BODY_PREFIX_CHARS).collect();
        for token in tokenize(&body_prefix) {
            *counts.entry(token).or_insert(0) += BODY_WEIGHT;
        }

        let mut components = vec![0.0f32; self.dimensions];

        for (token, count) in &counts {
            let weight = 1.0 + (*count as f32).ln();
            for seed in HASH_SEEDS {
                let hash = fnv1a64(token.as_bytes(), seed);
                let position = (hash % self.dimensions as u64) as usize;
                components[position] += sign_of(hash) * weight;
            }
        }

        for trigram in title_trigrams(title) {
            let hash = fnv1a64(trigram.as_bytes(), TRIGRAM_SEED);
            let position = (hash % self.dimensions as u64) as usize;
            components[position] += sign_of(hash) * TRIGRAM_WEIGHT;
        }

        normalize(&mut components);
        components
    }
}

impl Default for FeatureGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

/// Character trigrams over the lowercased alphanumeric characters of the
/// title.
fn title_trigrams(title: &str) -> Vec<String> {
    let chars: Vec<char> = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();

    chars.windows(3).map(|w| w.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn identical_inputs_are_bit_identical() {
        let gen = FeatureGenerator::default();
        let keywords = vec!["rust".to_string(), "testing".to_string()];

        let a = gen.generate("Fearless concurrency", "ownership and borrowing", &keywords);
        let b = gen.generate("Fearless concurrency", "ownership and borrowing", &keywords);

        assert_eq!(a, b);
    }

    #[test]
    fn output_is_unit_norm_and_finite() {
        let gen = FeatureGenerator::default();
        let v = gen.generate(
            "cats are great pets",
            "a very long essay about cats and their habits",
            &["cats".to_string(), "pets".to_string()],
        );

        assert_eq!(v.len(), DEFAULT_DIMENSIONS);
        assert!(v.iter().all(|c| c.is_finite()));

        let norm: f32 = v.iter().map(|c| c * c).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_input_yields_basis_vector() {
        let gen = FeatureGenerator::default();
        let v = gen.generate("", "", &[]);

        assert_eq!(v[0], 1.0);
        assert!(v[1..].iter().all(|c| *c == 0.0));
    }

    #[test]
    fn stopword_only_input_yields_basis_vector() {
        let gen = FeatureGenerator::default();
        let v = gen.generate("the and for", "", &[]);
        assert_eq!(v[0], 1.0);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut v = vec![3.0f32, -4.0, 0.5, 12.0];
        normalize(&mut v);
        let once = v.clone();
        normalize(&mut v);
        assert_eq!(once, v);
    }

    #[test]
    fn self_similarity_is_one() {
        let gen = FeatureGenerator::default();
        let v = gen.generate("semantic recall", "vectors everywhere", &[]);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn related_text_is_closer_than_unrelated() {
        let gen = FeatureGenerator::default();
        let cats = gen.generate(
            "cats are great pets",
            "most cats enjoy sunny windows",
            &["cats".to_string(), "pets".to_string()],
        );
        let more_cats = gen.generate(
            "why cats make great pets",
            "cats and their owners",
            &["cats".to_string()],
        );
        let compilers = gen.generate(
            "register allocation in compilers",
            "graph coloring on interference graphs",
            &["compilers".to_string()],
        );

        assert!(cosine(&cats, &more_cats) > cosine(&cats, &compilers));
    }

    #[test]
    fn near_duplicate_titles_are_close() {
        let gen = FeatureGenerator::default();
        let a = gen.generate("introducing the recall engine", "", &[]);
        let b = gen.generate("introducing the recall engines", "", &[]);
        let unrelated = gen.generate("quarterly budget review", "", &[]);

        assert!(cosine(&a, &b) > cosine(&a, &unrelated));
    }

    #[test]
    fn tokenize_drops_short_and_stop_words() {
        let tokens = tokenize("The cat is on a mat, obviously!");
        assert_eq!(tokens, vec!["cat", "mat", "obviously"]);
    }

    #[test]
    fn short_dimension_generator_stays_in_bounds() {
        let gen = FeatureGenerator::new(8);
        let v = gen.generate("tiny vectors for testing", "body text", &[]);
        assert_eq!(v.len(), 8);
        let norm: f32 = v.iter().map(|c| c * c).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
