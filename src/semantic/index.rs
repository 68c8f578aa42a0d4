//! Vector index contract and the exact brute-force strategy.
//!
//! Both strategies (exact here, hash-bucket in `lsh`) sit behind the
//! `VectorIndex` trait so the recall service and the graph builder are
//! indifferent to which one is active.

use std::collections::HashMap;

use crate::semantic::features::normalize;

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

/// Similarity search over unit vectors keyed by record id.
///
/// The first `add` establishes the dimension; every later vector and query
/// must agree with it. Results are `(id, similarity)` pairs sorted by
/// similarity descending and truncated to `k`; every entry is `>= threshold`.
pub trait VectorIndex: Send + Sync {
    /// Store a normalized copy. Re-adding an id overwrites.
    fn add(&mut self, id: u64, components: Vec<f32>) -> Result<(), IndexError>;

    fn search(&self, query: &[f32], k: usize, threshold: f32)
        -> Result<Vec<(u64, f32)>, IndexError>;

    fn remove(&mut self, id: u64) -> bool;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Established dimension, `None` until the first `add`.
    fn dimensions(&self) -> Option<usize>;

    fn contains(&self, id: u64) -> bool;
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors, 0.0 when either norm vanishes.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

/// Exhaustive scan strategy. O(n·D) per query; the correctness baseline.
#[derive(Debug, Default)]
pub struct ExactIndex {
    entries: HashMap<u64, Vec<f32>>,
    dimensions: Option<usize>,
}

impl ExactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_dimensions(&self, got: usize) -> Result<(), IndexError> {
        match self.dimensions {
            Some(expected) if expected != got => {
                Err(IndexError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }
}

impl VectorIndex for ExactIndex {
    fn add(&mut self, id: u64, mut components: Vec<f32>) -> Result<(), IndexError> {
        self.check_dimensions(components.len())?;

        if l2_norm(&components) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        normalize(&mut components);
        self.dimensions.get_or_insert(components.len());
        self.entries.insert(id, components);

        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(u64, f32)>, IndexError> {
        self.check_dimensions(query.len())?;

        if self.entries.is_empty() {
            return Ok(vec![]);
        }

        if l2_norm(query) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<(u64, f32)> = self
            .entries
            .iter()
            .filter_map(|(id, components)| {
                let similarity = cosine_similarity(query, components);
                if similarity >= threshold {
                    Some((*id, similarity))
                } else {
                    None
                }
            })
            .collect();

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);

        Ok(results)
    }

    fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.dimensions = None;
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_add_establishes_dimension() {
        let mut index = ExactIndex::new();
        assert_eq!(index.dimensions(), None);

        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.dimensions(), Some(3));
    }

    #[test]
    fn add_dimension_mismatch() {
        let mut index = ExactIndex::new();
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();

        let result = index.add(2, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch { expected: 3, got: 4 })
        ));

        // the failed call did not poison the index
        assert_eq!(index.len(), 1);
        assert!(index.contains(1));
    }

    #[test]
    fn search_dimension_mismatch() {
        let mut index = ExactIndex::new();
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();

        let result = index.search(&[1.0, 0.0], 10, 0.0);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn zero_norm_vector_rejected() {
        let mut index = ExactIndex::new();
        let result = index.add(1, vec![0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn add_stores_normalized_copy() {
        let mut index = ExactIndex::new();
        index.add(1, vec![3.0, 4.0, 0.0]).unwrap();

        let results = index.search(&[3.0, 4.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn readd_overwrites() {
        let mut index = ExactIndex::new();
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.add(1, vec![0.0, 1.0, 0.0]).unwrap();

        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0, 0.0], 1, 0.9).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn search_sorted_descending_within_threshold() {
        let mut index = ExactIndex::new();
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.add(2, vec![0.9, 0.1, 0.0]).unwrap();
        index.add(3, vec![0.0, 1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 10, 0.5).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 2);
        assert!(results[0].1 >= results[1].1);
        assert!(results.iter().all(|(_, s)| *s >= 0.5));
    }

    #[test]
    fn search_respects_limit() {
        let mut index = ExactIndex::new();
        for i in 0..10u64 {
            index.add(i, vec![1.0, i as f32 * 0.01, 0.0]).unwrap();
        }

        let results = index.search(&[1.0, 0.0, 0.0], 3, 0.0).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn remove_and_clear() {
        let mut index = ExactIndex::new();
        index.add(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0, 0.0]).unwrap();

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert_eq!(index.len(), 1);

        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.dimensions(), None);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = ExactIndex::new();
        let results = index.search(&[1.0, 0.0, 0.0], 10, 0.0).unwrap();
        assert!(results.is_empty());
    }
}
