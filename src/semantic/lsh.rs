//! Approximate strategy: random-hyperplane locality-sensitive hashing.
//!
//! Each vector gets an H-bit signature (bit i = sign of the dot product with
//! hyperplane i) used as a bucket key. A search probes the query's bucket
//! plus every bucket at Hamming distance 1, so candidate generation touches
//! O(H) buckets instead of the whole index. When that yields fewer than k
//! candidates the search widens to a scan of all stored vectors, trading
//! the latency win back for recall. True cosine similarity is computed on
//! candidates only, then filtered, sorted and truncated exactly like the
//! exact strategy.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::semantic::features::normalize;
use crate::semantic::index::{cosine_similarity, l2_norm, IndexError, VectorIndex};

/// Default number of hyperplanes (signature bits).
pub const DEFAULT_PROJECTIONS: usize = 16;

/// Fixed seed keeps signatures stable across instance lifetimes, so buckets
/// rebuilt after a reload agree with the ones before it.
const HYPERPLANE_SEED: u64 = 0x1f3a_4c5b_9e2d_7081;

pub struct LshIndex {
    entries: HashMap<u64, Vec<f32>>,
    signatures: HashMap<u64, u32>,
    buckets: HashMap<u32, Vec<u64>>,
    hyperplanes: Vec<Vec<f32>>,
    projections: usize,
    dimensions: Option<usize>,
}

impl LshIndex {
    pub fn new(projections: usize) -> Self {
        Self {
            entries: HashMap::new(),
            signatures: HashMap::new(),
            buckets: HashMap::new(),
            hyperplanes: Vec::new(),
            projections: projections.clamp(1, 32),
            dimensions: None,
        }
    }

    fn check_dimensions(&self, got: usize) -> Result<(), IndexError> {
        match self.dimensions {
            Some(expected) if expected != got => {
                Err(IndexError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }

    /// Materialized on the first add, once the dimension is known.
    fn build_hyperplanes(&mut self, dimensions: usize) {
        let mut rng = StdRng::seed_from_u64(HYPERPLANE_SEED);
        self.hyperplanes = (0..self.projections)
            .map(|_| {
                (0..dimensions)
                    .map(|_| rng.random_range(-1.0f32..1.0f32))
                    .collect()
            })
            .collect();
    }

    fn signature(&self, components: &[f32]) -> u32 {
        let mut signature = 0u32;
        for (bit, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = components.iter().zip(plane.iter()).map(|(a, b)| a * b).sum();
            if dot > 0.0 {
                signature |= 1 << bit;
            }
        }
        signature
    }

    fn unlink(&mut self, id: u64) {
        if let Some(signature) = self.signatures.remove(&id) {
            if let Some(bucket) = self.buckets.get_mut(&signature) {
                bucket.retain(|entry| *entry != id);
                if bucket.is_empty() {
                    self.buckets.remove(&signature);
                }
            }
        }
    }

    fn candidates_for(&self, signature: u32) -> HashSet<u64> {
        let mut candidates: HashSet<u64> = HashSet::new();

        if let Some(bucket) = self.buckets.get(&signature) {
            candidates.extend(bucket.iter().copied());
        }
        for bit in 0..self.projections {
            if let Some(bucket) = self.buckets.get(&(signature ^ (1 << bit))) {
                candidates.extend(bucket.iter().copied());
            }
        }

        candidates
    }
}

impl VectorIndex for LshIndex {
    fn add(&mut self, id: u64, mut components: Vec<f32>) -> Result<(), IndexError> {
        self.check_dimensions(components.len())?;

        if l2_norm(&components) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        normalize(&mut components);

        if self.dimensions.is_none() {
            self.dimensions = Some(components.len());
            self.build_hyperplanes(components.len());
        }

        self.unlink(id);

        let signature = self.signature(&components);
        self.signatures.insert(id, signature);
        self.buckets.entry(signature).or_default().push(id);
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

        let signature = self.signature(query);
        let mut candidates = self.candidates_for(signature);

        if candidates.len() < k {
            log::debug!(
                "lsh bucket probe found {} candidates for k={k}, widening to full scan",
                candidates.len()
            );
            candidates = self.entries.keys().copied().collect();
        }

        let mut results: Vec<(u64, f32)> = candidates
            .into_iter()
            .filter_map(|id| {
                let components = self.entries.get(&id)?;
                let similarity = cosine_similarity(query, components);
                if similarity >= threshold {
                    Some((id, similarity))
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
        self.unlink(id);
        self.entries.remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.signatures.clear();
        self.buckets.clear();
        self.hyperplanes.clear();
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
