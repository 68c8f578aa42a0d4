//! Integration tests for the semantic layer: generator determinism and the
//! relationship between the exact and approximate index strategies.

use crate::semantic::features::FeatureGenerator;
use crate::semantic::index::{ExactIndex, VectorIndex};
use crate::semantic::lsh::LshIndex;

fn sample_vectors(generator: &FeatureGenerator) -> Vec<(u64, Vec<f32>)> {
    let topics = [
        "rust ownership and borrowing",
        "tokio async runtime internals",
        "baking sourdough bread at home",
        "vegetable garden soil health",
    ];

    let mut out = Vec::new();
    let mut id = 1u64;
    for topic in topics {
        for n in 0..10 {
            let title = format!("{topic} part {n}");
            let body = format!("notes about {topic}, revision {n}");
            out.push((id, generator.generate(&title, &body, &[])));
            id += 1;
        }
    }
    out
}

#[test]
fn feature_generation_is_deterministic_across_instances() {
    let a = FeatureGenerator::default();
    let b = FeatureGenerator::default();

    let keywords = vec!["stable".to_string()];
    let va = a.generate("deterministic hashing", "same text in", &keywords);
    let vb = b.generate("deterministic hashing", "same text in", &keywords);
    assert_eq!(va, vb);
}

#[test]
fn approximate_hits_are_a_subset_of_exact_hits() {
    let generator = FeatureGenerator::default();
    let vectors = sample_vectors(&generator);

    let mut exact = ExactIndex::new();
    let mut approx = LshIndex::new(16);
    for (id, components) in &vectors {
        exact.add(*id, components.clone()).unwrap();
        approx.add(*id, components.clone()).unwrap();
    }

    for (id, components) in &vectors {
        let expected = exact.search(components, vectors.len(), 0.3).unwrap();
        let got = approx.search(components, 5, 0.3).unwrap();

        // a query always finds at least itself
        assert!(!got.is_empty(), "query {id} returned nothing");

        // every approximate hit is a real hit, scored with the true cosine
        for (hit, sim) in &got {
            let (_, expected_sim) = expected
                .iter()
                .find(|(exact_id, _)| exact_id == hit)
                .expect("approximate hit missing from exact scan");
            assert!((sim - expected_sim).abs() < 1e-6);
        }
    }
}

#[test]
fn sparse_buckets_degrade_to_the_exact_scan() {
    let generator = FeatureGenerator::default();
    let docs = ["alpha beta", "gamma delta", "epsilon zeta"];

    let mut exact = ExactIndex::new();
    let mut approx = LshIndex::new(16);
    for (n, doc) in docs.iter().enumerate() {
        let components = generator.generate(doc, "", &[]);
        exact.add(n as u64 + 1, components.clone()).unwrap();
        approx.add(n as u64 + 1, components).unwrap();
    }

    // fewer candidates than k forces the widening path
    let query = generator.generate("alpha beta", "", &[]);
    let wide = exact.search(&query, 10, 0.0).unwrap();
    let narrow = approx.search(&query, 10, 0.0).unwrap();

    assert_eq!(narrow[0].0, 1);
    assert_eq!(narrow.len(), wide.len());
    for (id, sim) in &narrow {
        let (_, expected_sim) = wide
            .iter()
            .find(|(wide_id, _)| wide_id == id)
            .expect("widened hit missing from exact scan");
        assert!((sim - expected_sim).abs() < 1e-6);
    }
}
