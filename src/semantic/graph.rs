//! Similarity graph over captured records.
//!
//! Edges are kept as a flat list of directed rows; every relation is stored
//! as a symmetric pair so neighbor lookups are a single scan over `from_id`.
//! Traversals build their adjacency map per call instead of maintaining one,
//! which keeps the edge list the only source of truth.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::semantic::index::{IndexError, VectorIndex};
use crate::storage::{StorageManager, StoreError};

pub const DEFAULT_MAX_EDGES_PER_NODE: usize = 10;
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.6;

const EDGES_FILE: &str = "edges.json";
const CLUSTERS_FILE: &str = "clusters.json";

/// A directed similarity edge. Relations always exist as two rows, one per
/// direction, with the same strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Eid,
    pub from_id: u64,
    pub to_id: u64,
    pub strength: f32,
}

/// A connected component of the graph, named by descending size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Eid,
    pub name: String,
    pub member_ids: Vec<u64>,
}

pub struct SemanticGraph {
    edges: Vec<Edge>,
    max_edges_per_node: usize,
    min_similarity: f32,
}

impl SemanticGraph {
    pub fn new(max_edges_per_node: usize, min_similarity: f32) -> Self {
        Self {
            edges: Vec::new(),
            max_edges_per_node,
            min_similarity,
        }
    }

    pub fn load(
        storage: &dyn StorageManager,
        max_edges_per_node: usize,
        min_similarity: f32,
    ) -> Result<Self, StoreError> {
        let mut graph = Self::new(max_edges_per_node, min_similarity);

        if storage.exists(EDGES_FILE) {
            let raw = storage.read(EDGES_FILE)?;
            graph.edges =
                serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
                    name: EDGES_FILE.to_string(),
                    reason: err.to_string(),
                })?;
        }

        Ok(graph)
    }

    pub fn save(&self, storage: &dyn StorageManager) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(&self.edges).map_err(|err| StoreError::Corrupt {
            name: EDGES_FILE.to_string(),
            reason: err.to_string(),
        })?;
        storage.write(EDGES_FILE, &raw)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Link a record to its nearest stored neighbors.
    ///
    /// The index may already contain the record's own vector; it is excluded
    /// from the result. Existing edges incident to the record are replaced.
    /// Returns the newly created rows.
    pub fn add_node(
        &mut self,
        record_id: u64,
        components: &[f32],
        index: &dyn VectorIndex,
    ) -> Result<Vec<Edge>, IndexError> {
        self.detach(record_id);

        let hits = index.search(components, self.max_edges_per_node + 1, self.min_similarity)?;

        let mut created = Vec::new();
        for (neighbor_id, strength) in hits
            .into_iter()
            .filter(|(id, _)| *id != record_id)
            .take(self.max_edges_per_node)
        {
            created.push(Edge {
                id: Eid::new(),
                from_id: record_id,
                to_id: neighbor_id,
                strength,
            });
            created.push(Edge {
                id: Eid::new(),
                from_id: neighbor_id,
                to_id: record_id,
                strength,
            });
        }

        self.edges.extend(created.iter().cloned());
        Ok(created)
    }

    /// Strongest-first neighbors of a record.
    pub fn neighbors(&self, record_id: u64, k: usize) -> Vec<Edge> {
        let mut out: Vec<Edge> = self
            .edges
            .iter()
            .filter(|edge| edge.from_id == record_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(k);
        out
    }

    /// Shortest chain of record ids between two records, bounded by hop
    /// count. A record trivially reaches itself.
    pub fn find_path(&self, from_id: u64, to_id: u64, max_depth: usize) -> Option<Vec<u64>> {
        if from_id == to_id {
            return Some(vec![from_id]);
        }

        let adjacency = self.adjacency();

        let mut visited: HashSet<u64> = HashSet::from([from_id]);
        let mut parents: HashMap<u64, u64> = HashMap::new();
        let mut queue: VecDeque<(u64, usize)> = VecDeque::from([(from_id, 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(next) = adjacency.get(&current) else {
                continue;
            };
            for &neighbor in next {
                if !visited.insert(neighbor) {
                    continue;
                }
                parents.insert(neighbor, current);
                if neighbor == to_id {
                    return Some(Self::backtrack(&parents, from_id, to_id));
                }
                queue.push_back((neighbor, depth + 1));
            }
        }

        None
    }

    /// Number of connected components among records with at least one edge.
    pub fn cluster_count(&self) -> usize {
        self.components().len()
    }

    /// Materialize components as named clusters, largest first.
    pub fn rebuild_clusters(&self) -> Vec<Cluster> {
        let mut components = self.components();
        components.sort_by(|a, b| b.len().cmp(&a.len()));

        components
            .into_iter()
            .enumerate()
            .map(|(i, mut member_ids)| {
                member_ids.sort_unstable();
                Cluster {
                    id: Eid::new(),
                    name: format!("cluster-{}", i + 1),
                    member_ids,
                }
            })
            .collect()
    }

    /// Drop every edge incident to a record. Returns the number of rows
    /// removed.
    pub fn detach(&mut self, record_id: u64) -> usize {
        let before = self.edges.len();
        self.edges
            .retain(|edge| edge.from_id != record_id && edge.to_id != record_id);
        before - self.edges.len()
    }

    fn adjacency(&self) -> HashMap<u64, Vec<u64>> {
        let mut adjacency: HashMap<u64, Vec<u64>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from_id).or_default().push(edge.to_id);
        }
        adjacency
    }

    fn components(&self) -> Vec<Vec<u64>> {
        let adjacency = self.adjacency();
        let mut nodes: Vec<u64> = adjacency.keys().copied().collect();
        nodes.sort_unstable();

        let mut seen: HashSet<u64> = HashSet::new();
        let mut components = Vec::new();

        for node in nodes {
            if seen.contains(&node) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([node]);
            seen.insert(node);
            while let Some(current) = queue.pop_front() {
                component.push(current);
                if let Some(next) = adjacency.get(&current) {
                    for &neighbor in next {
                        if seen.insert(neighbor) {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
            components.push(component);
        }

        components
    }

    fn backtrack(parents: &HashMap<u64, u64>, from_id: u64, to_id: u64) -> Vec<u64> {
        let mut path = vec![to_id];
        let mut current = to_id;
        while current != from_id {
            current = parents[&current];
            path.push(current);
        }
        path.reverse();
        path
    }
}

pub fn load_clusters(storage: &dyn StorageManager) -> Result<Vec<Cluster>, StoreError> {
    if !storage.exists(CLUSTERS_FILE) {
        return Ok(vec![]);
    }
    let raw = storage.read(CLUSTERS_FILE)?;
    serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
        name: CLUSTERS_FILE.to_string(),
        reason: err.to_string(),
    })
}

pub fn save_clusters(
    storage: &dyn StorageManager,
    clusters: &[Cluster],
) -> Result<(), StoreError> {
    let raw = serde_json::to_vec_pretty(clusters).map_err(|err| StoreError::Corrupt {
        name: CLUSTERS_FILE.to_string(),
        reason: err.to_string(),
    })?;
    storage.write(CLUSTERS_FILE, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::ExactIndex;
    use crate::storage::BackendLocal;

    fn unit(x: f32, y: f32, z: f32) -> Vec<f32> {
        let norm = (x * x + y * y + z * z).sqrt();
        vec![x / norm, y / norm, z / norm]
    }

    fn linked_pair(graph: &SemanticGraph, a: u64, b: u64) -> bool {
        graph.edges().iter().any(|e| e.from_id == a && e.to_id == b)
            && graph.edges().iter().any(|e| e.from_id == b && e.to_id == a)
    }

    fn link(graph: &mut SemanticGraph, a: u64, b: u64) {
        for (from_id, to_id) in [(a, b), (b, a)] {
            graph.edges.push(Edge {
                id: Eid::new(),
                from_id,
                to_id,
                strength: 0.9,
            });
        }
    }

    #[test]
    fn add_node_links_symmetric_pairs_above_threshold() {
        let mut index = ExactIndex::new();
        index.add(1, unit(1.0, 0.0, 0.0)).unwrap();
        index.add(2, unit(0.8, 0.6, 0.0)).unwrap();
        index.add(3, unit(0.0, 0.0, 1.0)).unwrap();

        let mut graph = SemanticGraph::new(10, 0.6);
        let created = graph.add_node(1, &unit(1.0, 0.0, 0.0), &index).unwrap();

        // cos(1, 2) = 0.8, cos(1, 3) = 0.0
        assert_eq!(created.len(), 2);
        assert!(linked_pair(&graph, 1, 2));
        assert!(!linked_pair(&graph, 1, 3));
        assert!((created[0].strength - 0.8).abs() < 1e-5);
    }

    #[test]
    fn add_node_caps_edges_per_node() {
        let mut index = ExactIndex::new();
        index.add(1, unit(1.0, 0.0, 0.0)).unwrap();
        index.add(2, unit(0.9, 0.1, 0.0)).unwrap();
        index.add(3, unit(0.9, 0.0, 0.1)).unwrap();
        index.add(4, unit(0.8, 0.1, 0.1)).unwrap();

        let mut graph = SemanticGraph::new(2, 0.6);
        graph.add_node(1, &unit(1.0, 0.0, 0.0), &index).unwrap();

        let neighbors = graph.neighbors(1, 10);
        assert_eq!(neighbors.len(), 2);
        // strongest first
        assert!(neighbors[0].strength >= neighbors[1].strength);
    }

    #[test]
    fn add_node_replaces_stale_edges() {
        let mut index = ExactIndex::new();
        index.add(1, unit(1.0, 0.0, 0.0)).unwrap();
        index.add(2, unit(0.9, 0.1, 0.0)).unwrap();

        let mut graph = SemanticGraph::new(10, 0.6);
        graph.add_node(1, &unit(1.0, 0.0, 0.0), &index).unwrap();
        graph.add_node(1, &unit(1.0, 0.0, 0.0), &index).unwrap();

        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn find_path_respects_depth_bound() {
        let mut graph = SemanticGraph::new(10, 0.6);
        link(&mut graph, 1, 2);
        link(&mut graph, 2, 3);
        link(&mut graph, 3, 4);

        assert_eq!(graph.find_path(1, 3, 5), Some(vec![1, 2, 3]));
        assert_eq!(graph.find_path(1, 4, 2), None);
        assert_eq!(graph.find_path(1, 4, 3), Some(vec![1, 2, 3, 4]));
        assert_eq!(graph.find_path(1, 1, 0), Some(vec![1]));
        assert_eq!(graph.find_path(1, 99, 5), None);
    }

    #[test]
    fn cluster_count_tracks_components() {
        let mut graph = SemanticGraph::new(10, 0.6);

        link(&mut graph, 1, 2);
        link(&mut graph, 3, 4);
        assert_eq!(graph.cluster_count(), 2);

        link(&mut graph, 2, 3);
        assert_eq!(graph.cluster_count(), 1);
    }

    #[test]
    fn rebuild_clusters_names_by_size() {
        let mut graph = SemanticGraph::new(10, 0.6);

        link(&mut graph, 10, 11);
        link(&mut graph, 1, 2);
        link(&mut graph, 2, 3);

        let clusters = graph.rebuild_clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "cluster-1");
        assert_eq!(clusters[0].member_ids, vec![1, 2, 3]);
        assert_eq!(clusters[1].member_ids, vec![10, 11]);
    }

    #[test]
    fn detach_removes_both_directions() {
        let mut index = ExactIndex::new();
        index.add(1, unit(1.0, 0.0, 0.0)).unwrap();
        index.add(2, unit(0.9, 0.1, 0.0)).unwrap();

        let mut graph = SemanticGraph::new(10, 0.6);
        graph.add_node(1, &unit(1.0, 0.0, 0.0), &index).unwrap();
        assert_eq!(graph.edge_count(), 2);

        assert_eq!(graph.detach(2), 2);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.neighbors(1, 10).is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(dir.path().to_str().unwrap()).unwrap();

        let mut graph = SemanticGraph::new(10, 0.6);
        graph.edges.push(Edge {
            id: Eid::new(),
            from_id: 1,
            to_id: 2,
            strength: 0.75,
        });
        graph.save(&storage).unwrap();

        let loaded = SemanticGraph::load(&storage, 10, 0.6).unwrap();
        assert_eq!(loaded.edges(), graph.edges());

        // empty dataset loads an empty graph
        let other = tempfile::tempdir().unwrap();
        let empty_storage = BackendLocal::new(other.path().to_str().unwrap()).unwrap();
        let empty = SemanticGraph::load(&empty_storage, 10, 0.6).unwrap();
        assert_eq!(empty.edge_count(), 0);
    }

    #[test]
    fn clusters_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(dir.path().to_str().unwrap()).unwrap();

        assert!(load_clusters(&storage).unwrap().is_empty());

        let clusters = vec![Cluster {
            id: Eid::new(),
            name: "cluster-1".to_string(),
            member_ids: vec![1, 2, 3],
        }];
        save_clusters(&storage, &clusters).unwrap();
        assert_eq!(load_clusters(&storage).unwrap(), clusters);
    }
}
