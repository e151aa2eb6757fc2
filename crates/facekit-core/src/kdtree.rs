//! Incremental KD-tree over face embeddings.
//!
//! Nodes live in a flat, append-only arena owned by the tree. Children are
//! referenced by arena index; the parent index is bookkeeping only. The tree
//! is never rebalanced, so adversarial insertion order degrades search toward
//! a linear scan. Training batches are small and append-only per identity.

use crate::types::{squared_distance, IdentityId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Index of a node inside the tree's arena.
pub type NodeId = usize;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },
    #[error("embedding has no components")]
    EmptyVector,
    #[error("non-finite component at axis {axis}")]
    NonFinite { axis: usize },
}

/// One point of the partition tree plus the bounding box of its subtree.
#[derive(Debug, Clone)]
pub struct EmbeddingNode {
    position: Vec<f32>,
    identity: IdentityId,
    split_axis: usize,
    min_range: Vec<f32>,
    max_range: Vec<f32>,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

impl EmbeddingNode {
    fn new(position: Vec<f32>, identity: IdentityId, split_axis: usize, parent: Option<NodeId>) -> Self {
        Self {
            min_range: position.clone(),
            max_range: position.clone(),
            position,
            identity,
            split_axis,
            parent,
            left: None,
            right: None,
        }
    }

    pub fn position(&self) -> &[f32] {
        &self.position
    }

    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    pub fn split_axis(&self) -> usize {
        self.split_axis
    }

    /// Component-wise minimum over this node and all of its descendants.
    pub fn min_range(&self) -> &[f32] {
        &self.min_range
    }

    /// Component-wise maximum over this node and all of its descendants.
    pub fn max_range(&self) -> &[f32] {
        &self.max_range
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn left(&self) -> Option<NodeId> {
        self.left
    }

    pub fn right(&self) -> Option<NodeId> {
        self.right
    }

    /// Whether `point` lies inside this node's bounding box.
    pub fn box_contains(&self, point: &[f32]) -> bool {
        point
            .iter()
            .zip(self.min_range.iter().zip(&self.max_range))
            .all(|(&x, (&lo, &hi))| lo <= x && x <= hi)
    }

    /// Lower bound on the squared distance from `query` to any point of the
    /// subtree rooted here. Zero when the query is inside the box.
    ///
    /// Summed axis by axis in the same order as [`squared_distance`], so the
    /// bound never exceeds the distance to a contained point, rounding
    /// included.
    pub fn box_distance(&self, query: &[f32]) -> f32 {
        query
            .iter()
            .zip(self.min_range.iter().zip(&self.max_range))
            .map(|(&q, (&lo, &hi))| {
                let over = if q < lo {
                    lo - q
                } else if q > hi {
                    q - hi
                } else {
                    0.0
                };
                over * over
            })
            .sum()
    }

    fn widen(&mut self, point: &[f32]) {
        for ((lo, hi), &x) in self.min_range.iter_mut().zip(self.max_range.iter_mut()).zip(point) {
            if x < *lo {
                *lo = x;
            }
            if x > *hi {
                *hi = x;
            }
        }
    }
}

/// Squared distance used as an ordered map key.
///
/// Distances are non-negative, so `total_cmp` orders them numerically.
#[derive(Debug, Clone, Copy)]
struct DistanceKey(f32);

impl PartialEq for DistanceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DistanceKey {}

impl PartialOrd for DistanceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DistanceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Result of a range-limited k-NN query: identities grouped by squared
/// distance, nearest first.
#[derive(Debug, Clone, Default)]
pub struct Neighbors {
    buckets: BTreeMap<DistanceKey, Vec<IdentityId>>,
    count: usize,
    radius: f32,
}

impl Neighbors {
    fn with_radius(radius: f32) -> Self {
        Self {
            buckets: BTreeMap::new(),
            count: 0,
            radius,
        }
    }

    /// Total number of candidates across all distance buckets.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Search radius when the query finished. Never larger than the
    /// initial radius.
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// `(squared_distance, identity)` pairs, nearest first.
    pub fn iter(&self) -> impl Iterator<Item = (f32, IdentityId)> + '_ {
        self.buckets
            .iter()
            .flat_map(|(d, ids)| ids.iter().map(move |&id| (d.0, id)))
    }

    /// Distance buckets, nearest first. Tied identities share a bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (f32, &[IdentityId])> + '_ {
        self.buckets.iter().map(|(d, ids)| (d.0, ids.as_slice()))
    }

    pub fn nearest(&self) -> Option<(f32, IdentityId)> {
        self.iter().next()
    }

    pub fn farthest(&self) -> Option<f32> {
        self.buckets.last_key_value().map(|(d, _)| d.0)
    }

    fn push(&mut self, distance: f32, identity: IdentityId) {
        self.buckets.entry(DistanceKey(distance)).or_default().push(identity);
        self.count += 1;
    }

    fn evict_farthest(&mut self) {
        if let Some(mut entry) = self.buckets.last_entry() {
            entry.get_mut().pop();
            if entry.get().is_empty() {
                entry.remove();
            }
            self.count -= 1;
        }
    }
}

/// Unbalanced, append-only KD-tree keyed by embedding position.
#[derive(Debug, Clone, Default)]
pub struct SpacePartitionTree {
    nodes: Vec<EmbeddingNode>,
    dim: Option<usize>,
}

impl SpacePartitionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedding dimension, fixed by the first insert.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&EmbeddingNode> {
        self.nodes.first()
    }

    pub fn node(&self, id: NodeId) -> Option<&EmbeddingNode> {
        self.nodes.get(id)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[EmbeddingNode] {
        &self.nodes
    }

    /// Check that `point` can be inserted into or queried against this tree:
    /// non-empty, the tree's dimension, and finite in every component.
    pub fn check_point(&self, point: &[f32]) -> Result<(), IndexError> {
        if point.is_empty() {
            return Err(IndexError::EmptyVector);
        }
        if let Some(want) = self.dim {
            if want != point.len() {
                return Err(IndexError::DimensionMismatch {
                    got: point.len(),
                    want,
                });
            }
        }
        match point.iter().position(|v| !v.is_finite()) {
            Some(axis) => Err(IndexError::NonFinite { axis }),
            None => Ok(()),
        }
    }

    /// Insert a point, widening the bounding box of every node on the way
    /// down. Returns the arena index of the new node.
    pub fn insert(&mut self, position: &[f32], identity: IdentityId) -> Result<NodeId, IndexError> {
        self.check_point(position)?;
        let new_id = self.nodes.len();
        let dim = match self.dim {
            Some(dim) => dim,
            None => {
                self.dim = Some(position.len());
                self.nodes.push(EmbeddingNode::new(position.to_vec(), identity, 0, None));
                return Ok(new_id);
            }
        };

        let mut current = 0;
        loop {
            let node = &mut self.nodes[current];
            node.widen(position);
            let axis = node.split_axis;
            let slot = if position[axis] >= node.position[axis] {
                &mut node.right
            } else {
                &mut node.left
            };
            match *slot {
                Some(next) => current = next,
                None => {
                    *slot = Some(new_id);
                    self.nodes.push(EmbeddingNode::new(
                        position.to_vec(),
                        identity,
                        (axis + 1) % dim,
                        Some(current),
                    ));
                    return Ok(new_id);
                }
            }
        }
    }

    /// Best-first k-NN search bounded by `initial_radius` (squared distance).
    ///
    /// Once more than `k` candidates are held, the farthest one is evicted
    /// and the radius shrinks to the new farthest distance. A child subtree
    /// is visited only if the lower bound to its box is within the current
    /// radius; the nearer child goes first so the radius shrinks before the
    /// other one is considered.
    pub fn range_limited_knn(
        &self,
        query: &[f32],
        initial_radius: f32,
        k: usize,
    ) -> Result<Neighbors, IndexError> {
        let mut result = Neighbors::with_radius(initial_radius);
        if self.nodes.is_empty() {
            return Ok(result);
        }
        self.check_point(query)?;
        if k == 0 {
            return Ok(result);
        }

        let mut radius = initial_radius;
        // Explicit stack instead of recursion: a degenerate tree is as deep
        // as it is long. The near child is pushed last so it is popped
        // first, and its whole subtree drains before the far child is
        // re-checked against the radius.
        let mut stack: Vec<(NodeId, f32)> = vec![(0, 0.0)];
        while let Some((id, bound)) = stack.pop() {
            if bound > radius {
                continue;
            }
            let node = &self.nodes[id];

            let distance = squared_distance(query, &node.position);
            if distance <= radius {
                result.push(distance, node.identity);
                if result.len() > k {
                    result.evict_farthest();
                    if let Some(farthest) = result.farthest() {
                        radius = farthest;
                    }
                }
            }

            let left = node.left.map(|c| (c, self.nodes[c].box_distance(query)));
            let right = node.right.map(|c| (c, self.nodes[c].box_distance(query)));
            let (near, far) = match (left, right) {
                (Some(l), Some(r)) if r.1 < l.1 => (Some(r), Some(l)),
                (Some(l), Some(r)) => (Some(l), Some(r)),
                (Some(only), None) | (None, Some(only)) => (Some(only), None),
                (None, None) => (None, None),
            };
            if let Some(far) = far {
                if far.1 <= radius {
                    stack.push(far);
                }
            }
            if let Some(near) = near {
                if near.1 <= radius {
                    stack.push(near);
                }
            }
        }

        result.radius = radius;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(rng: &mut StdRng, n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-10.0f32..10.0)).collect())
            .collect()
    }

    fn build(points: &[Vec<f32>]) -> SpacePartitionTree {
        let mut tree = SpacePartitionTree::new();
        for (i, p) in points.iter().enumerate() {
            tree.insert(p, i as IdentityId).unwrap();
        }
        tree
    }

    /// Sorted distances of the `k` nearest points within `radius`.
    fn brute_force(points: &[Vec<f32>], query: &[f32], radius: f32, k: usize) -> Vec<f32> {
        let mut d: Vec<f32> = points
            .iter()
            .map(|p| squared_distance(query, p))
            .filter(|&d| d <= radius)
            .collect();
        d.sort_by(|a, b| a.total_cmp(b));
        d.truncate(k);
        d
    }

    #[test]
    fn test_empty_tree_query() {
        let tree = SpacePartitionTree::new();
        let result = tree.range_limited_knn(&[0.0, 0.0], f32::MAX, 5).unwrap();
        assert!(result.is_empty());
        assert!(tree.root().is_none());
    }

    #[test]
    fn test_single_point_large_radius() {
        let mut tree = SpacePartitionTree::new();
        tree.insert(&[1.0, 2.0, 3.0], 42).unwrap();
        let result = tree.range_limited_knn(&[100.0, -50.0, 7.0], f32::MAX, 3).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.nearest().map(|(_, id)| id), Some(42));
    }

    #[test]
    fn test_root_has_axis_zero() {
        let mut tree = SpacePartitionTree::new();
        tree.insert(&[5.0, 5.0], 1).unwrap();
        let root = tree.root().unwrap();
        assert_eq!(root.split_axis(), 0);
        assert!(root.parent().is_none());
        assert_eq!(tree.dim(), Some(2));
    }

    #[test]
    fn test_equal_component_goes_right() {
        let mut tree = SpacePartitionTree::new();
        tree.insert(&[1.0, 1.0], 1).unwrap();
        let id = tree.insert(&[1.0, 0.0], 2).unwrap();
        let root = tree.root().unwrap();
        assert_eq!(root.right(), Some(id));
        assert!(root.left().is_none());

        let smaller = tree.insert(&[0.5, 9.0], 3).unwrap();
        assert_eq!(tree.root().unwrap().left(), Some(smaller));
    }

    #[test]
    fn test_split_axis_alternates() {
        let mut rng = StdRng::seed_from_u64(7);
        let dim = 3;
        let tree = build(&random_points(&mut rng, 200, dim));
        for node in tree.nodes() {
            if let Some(parent) = node.parent() {
                let parent = tree.node(parent).unwrap();
                assert_eq!(node.split_axis(), (parent.split_axis() + 1) % dim);
            }
        }
    }

    #[test]
    fn test_ancestor_boxes_contain_descendants() {
        let mut rng = StdRng::seed_from_u64(11);
        let tree = build(&random_points(&mut rng, 150, 4));
        for node in tree.nodes() {
            assert!(node.box_contains(node.position()));
            let mut ancestor = node.parent();
            while let Some(id) = ancestor {
                let a = tree.node(id).unwrap();
                assert!(a.box_contains(node.position()));
                ancestor = a.parent();
            }
        }
    }

    #[test]
    fn test_box_distance_is_lower_bound() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = random_points(&mut rng, 100, 3);
        let tree = build(&points);
        let root = tree.root().unwrap();
        for _ in 0..50 {
            let q: Vec<f32> = (0..3).map(|_| rng.gen_range(-20.0f32..20.0)).collect();
            let bound = root.box_distance(&q);
            for p in &points {
                assert!(bound <= squared_distance(&q, p));
            }
        }
    }

    #[test]
    fn test_count_and_radius_bounds() {
        let mut rng = StdRng::seed_from_u64(21);
        let points = random_points(&mut rng, 300, 4);
        let tree = build(&points);
        for k in [1usize, 3, 10] {
            let q: Vec<f32> = (0..4).map(|_| rng.gen_range(-10.0f32..10.0)).collect();
            let result = tree.range_limited_knn(&q, 80.0, k).unwrap();
            assert!(result.len() <= k);
            assert!(result.radius() <= 80.0);
            for (d, _) in result.iter() {
                assert!(d <= result.radius());
            }
        }
    }

    #[test]
    fn test_matches_brute_force() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let dim = rng.gen_range(1..6);
            let n = rng.gen_range(1..250);
            let points = random_points(&mut rng, n, dim);
            let tree = build(&points);

            for _ in 0..10 {
                let q: Vec<f32> = (0..dim).map(|_| rng.gen_range(-12.0f32..12.0)).collect();
                let radius = rng.gen_range(0.0f32..200.0);
                let k = rng.gen_range(1..12);
                let got: Vec<f32> = tree
                    .range_limited_knn(&q, radius, k)
                    .unwrap()
                    .iter()
                    .map(|(d, _)| d)
                    .collect();
                assert_eq!(got, brute_force(&points, &q, radius, k), "seed {seed}");
            }
        }
    }

    #[test]
    fn test_identities_are_the_nearest() {
        let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0], vec![0.0, 2.0]];
        let tree = build(&points);
        let result = tree.range_limited_knn(&[0.1, 0.0], 100.0, 2).unwrap();
        let ids: Vec<IdentityId> = result.iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!((result.radius() - 0.81).abs() < 1e-5);
    }

    #[test]
    fn test_ties_keep_both_identities() {
        let mut tree = SpacePartitionTree::new();
        tree.insert(&[1.0, 1.0], 1).unwrap();
        tree.insert(&[1.0, 1.0], 2).unwrap();
        tree.insert(&[9.0, 9.0], 3).unwrap();
        let result = tree.range_limited_knn(&[0.0, 0.0], 50.0, 2).unwrap();
        let buckets: Vec<(f32, Vec<IdentityId>)> =
            result.buckets().map(|(d, ids)| (d, ids.to_vec())).collect();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].1.len(), 2);
        assert!(buckets[0].1.contains(&1) && buckets[0].1.contains(&2));
    }

    #[test]
    fn test_radius_excludes_far_points() {
        let tree = build(&[vec![0.0], vec![10.0]]);
        let result = tree.range_limited_knn(&[9.0], 4.0, 5).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.nearest(), Some((1.0, 1)));
    }

    #[test]
    fn test_zero_k_returns_empty() {
        let tree = build(&[vec![0.0, 0.0]]);
        assert!(tree.range_limited_knn(&[0.0, 0.0], 1.0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut tree = SpacePartitionTree::new();
        tree.insert(&[0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(
            tree.insert(&[0.0, 0.0], 2),
            Err(IndexError::DimensionMismatch { got: 2, want: 3 })
        );
        assert!(tree.range_limited_knn(&[0.0], 1.0, 1).is_err());
        assert_eq!(tree.insert(&[], 3), Err(IndexError::EmptyVector));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut tree = SpacePartitionTree::new();
        assert_eq!(
            tree.insert(&[f32::NAN, 0.0], 1),
            Err(IndexError::NonFinite { axis: 0 })
        );
        assert!(tree.is_empty());
        assert_eq!(tree.dim(), None);

        tree.insert(&[0.0, 0.0], 1).unwrap();
        assert_eq!(
            tree.insert(&[0.0, f32::INFINITY], 2),
            Err(IndexError::NonFinite { axis: 1 })
        );
        assert_eq!(tree.root().unwrap().max_range(), &[0.0, 0.0]);
        assert_eq!(
            tree.range_limited_knn(&[f32::NAN, 0.0], 1.0, 1).unwrap_err(),
            IndexError::NonFinite { axis: 0 }
        );
    }

    #[test]
    fn test_sorted_insertion_does_not_overflow() {
        let mut tree = SpacePartitionTree::new();
        for i in 0..5_000 {
            tree.insert(&[i as f32], i).unwrap();
        }
        let result = tree.range_limited_knn(&[4_999.0], 1.0, 1).unwrap();
        assert_eq!(result.nearest(), Some((0.0, 4_999)));
    }
}
