use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{sort_neighbors, DescriptorMetric, FeatureMatrix, IndexParams, Neighbor};

const LEAF_MAX_SIZE: usize = 4;
const SAMPLE_MEAN: usize = 100;
const RAND_DIM: usize = 5;
const FOREST_SEED: u64 = 0x5eed_f0e5;

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        start: u32,
        end: u32,
    },
    Split {
        dim: u32,
        value: f32,
        left: u32,
        right: u32,
    },
}

#[derive(Debug, Clone)]
struct KdTree {
    nodes: Vec<Node>,
    indices: Vec<u32>,
}

/// Randomized kd-tree forest over the rows of a [`FeatureMatrix`].
///
/// Each tree splits on a dimension drawn at random among the ones with the
/// highest variance, so the trees partition the space differently and a
/// shared priority queue over all of them finds good neighbours after few
/// leaf checks.
#[derive(Debug, Clone)]
pub struct KdForest<M: DescriptorMetric> {
    matrix: FeatureMatrix,
    trees: Vec<KdTree>,
    params: IndexParams,
    _metric: PhantomData<M>,
}

impl<M: DescriptorMetric> KdForest<M> {
    /// Build the forest. The trees are seeded deterministically.
    pub fn build(matrix: FeatureMatrix, params: IndexParams) -> Self {
        let num_trees = params.trees.max(1);
        let trees = (0..num_trees)
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(FOREST_SEED + t as u64);
                build_tree(&matrix, &mut rng)
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Built {} kd-trees over {} rows of {} columns",
            trees.len(),
            matrix.rows(),
            matrix.cols()
        );

        Self {
            matrix,
            trees,
            params,
            _metric: PhantomData,
        }
    }

    /// The indexed descriptors.
    pub fn matrix(&self) -> &FeatureMatrix {
        &self.matrix
    }

    /// Build and search parameters.
    pub fn params(&self) -> IndexParams {
        self.params
    }

    /// Approximate k nearest rows, sorted by distance then row index.
    ///
    /// The search keeps exploring branches until `k` hits are collected, then
    /// stops after `checks` leaf points. With `checks >= rows` the result is exact.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let rows = self.matrix.rows();
        let k = k.min(rows);
        if k == 0 {
            return Vec::new();
        }

        let mut results = ResultSet::new(k);
        let mut visited = vec![false; rows];
        let mut heap = BinaryHeap::new();
        let mut checks = 0usize;

        // the first descent of every tree is unconditional
        for tree in 0..self.trees.len() {
            let root = Branch {
                bound: 0.0,
                tree,
                node: 0,
            };
            self.descend(root, query, &mut heap, &mut results, &mut visited, &mut checks);
        }

        while let Some(branch) = heap.pop() {
            if results.is_full() && (checks >= self.params.checks || branch.bound > results.worst())
            {
                break;
            }
            self.descend(branch, query, &mut heap, &mut results, &mut visited, &mut checks);
        }

        results.into_sorted()
    }

    fn descend(
        &self,
        branch: Branch,
        query: &[f32],
        heap: &mut BinaryHeap<Branch>,
        results: &mut ResultSet,
        visited: &mut [bool],
        checks: &mut usize,
    ) {
        let tree = &self.trees[branch.tree];
        let mut node = branch.node;
        loop {
            match tree.nodes[node] {
                Node::Leaf { start, end } => {
                    for &idx in &tree.indices[start as usize..end as usize] {
                        let idx = idx as usize;
                        if visited[idx] {
                            continue;
                        }
                        visited[idx] = true;
                        *checks += 1;
                        results.insert(idx, M::distance(query, self.matrix.row(idx)));
                    }
                    return;
                }
                Node::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let q = query[dim as usize];
                    let (near, far) = if q < value { (left, right) } else { (right, left) };
                    let bound = branch.bound.max(M::axis_distance(q, value));
                    if !results.is_full() || bound <= results.worst() {
                        heap.push(Branch {
                            bound,
                            tree: branch.tree,
                            node: far as usize,
                        });
                    }
                    node = near as usize;
                }
            }
        }
    }
}

fn build_tree(matrix: &FeatureMatrix, rng: &mut StdRng) -> KdTree {
    let mut indices = (0..matrix.rows() as u32).collect::<Vec<_>>();
    let mut nodes = Vec::new();
    divide(matrix, &mut indices, 0, &mut nodes, rng);
    KdTree { nodes, indices }
}

/// Recursively split `indices` (located at `offset` in the tree's index
/// array) and return the id of the created node.
fn divide(
    matrix: &FeatureMatrix,
    indices: &mut [u32],
    offset: usize,
    nodes: &mut Vec<Node>,
    rng: &mut StdRng,
) -> u32 {
    let id = nodes.len() as u32;
    let leaf = Node::Leaf {
        start: offset as u32,
        end: (offset + indices.len()) as u32,
    };

    if indices.len() <= LEAF_MAX_SIZE {
        nodes.push(leaf);
        return id;
    }

    let Some((dim, mean)) = choose_split(matrix, indices, rng) else {
        // all sampled points are identical
        nodes.push(leaf);
        return id;
    };

    let mut split = partition(matrix, indices, dim, mean);
    let mut value = mean;
    if split == 0 || split == indices.len() {
        indices.sort_by(|a, b| {
            matrix.row(*a as usize)[dim].total_cmp(&matrix.row(*b as usize)[dim])
        });
        split = indices.len() / 2;
        value = matrix.row(indices[split] as usize)[dim];
    }

    // reserve the slot, children are pushed after it
    nodes.push(leaf);
    let (lo, hi) = indices.split_at_mut(split);
    let left = divide(matrix, lo, offset, nodes, rng);
    let right = divide(matrix, hi, offset + split, nodes, rng);
    nodes[id as usize] = Node::Split {
        dim: dim as u32,
        value,
        left,
        right,
    };
    id
}

fn choose_split(matrix: &FeatureMatrix, indices: &[u32], rng: &mut StdRng) -> Option<(usize, f32)> {
    let cols = matrix.cols();
    let sample = &indices[..indices.len().min(SAMPLE_MEAN)];
    let n = sample.len() as f64;

    let mut mean = vec![0.0f64; cols];
    for &i in sample {
        for (m, v) in mean.iter_mut().zip(matrix.row(i as usize)) {
            *m += *v as f64;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut var = vec![0.0f64; cols];
    for &i in sample {
        for ((s, v), m) in var.iter_mut().zip(matrix.row(i as usize)).zip(&mean) {
            let d = *v as f64 - m;
            *s += d * d;
        }
    }

    let mut dims = (0..cols).filter(|d| var[*d] > 0.0).collect::<Vec<_>>();
    if dims.is_empty() {
        return None;
    }
    dims.sort_by(|a, b| var[*b].total_cmp(&var[*a]).then(a.cmp(b)));
    dims.truncate(RAND_DIM);

    let dim = dims[rng.random_range(0..dims.len())];
    Some((dim, mean[dim] as f32))
}

/// Move rows with `row[dim] < value` to the front and return their count.
fn partition(matrix: &FeatureMatrix, indices: &mut [u32], dim: usize, value: f32) -> usize {
    let mut split = 0;
    for i in 0..indices.len() {
        if matrix.row(indices[i] as usize)[dim] < value {
            indices.swap(i, split);
            split += 1;
        }
    }
    split
}

#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    // min-heap on the bound
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then(other.tree.cmp(&self.tree))
            .then(other.node.cmp(&self.node))
    }
}

/// Bounded set of the best hits seen so far, kept sorted.
struct ResultSet {
    capacity: usize,
    hits: Vec<Neighbor>,
}

impl ResultSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hits: Vec::with_capacity(capacity + 1),
        }
    }

    fn is_full(&self) -> bool {
        self.hits.len() >= self.capacity
    }

    fn worst(&self) -> f32 {
        self.hits.last().map_or(f32::INFINITY, |h| h.1)
    }

    fn insert(&mut self, idx: usize, dist: f32) {
        let pos = self
            .hits
            .partition_point(|h| h.1 < dist || (h.1 == dist && h.0 < idx));
        if pos >= self.capacity {
            return;
        }
        self.hits.insert(pos, (idx, dist));
        self.hits.truncate(self.capacity);
    }

    fn into_sorted(mut self) -> Vec<Neighbor> {
        sort_neighbors(&mut self.hits);
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{brute_force_knn, ChiSquare, L2};

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> FeatureMatrix {
        let mut m = FeatureMatrix::new(cols);
        for _ in 0..rows {
            let row = (0..cols).map(|_| rng.random::<f32>()).collect::<Vec<_>>();
            m.push_row(&row).unwrap();
        }
        m
    }

    #[test]
    fn test_knn_matches_brute_force_l2() {
        let mut rng = StdRng::seed_from_u64(3);
        let m = random_matrix(&mut rng, 60, 8);
        let params = IndexParams {
            trees: 4,
            checks: 60,
        };
        let forest = KdForest::<L2>::build(m.clone(), params);
        for _ in 0..10 {
            let q = (0..8).map(|_| rng.random::<f32>()).collect::<Vec<_>>();
            assert_eq!(forest.knn(&q, 5), brute_force_knn::<L2>(&m, &q, 5));
        }
    }

    #[test]
    fn test_knn_matches_brute_force_chi_square() {
        let mut rng = StdRng::seed_from_u64(11);
        let m = random_matrix(&mut rng, 40, 16);
        let params = IndexParams {
            trees: 2,
            checks: 40,
        };
        let forest = KdForest::<ChiSquare>::build(m.clone(), params);
        for _ in 0..10 {
            let q = (0..16).map(|_| rng.random::<f32>()).collect::<Vec<_>>();
            assert_eq!(forest.knn(&q, 3), brute_force_knn::<ChiSquare>(&m, &q, 3));
        }
    }

    #[test]
    fn test_knn_exact_row_is_first() {
        let mut rng = StdRng::seed_from_u64(5);
        let m = random_matrix(&mut rng, 200, 6);
        let forest = KdForest::<L2>::build(m.clone(), IndexParams::default());
        for i in [0, 17, 199] {
            let hits = forest.knn(m.row(i), 1);
            assert_eq!(hits, vec![(i, 0.0)]);
        }
    }

    #[test]
    fn test_knn_k_bounds() {
        let mut rng = StdRng::seed_from_u64(9);
        let m = random_matrix(&mut rng, 7, 3);
        let forest = KdForest::<L2>::build(m, IndexParams::default());
        assert!(forest.knn(&[0.5; 3], 0).is_empty());
        let all = forest.knn(&[0.5; 3], 100);
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_identical_points() {
        let m = FeatureMatrix::from_raw(2, vec![1.0; 40]).unwrap();
        let forest = KdForest::<L2>::build(m, IndexParams::default());
        let hits = forest.knn(&[1.0, 1.0], 3);
        assert_eq!(hits, vec![(0, 0.0), (1, 0.0), (2, 0.0)]);
    }
}
