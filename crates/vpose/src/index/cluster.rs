use super::{sort_neighbors, ChiSquare, DescriptorMetric, FeatureMatrix, Neighbor};

/// Descriptor space where each exemplar owns any number of cluster rows.
///
/// `owners[row]` is the index of the exemplar the row belongs to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSpace {
    matrix: FeatureMatrix,
    owners: Vec<usize>,
}

impl ClusterSpace {
    /// Create a cluster space. Fails if `owners` is not parallel to the rows.
    pub fn new(matrix: FeatureMatrix, owners: Vec<usize>) -> Result<Self, String> {
        if owners.len() != matrix.rows() {
            return Err(format!(
                "{} cluster rows but {} owners",
                matrix.rows(),
                owners.len()
            ));
        }
        Ok(Self { matrix, owners })
    }

    /// The cluster descriptors.
    pub fn matrix(&self) -> &FeatureMatrix {
        &self.matrix
    }

    /// Owning exemplar of every row.
    pub fn owners(&self) -> &[usize] {
        &self.owners
    }

    /// Rows owned by exemplar `owner`.
    pub fn clusters_of(&self, owner: usize) -> impl Iterator<Item = usize> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter(move |(_, o)| **o == owner)
            .map(|(row, _)| row)
    }

    /// Closest `k` exemplars to any of the `queries`.
    ///
    /// Every query cluster is compared with every stored cluster, and an
    /// exemplar scores the minimum chi-square distance over all of its pairs.
    /// Each exemplar appears at most once.
    pub fn search(&self, queries: &[&[f32]], num_exemplars: usize, k: usize) -> Vec<Neighbor> {
        if k == 0 || queries.is_empty() {
            return Vec::new();
        }

        let mut best = vec![f32::INFINITY; num_exemplars];
        let mut seen = vec![false; num_exemplars];
        for (row, &owner) in self.matrix.iter_rows().zip(&self.owners) {
            for query in queries {
                let d = ChiSquare::distance(query, row);
                seen[owner] = true;
                if d < best[owner] {
                    best[owner] = d;
                }
            }
        }

        let mut hits = best
            .into_iter()
            .enumerate()
            .filter(|(i, _)| seen[*i])
            .collect::<Vec<_>>();
        sort_neighbors(&mut hits);
        hits.truncate(k);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ClusterSpace {
        // exemplar 0 owns rows 0 and 2, exemplar 1 owns row 1, exemplar 2 none
        let matrix = FeatureMatrix::from_raw(2, vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5]).unwrap();
        ClusterSpace::new(matrix, vec![0, 1, 0]).unwrap()
    }

    #[test]
    fn test_search_deduplicates_owners() {
        let q: &[f32] = &[0.5, 0.5];
        let hits = space().search(&[q], 3, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], (0, 0.0));
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn test_search_minimum_over_query_clusters() {
        let (a, b): (&[f32], &[f32]) = (&[1.0, 0.0], &[0.0, 1.0]);
        let hits = space().search(&[a, b], 3, 10);
        assert_eq!(hits, vec![(0, 0.0), (1, 0.0)]);
    }

    #[test]
    fn test_search_truncates() {
        let q: &[f32] = &[0.0, 1.0];
        assert_eq!(space().search(&[q], 3, 1), vec![(1, 0.0)]);
        assert!(space().search(&[q], 3, 0).is_empty());
        assert!(space().search(&[], 3, 4).is_empty());
    }

    #[test]
    fn test_owner_mismatch() {
        let matrix = FeatureMatrix::from_raw(2, vec![0.0; 4]).unwrap();
        assert!(ClusterSpace::new(matrix, vec![0]).is_err());
    }

    #[test]
    fn test_clusters_of() {
        assert_eq!(space().clusters_of(0).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(space().clusters_of(2).count(), 0);
    }
}
