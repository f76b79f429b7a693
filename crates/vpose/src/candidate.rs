//! Candidates and their per-descriptor ranked lists.

use std::sync::Arc;

use vpose_3d::linalg::{Transform4, IDENTITY4};
use vpose_3d::pointcloud::PointCloud;

use crate::database::PoseDatabase;
use crate::descriptor::{DescriptorSet, Descriptors, ListType};
use crate::error::PoseResult;
use crate::index::Neighbor;

/// A database exemplar proposed as the pose of the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) cloud: Option<Arc<PointCloud>>,
    pub(crate) rank: usize,
    pub(crate) distance: f32,
    pub(crate) normalized_distance: f32,
    pub(crate) rmse: f64,
    pub(crate) transformation: Transform4,
    pub(crate) sources: DescriptorSet,
}

impl Candidate {
    /// Create an unrefined candidate.
    pub fn new(
        name: impl Into<String>,
        index: usize,
        cloud: Option<Arc<PointCloud>>,
        distance: f32,
        sources: DescriptorSet,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            cloud,
            rank: 0,
            distance,
            normalized_distance: 0.0,
            rmse: f64::INFINITY,
            transformation: IDENTITY4,
            sources,
        }
    }

    /// Exemplar name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the exemplar in the database.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared view of the exemplar cloud.
    pub fn cloud(&self) -> Option<&Arc<PointCloud>> {
        self.cloud.as_ref()
    }

    /// 1-based position in the list when the list was built.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Raw descriptor distance (fused score for composite candidates).
    pub fn distance(&self) -> f32 {
        self.distance
    }

    /// Distance rescaled to `[0, 1]` within the originating list.
    pub fn normalized_distance(&self) -> f32 {
        self.normalized_distance
    }

    /// Alignment error, `INFINITY` until the candidate is refined successfully.
    pub fn rmse(&self) -> f64 {
        self.rmse
    }

    /// Transformation bringing the exemplar onto the query, identity until refined.
    pub fn transformation(&self) -> &Transform4 {
        &self.transformation
    }

    /// Descriptor types whose lists contained this exemplar.
    pub fn sources(&self) -> DescriptorSet {
        self.sources
    }

    /// `true` once an alignment succeeded on this candidate.
    pub fn is_refined(&self) -> bool {
        self.rmse.is_finite()
    }

    pub(crate) fn reset_refinement(&mut self) {
        self.rmse = f64::INFINITY;
        self.transformation = IDENTITY4;
    }
}

/// Ordering criteria of [`CandidateList::sort_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Creation rank.
    Rank,
    /// Raw distance.
    Distance,
    /// Normalized distance.
    NormalizedDistance,
    /// Alignment error.
    Rmse,
}

/// Ordered candidates of one list type.
#[derive(Debug, Clone)]
pub struct CandidateList {
    kind: ListType,
    entries: Vec<Candidate>,
}

impl CandidateList {
    /// An empty list.
    pub fn new(kind: ListType) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    /// Wrap candidates already in list order, assigning ranks and normalized distances.
    pub fn from_candidates(kind: ListType, entries: Vec<Candidate>) -> Self {
        let mut list = Self { kind, entries };
        list.rerank();
        list
    }

    /// Search the database with the query descriptors of `kind` and keep the
    /// `k` closest exemplars.
    pub fn generate(
        kind: ListType,
        db: &PoseDatabase,
        query: &Descriptors,
        k: usize,
    ) -> PoseResult<Self> {
        let hits = db.query_descriptors(kind, query, k)?;
        Ok(Self::from_neighbors(kind, db, &hits))
    }

    pub(crate) fn from_neighbors(kind: ListType, db: &PoseDatabase, hits: &[Neighbor]) -> Self {
        let entries = hits
            .iter()
            .filter_map(|&(index, distance)| {
                let name = db.name(index)?;
                Some(Candidate::new(
                    name,
                    index,
                    db.cloud(index).cloned(),
                    distance,
                    DescriptorSet::single(kind),
                ))
            })
            .collect();
        Self::from_candidates(kind, entries)
    }

    /// Renumber ranks from the current order and recompute normalized distances.
    pub(crate) fn rerank(&mut self) {
        let (min, max) = self
            .entries
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), c| {
                (lo.min(c.distance), hi.max(c.distance))
            });
        let span = max - min;
        for (i, c) in self.entries.iter_mut().enumerate() {
            c.rank = i + 1;
            c.normalized_distance = if span > 0.0 && span.is_finite() {
                (c.distance - min) / span
            } else {
                0.0
            };
        }
    }

    /// List type tag.
    pub fn kind(&self) -> ListType {
        self.kind
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the list has no candidate.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidates in list order.
    pub fn as_slice(&self) -> &[Candidate] {
        &self.entries
    }

    /// Candidate at position `i`.
    pub fn get(&self, i: usize) -> Option<&Candidate> {
        self.entries.get(i)
    }

    /// Iterate over the candidates in list order.
    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.entries.iter()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [Candidate] {
        &mut self.entries
    }

    /// Stable in-place sort. Returns `false` on an empty list.
    pub fn sort_by(&mut self, key: SortKey) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        match key {
            SortKey::Rank => self.entries.sort_by_key(|c| c.rank),
            SortKey::Distance => self
                .entries
                .sort_by(|a, b| a.distance.total_cmp(&b.distance)),
            SortKey::NormalizedDistance => self
                .entries
                .sort_by(|a, b| a.normalized_distance.total_cmp(&b.normalized_distance)),
            SortKey::Rmse => self.entries.sort_by(|a, b| a.rmse.total_cmp(&b.rmse)),
        }
        true
    }

    /// Remove the first candidate called `name`, returning its normalized distance.
    pub fn find_and_erase(&mut self, name: &str) -> Option<f32> {
        let pos = self.entries.iter().position(|c| c.name == name)?;
        Some(self.entries.remove(pos).normalized_distance)
    }

    /// Forget every refinement result.
    pub fn reset_refinement(&mut self) {
        self.entries.iter_mut().for_each(Candidate::reset_refinement);
    }
}

impl<'a> IntoIterator for &'a CandidateList {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// One candidate list per [`ListType`].
#[derive(Debug, Clone)]
pub struct CandidateLists {
    lists: [CandidateList; 5],
}

impl Default for CandidateLists {
    fn default() -> Self {
        Self {
            lists: ListType::ALL.map(CandidateList::new),
        }
    }
}

impl CandidateLists {
    /// The list of the given type.
    pub fn get(&self, kind: ListType) -> &CandidateList {
        &self.lists[kind.index()]
    }

    /// Mutable access to the list of the given type.
    pub fn get_mut(&mut self, kind: ListType) -> &mut CandidateList {
        &mut self.lists[kind.index()]
    }

    /// Replace the list of the list's own type.
    pub fn set(&mut self, list: CandidateList) {
        let i = list.kind().index();
        self.lists[i] = list;
    }

    /// Empty every list.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::ramp_database;
    use crate::database::tests::ramp_descriptors;

    fn list(distances: &[f32]) -> CandidateList {
        let entries = distances
            .iter()
            .enumerate()
            .map(|(i, d)| Candidate::new(format!("c{i}"), i, None, *d, DescriptorSet::default()))
            .collect();
        CandidateList::from_candidates(ListType::Vfh, entries)
    }

    #[test]
    fn test_generate_ranks_and_normalization() -> PoseResult<()> {
        let db = ramp_database(&[0.1, 0.5, 0.3]);
        let query = ramp_descriptors(0.3);
        let list = CandidateList::generate(ListType::Vfh, &db, &query, 2)?;
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).map(|c| c.rank()), Some(1));
        assert_eq!(list.get(1).map(|c| c.rank()), Some(2));
        assert_eq!(list.get(0).map(|c| c.name()), Some("obj_0_20"));
        assert_eq!(list.get(0).map(|c| c.normalized_distance()), Some(0.0));
        assert_eq!(list.get(1).map(|c| c.normalized_distance()), Some(1.0));
        assert!(list.iter().all(|c| c.rmse().is_infinite()));
        Ok(())
    }

    #[test]
    fn test_single_entry_normalizes_to_zero() -> PoseResult<()> {
        let db = ramp_database(&[0.1, 0.5]);
        let list = CandidateList::generate(ListType::Esf, &db, &ramp_descriptors(0.4), 1)?;
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).map(|c| c.normalized_distance()), Some(0.0));
        Ok(())
    }

    #[test]
    fn test_sort_by_distance_keeps_entries() {
        let mut l = list(&[0.4, 0.1, 0.4, 0.2]);
        assert!(l.sort_by(SortKey::Distance));
        let names = l.iter().map(|c| c.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["c1", "c3", "c0", "c2"]);
        assert!(l.sort_by(SortKey::Rank));
        let names = l.iter().map(|c| c.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["c0", "c1", "c2", "c3"]);
    }

    #[test]
    fn test_sort_empty_list() {
        let mut l = CandidateList::new(ListType::Esf);
        assert!(!l.sort_by(SortKey::Rmse));
    }

    #[test]
    fn test_find_and_erase() {
        let mut l = list(&[0.0, 1.0, 3.0]);
        assert_eq!(l.find_and_erase("missing"), None);
        assert_eq!(l.len(), 3);
        let erased = l.find_and_erase("c1");
        assert!(erased.is_some_and(|d| (d - 1.0 / 3.0).abs() < 1e-6));
        assert_eq!(l.len(), 2);
        assert_eq!(l.find_and_erase("c1"), None);
    }

    #[test]
    fn test_candidate_lists_indexing() {
        let mut lists = CandidateLists::default();
        lists.set(list(&[1.0]));
        assert_eq!(lists.get(ListType::Vfh).len(), 1);
        assert!(lists.get(ListType::Composite).is_empty());
        assert_eq!(lists.get(ListType::OurCvfh).kind(), ListType::OurCvfh);
        lists.clear();
        assert!(lists.get(ListType::Vfh).is_empty());
    }
}
