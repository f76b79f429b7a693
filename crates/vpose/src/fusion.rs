use crate::candidate::{Candidate, CandidateList, CandidateLists, SortKey};
use crate::descriptor::{DescriptorSet, ListType};

/// Merges the enabled per-descriptor lists into one composite ranking.
///
/// Each exemplar scores `Σ weight(t) × normalized_distance(t)` over the
/// enabled descriptor types. An exemplar missing from the list of `t`
/// scores `weight(t)` for it, the worst normalized distance. Weights are
/// rescaled to sum to one over the enabled types.
#[derive(Debug, Clone, Copy)]
pub struct CompositeFusion {
    enabled: DescriptorSet,
    weights: [f32; 4],
}

impl CompositeFusion {
    /// `weights` are indexed like [`ListType::DESCRIPTORS`].
    pub fn new(enabled: DescriptorSet, weights: [f32; 4]) -> Self {
        let total: f32 = ListType::DESCRIPTORS
            .iter()
            .filter(|t| enabled.contains(**t))
            .map(|t| weights[t.index()].max(0.0))
            .sum();

        let mut normalized = [0.0; 4];
        for t in ListType::DESCRIPTORS.iter().filter(|t| enabled.contains(**t)) {
            normalized[t.index()] = if total > 0.0 {
                weights[t.index()].max(0.0) / total
            } else {
                1.0 / enabled.len() as f32
            };
        }

        Self {
            enabled,
            weights: normalized,
        }
    }

    /// Effective weight of a descriptor type, zero when disabled.
    pub fn weight(&self, kind: ListType) -> f32 {
        if kind.is_descriptor() {
            self.weights[kind.index()]
        } else {
            0.0
        }
    }

    /// Build the composite list. Ties keep first-insertion order.
    pub fn fuse(&self, lists: &CandidateLists) -> CandidateList {
        let order = ListType::DESCRIPTORS
            .into_iter()
            .filter(|t| self.enabled.contains(*t))
            .collect::<Vec<_>>();

        // working copies, entries are erased as soon as they are merged
        let mut pending = order
            .iter()
            .map(|t| lists.get(*t).clone())
            .collect::<Vec<_>>();

        let mut fused = Vec::new();
        for (i, &kind) in order.iter().enumerate() {
            // exemplars left here were absent from every earlier list
            let missed_before: f32 = order[..i].iter().map(|t| self.weight(*t)).sum();
            let (head, later) = pending.split_at_mut(i + 1);

            for c in head[i].iter() {
                let mut score = missed_before + self.weight(kind) * c.normalized_distance();
                let mut sources = DescriptorSet::single(kind);
                for (list, &other) in later.iter_mut().zip(&order[i + 1..]) {
                    match list.find_and_erase(c.name()) {
                        Some(d) => {
                            score += self.weight(other) * d;
                            sources.insert(other);
                        }
                        None => score += self.weight(other),
                    }
                }
                fused.push(Candidate::new(
                    c.name(),
                    c.index(),
                    c.cloud().cloned(),
                    score,
                    sources,
                ));
            }
        }

        let mut composite = CandidateList::from_candidates(ListType::Composite, fused);
        composite.sort_by(SortKey::Distance);
        composite.rerank();

        log::debug!(
            "Fused {} lists into {} composite candidates",
            order.len(),
            composite.len()
        );
        composite
    }
}
