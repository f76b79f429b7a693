//! Geometric verification of the best candidates.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use vpose_3d::linalg::{compose_transform, decompose_transform, mat33_mul, mat33_transpose, transform_point, Transform4};
use vpose_3d::pointcloud::PointCloud;
use vpose_icp::{icp_vanilla, IcpConvergenceCriteria};

use crate::candidate::{Candidate, CandidateList};
use crate::config::PoseConfig;
use crate::error::{PoseError, PoseResult};
use crate::exemplar::ExemplarName;

/// Error type returned by aligners.
pub type AlignmentError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a rigid alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Transformation bringing the source onto the target.
    pub transform: Transform4,
    /// Root mean square distance of the final correspondences.
    pub rmse: f64,
    /// Whether the aligner met its convergence criterion.
    pub converged: bool,
}

/// Rigid alignment primitive used to verify candidates.
pub trait Aligner: Send + Sync {
    /// Align `source` onto `target` starting from `seed`.
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        seed: &Transform4,
    ) -> Result<Alignment, AlignmentError>;
}

/// Point-to-point ICP aligner.
#[derive(Debug, Clone)]
pub struct IcpAligner {
    criteria: IcpConvergenceCriteria,
}

impl IcpAligner {
    /// Create an aligner with the given convergence criteria.
    pub fn new(criteria: IcpConvergenceCriteria) -> Self {
        Self { criteria }
    }

    /// Create an aligner from the ICP settings of a configuration.
    pub fn from_config(config: &PoseConfig) -> Self {
        Self::new(IcpConvergenceCriteria {
            max_iterations: config.icp_max_iterations,
            tolerance: config.icp_tolerance,
        })
    }
}

impl Default for IcpAligner {
    fn default() -> Self {
        Self::new(IcpConvergenceCriteria::default())
    }
}

impl Aligner for IcpAligner {
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        seed: &Transform4,
    ) -> Result<Alignment, AlignmentError> {
        let (rotation, translation) = decompose_transform(seed);
        let result = icp_vanilla(source, target, rotation, translation, &self.criteria)?;
        Ok(Alignment {
            transform: compose_transform(&result.rotation, &result.translation),
            rmse: result.rmse,
            converged: result.converged,
        })
    }
}

/// Initial guess of the transformation bringing an exemplar onto the query.
///
/// When both names carry a viewpoint the rotation is `R(query) · R(exemplar)ᵀ`,
/// otherwise identity. The translation moves the rotated exemplar centroid
/// onto the query centroid.
pub fn seed_transform(
    query_name: &str,
    query: &PointCloud,
    exemplar_name: &str,
    exemplar: &PointCloud,
) -> Transform4 {
    let rotation = match (
        query_name.parse::<ExemplarName>(),
        exemplar_name.parse::<ExemplarName>(),
    ) {
        (Ok(q), Ok(e)) => mat33_mul(&q.rotation(), &mat33_transpose(&e.rotation())),
        _ => [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    let query_centroid = query.centroid().unwrap_or([0.0; 3]);
    let rotated = transform_point(&exemplar.centroid().unwrap_or([0.0; 3]), &rotation, &[0.0; 3]);
    let translation = [
        query_centroid[0] - rotated[0],
        query_centroid[1] - rotated[1],
        query_centroid[2] - rotated[2],
    ];
    compose_transform(&rotation, &translation)
}

/// Progress of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinementState {
    /// No refinement attempted yet.
    Unrefined,
    /// Rounds are running.
    Refining,
    /// A winner was selected.
    Refined,
    /// Every attempted candidate failed.
    Failed,
}

/// Schedule of the progressive refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementPolicy {
    /// Candidates refined in the first round. The window doubles every round.
    pub initial_candidates: usize,
    /// Maximum number of rounds.
    pub max_rounds: usize,
    /// RMSE at or below which no further round is started.
    pub rmse_threshold: f64,
    /// RMSEs closer than this are broken by descriptor distance.
    pub tie_epsilon: f64,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self::from_config(&PoseConfig::default())
    }
}

impl RefinementPolicy {
    /// Read the refinement settings of a configuration.
    pub fn from_config(config: &PoseConfig) -> Self {
        Self {
            initial_candidates: config.refine_candidates,
            max_rounds: config.progressive_iterations,
            rmse_threshold: config.rmse_threshold,
            tie_epsilon: config.rmse_tie_epsilon,
        }
    }
}

/// Summary of a successful refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementOutcome {
    /// Position of the winner in the refined list.
    pub winner: usize,
    /// Number of candidates an alignment was attempted on.
    pub attempted: usize,
    /// Number of rounds run.
    pub rounds: usize,
}

/// Runs the aligner over a growing window of candidates and picks the best one.
pub struct RefinementEngine<'a> {
    aligner: &'a dyn Aligner,
    policy: RefinementPolicy,
    state: RefinementState,
}

impl<'a> RefinementEngine<'a> {
    /// Create an engine.
    pub fn new(aligner: &'a dyn Aligner, policy: RefinementPolicy) -> Self {
        Self {
            aligner,
            policy,
            state: RefinementState::Unrefined,
        }
    }

    /// Current state.
    pub fn state(&self) -> RefinementState {
        self.state
    }

    /// Refine `list` against the query cloud.
    ///
    /// Round `n` aligns the candidates not yet refined among the first
    /// `initial_candidates × 2ⁿ`. Rounds stop when a candidate reaches the
    /// RMSE threshold, when the list is exhausted or after `max_rounds`.
    /// Failed candidates keep an infinite RMSE and the identity transform.
    pub fn refine(
        &mut self,
        list: &mut CandidateList,
        query_name: &str,
        query: &PointCloud,
    ) -> PoseResult<RefinementOutcome> {
        list.reset_refinement();
        self.state = RefinementState::Unrefined;
        let len = list.len();
        if len == 0 || query.is_empty() {
            self.state = RefinementState::Failed;
            return Err(PoseError::RefinementFailed { attempted: 0 });
        }

        let max_rounds = self.policy.max_rounds.max(1);
        let mut window = self.policy.initial_candidates.clamp(1, len);
        let mut done = 0;
        let mut rounds = 0;
        self.state = RefinementState::Refining;

        loop {
            rounds += 1;
            let aligner = self.aligner;
            list.entries_mut()[done..window]
                .par_iter_mut()
                .for_each(|candidate| refine_one(aligner, candidate, query_name, query));
            done = window;

            let reached = list.as_slice()[..done]
                .iter()
                .any(|c| c.rmse() <= self.policy.rmse_threshold);
            log::debug!(
                "Refinement round {} aligned {} candidates, threshold reached: {}",
                rounds,
                done,
                reached
            );
            if reached || done == len || rounds >= max_rounds {
                break;
            }
            window = (window * 2).min(len);
        }

        match select_winner(&list.as_slice()[..done], self.policy.tie_epsilon) {
            Some(winner) => {
                self.state = RefinementState::Refined;
                Ok(RefinementOutcome {
                    winner,
                    attempted: done,
                    rounds,
                })
            }
            None => {
                self.state = RefinementState::Failed;
                Err(PoseError::RefinementFailed { attempted: done })
            }
        }
    }
}

fn refine_one(aligner: &dyn Aligner, candidate: &mut Candidate, query_name: &str, query: &PointCloud) {
    candidate.reset_refinement();
    let Some(cloud) = candidate.cloud().cloned() else {
        log::warn!("Candidate {} has no cloud, skipping refinement", candidate.name());
        return;
    };

    let seed = seed_transform(query_name, query, candidate.name(), &cloud);
    match aligner.align(&cloud, query, &seed) {
        Ok(alignment) if alignment.rmse.is_finite() => {
            if !alignment.converged {
                log::debug!("Alignment of {} did not converge", candidate.name());
            }
            candidate.rmse = alignment.rmse;
            candidate.transformation = alignment.transform;
        }
        Ok(_) => log::warn!("Alignment of {} produced a non finite error", candidate.name()),
        Err(e) => log::warn!("Alignment of {} failed: {}", candidate.name(), e),
    }
}

/// Minimum RMSE, ties within `epsilon` broken by distance then position.
fn select_winner(candidates: &[Candidate], epsilon: f64) -> Option<usize> {
    let best = candidates
        .iter()
        .map(Candidate::rmse)
        .filter(|r| r.is_finite())
        .min_by(|a, b| a.total_cmp(b))?;

    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.rmse().is_finite() && c.rmse() <= best + epsilon)
        .min_by(|(i, a), (j, b)| a.distance().total_cmp(&b.distance()).then(i.cmp(j)))
        .map(|(i, _)| i)
}

/// Final pose of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimation {
    /// Name of the query.
    pub query: String,
    /// Name of the winning exemplar.
    pub name: String,
    /// Alignment error of the winner.
    pub rmse: f64,
    /// Transformation bringing the winning exemplar onto the query.
    pub transformation: Transform4,
}

impl fmt::Display for Estimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Query {} estimated as {} (RMSE {:.6})", self.query, self.name, self.rmse)?;
        for row in &self.transformation {
            writeln!(f, "  {:>10.6} {:>10.6} {:>10.6} {:>10.6}", row[0], row[1], row[2], row[3])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorSet, ListType};
    use approx::assert_relative_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vpose_3d::linalg::IDENTITY4;

    /// Aligner returning a fixed RMSE per source cloud size.
    struct TableAligner {
        rmse_by_len: HashMap<usize, f64>,
        calls: AtomicUsize,
    }

    impl Aligner for TableAligner {
        fn align(
            &self,
            source: &PointCloud,
            _target: &PointCloud,
            seed: &Transform4,
        ) -> Result<Alignment, AlignmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rmse = *self.rmse_by_len.get(&source.len()).ok_or("no entry")?;
            Ok(Alignment {
                transform: *seed,
                rmse,
                converged: true,
            })
        }
    }

    fn cloud(n: usize) -> Arc<PointCloud> {
        Arc::new(PointCloud::new(
            (0..n).map(|i| [i as f64, 0.0, 0.0]).collect(),
            None,
            None,
        ))
    }

    /// Candidate `i` gets a cloud of `i + 1` points so the aligner can tell them apart.
    fn list(n: usize) -> CandidateList {
        let entries = (0..n)
            .map(|i| {
                Candidate::new(
                    format!("obj_0_{}", i * 10),
                    i,
                    Some(cloud(i + 1)),
                    i as f32,
                    DescriptorSet::single(ListType::Vfh),
                )
            })
            .collect();
        CandidateList::from_candidates(ListType::Composite, entries)
    }

    fn policy() -> RefinementPolicy {
        RefinementPolicy {
            initial_candidates: 2,
            max_rounds: 5,
            rmse_threshold: 0.01,
            tie_epsilon: 1e-6,
        }
    }

    #[test]
    fn test_stops_when_threshold_reached() -> PoseResult<()> {
        let aligner = TableAligner {
            rmse_by_len: HashMap::from([(1, 0.5), (2, 0.005), (3, 0.001), (4, 0.2)]),
            calls: AtomicUsize::new(0),
        };
        let mut l = list(8);
        let mut engine = RefinementEngine::new(&aligner, policy());
        let outcome = engine.refine(&mut l, "obj_0_0", &cloud(5))?;
        assert_eq!(outcome.winner, 1);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.attempted, 2);
        assert_eq!(aligner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.state(), RefinementState::Refined);
        assert!(l.get(2).is_some_and(|c| c.rmse().is_infinite()));
        Ok(())
    }

    #[test]
    fn test_window_doubles_until_exhausted() -> PoseResult<()> {
        let aligner = TableAligner {
            rmse_by_len: (1..=5).map(|n| (n, 1.0 / n as f64)).collect(),
            calls: AtomicUsize::new(0),
        };
        let mut l = list(5);
        let mut engine = RefinementEngine::new(&aligner, policy());
        let outcome = engine.refine(&mut l, "query", &cloud(5))?;
        // windows 2, 4, 5
        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.attempted, 5);
        assert_eq!(aligner.calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.winner, 4);
        Ok(())
    }

    #[test]
    fn test_round_cap() -> PoseResult<()> {
        let aligner = TableAligner {
            rmse_by_len: (1..=10).map(|n| (n, 1.0)).collect(),
            calls: AtomicUsize::new(0),
        };
        let mut l = list(10);
        let mut p = policy();
        p.max_rounds = 2;
        let outcome = RefinementEngine::new(&aligner, p).refine(&mut l, "query", &cloud(3))?;
        assert_eq!(outcome.attempted, 4);
        // all tied, the smallest distance wins
        assert_eq!(outcome.winner, 0);
        Ok(())
    }

    #[test]
    fn test_failures_are_skipped() -> PoseResult<()> {
        let aligner = TableAligner {
            rmse_by_len: HashMap::from([(2, 0.3)]),
            calls: AtomicUsize::new(0),
        };
        let mut l = list(2);
        let outcome = RefinementEngine::new(&aligner, policy()).refine(&mut l, "q", &cloud(3))?;
        assert_eq!(outcome.winner, 1);
        let failed = l.get(0).unwrap();
        assert!(failed.rmse().is_infinite());
        assert_eq!(failed.transformation(), &IDENTITY4);
        Ok(())
    }

    #[test]
    fn test_all_failed() {
        let aligner = TableAligner {
            rmse_by_len: HashMap::new(),
            calls: AtomicUsize::new(0),
        };
        let mut l = list(3);
        let mut engine = RefinementEngine::new(&aligner, policy());
        assert!(matches!(
            engine.refine(&mut l, "q", &cloud(3)),
            Err(PoseError::RefinementFailed { attempted: 3 })
        ));
        assert_eq!(engine.state(), RefinementState::Failed);
    }

    #[test]
    fn test_seed_rotation_from_names() {
        let q = cloud(3);
        let e = cloud(3);
        let seed = seed_transform("obj_0_90", &q, "obj_0_0", &e);
        let (r, t) = decompose_transform(&seed);
        // the exemplar view axis (x) lands on the query view axis (y)
        let x = transform_point(&[1.0, 0.0, 0.0], &r, &[0.0; 3]);
        assert_relative_eq!(x[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-12);
        // the rotated exemplar centroid (1, 0, 0) → (0, 1, 0) is moved back on (1, 0, 0)
        assert_relative_eq!(t[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(t[1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_seed_identity_without_labels() {
        let seed = seed_transform("query", &cloud(3), "obj_0_0", &cloud(5));
        let (r, t) = decompose_transform(&seed);
        assert_eq!(r, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert_relative_eq!(t[0], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_icp_aligner_identity() -> Result<(), AlignmentError> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                points.push([i as f64 * 0.1, j as f64 * 0.1, (i * j) as f64 * 0.01]);
            }
        }
        let pc = PointCloud::new(points, None, None);
        let alignment = IcpAligner::default().align(&pc, &pc, &IDENTITY4)?;
        assert!(alignment.rmse < 1e-9);
        assert!(alignment.converged);
        Ok(())
    }

    #[test]
    fn test_estimation_json_is_lossless() -> Result<(), serde_json::Error> {
        let mut transformation = IDENTITY4;
        transformation[0][1] = -1.4901161138336505e-9;
        transformation[1][3] = 0.1 + 0.2;
        transformation[2][0] = std::f64::consts::FRAC_1_SQRT_2;
        let estimation = Estimation {
            query: "query".into(),
            name: "obj_10_20".into(),
            rmse: 2.0f64.sqrt() * 1e-3,
            transformation,
        };

        let json = serde_json::to_string(&estimation)?;
        let parsed: Estimation = serde_json::from_str(&json)?;
        assert_eq!(parsed, estimation);
        Ok(())
    }
}
