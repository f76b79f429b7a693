//! Per-query pose estimation workflow.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use vpose_3d::pointcloud::PointCloud;

use crate::candidate::{CandidateList, CandidateLists};
use crate::config::PoseConfig;
use crate::database::PoseDatabase;
use crate::descriptor::{DescriptorExtractor, Descriptors, ListType};
use crate::error::{PoseError, PoseResult};
use crate::exemplar::ExemplarName;
use crate::fusion::CompositeFusion;
use crate::refinement::{
    Aligner, Estimation, IcpAligner, RefinementEngine, RefinementPolicy, RefinementState,
};

/// Progress of a [`PoseEstimation`] session. States are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Parameters set, no query yet.
    Configured,
    /// A query and its descriptors are available.
    QuerySet,
    /// A database is selected.
    DatabaseSet,
    /// Candidate lists are generated.
    ListsGenerated,
    /// A final pose was selected.
    Refined,
    /// The estimation was saved.
    Done,
}

/// Stages of [`PoseEstimation::estimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Query setup and descriptor extraction.
    SetQuery,
    /// Database selection.
    SetDatabase,
    /// Candidate list generation.
    GenerateLists,
    /// Candidate refinement.
    Refine,
}

#[derive(Debug, Clone)]
struct Query {
    name: String,
    cloud: Arc<PointCloud>,
    viewpoint: [f64; 3],
    descriptors: Descriptors,
}

/// A pose estimation session: one query at a time against a shared database.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use vpose::{PoseEstimation, PoseConfig, DescriptorExtractor};
/// # fn run(extractor: Arc<dyn DescriptorExtractor>, cloud: vpose_3d::pointcloud::PointCloud) -> vpose::PoseResult<()> {
/// let mut session = PoseEstimation::new(PoseConfig::default()).with_extractor(extractor);
/// session.set_param("kNeighbors", 10.0)?;
/// let estimation = session.estimate("funnel_20_30", cloud, "db/")?;
/// println!("{estimation}");
/// # Ok(())
/// # }
/// ```
pub struct PoseEstimation {
    config: PoseConfig,
    extractor: Option<Arc<dyn DescriptorExtractor>>,
    aligner: Option<Arc<dyn Aligner>>,
    state: SessionState,
    explicit_viewpoint: Option<[f64; 3]>,
    query: Option<Query>,
    database: Option<Arc<PoseDatabase>>,
    database_path: Option<PathBuf>,
    lists: CandidateLists,
    refinement: RefinementState,
    estimation: Option<Estimation>,
}

impl Default for PoseEstimation {
    fn default() -> Self {
        Self::new(PoseConfig::default())
    }
}

impl PoseEstimation {
    /// Create a session with the given parameters.
    pub fn new(config: PoseConfig) -> Self {
        Self {
            config,
            extractor: None,
            aligner: None,
            state: SessionState::Configured,
            explicit_viewpoint: None,
            query: None,
            database: None,
            database_path: None,
            lists: CandidateLists::default(),
            refinement: RefinementState::Unrefined,
            estimation: None,
        }
    }

    /// Create a session with the parameters of a configuration file.
    pub fn from_config_file(path: impl AsRef<Path>) -> PoseResult<Self> {
        Ok(Self::new(PoseConfig::from_file(path)?))
    }

    /// Use `extractor` to compute query descriptors.
    pub fn with_extractor(mut self, extractor: Arc<dyn DescriptorExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Use `aligner` instead of the default ICP during refinement.
    pub fn with_aligner(mut self, aligner: Arc<dyn Aligner>) -> Self {
        self.aligner = Some(aligner);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// State of the last refinement.
    pub fn refinement_state(&self) -> RefinementState {
        self.refinement
    }

    /// Current parameters.
    pub fn params(&self) -> &PoseConfig {
        &self.config
    }

    /// Set one parameter by name, see [`PoseConfig::set_param`].
    pub fn set_param(&mut self, key: &str, value: f64) -> PoseResult<()> {
        self.config.set_param(key, value)
    }

    /// Apply a configuration file, see [`PoseConfig::init_params`].
    pub fn init_params(&mut self, path: impl AsRef<Path>) -> PoseResult<()> {
        self.config.init_params(path)
    }

    /// Log the current parameters.
    pub fn print_params(&self) {
        log::info!("Pose estimation parameters:\n{}", self.config);
    }

    /// Force the viewpoint used for the next query, overriding
    /// `useSOasViewpoint` and `computeViewpointFromName`.
    pub fn set_query_viewpoint(&mut self, x: f64, y: f64, z: f64) {
        self.explicit_viewpoint = Some([x, y, z]);
    }

    /// Viewpoint of the current query.
    pub fn query_viewpoint(&self) -> Option<[f64; 3]> {
        self.query.as_ref().map(|q| q.viewpoint)
    }

    /// Name of the current query.
    pub fn query_name(&self) -> Option<&str> {
        self.query.as_ref().map(|q| q.name.as_str())
    }

    /// Descriptors of the current query.
    pub fn query_descriptors(&self) -> Option<&Descriptors> {
        self.query.as_ref().map(|q| &q.descriptors)
    }

    /// The selected database.
    pub fn database(&self) -> Option<&Arc<PoseDatabase>> {
        self.database.as_ref()
    }

    fn require(&self, operation: &'static str, required: SessionState) -> PoseResult<()> {
        if self.state < required {
            return Err(PoseError::Precondition {
                operation,
                required,
                current: self.state,
            });
        }
        Ok(())
    }

    fn resolve_viewpoint(&self, name: &str, cloud: &PointCloud) -> [f64; 3] {
        if let Some(vp) = self.explicit_viewpoint {
            return vp;
        }
        if self.config.use_so_as_viewpoint {
            if let Some(origin) = cloud.sensor_origin() {
                return origin;
            }
        }
        if self.config.compute_viewpoint_from_name {
            match name.parse::<ExemplarName>() {
                Ok(label) => return label.viewpoint(),
                Err(e) => log::warn!("Cannot compute viewpoint from name: {}", e),
            }
        }
        [0.0; 3]
    }

    /// Set the query and compute its descriptors with the extractor.
    pub fn set_query(&mut self, name: impl Into<String>, cloud: PointCloud) -> PoseResult<()> {
        let name = name.into();
        let extractor = self
            .extractor
            .clone()
            .ok_or(PoseError::MissingCollaborator("descriptor extractor"))?;
        if cloud.is_empty() {
            return Err(PoseError::QueryEmpty);
        }

        let viewpoint = self.resolve_viewpoint(&name, &cloud);
        let descriptors = extractor
            .extract(&cloud, viewpoint)
            .map_err(|e| PoseError::Extraction(e.to_string()))?;
        self.install_query(name, cloud, viewpoint, descriptors)
    }

    /// Set the query with precomputed descriptors.
    pub fn set_query_with_descriptors(
        &mut self,
        name: impl Into<String>,
        cloud: PointCloud,
        descriptors: Descriptors,
    ) -> PoseResult<()> {
        let name = name.into();
        if cloud.is_empty() {
            return Err(PoseError::QueryEmpty);
        }
        let viewpoint = self.resolve_viewpoint(&name, &cloud);
        self.install_query(name, cloud, viewpoint, descriptors)
    }

    fn install_query(
        &mut self,
        name: String,
        cloud: PointCloud,
        viewpoint: [f64; 3],
        descriptors: Descriptors,
    ) -> PoseResult<()> {
        descriptors.validate()?;
        if self.config.verbosity > 0 {
            log::info!(
                "Query {} set with {} points, viewpoint {:?}",
                name,
                cloud.len(),
                viewpoint
            );
        }

        self.query = Some(Query {
            name,
            cloud: Arc::new(cloud),
            viewpoint,
            descriptors,
        });
        self.reset_results();
        self.state = SessionState::QuerySet;
        Ok(())
    }

    fn reset_results(&mut self) {
        self.lists.clear();
        self.refinement = RefinementState::Unrefined;
        self.estimation = None;
    }

    /// Load the database stored in `path`. Selecting the path of the
    /// database already loaded reuses it.
    pub fn set_database(&mut self, path: impl AsRef<Path>) -> PoseResult<()> {
        self.require("set_database", SessionState::QuerySet)?;
        let path = path.as_ref();

        let cached = self
            .database
            .as_ref()
            .filter(|_| self.database_path.as_deref() == Some(path))
            .cloned();
        let db = match cached {
            Some(db) => {
                log::debug!("Reusing database loaded from {:?}", path);
                db
            }
            None => Arc::new(PoseDatabase::load(path)?),
        };

        self.database_path = Some(path.to_path_buf());
        self.attach_database(db);
        Ok(())
    }

    /// Use an already built database.
    pub fn set_database_handle(&mut self, db: Arc<PoseDatabase>) -> PoseResult<()> {
        self.require("set_database_handle", SessionState::QuerySet)?;
        self.database_path = None;
        self.attach_database(db);
        Ok(())
    }

    fn attach_database(&mut self, db: Arc<PoseDatabase>) {
        if self.config.verbosity > 0 {
            log::info!("Database with {} exemplars selected", db.len());
        }
        self.database = Some(db);
        self.reset_results();
        self.state = SessionState::DatabaseSet;
    }

    /// Search the database with every enabled descriptor and fuse the results.
    ///
    /// With `Some(path)` the database in `path` is selected first.
    pub fn generate_lists(&mut self, db_path: Option<&Path>) -> PoseResult<()> {
        if let Some(path) = db_path {
            self.set_database(path)?;
        }
        self.require("generate_lists", SessionState::DatabaseSet)?;
        let (Some(query), Some(db)) = (self.query.as_ref(), self.database.as_ref()) else {
            return Err(PoseError::Precondition {
                operation: "generate_lists",
                required: SessionState::DatabaseSet,
                current: self.state,
            });
        };

        let enabled = self.config.enabled_descriptors();
        if enabled.is_empty() {
            return Err(PoseError::NoDescriptorEnabled);
        }

        let k = self.config.k_neighbors;
        let kinds = enabled.iter().collect::<Vec<_>>();
        let generated = kinds
            .par_iter()
            .map(|kind| CandidateList::generate(*kind, db, &query.descriptors, k))
            .collect::<PoseResult<Vec<_>>>()?;

        let mut lists = CandidateLists::default();
        for list in generated {
            log::debug!("{} list holds {} candidates", list.kind(), list.len());
            lists.set(list);
        }
        let fusion = CompositeFusion::new(enabled, self.config.weights());
        let composite = fusion.fuse(&lists);
        if self.config.verbosity > 0 {
            log::info!(
                "Generated {} lists, composite holds {} candidates",
                kinds.len(),
                composite.len()
            );
        }
        lists.set(composite);

        self.lists = lists;
        self.refinement = RefinementState::Unrefined;
        self.estimation = None;
        self.state = SessionState::ListsGenerated;
        Ok(())
    }

    /// Align the best composite candidates on the query and select the final pose.
    pub fn refine_candidates(&mut self) -> PoseResult<&Estimation> {
        self.require("refine_candidates", SessionState::ListsGenerated)?;
        let Some(query) = self.query.as_ref() else {
            return Err(PoseError::Precondition {
                operation: "refine_candidates",
                required: SessionState::QuerySet,
                current: self.state,
            });
        };

        self.estimation = None;
        self.state = SessionState::ListsGenerated;

        let default_aligner;
        let aligner: &dyn Aligner = match self.aligner.as_deref() {
            Some(aligner) => aligner,
            None => {
                default_aligner = IcpAligner::from_config(&self.config);
                &default_aligner
            }
        };

        let list = self.lists.get_mut(ListType::Composite);
        let mut engine = RefinementEngine::new(aligner, RefinementPolicy::from_config(&self.config));
        let result = engine.refine(list, &query.name, &query.cloud);
        self.refinement = engine.state();
        let outcome = result?;

        let winner = list
            .get(outcome.winner)
            .ok_or(PoseError::RefinementFailed {
                attempted: outcome.attempted,
            })?;
        let estimation = Estimation {
            query: query.name.clone(),
            name: winner.name().to_string(),
            rmse: winner.rmse(),
            transformation: *winner.transformation(),
        };
        if self.config.verbosity > 0 {
            log::info!(
                "Refined {} candidates in {} rounds, best is {} with RMSE {}",
                outcome.attempted,
                outcome.rounds,
                estimation.name,
                estimation.rmse
            );
        }

        self.state = SessionState::Refined;
        Ok(self.estimation.insert(estimation))
    }

    /// The candidate list of the given type.
    pub fn candidates(&self, kind: ListType) -> PoseResult<&CandidateList> {
        self.require("candidates", SessionState::ListsGenerated)?;
        Ok(self.lists.get(kind))
    }

    /// The final pose.
    pub fn estimation(&self) -> PoseResult<&Estimation> {
        self.require("estimation", SessionState::Refined)?;
        self.estimation.as_ref().ok_or(PoseError::Precondition {
            operation: "estimation",
            required: SessionState::Refined,
            current: self.state,
        })
    }

    /// Log the final pose.
    pub fn print_estimation(&self) -> PoseResult<()> {
        log::info!("{}", self.estimation()?);
        Ok(())
    }

    /// Write the final pose to `path` as JSON.
    pub fn save_estimation(&mut self, path: impl AsRef<Path>) -> PoseResult<()> {
        let path = path.as_ref();
        let estimation = self.estimation()?;
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, estimation)?;
        log::debug!("Saved estimation of {} to {:?}", estimation.query, path);
        self.state = SessionState::Done;
        Ok(())
    }

    /// Run the whole pipeline on one query.
    pub fn estimate(
        &mut self,
        name: impl Into<String>,
        cloud: PointCloud,
        db_path: impl AsRef<Path>,
    ) -> PoseResult<&Estimation> {
        let stage = |stage: Stage| move |e: PoseError| PoseError::Stage {
            stage,
            source: Box::new(e),
        };

        self.set_query(name, cloud).map_err(stage(Stage::SetQuery))?;
        self.set_database(db_path).map_err(stage(Stage::SetDatabase))?;
        self.generate_lists(None).map_err(stage(Stage::GenerateLists))?;
        self.refine_candidates().map_err(stage(Stage::Refine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{ramp_database, ramp_descriptors};

    fn query_cloud() -> PointCloud {
        PointCloud::new(vec![[0.0; 3], [1.0, 0.0, 0.0]], None, None)
    }

    #[test]
    fn test_out_of_order_operations() {
        let mut session = PoseEstimation::default();
        assert!(matches!(
            session.generate_lists(None),
            Err(PoseError::Precondition {
                required: SessionState::DatabaseSet,
                current: SessionState::Configured,
                ..
            })
        ));
        assert!(matches!(
            session.set_database_handle(Arc::new(ramp_database(&[0.1]))),
            Err(PoseError::Precondition { .. })
        ));
        assert!(matches!(session.refine_candidates(), Err(PoseError::Precondition { .. })));
        assert!(matches!(session.estimation(), Err(PoseError::Precondition { .. })));
        assert!(session.database().is_none());
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_set_query_requires_extractor() {
        let mut session = PoseEstimation::default();
        assert!(matches!(
            session.set_query("q", query_cloud()),
            Err(PoseError::MissingCollaborator(_))
        ));
    }

    #[test]
    fn test_empty_query_rejected() {
        let mut session = PoseEstimation::default();
        let empty = PointCloud::new(vec![], None, None);
        assert!(matches!(
            session.set_query_with_descriptors("q", empty, ramp_descriptors(0.1)),
            Err(PoseError::QueryEmpty)
        ));
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_viewpoint_resolution_order() -> PoseResult<()> {
        let mut session = PoseEstimation::default();
        session.set_param("computeViewpointFromName", 1.0)?;

        let cloud = query_cloud().with_sensor_origin([0.0, 0.0, 2.0]);
        session.set_query_with_descriptors("obj_0_90", cloud, ramp_descriptors(0.1))?;
        assert_eq!(session.query_viewpoint(), Some([0.0, 0.0, 2.0]));

        session.set_query_with_descriptors("obj_90_0", query_cloud(), ramp_descriptors(0.1))?;
        let vp = session.query_viewpoint().unwrap();
        assert!((vp[2] - 1.0).abs() < 1e-12);

        session.set_query_viewpoint(1.0, 2.0, 3.0);
        session.set_query_with_descriptors("obj_90_0", query_cloud(), ramp_descriptors(0.1))?;
        assert_eq!(session.query_viewpoint(), Some([1.0, 2.0, 3.0]));
        Ok(())
    }

    #[test]
    fn test_generate_lists_and_reset() -> PoseResult<()> {
        let mut session = PoseEstimation::default();
        session.set_param("kNeighbors", 2.0)?;
        session.set_query_with_descriptors("q", query_cloud(), ramp_descriptors(0.3))?;
        session.set_database_handle(Arc::new(ramp_database(&[0.1, 0.5, 0.3])))?;
        session.generate_lists(None)?;
        assert_eq!(session.state(), SessionState::ListsGenerated);

        for kind in ListType::ALL {
            let list = session.candidates(kind)?;
            assert_eq!(list.get(0).map(|c| c.name()), Some("obj_0_20"), "{kind}");
        }
        // chi-square prefers obj_0_10 as runner-up while squared L2 ties
        // and keeps obj_0_0, so the composite holds three exemplars
        assert_eq!(session.candidates(ListType::Vfh)?.len(), 2);
        assert_eq!(session.candidates(ListType::Composite)?.len(), 3);

        // a new query drops the lists but keeps the database
        session.set_query_with_descriptors("q2", query_cloud(), ramp_descriptors(0.1))?;
        assert_eq!(session.state(), SessionState::QuerySet);
        assert!(session.database().is_some());
        assert!(matches!(session.candidates(ListType::Vfh), Err(PoseError::Precondition { .. })));
        Ok(())
    }

    #[test]
    fn test_no_descriptor_enabled() -> PoseResult<()> {
        let mut session = PoseEstimation::default();
        for key in ["useVFH", "useESF", "useCVFH", "useOURCVFH"] {
            session.set_param(key, 0.0)?;
        }
        session.set_query_with_descriptors("q", query_cloud(), ramp_descriptors(0.3))?;
        session.set_database_handle(Arc::new(ramp_database(&[0.1])))?;
        assert!(matches!(session.generate_lists(None), Err(PoseError::NoDescriptorEnabled)));
        assert_eq!(session.state(), SessionState::DatabaseSet);
        Ok(())
    }
}
