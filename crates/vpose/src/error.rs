use std::path::PathBuf;

use crate::descriptor::ListType;
use crate::session::{SessionState, Stage};

/// Errors raised by the pose retrieval engine.
#[derive(Debug, thiserror::Error)]
pub enum PoseError {
    /// An operation was invoked before the session reached the required state.
    #[error("{operation} requires state {required:?} or later, session is {current:?}")]
    Precondition {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Minimum state the operation needs.
        required: SessionState,
        /// State of the session when the operation was attempted.
        current: SessionState,
    },

    /// `set_param` was called with a key the configuration does not know.
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// A known parameter was given a value outside its domain.
    #[error("Invalid value {value} for parameter {key}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        key: String,
        /// Rejected value.
        value: f64,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// Every descriptor type is disabled, no list can be generated.
    #[error("No descriptor type is enabled")]
    NoDescriptorEnabled,

    /// A session collaborator required by the operation was not supplied.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// A file or query name does not follow the `<object>_<lat>_<lon>` convention.
    #[error("Name {0:?} does not follow the <object>_<lat>_<lon> convention")]
    InvalidNaming(String),

    /// Two exemplars share the same name.
    #[error("Duplicate exemplar {0:?}")]
    DuplicateExemplar(String),

    /// A database or configuration file could not be loaded.
    #[error("Failed to load {path:?}: {reason}")]
    Load {
        /// Database directory or configuration file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Database tables disagree with each other.
    #[error("Inconsistent database: {0}")]
    Inconsistent(String),

    /// Saving would overwrite an existing database.
    #[error("{0:?} already contains a database")]
    Overwrite(PathBuf),

    /// The given path is not a directory.
    #[error("{0:?} is not a valid directory")]
    NotADirectory(PathBuf),

    /// Database creation processed zero exemplars.
    #[error("No exemplar could be processed from {0:?}")]
    EmptyDatabase(PathBuf),

    /// The query cloud has no points.
    #[error("Query cloud is empty")]
    QueryEmpty,

    /// Every refined candidate failed alignment.
    #[error("Refinement failed for all {attempted} candidates")]
    RefinementFailed {
        /// Number of candidates an alignment was attempted on.
        attempted: usize,
    },

    /// The list type cannot be used for the requested operation.
    #[error("List type {0} is not supported here")]
    ListTypeUnsupported(String),

    /// A descriptor vector has the wrong length.
    #[error("{descriptor} descriptor has {found} values, expected {expected}")]
    DimensionMismatch {
        /// Descriptor type of the offending vector.
        descriptor: ListType,
        /// Expected length.
        expected: usize,
        /// Actual length.
        found: usize,
    },

    /// A descriptor bin is negative or not finite.
    #[error("{descriptor} descriptor bin {bin} holds {value}, expected a finite non-negative value")]
    InvalidDescriptor {
        /// Descriptor type of the offending vector.
        descriptor: ListType,
        /// Index of the offending bin.
        bin: usize,
        /// Rejected value.
        value: f32,
    },

    /// The descriptor extractor failed.
    #[error("Descriptor extraction failed: {0}")]
    Extraction(String),

    /// Failed to read or write a point cloud.
    #[error(transparent)]
    Pcd(#[from] vpose_3d::io::pcd::PcdError),

    /// Generic I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Bincode (de)serialization failure.
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// The worker pool could not be created.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A stage of the estimation pipeline failed.
    #[error("{stage:?} stage failed: {source}")]
    Stage {
        /// Stage that failed.
        stage: Stage,
        /// Underlying cause.
        #[source]
        source: Box<PoseError>,
    },
}

/// Coarse classification of a [`PoseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The caller misused the API or supplied an invalid configuration.
    Configuration,
    /// The operation was valid but could not complete.
    Runtime,
}

impl PoseError {
    /// Classify the error as a configuration or a runtime failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoseError::Precondition { .. }
            | PoseError::UnknownParameter(_)
            | PoseError::InvalidParameter { .. }
            | PoseError::NoDescriptorEnabled
            | PoseError::MissingCollaborator(_)
            | PoseError::ListTypeUnsupported(_)
            | PoseError::DimensionMismatch { .. } => ErrorCategory::Configuration,
            PoseError::Stage { source, .. } => source.category(),
            _ => ErrorCategory::Runtime,
        }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PoseError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type PoseResult<T> = Result<T, PoseError>;
