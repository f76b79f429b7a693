#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

pub mod candidate;

/// Estimation parameters and their configuration files.
pub mod config;

pub mod database;
pub mod descriptor;

/// Error types.
pub mod error;

/// Exemplar naming convention.
pub mod exemplar;

/// Fusion of the per-descriptor lists.
pub mod fusion;

pub mod index;
pub mod refinement;
pub mod session;

pub use candidate::{Candidate, CandidateList, CandidateLists, SortKey};
pub use config::PoseConfig;
pub use database::{CreateOptions, CreationReport, Exemplar, PoseDatabase};
pub use descriptor::{DescriptorExtractor, DescriptorSet, Descriptors, ListType};
pub use error::{ErrorCategory, PoseError, PoseResult};
pub use exemplar::ExemplarName;
pub use fusion::CompositeFusion;
pub use refinement::{Aligner, Alignment, Estimation, IcpAligner, RefinementEngine};
pub use session::{PoseEstimation, SessionState, Stage};
