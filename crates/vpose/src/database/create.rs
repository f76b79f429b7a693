use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use vpose_3d::io::pcd::{read_pcd, PcdError};

use super::{Exemplar, PoseDatabase};
use crate::descriptor::DescriptorExtractor;
use crate::error::{PoseError, PoseResult};
use crate::exemplar::ExemplarName;
use crate::index::IndexParams;

/// Options of [`PoseDatabase::create`].
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    /// Worker threads used for descriptor extraction, `0` lets rayon decide.
    pub num_threads: usize,
    /// Parameters of the kd-tree forests.
    pub index: IndexParams,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            num_threads: 0,
            index: IndexParams::default(),
        }
    }
}

/// A file left out of the database and why.
#[derive(Debug)]
pub struct SkippedFile {
    /// Path of the file.
    pub path: PathBuf,
    /// Reason the file was skipped.
    pub error: PoseError,
}

/// Outcome of a database creation run.
#[derive(Debug, Default)]
pub struct CreationReport {
    /// Number of exemplars stored in the database.
    pub processed: usize,
    /// Files that were not turned into exemplars.
    pub skipped: Vec<SkippedFile>,
}

impl PoseDatabase {
    /// Build a database from a directory of `<object>_<lat>_<lon>.pcd` files.
    ///
    /// Files are processed in sorted path order. Files that are not PCD, are
    /// misnamed, unreadable, or fail extraction are skipped and listed in the
    /// returned [`CreationReport`]. The descriptors are computed from the
    /// sensor origin stored in each cloud, or from the origin.
    pub fn create(
        exemplar_dir: impl AsRef<Path>,
        extractor: &dyn DescriptorExtractor,
        options: &CreateOptions,
    ) -> PoseResult<(Self, CreationReport)> {
        let exemplar_dir = exemplar_dir.as_ref();
        if !exemplar_dir.is_dir() {
            return Err(PoseError::NotADirectory(exemplar_dir.to_path_buf()));
        }

        let mut report = CreationReport::default();

        let paths = list_pcd_files(exemplar_dir, &mut report);

        log::info!(
            "Found {} PCD files in {:?}, extracting descriptors",
            paths.len(),
            exemplar_dir
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .build()?;

        let results = pool.install(|| {
            paths
                .into_par_iter()
                .map(|path| {
                    let exemplar = process_file(&path, extractor);
                    (path, exemplar)
                })
                .collect::<Vec<_>>()
        });

        let mut exemplars = Vec::with_capacity(results.len());
        let mut sensor_frame: Option<bool> = None;
        for (path, result) in results {
            match result {
                Ok(exemplar) => {
                    let has_origin = exemplar
                        .cloud
                        .as_ref()
                        .and_then(|c| c.sensor_origin())
                        .is_some();
                    match sensor_frame {
                        None => sensor_frame = Some(has_origin),
                        Some(first) if first != has_origin => log::warn!(
                            "{:?} mixes sensor and object reference frames with previous exemplars",
                            path
                        ),
                        Some(_) => {}
                    }
                    exemplars.push(exemplar);
                }
                Err(error) => {
                    log::warn!("Skipping {:?}: {}", path, error);
                    report.skipped.push(SkippedFile { path, error });
                }
            }
        }

        if exemplars.is_empty() {
            return Err(PoseError::EmptyDatabase(exemplar_dir.to_path_buf()));
        }
        report.processed = exemplars.len();

        let db = PoseDatabase::from_exemplars(exemplars, options.index)?;
        log::info!(
            "Created database with {} exemplars, {} files skipped",
            db.len(),
            report.skipped.len()
        );
        Ok((db, report))
    }
}

/// Sorted regular `.pcd` files directly inside `dir`. Everything else is
/// recorded in `report` as skipped.
fn list_pcd_files(dir: &Path, report: &mut CreationReport) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                log::warn!("Skipping unreadable entry {:?}: {}", path, e);
                report.skipped.push(SkippedFile {
                    path,
                    error: PoseError::Io(e.into()),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        let is_pcd = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pcd"))
            .unwrap_or(false);
        if is_pcd {
            paths.push(path);
        } else {
            log::warn!("Skipping {:?}, not a PCD file", path);
            report.skipped.push(SkippedFile {
                error: PoseError::Pcd(PcdError::InvalidFileExtension(path.display().to_string())),
                path,
            });
        }
    }
    paths
}

fn process_file(path: &Path, extractor: &dyn DescriptorExtractor) -> PoseResult<Exemplar> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PoseError::InvalidNaming(path.display().to_string()))?
        .to_string();
    name.parse::<ExemplarName>()?;

    let cloud = read_pcd(path)?;
    if cloud.is_empty() {
        return Err(PoseError::Extraction("cloud has no points".into()));
    }

    let viewpoint = cloud.sensor_origin().unwrap_or([0.0; 3]);
    let descriptors = extractor
        .extract(&cloud, viewpoint)
        .map_err(|e| PoseError::Extraction(e.to_string()))?;
    descriptors.validate()?;

    Ok(Exemplar {
        name,
        descriptors,
        cloud: Some(Arc::new(cloud)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpose_3d::io::pcd::write_pcd_binary;
    use vpose_3d::pointcloud::PointCloud;

    #[test]
    fn test_list_pcd_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cloud = PointCloud::new(vec![[0.0; 3]], None, None);
        write_pcd_binary(dir.path().join("mug_0_10.PCD"), &cloud)?;
        write_pcd_binary(dir.path().join("mug_0_0.pcd"), &cloud)?;
        std::fs::write(dir.path().join("readme.txt"), "")?;
        std::fs::create_dir(dir.path().join("nested.pcd"))?;

        let mut report = CreationReport::default();
        let paths = list_pcd_files(dir.path(), &mut report);
        let names = paths
            .iter()
            .filter_map(|p| p.file_name()?.to_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["mug_0_0.pcd", "mug_0_10.PCD"]);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(
            report.skipped[0].error,
            PoseError::Pcd(PcdError::InvalidFileExtension(_))
        ));

        // the uppercase file is readable too
        assert_eq!(read_pcd(&paths[1])?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_unreadable_entries_are_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("gone");

        let mut report = CreationReport::default();
        let paths = list_pcd_files(&missing, &mut report);
        assert!(paths.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, missing);
        assert!(matches!(report.skipped[0].error, PoseError::Io(_)));
        Ok(())
    }
}
