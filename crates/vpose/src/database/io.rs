use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vpose_3d::io::pcd::{read_pcd, write_pcd_binary};

use super::{DatabaseParts, PoseDatabase};
use crate::descriptor::{ClusterFrame, ListType};
use crate::error::{PoseError, PoseResult};
use crate::index::{FeatureMatrix, IndexParams};

/// Magic number opening every matrix file ("VPDB").
const MATRIX_MAGIC: u32 = 0x5650_4442;
const FORMAT_VERSION: u32 = 1;
const SIDECAR_FILE: &str = "exemplars.json";
const CLOUDS_DIR: &str = "clouds";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    version: u32,
    index_trees: usize,
    #[serde(default = "default_checks")]
    search_checks: usize,
    names: Vec<String>,
    cvfh_owners: Vec<usize>,
    ourcvfh_owners: Vec<usize>,
    ourcvfh_frames: Vec<ClusterFrame>,
}

fn default_checks() -> usize {
    IndexParams::default().checks
}

fn matrix_file(kind: ListType) -> String {
    format!("{}.bin", kind.as_str())
}

impl PoseDatabase {
    /// `true` if `dir` contains any database file.
    pub fn exists_in(dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        dir.join(SIDECAR_FILE).exists()
            || ListType::DESCRIPTORS
                .iter()
                .any(|kind| dir.join(matrix_file(*kind)).exists())
    }

    /// Persist the database into `dir`, creating the directory when missing.
    ///
    /// Fails with [`PoseError::Overwrite`] if `dir` already holds a database.
    pub fn save(&self, dir: impl AsRef<Path>) -> PoseResult<()> {
        let dir = dir.as_ref();
        if Self::exists_in(dir) {
            return Err(PoseError::Overwrite(dir.to_path_buf()));
        }
        std::fs::create_dir_all(dir)?;

        for kind in ListType::DESCRIPTORS {
            write_matrix(&dir.join(matrix_file(kind)), kind, self.matrix(kind)?)?;
        }

        let params = self.index_params();
        let sidecar = Sidecar {
            version: FORMAT_VERSION,
            index_trees: params.trees,
            search_checks: params.checks,
            names: self.names.clone(),
            cvfh_owners: self.cvfh.owners().to_vec(),
            ourcvfh_owners: self.ourcvfh.owners().to_vec(),
            ourcvfh_frames: self.ourcvfh_frames.clone(),
        };
        let writer = BufWriter::new(File::create(dir.join(SIDECAR_FILE))?);
        serde_json::to_writer_pretty(writer, &sidecar)?;

        let clouds_dir = dir.join(CLOUDS_DIR);
        for (name, cloud) in self.names.iter().zip(&self.clouds) {
            if let Some(cloud) = cloud {
                std::fs::create_dir_all(&clouds_dir)?;
                write_pcd_binary(clouds_dir.join(format!("{name}.pcd")), cloud)?;
            }
        }

        log::info!("Saved database with {} exemplars to {:?}", self.len(), dir);
        Ok(())
    }

    /// Load a database saved with [`PoseDatabase::save`] and rebuild its indices.
    ///
    /// Exemplars whose cloud file is missing are kept without a cloud.
    pub fn load(dir: impl AsRef<Path>) -> PoseResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(PoseError::load(dir, "not a directory"));
        }

        let sidecar_path = dir.join(SIDECAR_FILE);
        let reader = BufReader::new(
            File::open(&sidecar_path).map_err(|e| PoseError::load(dir, format!("{SIDECAR_FILE}: {e}")))?,
        );
        let sidecar: Sidecar = serde_json::from_reader(reader)
            .map_err(|e| PoseError::load(dir, format!("{SIDECAR_FILE}: {e}")))?;
        if sidecar.version != FORMAT_VERSION {
            return Err(PoseError::load(
                dir,
                format!("unsupported sidecar version {}", sidecar.version),
            ));
        }

        let mut matrices = Vec::with_capacity(ListType::DESCRIPTORS.len());
        for kind in ListType::DESCRIPTORS {
            let path = dir.join(matrix_file(kind));
            matrices.push(read_matrix(&path, kind).map_err(|e| PoseError::load(dir, e))?);
        }
        let [vfh, esf, cvfh, ourcvfh]: [FeatureMatrix; 4] = matrices
            .try_into()
            .map_err(|_| PoseError::load(dir, "missing descriptor matrix"))?;

        let clouds = sidecar
            .names
            .iter()
            .map(|name| load_cloud(&dir.join(CLOUDS_DIR).join(format!("{name}.pcd"))))
            .collect::<Vec<_>>();

        let params = IndexParams {
            trees: sidecar.index_trees,
            checks: sidecar.search_checks,
        };
        let parts = DatabaseParts {
            names: sidecar.names,
            vfh,
            esf,
            cvfh,
            cvfh_owners: sidecar.cvfh_owners,
            ourcvfh,
            ourcvfh_owners: sidecar.ourcvfh_owners,
            ourcvfh_frames: sidecar.ourcvfh_frames,
            clouds,
        };
        let db = Self::from_parts(parts, params).map_err(|e| PoseError::load(dir, e))?;

        log::info!("Loaded database with {} exemplars from {:?}", db.len(), dir);
        Ok(db)
    }
}

fn load_cloud(path: &Path) -> Option<Arc<vpose_3d::pointcloud::PointCloud>> {
    if !path.exists() {
        log::warn!("Exemplar cloud {:?} not found, refinement will skip it", path);
        return None;
    }
    match read_pcd(path) {
        Ok(cloud) => Some(Arc::new(cloud)),
        Err(e) => {
            log::warn!("Failed to read exemplar cloud {:?}: {}", path, e);
            None
        }
    }
}

fn write_matrix(path: &Path, kind: ListType, matrix: &FeatureMatrix) -> PoseResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let config = bincode::config::standard();

    bincode::encode_into_std_write(MATRIX_MAGIC, &mut writer, config)
        .map_err(|e| PoseError::Bincode(e.to_string()))?;
    bincode::encode_into_std_write(FORMAT_VERSION, &mut writer, config)
        .map_err(|e| PoseError::Bincode(e.to_string()))?;
    bincode::encode_into_std_write(kind.as_str(), &mut writer, config)
        .map_err(|e| PoseError::Bincode(e.to_string()))?;
    bincode::encode_into_std_write(matrix, &mut writer, config)
        .map_err(|e| PoseError::Bincode(e.to_string()))?;

    Ok(())
}

/// Read a matrix file and verify its header.
fn read_matrix(path: &Path, kind: ListType) -> Result<FeatureMatrix, String> {
    let file = File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);
    let config = bincode::config::standard();
    let corrupt = |e: bincode::error::DecodeError| format!("{}: {e}", path.display());

    let magic: u32 = bincode::decode_from_std_read(&mut reader, config).map_err(corrupt)?;
    if magic != MATRIX_MAGIC {
        return Err(format!("{}: bad magic number {magic:#x}", path.display()));
    }
    let version: u32 = bincode::decode_from_std_read(&mut reader, config).map_err(corrupt)?;
    if version != FORMAT_VERSION {
        return Err(format!("{}: unsupported version {version}", path.display()));
    }
    let tag: String = bincode::decode_from_std_read(&mut reader, config).map_err(corrupt)?;
    if tag != kind.as_str() {
        return Err(format!(
            "{}: holds {tag} descriptors, expected {kind}",
            path.display()
        ));
    }
    let matrix: FeatureMatrix = bincode::decode_from_std_read(&mut reader, config).map_err(corrupt)?;

    let expected = kind.dimension().unwrap_or_default();
    if matrix.cols() != expected {
        return Err(format!(
            "{}: {} columns, expected {expected}",
            path.display(),
            matrix.cols()
        ));
    }
    matrix
        .check_shape()
        .map_err(|e| format!("{}: {e}", path.display()))?;

    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{ramp_database, spike_descriptors};
    use crate::database::Exemplar;
    use vpose_3d::pointcloud::PointCloud;

    #[test]
    fn test_save_load_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("db");

        let cloud = Arc::new(PointCloud::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.5, 0.25]],
            None,
            None,
        ));
        let exemplars = vec![
            Exemplar {
                name: "mug_0_0".into(),
                descriptors: spike_descriptors(0, &[1, 2]),
                cloud: Some(cloud.clone()),
            },
            Exemplar {
                name: "mug_0_90".into(),
                descriptors: spike_descriptors(4, &[3]),
                cloud: None,
            },
        ];
        let db = PoseDatabase::from_exemplars(exemplars, IndexParams::default())?;
        db.save(&dir)?;

        let loaded = PoseDatabase::load(&dir)?;
        assert_eq!(loaded.names(), db.names());
        for kind in ListType::DESCRIPTORS {
            assert_eq!(loaded.matrix(kind)?, db.matrix(kind)?);
        }
        assert_eq!(loaded.cluster_owners(ListType::Cvfh)?, &[0, 0, 1]);
        assert_eq!(loaded.ourcvfh_frames().len(), 3);
        assert_eq!(loaded.cloud(0).map(|c| c.points().to_vec()), Some(cloud.points().to_vec()));
        assert!(loaded.cloud(1).is_none());
        assert_eq!(loaded.index_params(), IndexParams::default());
        Ok(())
    }

    #[test]
    fn test_save_refuses_overwrite() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let db = ramp_database(&[0.1, 0.2]);
        db.save(tmp.path())?;
        assert!(matches!(db.save(tmp.path()), Err(PoseError::Overwrite(_))));
        Ok(())
    }

    #[test]
    fn test_load_missing_directory() {
        assert!(matches!(
            PoseDatabase::load("/definitely/not/here"),
            Err(PoseError::Load { .. })
        ));
    }

    #[test]
    fn test_load_bad_magic() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        ramp_database(&[0.1]).save(tmp.path())?;
        std::fs::write(tmp.path().join("esf.bin"), [0u8; 16])?;
        assert!(matches!(
            PoseDatabase::load(tmp.path()),
            Err(PoseError::Load { reason, .. }) if reason.contains("esf.bin")
        ));
        Ok(())
    }

    #[test]
    fn test_load_swapped_descriptor_files() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        ramp_database(&[0.1]).save(tmp.path())?;
        std::fs::copy(tmp.path().join("cvfh.bin"), tmp.path().join("vfh.bin"))?;
        assert!(matches!(
            PoseDatabase::load(tmp.path()),
            Err(PoseError::Load { reason, .. }) if reason.contains("expected vfh")
        ));
        Ok(())
    }

    #[test]
    fn test_load_name_count_mismatch() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        ramp_database(&[0.1, 0.2]).save(tmp.path())?;
        let path = tmp.path().join(SIDECAR_FILE);
        let mut sidecar: Sidecar = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        sidecar.names.pop();
        std::fs::write(&path, serde_json::to_string(&sidecar)?)?;
        assert!(matches!(PoseDatabase::load(tmp.path()), Err(PoseError::Load { .. })));
        Ok(())
    }
}
