use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorSet, ListType};
use crate::error::{PoseError, PoseResult};

/// Parameters of a pose estimation session.
///
/// Values are validated when set through [`PoseConfig::set_param`] or
/// [`PoseConfig::init_params`], the string keys only exist at that boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoseConfig {
    /// 0 silent, 1 progress, 2 detailed.
    pub verbosity: u8,
    /// Derive the query viewpoint from its `<object>_<lat>_<lon>` name.
    pub compute_viewpoint_from_name: bool,
    /// Use the sensor origin stored in the query cloud as viewpoint.
    #[serde(rename = "useSOasViewpoint")]
    pub use_so_as_viewpoint: bool,
    /// Generate the VFH list.
    #[serde(rename = "useVFH")]
    pub use_vfh: bool,
    /// Generate the ESF list.
    #[serde(rename = "useESF")]
    pub use_esf: bool,
    /// Generate the CVFH list.
    #[serde(rename = "useCVFH")]
    pub use_cvfh: bool,
    /// Generate the OURCVFH list.
    #[serde(rename = "useOURCVFH")]
    pub use_ourcvfh: bool,
    /// Candidates kept per descriptor list.
    pub k_neighbors: usize,
    /// Fusion weight of the VFH list.
    pub vfh_weight: f32,
    /// Fusion weight of the ESF list.
    pub esf_weight: f32,
    /// Fusion weight of the CVFH list.
    pub cvfh_weight: f32,
    /// Fusion weight of the OURCVFH list.
    pub ourcvfh_weight: f32,
    /// Candidates refined in the first progressive round.
    pub refine_candidates: usize,
    /// Maximum number of progressive refinement rounds.
    #[serde(rename = "progItera")]
    pub progressive_iterations: usize,
    /// RMSE at or below which refinement stops early.
    pub rmse_threshold: f64,
    /// RMSEs closer than this are considered tied.
    pub rmse_tie_epsilon: f64,
    /// Iteration cap of the default ICP aligner.
    pub icp_max_iterations: usize,
    /// RMSE change below which the default ICP aligner stops.
    pub icp_tolerance: f64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            compute_viewpoint_from_name: false,
            use_so_as_viewpoint: true,
            use_vfh: true,
            use_esf: true,
            use_cvfh: true,
            use_ourcvfh: true,
            k_neighbors: 20,
            vfh_weight: 1.0,
            esf_weight: 1.0,
            cvfh_weight: 1.0,
            ourcvfh_weight: 1.0,
            refine_candidates: 3,
            progressive_iterations: 5,
            rmse_threshold: 0.003,
            rmse_tie_epsilon: 1e-6,
            icp_max_iterations: 50,
            icp_tolerance: 1e-8,
        }
    }
}

fn invalid(key: &str, value: f64, reason: &'static str) -> PoseError {
    PoseError::InvalidParameter {
        key: key.to_string(),
        value,
        reason,
    }
}

fn as_bool(key: &str, value: f64) -> PoseResult<bool> {
    if value == 0.0 {
        Ok(false)
    } else if value == 1.0 {
        Ok(true)
    } else {
        Err(invalid(key, value, "expected 0 or 1"))
    }
}

fn as_count(key: &str, value: f64, min: usize) -> PoseResult<usize> {
    if !value.is_finite() || value.fract() != 0.0 || value < 0.0 {
        return Err(invalid(key, value, "expected a non-negative integer"));
    }
    if value < min as f64 {
        return Err(invalid(key, value, "below the minimum"));
    }
    Ok(value as usize)
}

fn as_non_negative(key: &str, value: f64) -> PoseResult<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(key, value, "expected a finite non-negative number"));
    }
    Ok(value)
}

impl PoseConfig {
    /// Every key accepted by [`PoseConfig::set_param`].
    pub const KEYS: [&'static str; 18] = [
        "verbosity",
        "computeViewpointFromName",
        "useSOasViewpoint",
        "useVFH",
        "useESF",
        "useCVFH",
        "useOURCVFH",
        "kNeighbors",
        "vfhWeight",
        "esfWeight",
        "cvfhWeight",
        "ourcvfhWeight",
        "refineCandidates",
        "progItera",
        "rmseThreshold",
        "rmseTieEpsilon",
        "icpMaxIterations",
        "icpTolerance",
    ];

    /// Set one parameter by name. Nothing changes on error.
    pub fn set_param(&mut self, key: &str, value: f64) -> PoseResult<()> {
        match key {
            "verbosity" => {
                let v = as_count(key, value, 0)?;
                if v > 2 {
                    return Err(invalid(key, value, "expected 0, 1 or 2"));
                }
                self.verbosity = v as u8;
            }
            "computeViewpointFromName" => self.compute_viewpoint_from_name = as_bool(key, value)?,
            "useSOasViewpoint" => self.use_so_as_viewpoint = as_bool(key, value)?,
            "useVFH" => self.use_vfh = as_bool(key, value)?,
            "useESF" => self.use_esf = as_bool(key, value)?,
            "useCVFH" => self.use_cvfh = as_bool(key, value)?,
            "useOURCVFH" => self.use_ourcvfh = as_bool(key, value)?,
            "kNeighbors" => self.k_neighbors = as_count(key, value, 1)?,
            "vfhWeight" => self.vfh_weight = as_non_negative(key, value)? as f32,
            "esfWeight" => self.esf_weight = as_non_negative(key, value)? as f32,
            "cvfhWeight" => self.cvfh_weight = as_non_negative(key, value)? as f32,
            "ourcvfhWeight" => self.ourcvfh_weight = as_non_negative(key, value)? as f32,
            "refineCandidates" => self.refine_candidates = as_count(key, value, 1)?,
            "progItera" => self.progressive_iterations = as_count(key, value, 1)?,
            "rmseThreshold" => self.rmse_threshold = as_non_negative(key, value)?,
            "rmseTieEpsilon" => self.rmse_tie_epsilon = as_non_negative(key, value)?,
            "icpMaxIterations" => self.icp_max_iterations = as_count(key, value, 1)?,
            "icpTolerance" => self.icp_tolerance = as_non_negative(key, value)?,
            _ => return Err(PoseError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }

    /// Apply every parameter found in a configuration file.
    ///
    /// `.json` files hold an object of key to number (booleans are accepted),
    /// `.conf`/`.config` files hold `key=value` lines with `#` comments.
    /// Either all parameters are applied or none.
    pub fn init_params(&mut self, path: impl AsRef<Path>) -> PoseResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let pairs = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => parse_json(&text)?,
            Some("conf") | Some("config") => parse_key_values(&text)?,
            _ => {
                return Err(PoseError::load(
                    path,
                    "configuration files must have a .json, .conf or .config extension",
                ))
            }
        };

        let mut updated = self.clone();
        for (key, value) in &pairs {
            updated.set_param(key, *value)?;
        }
        *self = updated;

        log::debug!("Applied {} parameters from {:?}", pairs.len(), path);
        Ok(())
    }

    /// Load a configuration file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> PoseResult<Self> {
        let mut config = Self::default();
        config.init_params(path)?;
        Ok(config)
    }

    /// Enabled descriptor types.
    pub fn enabled_descriptors(&self) -> DescriptorSet {
        let mut set = DescriptorSet::default();
        for (kind, on) in [
            (ListType::Vfh, self.use_vfh),
            (ListType::Esf, self.use_esf),
            (ListType::Cvfh, self.use_cvfh),
            (ListType::OurCvfh, self.use_ourcvfh),
        ] {
            if on {
                set.insert(kind);
            }
        }
        set
    }

    /// Fusion weights indexed like [`ListType::DESCRIPTORS`].
    pub fn weights(&self) -> [f32; 4] {
        [
            self.vfh_weight,
            self.esf_weight,
            self.cvfh_weight,
            self.ourcvfh_weight,
        ]
    }
}

fn parse_json(text: &str) -> PoseResult<Vec<(String, f64)>> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
    map.into_iter()
        .map(|(key, value)| {
            let number = match &value {
                serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                v => v.as_f64(),
            };
            number
                .map(|n| (key.clone(), n))
                .ok_or(PoseError::InvalidParameter {
                    key,
                    value: f64::NAN,
                    reason: "expected a number",
                })
        })
        .collect()
}

fn parse_key_values(text: &str) -> PoseResult<Vec<(String, f64)>> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(PoseError::UnknownParameter(line.to_string()));
        };
        let key = key.trim();
        let value = value.trim().parse::<f64>().map_err(|_| PoseError::InvalidParameter {
            key: key.to_string(),
            value: f64::NAN,
            reason: "expected a number",
        })?;
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

impl fmt::Display for PoseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "verbosity={}", self.verbosity)?;
        writeln!(f, "computeViewpointFromName={}", self.compute_viewpoint_from_name as u8)?;
        writeln!(f, "useSOasViewpoint={}", self.use_so_as_viewpoint as u8)?;
        writeln!(f, "useVFH={}", self.use_vfh as u8)?;
        writeln!(f, "useESF={}", self.use_esf as u8)?;
        writeln!(f, "useCVFH={}", self.use_cvfh as u8)?;
        writeln!(f, "useOURCVFH={}", self.use_ourcvfh as u8)?;
        writeln!(f, "kNeighbors={}", self.k_neighbors)?;
        writeln!(f, "vfhWeight={}", self.vfh_weight)?;
        writeln!(f, "esfWeight={}", self.esf_weight)?;
        writeln!(f, "cvfhWeight={}", self.cvfh_weight)?;
        writeln!(f, "ourcvfhWeight={}", self.ourcvfh_weight)?;
        writeln!(f, "refineCandidates={}", self.refine_candidates)?;
        writeln!(f, "progItera={}", self.progressive_iterations)?;
        writeln!(f, "rmseThreshold={}", self.rmse_threshold)?;
        writeln!(f, "rmseTieEpsilon={}", self.rmse_tie_epsilon)?;
        writeln!(f, "icpMaxIterations={}", self.icp_max_iterations)?;
        write!(f, "icpTolerance={}", self.icp_tolerance)
    }
}
