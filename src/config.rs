//! Study configuration via TOML files.
//!
//! Only path and scheduling fields get defaults. The numeric parameters that
//! shape the result (`roi_volume`, `cut_off`, `threshold`) must be given
//! explicitly; [`StudyConfig::validate`] rejects a config missing any of them.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use toml::Value;

use crate::error::{LocalizeError, LocalizeResult};

const DEFAULT_DIR: &str = ".";
const DEFAULT_BATCH_SIZE: usize = 32;

/// ROI neighbour selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Neighbourhood {
    /// Every voxel inside the ball whose volume equals the ROI volume.
    #[default]
    Ball,
    /// The ROI-volume-equivalent number of nearest voxels.
    Nearest,
}

impl FromStr for Neighbourhood {
    type Err = LocalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ball" | "radius" => Ok(Neighbourhood::Ball),
            "nearest" | "knn" => Ok(Neighbourhood::Nearest),
            other => Err(LocalizeError::Configuration(format!(
                "unknown neighbourhood policy '{other}' (expected \"ball\" or \"nearest\")"
            ))),
        }
    }
}

/// Options recognised by the concentration solver.
#[derive(Debug, Clone, Serialize)]
pub struct ConcentrationConfig {
    /// ROI search volume, in the cubed units of the voxel centroids
    pub roi_volume: Option<f64>,
    /// Neighbour selection policy
    pub neighbourhood: Neighbourhood,
    /// Directory holding the concentration file
    pub dir: PathBuf,
    /// Concentration file name
    pub filename: Option<String>,
    /// Voxels decomposed per parallel batch before their records are written
    pub batch_size: usize,
    /// Expected sensor count; checked against the kernel when given
    pub channels: Option<usize>,
}

impl Default for ConcentrationConfig {
    fn default() -> Self {
        Self {
            roi_volume: None,
            neighbourhood: Neighbourhood::default(),
            dir: PathBuf::from(DEFAULT_DIR),
            filename: None,
            batch_size: DEFAULT_BATCH_SIZE,
            channels: None,
        }
    }
}

impl ConcentrationConfig {
    pub fn validate(&self) -> LocalizeResult<()> {
        let roi_volume = self.roi_volume.ok_or_else(|| {
            LocalizeError::Configuration("concentration.roi_volume is not set".into())
        })?;
        if !roi_volume.is_finite() || roi_volume <= 0.0 {
            return Err(LocalizeError::Configuration(format!(
                "concentration.roi_volume must be a positive finite number, got {roi_volume}"
            )));
        }
        self.artifact_path()?;
        if self.batch_size == 0 {
            return Err(LocalizeError::Configuration(
                "concentration.batch_size must be >= 1".into(),
            ));
        }
        if self.channels == Some(0) {
            return Err(LocalizeError::Configuration(
                "concentration.channels must be >= 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Location of the concentration file (`dir/filename`).
    pub fn artifact_path(&self) -> LocalizeResult<PathBuf> {
        match self.filename.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Ok(self.dir.join(name)),
            _ => Err(LocalizeError::Configuration(
                "concentration.filename is not set".into(),
            )),
        }
    }
}

/// Options recognised by the power localizer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalizeConfig {
    /// Fraction of the leading singular value below which global modes are cut
    pub cut_off: Option<f64>,
    /// Minimum leading concentration eigenvalue for a voxel to be accepted
    pub threshold: Option<f64>,
}

impl LocalizeConfig {
    pub fn validate(&self) -> LocalizeResult<()> {
        let cut_off = self
            .cut_off
            .ok_or_else(|| LocalizeError::Configuration("localize.cut_off is not set".into()))?;
        if !(0.0..1.0).contains(&cut_off) {
            return Err(LocalizeError::Configuration(format!(
                "localize.cut_off must be in [0, 1), got {cut_off}"
            )));
        }
        let threshold = self
            .threshold
            .ok_or_else(|| LocalizeError::Configuration("localize.threshold is not set".into()))?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(LocalizeError::Configuration(format!(
                "localize.threshold must be in [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Full study configuration loaded from TOML.
///
/// ```toml
/// [concentration]
/// roi_volume = 2.0
/// neighbourhood = "ball"
/// dir = "artifacts"
/// filename = "head.cev"
///
/// [localize]
/// cut_off = 0.01
/// threshold = 0.9
/// ```
#[derive(Debug, Clone, Default, Serialize)]
pub struct StudyConfig {
    pub concentration: ConcentrationConfig,
    pub localize: LocalizeConfig,
}

impl StudyConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> LocalizeResult<Self> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(toml_str: &str) -> LocalizeResult<Self> {
        let value: Value = toml::from_str(toml_str)?;

        let table = value
            .get("concentration")
            .and_then(|v| v.as_table())
            .cloned()
            .unwrap_or_default();
        let defaults = ConcentrationConfig::default();
        let concentration = ConcentrationConfig {
            roi_volume: number(table.get("roi_volume"), "concentration.roi_volume")?,
            neighbourhood: table
                .get("neighbourhood")
                .and_then(|v| v.as_str())
                .map(Neighbourhood::from_str)
                .transpose()?
                .unwrap_or(defaults.neighbourhood),
            dir: table
                .get("dir")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            filename: table
                .get("filename")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            batch_size: count(table.get("batch_size"), "concentration.batch_size")?
                .unwrap_or(defaults.batch_size),
            channels: count(table.get("channels"), "concentration.channels")?,
        };

        let table = value
            .get("localize")
            .and_then(|v| v.as_table())
            .cloned()
            .unwrap_or_default();
        let localize = LocalizeConfig {
            cut_off: number(table.get("cut_off"), "localize.cut_off")?,
            threshold: number(table.get("threshold"), "localize.threshold")?,
        };

        Ok(Self {
            concentration,
            localize,
        })
    }

    pub fn validate(&self) -> LocalizeResult<()> {
        self.concentration.validate()?;
        self.localize.validate()
    }
}

fn number(value: Option<&Value>, key: &str) -> LocalizeResult<Option<f64>> {
    match value {
        None => Ok(None),
        Some(value) => {
            if let Some(float) = value.as_float() {
                Ok(Some(float))
            } else if let Some(int) = value.as_integer() {
                Ok(Some(int as f64))
            } else {
                Err(LocalizeError::Configuration(format!(
                    "{key} must be a number"
                )))
            }
        }
    }
}

fn count(value: Option<&Value>, key: &str) -> LocalizeResult<Option<usize>> {
    match value {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .filter(|v| *v >= 0)
            .map(|v| Some(v as usize))
            .ok_or_else(|| {
                LocalizeError::Configuration(format!("{key} must be a non-negative integer"))
            }),
    }
}
