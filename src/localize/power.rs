//! Localized power output, `frequency × time × voxel`.

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::Serialize;

/// Value held by every cell of a voxel whose ROI leaks too much energy.
///
/// Strictly positive so log-scale displays and power ratios stay defined.
pub const LEAKAGE_SENTINEL: f64 = f64::MIN_POSITIVE;

/// Run statistics of one localization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalizationSummary {
    pub voxels: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub cut_index: usize,
    pub channels: usize,
    pub tapers: usize,
    pub frequencies: usize,
    pub windows: usize,
}

/// Per-voxel power estimates plus which voxels fell back to the sentinel.
#[derive(Debug, Clone)]
pub struct PowerMap {
    power: Array3<f64>,
    rejected: Vec<bool>,
    summary: LocalizationSummary,
}

impl PowerMap {
    pub(crate) fn new(frequencies: usize, windows: usize, voxels: usize) -> Self {
        Self {
            power: Array3::from_elem((frequencies, windows, voxels), LEAKAGE_SENTINEL),
            rejected: vec![true; voxels],
            summary: LocalizationSummary::default(),
        }
    }

    /// Store the `frequency × time` estimate of a 1-based voxel.
    pub(crate) fn accept(&mut self, voxel: u32, estimate: &Array2<f64>) {
        let idx = voxel as usize - 1;
        self.power.slice_mut(s![.., .., idx]).assign(estimate);
        self.rejected[idx] = false;
    }

    /// Fill a 1-based voxel with the sentinel.
    pub(crate) fn reject(&mut self, voxel: u32) {
        let idx = voxel as usize - 1;
        self.power.slice_mut(s![.., .., idx]).fill(LEAKAGE_SENTINEL);
        self.rejected[idx] = true;
    }

    pub(crate) fn set_summary(&mut self, summary: LocalizationSummary) {
        self.summary = summary;
    }

    pub fn power(&self) -> &Array3<f64> {
        &self.power
    }

    pub fn into_power(self) -> Array3<f64> {
        self.power
    }

    pub fn summary(&self) -> &LocalizationSummary {
        &self.summary
    }

    pub fn voxels(&self) -> usize {
        self.power.len_of(Axis(2))
    }

    /// `frequency × time` estimate of a 1-based voxel; `None` outside
    /// `1..=voxels`.
    pub fn voxel(&self, voxel: u32) -> Option<ArrayView2<f64>> {
        let idx = (voxel as usize).checked_sub(1)?;
        (idx < self.voxels()).then(|| self.power.index_axis(Axis(2), idx))
    }

    /// Voxels outside `1..=voxels` count as rejected.
    pub fn is_rejected(&self, voxel: u32) -> bool {
        (voxel as usize)
            .checked_sub(1)
            .and_then(|idx| self.rejected.get(idx).copied())
            .unwrap_or(true)
    }

    /// 1-based identities of all rejected voxels, ascending.
    pub fn rejected_voxels(&self) -> Vec<u32> {
        self.rejected
            .iter()
            .enumerate()
            .filter(|(_, rejected)| **rejected)
            .map(|(idx, _)| idx as u32 + 1)
            .collect()
    }

    /// Power in decibels; rejected voxels map to the sentinel's dB value.
    pub fn to_decibels(&self) -> Array3<f64> {
        self.power.mapv(|value| 10.0 * value.log10())
    }
}
