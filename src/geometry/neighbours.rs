//! ROI neighbour search over voxel centroids.
//!
//! Both policies are exact linear scans. The voxel count of a source grid
//! is small enough that the scan is dominated by the per-voxel SVD that
//! follows it.

use std::f64::consts::PI;

use ndarray::ArrayView2;
use serde::Serialize;

use super::squared_distance;
use crate::config::Neighbourhood;

/// Relative slack on the ball radius so voxels lying exactly on the
/// boundary of a regular grid are not lost to rounding.
const RADIUS_SLACK: f64 = 1e-9;

/// A voxel's region of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roi {
    /// 0-based kernel column indices, three per ROI voxel, ascending
    pub columns: Vec<u32>,
    /// 1-based voxel identities, ascending
    pub voxels: Vec<u32>,
}

impl Roi {
    /// Build an ROI from 1-based voxel identities.
    pub fn from_voxels(mut voxels: Vec<u32>) -> Self {
        voxels.sort_unstable();
        voxels.dedup();
        let columns = voxels
            .iter()
            .flat_map(|&voxel| {
                let base = 3 * (voxel - 1);
                [base, base + 1, base + 2]
            })
            .collect();
        Self { columns, voxels }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }
}

/// Neighbour selection for the concentration solver.
///
/// `voxel` is 1-based; `centroids` is `voxels × 3`.
pub trait NeighbourSearch: Send + Sync {
    fn neighbours(
        &self,
        roi_volume: f64,
        voxel: u32,
        centroids: ArrayView2<f64>,
        spacing: f64,
        source_volume: f64,
    ) -> Roi;
}

/// Every voxel whose centroid lies within the ball of volume `roi_volume`
/// centred on the target voxel.
#[derive(Debug, Clone, Copy, Default)]
pub struct BallSearch;

impl BallSearch {
    pub fn radius(roi_volume: f64) -> f64 {
        (3.0 * roi_volume / (4.0 * PI)).cbrt()
    }
}

impl NeighbourSearch for BallSearch {
    fn neighbours(
        &self,
        roi_volume: f64,
        voxel: u32,
        centroids: ArrayView2<f64>,
        _spacing: f64,
        _source_volume: f64,
    ) -> Roi {
        let radius = Self::radius(roi_volume) * (1.0 + RADIUS_SLACK);
        let limit = radius * radius;
        let centre = centroids.row(voxel as usize - 1);

        let voxels = centroids
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(idx, row)| {
                *idx + 1 == voxel as usize || squared_distance(centre, *row) <= limit
            })
            .map(|(idx, _)| idx as u32 + 1)
            .collect();
        Roi::from_voxels(voxels)
    }
}

/// The `roi_volume / spacing³` nearest voxels, ties broken by lower index.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestSearch;

impl NearestSearch {
    pub fn count(roi_volume: f64, voxels: usize, source_volume: f64) -> usize {
        let expected = roi_volume / source_volume * voxels as f64;
        if expected.is_finite() {
            (expected.round() as usize).clamp(1, voxels.max(1))
        } else {
            voxels.max(1)
        }
    }
}

impl NeighbourSearch for NearestSearch {
    fn neighbours(
        &self,
        roi_volume: f64,
        voxel: u32,
        centroids: ArrayView2<f64>,
        _spacing: f64,
        source_volume: f64,
    ) -> Roi {
        let k = Self::count(roi_volume, centroids.nrows(), source_volume);
        let centre = centroids.row(voxel as usize - 1);

        let mut scored: Vec<(usize, f64)> = centroids
            .rows()
            .into_iter()
            .enumerate()
            .map(|(idx, row)| (idx, squared_distance(centre, row)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let voxels = scored
            .into_iter()
            .take(k)
            .map(|(idx, _)| idx as u32 + 1)
            .collect();
        Roi::from_voxels(voxels)
    }
}

pub fn search_for(policy: Neighbourhood) -> Box<dyn NeighbourSearch> {
    match policy {
        Neighbourhood::Ball => Box::new(BallSearch),
        Neighbourhood::Nearest => Box::new(NearestSearch),
    }
}
