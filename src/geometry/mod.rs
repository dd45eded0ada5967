//! Voxel centroid geometry: grid spacing, implied source volume and ROI
//! neighbour search.

pub mod neighbours;

pub use neighbours::{search_for, BallSearch, NearestSearch, NeighbourSearch, Roi};

use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{LocalizeError, LocalizeResult};

/// Characteristic grid spacing: the smallest nearest-neighbour distance
/// between any two voxel centroids.
pub fn voxel_spacing(centroids: ArrayView2<f64>) -> LocalizeResult<f64> {
    ensure_centroid_shape(centroids)?;
    let voxels = centroids.nrows();
    if voxels < 2 {
        return Err(LocalizeError::DataFormat(format!(
            "voxel spacing needs at least two centroids, got {voxels}"
        )));
    }

    let spacing = (0..voxels)
        .into_par_iter()
        .map(|i| {
            let origin = centroids.row(i);
            (0..voxels)
                .filter(|&j| j != i)
                .map(|j| squared_distance(origin, centroids.row(j)))
                .fold(f64::INFINITY, f64::min)
        })
        .reduce(|| f64::INFINITY, f64::min)
        .sqrt();

    if !(spacing.is_finite() && spacing > 0.0) {
        return Err(LocalizeError::DataFormat(format!(
            "voxel centroids must be distinct and finite (minimum spacing {spacing})"
        )));
    }
    Ok(spacing)
}

/// Volume implied by `voxels` cubes of side `spacing`.
pub fn source_volume(voxels: usize, spacing: f64) -> f64 {
    voxels as f64 * spacing.powi(3)
}

pub(crate) fn ensure_centroid_shape(centroids: ArrayView2<f64>) -> LocalizeResult<()> {
    if centroids.len_of(Axis(1)) != 3 {
        return Err(LocalizeError::consistency(
            "centroid columns",
            3,
            centroids.ncols(),
        ));
    }
    Ok(())
}

#[inline]
pub(crate) fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}
