//! Dense decompositions on `ndarray` data, backed by nalgebra.

use nalgebra::{DMatrix, SVD};
use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{LocalizeError, LocalizeResult};

/// Economy SVD `a = u · diag(singular_values) · vᵀ`, singular values
/// descending. With `a` of shape `m × n` and `k = min(m, n)`, `u` is `m × k`
/// and `v` is `n × k`.
#[derive(Debug, Clone)]
pub struct ThinSvd {
    pub u: Array2<f64>,
    pub singular_values: Array1<f64>,
    pub v: Array2<f64>,
}

pub fn thin_svd(a: ArrayView2<f64>) -> LocalizeResult<ThinSvd> {
    let (rows, cols) = a.dim();
    if rows == 0 || cols == 0 {
        return Err(LocalizeError::Numerical(format!(
            "cannot decompose an empty {rows}x{cols} matrix"
        )));
    }
    if a.iter().any(|value| !value.is_finite()) {
        return Err(LocalizeError::Numerical(
            "matrix contains non-finite entries".into(),
        ));
    }

    let matrix = DMatrix::from_fn(rows, cols, |i, j| a[[i, j]]);
    let svd = SVD::try_new(matrix, true, true, f64::EPSILON, 0).ok_or_else(|| {
        LocalizeError::Numerical(format!("SVD of {rows}x{cols} matrix did not converge"))
    })?;
    let u = svd
        .u
        .ok_or_else(|| LocalizeError::Numerical("SVD did not return U".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| LocalizeError::Numerical("SVD did not return V^T".into()))?;
    let sigma = svd.singular_values;

    // Descending order, whatever the backend returned.
    let k = sigma.len();
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| {
        sigma[b]
            .partial_cmp(&sigma[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let singular_values = Array1::from_iter(order.iter().map(|&idx| sigma[idx]));
    let u = Array2::from_shape_fn((rows, k), |(i, j)| u[(i, order[j])]);
    let v = Array2::from_shape_fn((cols, k), |(i, j)| v_t[(order[j], i)]);

    Ok(ThinSvd {
        u,
        singular_values,
        v,
    })
}

/// Column-major flattening, the on-disk matrix layout.
pub fn to_column_major(a: ArrayView2<f64>) -> Vec<f64> {
    a.t().iter().copied().collect()
}

pub fn from_column_major(rows: usize, cols: usize, data: Vec<f64>) -> LocalizeResult<Array2<f64>> {
    use ndarray::ShapeBuilder;

    Array2::from_shape_vec((rows, cols).f(), data).map_err(|err| {
        LocalizeError::DataFormat(format!("cannot shape {rows}x{cols} matrix: {err}"))
    })
}
