//! Global rank truncation of the concentration basis.

use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};

/// Number of leading singular values strictly above
/// `singular_values[0] · cut_off`. Singular values are descending.
pub fn cut_index(singular_values: ArrayView1<f64>, cut_off: f64) -> usize {
    let Some(&leading) = singular_values.get(0) else {
        return 0;
    };
    let floor = leading * cut_off;
    singular_values
        .iter()
        .take_while(|&&value| value > floor)
        .count()
}

/// `U[:, ..cut] · diag(1 / S[..cut])`: maps sensor data onto the truncated
/// global modes, scaled back to kernel units.
pub fn whitening(u: ArrayView2<f64>, singular_values: ArrayView1<f64>, cut: usize) -> Array2<f64> {
    let mut cut_us = u.slice(s![.., ..cut]).to_owned();
    for (mut column, &sigma) in cut_us
        .axis_iter_mut(Axis(1))
        .zip(singular_values.slice(s![..cut]).iter())
    {
        column.mapv_inplace(|value| value / sigma);
    }
    cut_us
}
