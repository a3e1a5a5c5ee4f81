use crate::linalg::faer_ndarray::fast_ab;
use crate::model::BandModel;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1};
use std::f64::consts::PI;

/// Grids at least this long are evaluated on the rayon pool.
const PARALLEL_MIN_POINTS: usize = 256;

/// Writes the normalised Hermite functions psi_0..psi_{n-1} at `x` into `out`.
///
/// psi_0 = pi^(-1/4) exp(-x^2/2), psi_1 = sqrt(2) x psi_0,
/// psi_k = sqrt(2/k) x psi_{k-1} - sqrt((k-1)/k) psi_{k-2}.
#[inline]
pub fn hermite_functions_into(x: f64, out: &mut [f64]) {
    let n = out.len();
    if n == 0 {
        return;
    }
    out[0] = PI.powf(-0.25) * (-0.5 * x * x).exp();
    if n > 1 {
        out[1] = std::f64::consts::SQRT_2 * x * out[0];
    }
    for k in 2..n {
        let kf = k as f64;
        out[k] = (2.0 / kf).sqrt() * x * out[k - 1] - ((kf - 1.0) / kf).sqrt() * out[k - 2];
    }
}

pub fn hermite_functions(n: usize, x: f64) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(n);
    if let Some(slice) = out.as_slice_mut() {
        hermite_functions_into(x, slice);
    }
    out
}

/// Value of `sum_k series[k] psi_k(x)`.
pub fn evaluate_hermite_series<S: Data<Elem = f64>>(series: &ArrayBase<S, Ix1>, x: f64) -> f64 {
    let mut values = vec![0.0; series.len()];
    hermite_functions_into(x, &mut values);
    series.iter().zip(values.iter()).map(|(a, b)| a * b).sum()
}

/// Hermite functions sampled on `xs`, one row per grid point (m x n).
pub fn hermite_function_rows(n: usize, xs: &[f64]) -> Array2<f64> {
    let mut rows = Array2::<f64>::zeros((xs.len(), n));
    if n == 0 {
        return rows;
    }
    if xs.len() >= PARALLEL_MIN_POINTS {
        rows.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(xs.par_iter().copied())
            .for_each(|(mut row, x)| {
                if let Some(slice) = row.as_slice_mut() {
                    hermite_functions_into(x, slice);
                }
            });
    } else {
        for (mut row, &x) in rows.axis_iter_mut(Axis(0)).zip(xs.iter()) {
            if let Some(slice) = row.as_slice_mut() {
                hermite_functions_into(x, slice);
            }
        }
    }
    rows
}

/// Design matrix of one band on a pseudo-wavelength grid.
///
/// Shape is n x m with `D[i][j] = sum_k T[i][k] psi_k(x_j)` where `T` is the
/// band's basis transformation and `x_j` the rescaled grid point. Row i is the
/// i-th basis function, so flux is `D^T c` for a coefficient vector `c`.
pub fn build_design_matrix(band: &BandModel, pseudo_grid: &[f64]) -> Array2<f64> {
    let n = band.n_bases();
    let xs: Vec<f64> = pseudo_grid
        .iter()
        .map(|&u| band.domain.pseudo_to_hermite(u))
        .collect();
    let psi_rows = hermite_function_rows(n, &xs);
    fast_ab(&band.transformation, &psi_rows.t())
}
