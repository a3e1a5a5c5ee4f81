//! Absolute coefficient covariance from stored correlations and formal errors.
//!
//! Archive formats have used three different scalings of the stored formal errors,
//! so the convention is always an explicit argument.

use crate::linalg::faer_ndarray::is_symmetric_with_tolerance;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SYMMETRY_REL_TOL: f64 = 1e-9;
const SYMMETRY_ABS_TOL: f64 = 1e-12;
const UNIT_DIAGONAL_TOL: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum CovarianceError {
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix is not symmetric")]
    NotSymmetric,
    #[error("matrix contains non-finite values")]
    NonFinite,
    #[error("correlation diagonal entry {index} is {value}, expected 1")]
    NonUnitDiagonal { index: usize, value: f64 },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("standard deviation must be positive and finite, got {0}")]
    InvalidStandardDeviation(f64),
    #[error("degrees of freedom ({dof}) must exceed the number of parameters ({n_parameters})")]
    InsufficientDegreesOfFreedom { dof: u32, n_parameters: usize },
    #[error("packed correlation array of length {len} does not fit a {n}x{n} matrix")]
    PackedLength { len: usize, n: usize },
}

/// How the record's standard deviation scales `errors[i] * errors[j] * corr[i][j]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CovarianceConvention {
    /// Formal errors are already absolute; scale = 1.
    Unscaled,
    /// Formal errors are unit-weight errors; scale = sigma^2.
    #[default]
    StandardDeviationSquared,
    /// Unit-weight errors with a small-sample correction;
    /// scale = sigma^2 * dof / (dof - n).
    DegreesOfFreedomCorrected { degrees_of_freedom: u32 },
}

impl CovarianceConvention {
    pub fn scale(self, standard_deviation: f64, n_parameters: usize) -> Result<f64, CovarianceError> {
        if !(standard_deviation.is_finite() && standard_deviation > 0.0) {
            return Err(CovarianceError::InvalidStandardDeviation(standard_deviation));
        }
        match self {
            CovarianceConvention::Unscaled => Ok(1.0),
            CovarianceConvention::StandardDeviationSquared => {
                Ok(standard_deviation * standard_deviation)
            }
            CovarianceConvention::DegreesOfFreedomCorrected { degrees_of_freedom } => {
                let dof = degrees_of_freedom as usize;
                if dof <= n_parameters {
                    return Err(CovarianceError::InsufficientDegreesOfFreedom {
                        dof: degrees_of_freedom,
                        n_parameters,
                    });
                }
                Ok(standard_deviation * standard_deviation * dof as f64
                    / (dof - n_parameters) as f64)
            }
        }
    }
}

fn check_square_symmetric<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<usize, CovarianceError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(CovarianceError::NotSquare { rows, cols });
    }
    if !matrix.iter().all(|v| v.is_finite()) {
        return Err(CovarianceError::NonFinite);
    }
    if !is_symmetric_with_tolerance(matrix, SYMMETRY_REL_TOL, SYMMETRY_ABS_TOL) {
        return Err(CovarianceError::NotSymmetric);
    }
    Ok(rows)
}

/// Checks an externally supplied covariance matrix.
pub fn validate_covariance<S: Data<Elem = f64>>(
    covariance: &ArrayBase<S, Ix2>,
) -> Result<(), CovarianceError> {
    check_square_symmetric(covariance).map(|_| ())
}

/// Checks a correlation matrix against its formal errors.
pub fn validate_correlation<S1, S2>(
    correlation: &ArrayBase<S1, Ix2>,
    formal_errors: &ArrayBase<S2, Ix1>,
) -> Result<(), CovarianceError>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let n = check_square_symmetric(correlation)?;
    if formal_errors.len() != n {
        return Err(CovarianceError::DimensionMismatch {
            expected: n,
            found: formal_errors.len(),
        });
    }
    if !formal_errors.iter().all(|v| v.is_finite()) {
        return Err(CovarianceError::NonFinite);
    }
    for i in 0..n {
        let value = correlation[[i, i]];
        if (value - 1.0).abs() > UNIT_DIAGONAL_TOL {
            return Err(CovarianceError::NonUnitDiagonal { index: i, value });
        }
    }
    Ok(())
}

/// `Cov[i][j] = corr[i][j] * e[i] * e[j] * scale(sigma, convention)`.
pub fn to_covariance<S1, S2>(
    correlation: &ArrayBase<S1, Ix2>,
    formal_errors: &ArrayBase<S2, Ix1>,
    standard_deviation: f64,
    convention: CovarianceConvention,
) -> Result<Array2<f64>, CovarianceError>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    validate_correlation(correlation, formal_errors)?;
    let n = formal_errors.len();
    let scale = convention.scale(standard_deviation, n)?;
    let mut cov = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let ei = formal_errors[i] * scale;
        for j in 0..n {
            cov[[i, j]] = correlation[[i, j]] * ei * formal_errors[j];
        }
    }
    // enforce exact symmetry after the scaled products
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (cov[[i, j]] + cov[[j, i]]);
            cov[[i, j]] = avg;
            cov[[j, i]] = avg;
        }
    }
    Ok(cov)
}

/// Rebuilds a full correlation matrix from the packed lower triangle archives store.
///
/// `values` holds either the strict lower triangle (`n(n-1)/2` entries, unit
/// diagonal implied) or the lower triangle including the diagonal
/// (`n(n+1)/2` entries), both in row-major order.
pub fn unpack_correlations(values: &[f64], n: usize) -> Result<Array2<f64>, CovarianceError> {
    let strict = n * n.saturating_sub(1) / 2;
    let with_diagonal = n * (n + 1) / 2;
    let includes_diagonal = if values.len() == strict {
        false
    } else if values.len() == with_diagonal {
        true
    } else {
        return Err(CovarianceError::PackedLength {
            len: values.len(),
            n,
        });
    };

    let mut out = Array2::<f64>::eye(n);
    let mut it = values.iter().copied();
    for i in 0..n {
        let upper = if includes_diagonal { i + 1 } else { i };
        for j in 0..upper {
            // length was checked above
            let v = it.next().unwrap_or(f64::NAN);
            out[[i, j]] = v;
            out[[j, i]] = v;
        }
    }
    Ok(out)
}

/// Formal errors times the convention scale square-rooted, i.e. the absolute
/// one-sigma uncertainty of each coefficient.
pub fn absolute_errors(
    formal_errors: &Array1<f64>,
    standard_deviation: f64,
    convention: CovarianceConvention,
) -> Result<Array1<f64>, CovarianceError> {
    let scale = convention.scale(standard_deviation, formal_errors.len())?;
    Ok(formal_errors.mapv(|e| e.abs() * scale.sqrt()))
}
