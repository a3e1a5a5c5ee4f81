//! Linear map from one band's coefficients and covariance onto a sampled curve.

use crate::covariance::{CovarianceConvention, CovarianceError, to_covariance};
use crate::linalg::faer_ndarray::{fast_ab, fast_atb, fast_atv};
use crate::types::{Band, BasisCoefficientRecord, CoefficientUncertainty, SampledBandSpectrum};
use ndarray::{Array1, Array2, ArrayView1, s};

/// Coefficients at index `>= n_relevant_bases` are treated as exactly zero when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub enabled: bool,
    pub n_relevant_bases: usize,
}

impl Truncation {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            n_relevant_bases: usize::MAX,
        }
    }

    pub fn at(n_relevant_bases: usize) -> Self {
        Self {
            enabled: true,
            n_relevant_bases,
        }
    }

    pub fn for_record(record: &BasisCoefficientRecord, enabled: bool) -> Self {
        Self {
            enabled,
            n_relevant_bases: record.n_relevant_bases,
        }
    }

    /// Number of leading coefficients that stay active out of `n`.
    #[inline]
    pub fn active_count(&self, n: usize) -> usize {
        if self.enabled {
            self.n_relevant_bases.min(n)
        } else {
            n
        }
    }
}

/// Caller-selected knobs shared by every sampling call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplingOptions {
    pub truncation: bool,
    pub with_covariance: bool,
    pub covariance_convention: CovarianceConvention,
}

/// Copy of `coefficients` with the truncated tail set to zero.
pub fn truncate_coefficients(coefficients: ArrayView1<'_, f64>, truncation: Truncation) -> Array1<f64> {
    let n = coefficients.len();
    let k = truncation.active_count(n);
    let mut out = coefficients.to_owned();
    out.slice_mut(s![k..]).fill(0.0);
    out
}

/// Absolute coefficient covariance of a record.
pub fn coefficient_covariance(
    record: &BasisCoefficientRecord,
    convention: CovarianceConvention,
) -> Result<Array2<f64>, CovarianceError> {
    match &record.uncertainty {
        CoefficientUncertainty::Correlation {
            correlations,
            errors,
        } => to_covariance(correlations, errors, record.standard_deviation, convention),
        CoefficientUncertainty::Covariance(cov) => Ok(cov.clone()),
    }
}

/// Samples one band: `flux = D^T c`, `cov = D^T C D`, `error = sqrt(diag cov)`.
///
/// With truncation the coefficient tail is zeroed and the propagation uses the
/// leading `k` rows of `design` and the leading `k x k` block of `covariance`.
/// The full m x m covariance is only formed when `with_covariance` is set.
///
/// # Panics
/// If `design` does not have one row per coefficient and one column per
/// position, or `covariance` is not n x n. These are caller bugs.
pub fn sample_band(
    band: Band,
    positions: ArrayView1<'_, f64>,
    coefficients: ArrayView1<'_, f64>,
    covariance: &Array2<f64>,
    design: &Array2<f64>,
    truncation: Truncation,
    with_covariance: bool,
) -> SampledBandSpectrum {
    let n = coefficients.len();
    let m = positions.len();
    assert_eq!(
        design.dim(),
        (n, m),
        "design matrix must be n_coefficients x n_positions"
    );
    assert_eq!(
        covariance.dim(),
        (n, n),
        "coefficient covariance must be n_coefficients x n_coefficients"
    );

    let k = truncation.active_count(n);
    let design_k = design.slice(s![..k, ..]);
    let coeffs_k = coefficients.slice(s![..k]);
    let cov_k = covariance.slice(s![..k, ..k]);

    let flux = fast_atv(&design_k, &coeffs_k);
    let cd = fast_ab(&cov_k, &design_k);

    let (error, covariance_out) = if with_covariance {
        let mut cov_out = fast_atb(&design_k, &cd);
        for i in 0..m {
            for j in (i + 1)..m {
                let avg = 0.5 * (cov_out[[i, j]] + cov_out[[j, i]]);
                cov_out[[i, j]] = avg;
                cov_out[[j, i]] = avg;
            }
        }
        let error = cov_out.diag().mapv(|v| v.max(0.0).sqrt());
        (error, Some(cov_out))
    } else {
        let mut error = Array1::<f64>::zeros(m);
        for j in 0..m {
            let var = design_k.column(j).dot(&cd.column(j));
            error[j] = var.max(0.0).sqrt();
        }
        (error, None)
    };

    SampledBandSpectrum {
        band,
        positions: positions.to_owned(),
        flux,
        error,
        covariance: covariance_out,
    }
}
