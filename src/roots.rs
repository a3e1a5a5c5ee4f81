//! Real zeros of the first and second derivative of a Hermite-function
//! expansion, found as eigenvalues of a companion matrix built directly from
//! the coefficients. No sampled curve is involved.
//!
//! For an expansion `f = sum_k a_k psi_k` with leading index `m`, the Hermite
//! recurrence `x psi_k = sqrt(k/2) psi_{k-1} + sqrt((k+1)/2) psi_{k+1}` makes
//! the zeros of `f` the eigenvalues of the m x m Jacobi matrix whose last row
//! is corrected by `-sqrt(m/2) a_i / a_m`.

use crate::dispersion::DispersionCurve;
use crate::linalg::faer_ndarray::{FaerEigenvalues, FaerLinalgError};
use crate::model::HermiteDomain;
use crate::sampling::Truncation;
use crate::types::Band;
use ndarray::{Array1, Array2, ArrayView1, s};

/// Leading coefficients below this fraction of the largest one count as zero.
pub const DEGENERACY_TOL: f64 = 1e-12;
/// Eigenvalues whose imaginary part is below this (relative) are real.
const IMAGINARY_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    Resolved,
    /// No active coefficients: nothing to differentiate.
    NoBasis,
    /// The leading derivative coefficient vanishes; the companion matrix is undefined.
    DegenerateLeadingTerm,
    /// The eigenvalue iteration did not converge.
    NoConvergence,
}

/// Ascending real roots together with how the search ended.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeRoots {
    pub roots: Array1<f64>,
    pub status: RootStatus,
}

impl DerivativeRoots {
    fn unresolved(status: RootStatus) -> Self {
        Self {
            roots: Array1::zeros(0),
            status,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == RootStatus::Resolved
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn map_roots(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            roots: self.roots.mapv(f),
            status: self.status,
        }
    }
}

/// Roots in the Hermite argument `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtremaRoots {
    pub first: DerivativeRoots,
    pub second: DerivativeRoots,
}

/// `t = c . T` with the truncated coefficient tail treated as zero.
pub fn hermite_series(
    coefficients: ArrayView1<'_, f64>,
    transform: &Array2<f64>,
    truncation: Truncation,
) -> Array1<f64> {
    let n = coefficients.len();
    assert_eq!(
        transform.nrows(),
        n,
        "basis transformation must have one row per coefficient"
    );
    let k = truncation.active_count(n);
    coefficients
        .slice(s![..k])
        .dot(&transform.slice(s![..k, ..]))
}

/// (n+1) x (n+1) skew-symmetric raising/lowering matrix of the first derivative.
pub fn first_derivative_ladder(n: usize) -> Array2<f64> {
    let mut d = Array2::<f64>::zeros((n + 1, n + 1));
    for k in 0..n {
        let v = ((k + 1) as f64).sqrt() / std::f64::consts::SQRT_2;
        d[[k + 1, k]] = v;
        d[[k, k + 1]] = -v;
    }
    d
}

/// (n+2) x (n+2) symmetric matrix of the second derivative.
pub fn second_derivative_ladder(n: usize) -> Array2<f64> {
    let mut d = Array2::<f64>::zeros((n + 2, n + 2));
    for k in 0..n + 2 {
        d[[k, k]] = -0.5 - k as f64;
    }
    for k in 0..n {
        let v = 0.5 * (((k + 2) * (k + 1)) as f64).sqrt();
        d[[k + 2, k]] = v;
        d[[k, k + 2]] = v;
    }
    d
}

fn padded(series: &Array1<f64>, extra: usize) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(series.len() + extra);
    out.slice_mut(s![..series.len()]).assign(series);
    out
}

/// Ladder image of `t`; this is `-f'` in the Hermite basis (the sign is irrelevant for zeros).
pub fn first_derivative_series(series: &Array1<f64>) -> Array1<f64> {
    first_derivative_ladder(series.len()).dot(&padded(series, 1))
}

/// `f''` in the Hermite basis, length n+2.
pub fn second_derivative_series(series: &Array1<f64>) -> Array1<f64> {
    second_derivative_ladder(series.len()).dot(&padded(series, 2))
}

/// Companion matrix of a Hermite expansion with leading index `m = len - 1`,
/// or `None` when the leading coefficient is numerically zero.
pub fn companion_matrix(series: &Array1<f64>) -> Option<Array2<f64>> {
    let m = series.len().checked_sub(1)?;
    if m == 0 {
        return None;
    }
    let scale = series.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let lead = series[m];
    if scale == 0.0 || lead.abs() <= DEGENERACY_TOL * scale {
        return None;
    }
    let mut b = Array2::<f64>::zeros((m, m));
    for k in 0..m - 1 {
        let v = ((k + 1) as f64).sqrt() / std::f64::consts::SQRT_2;
        b[[k, k + 1]] = v;
        b[[k + 1, k]] = v;
    }
    let factor = (m as f64 / 2.0).sqrt();
    for i in 0..m {
        b[[m - 1, i]] -= factor * series[i] / lead;
    }
    Some(b)
}

fn real_sorted_eigenvalues(matrix: &Array2<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let mut roots: Vec<f64> = matrix
        .eigenvalues()?
        .into_iter()
        .filter(|z| z.is_real(IMAGINARY_TOL))
        .map(|z| z.re)
        .collect();
    roots.sort_by(f64::total_cmp);
    Ok(Array1::from(roots))
}

/// Real zeros of the expansion whose Hermite coefficients are `series`.
pub fn hermite_series_roots(series: &Array1<f64>) -> DerivativeRoots {
    if series.is_empty() {
        return DerivativeRoots::unresolved(RootStatus::NoBasis);
    }
    let Some(companion) = companion_matrix(series) else {
        log::debug!(
            "degenerate leading Hermite coefficient (len {}); no roots reported",
            series.len()
        );
        return DerivativeRoots::unresolved(RootStatus::DegenerateLeadingTerm);
    };
    match real_sorted_eigenvalues(&companion) {
        Ok(roots) => DerivativeRoots {
            roots,
            status: RootStatus::Resolved,
        },
        Err(err) => {
            log::debug!("companion eigenvalues failed: {err}");
            DerivativeRoots::unresolved(RootStatus::NoConvergence)
        }
    }
}

/// Zeros of f' (extrema) and f'' (inflection points) in the Hermite argument.
///
/// The recurrence always spans all `n` basis slots; truncation only zeroes
/// coefficients before they are transformed.
pub fn find_derivative_roots(
    coefficients: ArrayView1<'_, f64>,
    transform: &Array2<f64>,
    truncation: Truncation,
) -> ExtremaRoots {
    let n = coefficients.len();
    if truncation.active_count(n) == 0 {
        return ExtremaRoots {
            first: DerivativeRoots::unresolved(RootStatus::NoBasis),
            second: DerivativeRoots::unresolved(RootStatus::NoBasis),
        };
    }
    let t = hermite_series(coefficients, transform, truncation);
    ExtremaRoots {
        first: hermite_series_roots(&first_derivative_series(&t)),
        second: hermite_series_roots(&second_derivative_series(&t)),
    }
}

/// Extrema and inflection points of one source in one band.
///
/// `first` and `second` hold ascending pseudo-wavelengths; the wavelength
/// arrays are aligned with them element by element, so they descend when the
/// band's dispersion does.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtremaSet {
    pub source_id: i64,
    pub band: Band,
    /// Zeros of f' (extrema).
    pub first: DerivativeRoots,
    /// Zeros of f'' (inflection points).
    pub second: DerivativeRoots,
    /// `first` in nm.
    pub first_wavelength: Array1<f64>,
    /// `second` in nm.
    pub second_wavelength: Array1<f64>,
}

impl ExtremaSet {
    pub fn from_hermite(
        source_id: i64,
        band: Band,
        roots: &ExtremaRoots,
        domain: &HermiteDomain,
        dispersion: &DispersionCurve,
    ) -> Self {
        let to_pseudo = |x: f64| domain.hermite_to_pseudo(x);
        let first = roots.first.map_roots(to_pseudo);
        let second = roots.second.map_roots(to_pseudo);
        let to_wavelength = |r: &DerivativeRoots| r.roots.mapv(|u| dispersion.pseudo_to_wavelength(u));
        Self {
            source_id,
            band,
            first_wavelength: to_wavelength(&first),
            second_wavelength: to_wavelength(&second),
            first,
            second,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.first.is_resolved() && self.second.is_resolved())
    }
}
