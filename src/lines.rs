//! Emission and absorption features located at the extrema of a band's
//! continuous spectrum.

use crate::basis::evaluate_hermite_series;
use crate::model::BandModel;
use crate::roots::{
    ExtremaRoots, find_derivative_roots, hermite_series, second_derivative_series,
};
use crate::sampling::Truncation;
use crate::types::{Band, BasisCoefficientRecord};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Curvature below this fraction of the l1 norm of f'' counts as flat.
const FLAT_CURVATURE_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Local maximum (f'' < 0).
    Emission,
    /// Local minimum (f'' > 0).
    Absorption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub source_id: i64,
    pub band: Band,
    pub kind: LineKind,
    pub pseudo_wavelength: f64,
    pub wavelength: f64,
    /// Continuous-spectrum value at the extremum, in coefficient flux units.
    pub flux: f64,
    /// Distance between the enclosing inflection points, when both exist.
    pub width_pseudo: Option<f64>,
    pub width_wavelength: Option<f64>,
}

/// Lines of one band from already-computed Hermite-argument roots.
///
/// `series` is the transformed expansion `t = c . T` the roots belong to.
/// Extrema outside the band's pseudo-wavelength range and flat extrema are
/// skipped. Without resolved inflection points widths are left empty.
pub fn lines_from_roots(
    source_id: i64,
    band: Band,
    band_model: &BandModel,
    series: &Array1<f64>,
    roots: &ExtremaRoots,
) -> Vec<LineRecord> {
    if !roots.first.is_resolved() {
        return Vec::new();
    }
    let curvature = second_derivative_series(series);
    let flat = FLAT_CURVATURE_TOL * curvature.iter().map(|v| v.abs()).sum::<f64>();
    let domain = &band_model.domain;
    let to_wavelength = |u: f64| band_model.dispersion.pseudo_to_wavelength(u);
    let inflections = roots.second.is_resolved().then_some(&roots.second.roots);

    let mut lines = Vec::new();
    for &x in roots.first.roots.iter() {
        let u = domain.hermite_to_pseudo(x);
        if !domain.contains_pseudo(u) {
            continue;
        }
        let f2 = evaluate_hermite_series(&curvature, x);
        if f2.abs() <= flat {
            continue;
        }
        let kind = if f2 < 0.0 {
            LineKind::Emission
        } else {
            LineKind::Absorption
        };

        let bounds = inflections.and_then(|xs| {
            let lower = xs.iter().copied().filter(|&v| v < x).last()?;
            let upper = xs.iter().copied().find(|&v| v > x)?;
            Some((domain.hermite_to_pseudo(lower), domain.hermite_to_pseudo(upper)))
        });
        let (width_pseudo, width_wavelength) = match bounds {
            Some((lo, hi)) => (
                Some(hi - lo),
                Some((to_wavelength(hi) - to_wavelength(lo)).abs()),
            ),
            None => (None, None),
        };

        lines.push(LineRecord {
            source_id,
            band,
            kind,
            pseudo_wavelength: u,
            wavelength: to_wavelength(u),
            flux: evaluate_hermite_series(series, x),
            width_pseudo,
            width_wavelength,
        });
    }
    lines
}

/// Lines of one record: root search plus classification.
pub fn find_lines(
    record: &BasisCoefficientRecord,
    band_model: &BandModel,
    truncation: Truncation,
) -> Vec<LineRecord> {
    let coefficients = record.coefficients.view();
    let roots = find_derivative_roots(coefficients, &band_model.transformation, truncation);
    if !roots.first.is_resolved() {
        log::warn!(
            "source {} {}: extrema unresolved ({:?}); no lines reported",
            record.source_id,
            record.band,
            roots.first.status
        );
        return Vec::new();
    }
    let series = hermite_series(coefficients, &band_model.transformation, truncation);
    lines_from_roots(record.source_id, record.band, band_model, &series, &roots)
}
