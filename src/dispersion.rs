//! Band-specific mapping between physical wavelength and pseudo-wavelength, and
//! the range gate that every sampling request passes before any matrix work.

use crate::model::InstrumentModel;
use crate::types::{Band, BandPair};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DispersionError {
    #[error("sampling grid is empty")]
    EmptyGrid,
    #[error("sampling grid value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error(
        "sampling grid must be non-decreasing: value {value} at index {index} follows {previous}"
    )]
    NonMonotonic {
        index: usize,
        previous: f64,
        value: f64,
    },
    #[error("sampling value {value} at index {index} lies outside the {target} domain [{lo}, {hi}]")]
    OutOfRange {
        target: SamplingTarget,
        index: usize,
        value: f64,
        lo: f64,
        hi: f64,
    },
    #[error("invalid dispersion table: {0}")]
    InvalidTable(String),
}

/// Which domain a sampling grid is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingTarget {
    /// Pseudo-wavelength grid of a single band.
    Band(Band),
    /// Wavelength grid spanning both bands.
    Combined,
}

impl fmt::Display for SamplingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingTarget::Band(band) => write!(f, "{band} pseudo-wavelength"),
            SamplingTarget::Combined => f.write_str("combined wavelength"),
        }
    }
}

/// Tabulated dispersion of one band: wavelength (nm) against pseudo-wavelength.
///
/// Both maps are piecewise linear over the same knots, so they are exact
/// inverses of each other; outside the table the end segments are extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispersionCurve {
    wavelengths: Vec<f64>,
    pseudo: Vec<f64>,
}

impl DispersionCurve {
    pub fn new(wavelengths: Vec<f64>, pseudo: Vec<f64>) -> Self {
        Self {
            wavelengths,
            pseudo,
        }
    }

    pub fn validate(&self) -> Result<(), DispersionError> {
        if self.wavelengths.len() < 2 || self.wavelengths.len() != self.pseudo.len() {
            return Err(DispersionError::InvalidTable(format!(
                "need at least two knots with matching lengths, got {} wavelengths and {} pseudo-wavelengths",
                self.wavelengths.len(),
                self.pseudo.len()
            )));
        }
        if self
            .wavelengths
            .iter()
            .chain(self.pseudo.iter())
            .any(|v| !v.is_finite())
        {
            return Err(DispersionError::InvalidTable(
                "table contains non-finite values".to_string(),
            ));
        }
        if self.wavelengths.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(DispersionError::InvalidTable(
                "wavelengths must be strictly increasing".to_string(),
            ));
        }
        let increasing = self.pseudo.windows(2).all(|w| w[0] < w[1]);
        let decreasing = self.pseudo.windows(2).all(|w| w[0] > w[1]);
        if !(increasing || decreasing) {
            return Err(DispersionError::InvalidTable(
                "pseudo-wavelengths must be strictly monotonic".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wavelength_to_pseudo(&self, wavelength: f64) -> f64 {
        interpolate(&self.wavelengths, &self.pseudo, wavelength)
    }

    pub fn pseudo_to_wavelength(&self, pseudo: f64) -> f64 {
        interpolate(&self.pseudo, &self.wavelengths, pseudo)
    }
}

/// Piecewise-linear interpolation over strictly monotonic `xs` (either
/// direction), extending the first and last segments beyond the table.
pub(crate) fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    debug_assert!(xs.len() >= 2 && xs.len() == ys.len());
    let last = xs.len() - 1;
    let hi = if xs[0] <= xs[last] {
        xs.partition_point(|&v| v < x)
    } else {
        xs.partition_point(|&v| v > x)
    }
    .clamp(1, last);
    let lo = hi - 1;
    let t = (x - xs[lo]) / (xs[hi] - xs[lo]);
    ys[lo] + t * (ys[hi] - ys[lo])
}

/// Per-band dispersion plus the domains used for validating sampling grids.
#[derive(Debug, Clone)]
pub struct DispersionMapper {
    curves: BandPair<DispersionCurve>,
    pseudo_domains: BandPair<(f64, f64)>,
    combined_range: (f64, f64),
}

impl DispersionMapper {
    pub fn from_model(model: &InstrumentModel) -> Self {
        Self {
            curves: BandPair::from_fn(|band| model.band(band).dispersion.clone()),
            pseudo_domains: BandPair::from_fn(|band| model.band(band).domain.pseudo_range),
            combined_range: model.combined_wavelength_range(),
        }
    }

    pub fn wavelength_to_pseudo(&self, band: Band, wavelengths: &[f64]) -> Array1<f64> {
        let curve = &self.curves[band];
        wavelengths
            .iter()
            .map(|&w| curve.wavelength_to_pseudo(w))
            .collect()
    }

    pub fn pseudo_to_wavelength(&self, band: Band, pseudo: &[f64]) -> Array1<f64> {
        let curve = &self.curves[band];
        pseudo
            .iter()
            .map(|&u| curve.pseudo_to_wavelength(u))
            .collect()
    }

    pub fn domain(&self, target: SamplingTarget) -> (f64, f64) {
        match target {
            SamplingTarget::Band(band) => self.pseudo_domains[band],
            SamplingTarget::Combined => self.combined_range,
        }
    }

    /// Rejects empty, non-finite, decreasing or out-of-domain grids.
    pub fn validate_sampling_range(
        &self,
        target: SamplingTarget,
        positions: &[f64],
    ) -> Result<(), DispersionError> {
        if positions.is_empty() {
            return Err(DispersionError::EmptyGrid);
        }
        let (lo, hi) = self.domain(target);
        let mut previous = f64::NEG_INFINITY;
        for (index, &value) in positions.iter().enumerate() {
            if !value.is_finite() {
                return Err(DispersionError::NonFinite { index });
            }
            if value < previous {
                return Err(DispersionError::NonMonotonic {
                    index,
                    previous,
                    value,
                });
            }
            if value < lo || value > hi {
                return Err(DispersionError::OutOfRange {
                    target,
                    index,
                    value,
                    lo,
                    hi,
                });
            }
            previous = value;
        }
        Ok(())
    }
}
