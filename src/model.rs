//! Instrument model: the fixed, versioned description of both bands that every
//! sampling and root-finding call reads from.

use crate::dispersion::{DispersionCurve, DispersionError};
use crate::types::{Band, BandPair};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read instrument model '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse instrument model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{band} band: basis transformation must be {n}x{n}, got {rows}x{cols}")]
    TransformShape {
        band: Band,
        n: usize,
        rows: usize,
        cols: usize,
    },
    #[error("{band} band: basis transformation contains non-finite values")]
    NonFiniteTransform { band: Band },
    #[error("{band} band: invalid range [{lo}, {hi}]")]
    InvalidRange { band: Band, lo: f64, hi: f64 },
    #[error("{band} band dispersion: {source}")]
    Dispersion {
        band: Band,
        #[source]
        source: DispersionError,
    },
    #[error("blend table: {0}")]
    Blend(String),
}

fn default_basis_function_id() -> u32 {
    0
}

/// Affine map from pseudo-wavelength onto the Hermite-function argument.
///
/// `pseudo_range` is mapped linearly onto `normalized_range`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HermiteDomain {
    pub pseudo_range: (f64, f64),
    pub normalized_range: (f64, f64),
}

impl HermiteDomain {
    pub fn scale(&self) -> f64 {
        (self.normalized_range.1 - self.normalized_range.0)
            / (self.pseudo_range.1 - self.pseudo_range.0)
    }

    pub fn offset(&self) -> f64 {
        self.normalized_range.0 - self.pseudo_range.0 * self.scale()
    }

    #[inline]
    pub fn pseudo_to_hermite(&self, pseudo: f64) -> f64 {
        pseudo * self.scale() + self.offset()
    }

    #[inline]
    pub fn hermite_to_pseudo(&self, x: f64) -> f64 {
        (x - self.offset()) / self.scale()
    }

    pub fn contains_pseudo(&self, pseudo: f64) -> bool {
        let (lo, hi) = self.pseudo_range;
        pseudo >= lo && pseudo <= hi
    }
}

/// Everything the core needs to know about one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandModel {
    #[serde(default = "default_basis_function_id")]
    pub basis_function_id: u32,
    pub domain: HermiteDomain,
    /// n x n, row i = coefficient i expressed in Hermite functions.
    pub transformation: Array2<f64>,
    pub dispersion: DispersionCurve,
}

impl BandModel {
    pub fn n_bases(&self) -> usize {
        self.transformation.nrows()
    }

    fn validate(&self, band: Band) -> Result<(), ModelError> {
        let (rows, cols) = self.transformation.dim();
        if rows != cols || rows == 0 {
            return Err(ModelError::TransformShape {
                band,
                n: rows,
                rows,
                cols,
            });
        }
        if !self.transformation.iter().all(|v| v.is_finite()) {
            return Err(ModelError::NonFiniteTransform { band });
        }
        for (lo, hi) in [self.domain.pseudo_range, self.domain.normalized_range] {
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(ModelError::InvalidRange { band, lo, hi });
            }
        }
        self.dispersion
            .validate()
            .map_err(|source| ModelError::Dispersion { band, source })
    }
}

/// Blue-band blend weight tabulated against wavelength; red = 1 - blue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendTable {
    pub wavelengths: Vec<f64>,
    pub blue_weights: Vec<f64>,
}

impl BlendTable {
    /// A hard switch at `crossover` with a linear ramp of `half_width` on each side.
    pub fn linear_crossover(crossover: f64, half_width: f64) -> Self {
        Self {
            wavelengths: vec![crossover - half_width, crossover + half_width],
            blue_weights: vec![1.0, 0.0],
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.wavelengths.is_empty() || self.wavelengths.len() != self.blue_weights.len() {
            return Err(ModelError::Blend(format!(
                "{} wavelengths but {} weights",
                self.wavelengths.len(),
                self.blue_weights.len()
            )));
        }
        if self.wavelengths.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(ModelError::Blend(
                "wavelengths must be strictly increasing".to_string(),
            ));
        }
        if self
            .blue_weights
            .iter()
            .any(|w| !(w.is_finite() && (0.0..=1.0).contains(w)))
        {
            return Err(ModelError::Blend(
                "weights must lie within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// The versioned instrument model shared by all processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentModel {
    #[serde(default)]
    pub version: String,
    pub bands: BandPair<BandModel>,
    pub blend: BlendTable,
}

impl InstrumentModel {
    pub fn from_json_str(payload: &str) -> Result<Self, ModelError> {
        let model: InstrumentModel = serde_json::from_str(payload)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let payload = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (band, model) in self.bands.iter() {
            model.validate(band)?;
        }
        self.blend.validate()
    }

    pub fn band(&self, band: Band) -> &BandModel {
        &self.bands[band]
    }

    /// Wavelength interval covered by the union of both bands.
    pub fn combined_wavelength_range(&self) -> (f64, f64) {
        let ranges = BandPair::from_fn(|band| self.band_wavelength_range(band));
        (
            ranges.blue.0.min(ranges.red.0),
            ranges.blue.1.max(ranges.red.1),
        )
    }

    /// Wavelength interval corresponding to the band's pseudo-wavelength domain.
    pub fn band_wavelength_range(&self, band: Band) -> (f64, f64) {
        let model = self.band(band);
        let (lo, hi) = model.domain.pseudo_range;
        let a = model.dispersion.pseudo_to_wavelength(lo);
        let b = model.dispersion.pseudo_to_wavelength(hi);
        (a.min(b), a.max(b))
    }
}
