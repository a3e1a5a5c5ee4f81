//! Engine context and batch driver.
//!
//! [`SpectrumEngine`] owns the instrument model together with the design-matrix
//! and blend-weight caches, so every cached value is shared explicitly by the
//! sources that run through one engine rather than through process globals.

use crate::basis::build_design_matrix;
use crate::cache::{AbscissaKey, AbscissaUnit, BasisKey, DesignKey, ReadThroughCache};
use crate::covariance::CovarianceError;
use crate::dispersion::{DispersionError, DispersionMapper, SamplingTarget};
use crate::lines::{LineRecord, find_lines};
use crate::merge::{MergeError, MergePolicy, blend_weights, merge_bands};
use crate::model::{InstrumentModel, ModelError};
use crate::roots::{ExtremaSet, find_derivative_roots};
use crate::sampling::{SamplingOptions, Truncation, coefficient_covariance, sample_band};
use crate::types::{
    Band, BandPair, BasisCoefficientRecord, MergedSpectrum, RecordError, SampledBandSpectrum,
    SourceRecords,
};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpectrumError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Covariance(#[from] CovarianceError),
    #[error(transparent)]
    Dispersion(#[from] DispersionError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(
        "source {source_id} ({band}): record has {found} coefficients with basis id {found_id}, model expects {expected} with basis id {expected_id}"
    )]
    BasisMismatch {
        source_id: i64,
        band: Band,
        expected: usize,
        found: usize,
        expected_id: u32,
        found_id: u32,
    },
    #[error("{band} band: no external design matrix '{name}' registered for this grid")]
    UnknownBasis { band: Band, name: String },
    #[error("{band} band: design matrix '{name}' is {rows}x{cols}, expected {n}x{m}")]
    DesignShape {
        band: Band,
        name: String,
        rows: usize,
        cols: usize,
        n: usize,
        m: usize,
    },
}

/// Absolute spectra on a wavelength grid with an explicit single-band policy.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsoluteRequest {
    pub wavelengths: Vec<f64>,
    pub policy: MergePolicy,
}

/// What to compute for every source of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    pub options: SamplingOptions,
    /// Per-band internal spectra on this pseudo-wavelength grid.
    pub pseudo_grid: Option<Vec<f64>>,
    pub absolute: Option<AbsoluteRequest>,
    pub extrema: bool,
    pub lines: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceProducts {
    pub source_id: i64,
    pub internal: BandPair<Option<SampledBandSpectrum>>,
    pub absolute: Option<MergedSpectrum>,
    pub extrema: BandPair<Option<ExtremaSet>>,
    pub lines: Vec<LineRecord>,
}

/// Result of one source. A failed source never aborts the rest of the batch.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: i64,
    pub result: Result<SourceProducts, SpectrumError>,
}

pub struct SpectrumEngine {
    model: Arc<InstrumentModel>,
    mapper: DispersionMapper,
    designs: ReadThroughCache<DesignKey, Array2<f64>>,
    blends: ReadThroughCache<AbscissaKey, BandPair<Array1<f64>>>,
}

impl SpectrumEngine {
    pub fn new(model: InstrumentModel) -> Result<Self, SpectrumError> {
        Self::from_shared(Arc::new(model))
    }

    pub fn from_shared(model: Arc<InstrumentModel>) -> Result<Self, SpectrumError> {
        model.validate()?;
        let mapper = DispersionMapper::from_model(&model);
        log::debug!(
            "spectrum engine ready: model '{}', {} blue / {} red bases",
            model.version,
            model.bands.blue.n_bases(),
            model.bands.red.n_bases()
        );
        Ok(Self {
            model,
            mapper,
            designs: ReadThroughCache::new("design matrix"),
            blends: ReadThroughCache::new("blend weights"),
        })
    }

    pub fn model(&self) -> &InstrumentModel {
        &self.model
    }

    pub fn mapper(&self) -> &DispersionMapper {
        &self.mapper
    }

    pub fn cached_designs(&self) -> usize {
        self.designs.len()
    }

    fn check_record(&self, record: &BasisCoefficientRecord) -> Result<(), SpectrumError> {
        record.validate()?;
        let band = self.model.band(record.band);
        if record.n_parameters != band.n_bases()
            || record.basis_function_id != band.basis_function_id
        {
            return Err(SpectrumError::BasisMismatch {
                source_id: record.source_id,
                band: record.band,
                expected: band.n_bases(),
                found: record.n_parameters,
                expected_id: band.basis_function_id,
                found_id: record.basis_function_id,
            });
        }
        Ok(())
    }

    /// Hermite design matrix of `band` on `positions`, built on first use.
    ///
    /// Wavelength grids are converted through the band's dispersion before
    /// the basis is evaluated.
    pub fn design_matrix(
        &self,
        band: Band,
        unit: AbscissaUnit,
        positions: &[f64],
    ) -> Arc<Array2<f64>> {
        let band_model = self.model.band(band);
        let key = DesignKey {
            band,
            basis: BasisKey::Hermite(band_model.basis_function_id),
            unit,
            abscissa: AbscissaKey::new(positions),
        };
        self.designs.get_or_build(&key, || match unit {
            AbscissaUnit::Pseudo => build_design_matrix(band_model, positions),
            AbscissaUnit::Wavelength => {
                let pseudo = self.mapper.wavelength_to_pseudo(band, positions);
                build_design_matrix(band_model, &pseudo.to_vec())
            }
        })
    }

    /// Registers a design matrix computed outside the engine for a pseudo-wavelength grid.
    /// An existing registration under the same name and grid is kept.
    pub fn register_external_design(
        &self,
        band: Band,
        name: &str,
        pseudo_grid: &[f64],
        design: Array2<f64>,
    ) -> Result<Arc<Array2<f64>>, SpectrumError> {
        let n = self.model.band(band).n_bases();
        let m = pseudo_grid.len();
        if design.dim() != (n, m) {
            return Err(SpectrumError::DesignShape {
                band,
                name: name.to_string(),
                rows: design.nrows(),
                cols: design.ncols(),
                n,
                m,
            });
        }
        let key = DesignKey {
            band,
            basis: BasisKey::External(name.to_string()),
            unit: AbscissaUnit::Pseudo,
            abscissa: AbscissaKey::new(pseudo_grid),
        };
        Ok(self.designs.insert(key, design))
    }

    fn sample_with(
        &self,
        record: &BasisCoefficientRecord,
        positions: &[f64],
        design: &Array2<f64>,
        options: &SamplingOptions,
    ) -> Result<SampledBandSpectrum, SpectrumError> {
        let covariance = coefficient_covariance(record, options.covariance_convention)?;
        Ok(sample_band(
            record.band,
            ArrayView1::from(positions),
            record.coefficients.view(),
            &covariance,
            design,
            Truncation::for_record(record, options.truncation),
            options.with_covariance,
        ))
    }

    /// Internal spectrum of one band on a pseudo-wavelength grid.
    pub fn sample_pseudo(
        &self,
        record: &BasisCoefficientRecord,
        pseudo_grid: &[f64],
        options: &SamplingOptions,
    ) -> Result<SampledBandSpectrum, SpectrumError> {
        self.check_record(record)?;
        self.mapper
            .validate_sampling_range(SamplingTarget::Band(record.band), pseudo_grid)?;
        let design = self.design_matrix(record.band, AbscissaUnit::Pseudo, pseudo_grid);
        self.sample_with(record, pseudo_grid, &design, options)
    }

    /// Like [`Self::sample_pseudo`] with a previously registered external design matrix.
    pub fn sample_external(
        &self,
        record: &BasisCoefficientRecord,
        name: &str,
        pseudo_grid: &[f64],
        options: &SamplingOptions,
    ) -> Result<SampledBandSpectrum, SpectrumError> {
        record.validate()?;
        self.mapper
            .validate_sampling_range(SamplingTarget::Band(record.band), pseudo_grid)?;
        let key = DesignKey {
            band: record.band,
            basis: BasisKey::External(name.to_string()),
            unit: AbscissaUnit::Pseudo,
            abscissa: AbscissaKey::new(pseudo_grid),
        };
        let design = self
            .designs
            .get(&key)
            .ok_or_else(|| SpectrumError::UnknownBasis {
                band: record.band,
                name: name.to_string(),
            })?;
        if design.nrows() != record.n_parameters {
            return Err(SpectrumError::DesignShape {
                band: record.band,
                name: name.to_string(),
                rows: design.nrows(),
                cols: design.ncols(),
                n: record.n_parameters,
                m: pseudo_grid.len(),
            });
        }
        self.sample_with(record, pseudo_grid, &design, options)
    }

    /// One band sampled directly on an absolute wavelength grid, unweighted.
    pub fn sample_band_absolute(
        &self,
        record: &BasisCoefficientRecord,
        wavelengths: &[f64],
        options: &SamplingOptions,
    ) -> Result<SampledBandSpectrum, SpectrumError> {
        self.check_record(record)?;
        self.mapper
            .validate_sampling_range(SamplingTarget::Combined, wavelengths)?;
        let design = self.design_matrix(record.band, AbscissaUnit::Wavelength, wavelengths);
        self.sample_with(record, wavelengths, &design, options)
    }

    pub fn blend_weights(&self, wavelengths: &[f64]) -> Arc<BandPair<Array1<f64>>> {
        self.blends
            .get_or_build(&AbscissaKey::new(wavelengths), || {
                blend_weights(&self.model.blend, wavelengths)
            })
    }

    /// Merged absolute spectrum of a source on a wavelength grid.
    pub fn sample_absolute(
        &self,
        source: &SourceRecords,
        wavelengths: &[f64],
        options: &SamplingOptions,
        policy: MergePolicy,
    ) -> Result<MergedSpectrum, SpectrumError> {
        self.mapper
            .validate_sampling_range(SamplingTarget::Combined, wavelengths)?;
        let mut sampled: BandPair<Option<SampledBandSpectrum>> = BandPair::default();
        for band in Band::ALL {
            if let Some(record) = &source.bands[band] {
                sampled[band] = Some(self.sample_band_absolute(record, wavelengths, options)?);
            }
        }
        let weights = self.blend_weights(wavelengths);
        Ok(merge_bands(
            BandPair::new(sampled.blue.as_ref(), sampled.red.as_ref()),
            &weights,
            policy,
        )?)
    }

    /// Extrema and inflection points of one record, in pseudo-wavelength and nm.
    pub fn extrema(
        &self,
        record: &BasisCoefficientRecord,
        truncation: bool,
    ) -> Result<ExtremaSet, SpectrumError> {
        self.check_record(record)?;
        let band = self.model.band(record.band);
        let roots = find_derivative_roots(
            record.coefficients.view(),
            &band.transformation,
            Truncation::for_record(record, truncation),
        );
        let set = ExtremaSet::from_hermite(
            record.source_id,
            record.band,
            &roots,
            &band.domain,
            &band.dispersion,
        );
        if set.is_degenerate() {
            log::warn!(
                "source {} ({}): root search unresolved (first: {:?}, second: {:?})",
                record.source_id,
                record.band,
                set.first.status,
                set.second.status
            );
        }
        Ok(set)
    }

    pub fn lines(
        &self,
        record: &BasisCoefficientRecord,
        truncation: bool,
    ) -> Result<Vec<LineRecord>, SpectrumError> {
        self.check_record(record)?;
        Ok(find_lines(
            record,
            self.model.band(record.band),
            Truncation::for_record(record, truncation),
        ))
    }

    /// Every product `request` asks for, for one source.
    pub fn process_source(
        &self,
        source: &SourceRecords,
        request: &BatchRequest,
    ) -> Result<SourceProducts, SpectrumError> {
        let mut products = SourceProducts {
            source_id: source.source_id,
            ..SourceProducts::default()
        };
        for band in Band::ALL {
            let Some(record) = &source.bands[band] else {
                continue;
            };
            if let Some(grid) = &request.pseudo_grid {
                products.internal[band] = Some(self.sample_pseudo(record, grid, &request.options)?);
            }
            if request.extrema {
                products.extrema[band] = Some(self.extrema(record, request.options.truncation)?);
            }
            if request.lines {
                products
                    .lines
                    .extend(self.lines(record, request.options.truncation)?);
            }
        }
        if let Some(absolute) = &request.absolute {
            products.absolute = Some(self.sample_absolute(
                source,
                &absolute.wavelengths,
                &request.options,
                absolute.policy,
            )?);
        }
        Ok(products)
    }

    /// Processes `sources` on the rayon pool. Outcomes keep the input order.
    pub fn process_batch(
        &self,
        sources: &[SourceRecords],
        request: &BatchRequest,
    ) -> Vec<SourceOutcome> {
        let outcomes: Vec<SourceOutcome> = sources
            .par_iter()
            .map(|source| SourceOutcome {
                source_id: source.source_id,
                result: self.process_source(source, request),
            })
            .collect();
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            for outcome in &outcomes {
                if let Err(err) = &outcome.result {
                    log::warn!("source {} skipped: {err}", outcome.source_id);
                }
            }
        }
        log::debug!(
            "batch of {} sources done ({} failed, {} cached design matrices)",
            outcomes.len(),
            failed,
            self.designs.len()
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::CovarianceConvention;
    use crate::model::fixtures::toy_model;
    use crate::types::CoefficientUncertainty;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn record(source_id: i64, band: Band, coefficients: Array1<f64>) -> BasisCoefficientRecord {
        let n = coefficients.len();
        BasisCoefficientRecord {
            source_id,
            band,
            coefficients,
            n_parameters: n,
            n_relevant_bases: n,
            standard_deviation: 1.0,
            uncertainty: CoefficientUncertainty::Correlation {
                correlations: Array2::eye(n),
                errors: Array1::from_elem(n, 0.1),
            },
            basis_function_id: match band {
                Band::Blue => 56,
                Band::Red => 57,
            },
        }
    }

    fn engine() -> SpectrumEngine {
        SpectrumEngine::new(toy_model(3)).expect("valid model")
    }

    #[test]
    fn design_matrices_are_cached_per_grid() {
        let engine = engine();
        let r = record(1, Band::Blue, array![1.0, 0.5, -0.2]);
        let grid = [10.0, 20.0, 30.0];
        let opts = SamplingOptions::default();
        engine.sample_pseudo(&r, &grid, &opts).expect("sampled");
        engine.sample_pseudo(&r, &grid, &opts).expect("sampled");
        assert_eq!(engine.cached_designs(), 1);
        engine.sample_pseudo(&r, &[10.0, 20.0], &opts).expect("sampled");
        assert_eq!(engine.cached_designs(), 2);
    }

    #[test]
    fn record_for_another_basis_is_rejected() {
        let engine = engine();
        let mut r = record(1, Band::Red, array![1.0, 0.5, -0.2]);
        r.basis_function_id = 99;
        let err = engine
            .sample_pseudo(&r, &[10.0], &SamplingOptions::default())
            .expect_err("mismatched basis");
        assert!(matches!(err, SpectrumError::BasisMismatch { found_id: 99, .. }));
    }

    #[test]
    fn out_of_domain_grid_is_a_dispersion_error() {
        let engine = engine();
        let r = record(1, Band::Blue, array![1.0, 0.5, -0.2]);
        let err = engine
            .sample_pseudo(&r, &[10.0, 70.0], &SamplingOptions::default())
            .expect_err("outside band");
        assert!(matches!(
            err,
            SpectrumError::Dispersion(DispersionError::OutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn external_design_must_be_registered_first() {
        let engine = engine();
        let r = record(4, Band::Red, array![1.0, 2.0, 3.0]);
        let grid = [5.0, 15.0];
        let opts = SamplingOptions::default();
        assert!(matches!(
            engine.sample_external(&r, "lsf", &grid, &opts),
            Err(SpectrumError::UnknownBasis { .. })
        ));
        let design = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        engine
            .register_external_design(Band::Red, "lsf", &grid, design)
            .expect("registered");
        let out = engine.sample_external(&r, "lsf", &grid, &opts).expect("sampled");
        assert_eq!(out.flux, array![4.0, 5.0]);
        assert!(matches!(
            engine.register_external_design(Band::Red, "bad", &grid, Array2::zeros((2, 2))),
            Err(SpectrumError::DesignShape { .. })
        ));
    }

    #[test]
    fn absolute_spectrum_blends_both_bands_across_the_crossover() {
        let engine = engine();
        let source = SourceRecords {
            source_id: 3,
            bands: BandPair::new(
                Some(record(3, Band::Blue, array![1.0, 0.0, 0.0])),
                Some(record(3, Band::Red, array![2.0, 0.0, 0.0])),
            ),
        };
        let wavelengths = [400.0, 650.0, 900.0];
        let opts = SamplingOptions {
            with_covariance: true,
            ..SamplingOptions::default()
        };
        let merged = engine
            .sample_absolute(&source, &wavelengths, &opts, MergePolicy::MaskedCoverage)
            .expect("merged");
        let blue = engine
            .sample_band_absolute(source.bands.blue.as_ref().expect("blue"), &wavelengths, &opts)
            .expect("blue");
        let red = engine
            .sample_band_absolute(source.bands.red.as_ref().expect("red"), &wavelengths, &opts)
            .expect("red");
        assert_abs_diff_eq!(merged.flux[0], blue.flux[0], epsilon = 1e-14);
        assert_abs_diff_eq!(merged.flux[1], 0.5 * (blue.flux[1] + red.flux[1]), epsilon = 1e-14);
        assert_abs_diff_eq!(merged.flux[2], red.flux[2], epsilon = 1e-14);
        assert_eq!(merged.covered_count(), 3);
        assert!(merged.covariance.is_some());
    }

    #[test]
    fn single_band_source_follows_the_chosen_policy() {
        let engine = engine();
        let source = SourceRecords {
            source_id: 8,
            bands: BandPair::new(None, Some(record(8, Band::Red, array![1.0, 0.3, 0.1]))),
        };
        let wavelengths = [400.0, 900.0];
        let opts = SamplingOptions::default();
        let masked = engine
            .sample_absolute(&source, &wavelengths, &opts, MergePolicy::MaskedCoverage)
            .expect("masked");
        assert_eq!(masked.missing, array![true, false]);
        let blank = engine
            .sample_absolute(&source, &wavelengths, &opts, MergePolicy::FullyMissing)
            .expect("blank");
        assert!(blank.missing.iter().all(|&m| m));
    }

    #[test]
    fn degenerate_extrema_do_not_fail_the_source() {
        let engine = engine();
        let r = record(2, Band::Blue, array![1.0, 0.5, 0.0]);
        let set = engine.extrema(&r, false).expect("non-fatal");
        assert!(set.is_degenerate());
        assert!(set.first.is_empty());
        assert!(engine.lines(&r, false).expect("non-fatal").is_empty());
    }

    #[test]
    fn batch_isolates_failures_and_keeps_order() {
        let engine = engine();
        let good = |id| SourceRecords {
            source_id: id,
            bands: BandPair::new(Some(record(id, Band::Blue, array![1.0, 0.2, 0.4])), None),
        };
        let mut bad = good(2);
        if let Some(r) = bad.bands.blue.as_mut() {
            r.standard_deviation = -1.0;
        }
        let sources = vec![good(1), bad, good(3)];
        let request = BatchRequest {
            options: SamplingOptions {
                covariance_convention: CovarianceConvention::Unscaled,
                ..SamplingOptions::default()
            },
            pseudo_grid: Some(vec![10.0, 30.0, 50.0]),
            extrema: true,
            ..BatchRequest::default()
        };
        let outcomes = engine.process_batch(&sources, &request);
        let ids: Vec<i64> = outcomes.iter().map(|o| o.source_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(SpectrumError::Record(RecordError::InvalidStandardDeviation { .. }))
        ));
        let products = outcomes[2].result.as_ref().expect("third source");
        assert!(products.internal.blue.is_some() && products.internal.red.is_none());
        assert!(products.extrema.blue.is_some());
        assert!(products.absolute.is_none());
    }
}
