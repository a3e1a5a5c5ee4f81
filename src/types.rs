use crate::covariance::{CovarianceError, validate_correlation, validate_covariance};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use thiserror::Error;

/// One of the two instrument channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Blue,
    Red,
}

impl Band {
    pub const ALL: [Band; 2] = [Band::Blue, Band::Red];

    pub fn tag(self) -> &'static str {
        match self {
            Band::Blue => "blue",
            Band::Red => "red",
        }
    }

    pub fn other(self) -> Band {
        match self {
            Band::Blue => Band::Red,
            Band::Red => Band::Blue,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown band tag '{0}'; expected 'blue' or 'red'")]
pub struct UnknownBandError(pub String);

impl FromStr for Band {
    type Err = UnknownBandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blue" | "bp" => Ok(Band::Blue),
            "red" | "rp" => Ok(Band::Red),
            _ => Err(UnknownBandError(s.to_string())),
        }
    }
}

/// One value per band.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandPair<T> {
    pub blue: T,
    pub red: T,
}

impl<T> BandPair<T> {
    pub fn new(blue: T, red: T) -> Self {
        Self { blue, red }
    }

    pub fn from_fn(mut f: impl FnMut(Band) -> T) -> Self {
        Self {
            blue: f(Band::Blue),
            red: f(Band::Red),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(Band, T) -> U) -> BandPair<U> {
        BandPair {
            blue: f(Band::Blue, self.blue),
            red: f(Band::Red, self.red),
        }
    }

    pub fn as_ref(&self) -> BandPair<&T> {
        BandPair {
            blue: &self.blue,
            red: &self.red,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Band, &T)> {
        [(Band::Blue, &self.blue), (Band::Red, &self.red)].into_iter()
    }
}

impl<T> Index<Band> for BandPair<T> {
    type Output = T;

    fn index(&self, band: Band) -> &T {
        match band {
            Band::Blue => &self.blue,
            Band::Red => &self.red,
        }
    }
}

impl<T> IndexMut<Band> for BandPair<T> {
    fn index_mut(&mut self, band: Band) -> &mut T {
        match band {
            Band::Blue => &mut self.blue,
            Band::Red => &mut self.red,
        }
    }
}

/// Stored uncertainty of a coefficient vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoefficientUncertainty {
    /// Correlation matrix (unit diagonal) plus per-coefficient formal errors.
    /// Converted to absolute covariance with the record's standard deviation.
    Correlation {
        correlations: Array2<f64>,
        errors: Array1<f64>,
    },
    /// Absolute covariance, used as is.
    Covariance(Array2<f64>),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(
        "source {source_id} ({band}): coefficient vector has length {found} but n_parameters is {expected}"
    )]
    CoefficientLength {
        source_id: i64,
        band: Band,
        expected: usize,
        found: usize,
    },
    #[error(
        "source {source_id} ({band}): n_relevant_bases ({relevant}) exceeds n_parameters ({parameters})"
    )]
    RelevantBasesExceedParameters {
        source_id: i64,
        band: Band,
        relevant: usize,
        parameters: usize,
    },
    #[error("source {source_id} ({band}): standard deviation must be positive and finite, got {value}")]
    InvalidStandardDeviation {
        source_id: i64,
        band: Band,
        value: f64,
    },
    #[error("source {source_id} ({band}): coefficients contain non-finite values")]
    NonFiniteCoefficients { source_id: i64, band: Band },
    #[error("source {source_id} ({band}): {source}")]
    Uncertainty {
        source_id: i64,
        band: Band,
        #[source]
        source: CovarianceError,
    },
}

/// Basis coefficients of one source in one band, as delivered by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisCoefficientRecord {
    pub source_id: i64,
    pub band: Band,
    pub coefficients: Array1<f64>,
    pub n_parameters: usize,
    pub n_relevant_bases: usize,
    pub standard_deviation: f64,
    pub uncertainty: CoefficientUncertainty,
    pub basis_function_id: u32,
}

impl BasisCoefficientRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        let (source_id, band) = (self.source_id, self.band);
        if self.coefficients.len() != self.n_parameters {
            return Err(RecordError::CoefficientLength {
                source_id,
                band,
                expected: self.n_parameters,
                found: self.coefficients.len(),
            });
        }
        if self.n_relevant_bases > self.n_parameters {
            return Err(RecordError::RelevantBasesExceedParameters {
                source_id,
                band,
                relevant: self.n_relevant_bases,
                parameters: self.n_parameters,
            });
        }
        if !(self.standard_deviation.is_finite() && self.standard_deviation > 0.0) {
            return Err(RecordError::InvalidStandardDeviation {
                source_id,
                band,
                value: self.standard_deviation,
            });
        }
        if !self.coefficients.iter().all(|v| v.is_finite()) {
            return Err(RecordError::NonFiniteCoefficients { source_id, band });
        }
        let checked = match &self.uncertainty {
            CoefficientUncertainty::Correlation {
                correlations,
                errors,
            } => validate_correlation(correlations, errors),
            CoefficientUncertainty::Covariance(cov) => validate_covariance(cov),
        };
        checked.map_err(|source| RecordError::Uncertainty {
            source_id,
            band,
            source,
        })?;
        let dim = match &self.uncertainty {
            CoefficientUncertainty::Correlation { correlations, .. } => correlations.nrows(),
            CoefficientUncertainty::Covariance(cov) => cov.nrows(),
        };
        if dim != self.n_parameters {
            return Err(RecordError::Uncertainty {
                source_id,
                band,
                source: CovarianceError::DimensionMismatch {
                    expected: self.n_parameters,
                    found: dim,
                },
            });
        }
        Ok(())
    }
}

/// All band records of one source. Either band may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecords {
    pub source_id: i64,
    pub bands: BandPair<Option<BasisCoefficientRecord>>,
}

impl SourceRecords {
    /// Group loose per-band records by source, keeping first-seen source order.
    /// A later record for an already filled band replaces the earlier one.
    pub fn group(records: impl IntoIterator<Item = BasisCoefficientRecord>) -> Vec<SourceRecords> {
        let mut order: Vec<SourceRecords> = Vec::new();
        let mut index = std::collections::HashMap::<i64, usize>::new();
        for record in records {
            let slot = *index.entry(record.source_id).or_insert_with(|| {
                order.push(SourceRecords {
                    source_id: record.source_id,
                    bands: BandPair::default(),
                });
                order.len() - 1
            });
            let band = record.band;
            order[slot].bands[band] = Some(record);
        }
        order
    }
}

/// Flux sampled from one band on a shared abscissa.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledBandSpectrum {
    pub band: Band,
    pub positions: Array1<f64>,
    pub flux: Array1<f64>,
    pub error: Array1<f64>,
    pub covariance: Option<Array2<f64>>,
}

impl SampledBandSpectrum {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Band-agnostic absolute spectrum. `missing[j]` marks positions no band informs;
/// flux, error and covariance are NaN there.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSpectrum {
    pub positions: Array1<f64>,
    pub flux: Array1<f64>,
    pub error: Array1<f64>,
    pub covariance: Option<Array2<f64>>,
    pub missing: Array1<bool>,
}

impl MergedSpectrum {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn covered_count(&self) -> usize {
        self.missing.iter().filter(|&&m| !m).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn record(source_id: i64, band: Band) -> BasisCoefficientRecord {
        BasisCoefficientRecord {
            source_id,
            band,
            coefficients: array![1.0, 2.0],
            n_parameters: 2,
            n_relevant_bases: 2,
            standard_deviation: 1.0,
            uncertainty: CoefficientUncertainty::Correlation {
                correlations: Array2::eye(2),
                errors: array![0.1, 0.2],
            },
            basis_function_id: 56,
        }
    }

    #[test]
    fn band_tags_parse_with_aliases() {
        assert_eq!("blue".parse::<Band>(), Ok(Band::Blue));
        assert_eq!(" RP ".parse::<Band>(), Ok(Band::Red));
        assert_eq!(
            "green".parse::<Band>(),
            Err(UnknownBandError("green".to_string()))
        );
        assert_eq!(Band::Blue.other(), Band::Red);
    }

    #[test]
    fn band_pair_indexes_by_band() {
        let mut pair = BandPair::new(1, 2);
        pair[Band::Red] += 10;
        assert_eq!(pair[Band::Blue], 1);
        assert_eq!(pair[Band::Red], 12);
        let doubled = pair.map(|_, v| v * 2);
        assert_eq!(doubled, BandPair::new(2, 24));
    }

    #[test]
    fn validate_rejects_broken_invariants() {
        assert!(record(1, Band::Blue).validate().is_ok());

        let mut too_many = record(1, Band::Blue);
        too_many.n_relevant_bases = 3;
        assert!(matches!(
            too_many.validate(),
            Err(RecordError::RelevantBasesExceedParameters { .. })
        ));

        let mut short = record(1, Band::Red);
        short.coefficients = array![1.0];
        assert!(matches!(
            short.validate(),
            Err(RecordError::CoefficientLength { .. })
        ));

        let mut sigma = record(1, Band::Red);
        sigma.standard_deviation = 0.0;
        assert!(matches!(
            sigma.validate(),
            Err(RecordError::InvalidStandardDeviation { .. })
        ));

        let mut asym = record(1, Band::Red);
        asym.uncertainty = CoefficientUncertainty::Covariance(array![[1.0, 0.5], [0.0, 1.0]]);
        assert!(matches!(
            asym.validate(),
            Err(RecordError::Uncertainty { .. })
        ));
    }

    #[test]
    fn group_collects_bands_per_source_in_first_seen_order() {
        let grouped = SourceRecords::group(vec![
            record(7, Band::Red),
            record(3, Band::Blue),
            record(7, Band::Blue),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].source_id, 7);
        assert!(grouped[0].bands.blue.is_some() && grouped[0].bands.red.is_some());
        assert_eq!(grouped[1].source_id, 3);
        assert!(grouped[1].bands.red.is_none());
    }
}
