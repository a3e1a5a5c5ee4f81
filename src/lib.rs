#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod cache;
pub mod covariance;
pub mod dispersion;
pub mod linalg;
pub mod lines;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod roots;
pub mod sampling;
pub mod types;

pub use basis::{build_design_matrix, hermite_function_rows, hermite_functions};
pub use cache::{AbscissaKey, AbscissaUnit, BasisKey, DesignKey, ReadThroughCache};
pub use covariance::{
    CovarianceConvention, CovarianceError, to_covariance, unpack_correlations, validate_correlation,
    validate_covariance,
};
pub use dispersion::{DispersionCurve, DispersionError, DispersionMapper, SamplingTarget};
pub use lines::{LineKind, LineRecord, find_lines};
pub use merge::{MergeError, MergePolicy, blend_weights, merge_bands};
pub use model::{BandModel, BlendTable, HermiteDomain, InstrumentModel, ModelError};
pub use pipeline::{
    AbsoluteRequest, BatchRequest, SourceOutcome, SourceProducts, SpectrumEngine, SpectrumError,
};
pub use roots::{DerivativeRoots, ExtremaRoots, ExtremaSet, RootStatus, find_derivative_roots};
pub use sampling::{SamplingOptions, Truncation, sample_band, truncate_coefficients};
pub use types::{
    Band, BandPair, BasisCoefficientRecord, CoefficientUncertainty, MergedSpectrum, RecordError,
    SampledBandSpectrum, SourceRecords,
};
