use ndarray::{Array1, Array2};
use xpspec::{
    AbsoluteRequest, Band, BasisCoefficientRecord, BatchRequest, CoefficientUncertainty,
    InstrumentModel, MergePolicy, SamplingOptions, SourceRecords, SpectrumEngine, SpectrumError,
};

const MODEL_JSON: &str = r#"{
  "version": "integration",
  "bands": {
    "blue": {
      "basis_function_id": 56,
      "domain": { "pseudo_range": [0.0, 60.0], "normalized_range": [-4.5, 4.5] },
      "transformation": { "v": 1, "dim": [3, 3], "data": [1.0, 0.1, 0.0, 0.0, 1.0, 0.1, 0.0, 0.0, 1.0] },
      "dispersion": { "wavelengths": [330.0, 500.0, 680.0], "pseudo": [60.0, 30.0, 0.0] }
    },
    "red": {
      "basis_function_id": 57,
      "domain": { "pseudo_range": [0.0, 60.0], "normalized_range": [-4.5, 4.5] },
      "transformation": { "v": 1, "dim": [3, 3], "data": [1.0, 0.0, 0.0, 0.2, 1.0, 0.0, 0.0, 0.2, 1.0] },
      "dispersion": { "wavelengths": [620.0, 800.0, 1050.0], "pseudo": [0.0, 25.0, 60.0] }
    }
  },
  "blend": { "wavelengths": [630.0, 670.0], "blue_weights": [1.0, 0.0] }
}"#;

fn record(source_id: i64, band: Band, shift: f64) -> BasisCoefficientRecord {
    BasisCoefficientRecord {
        source_id,
        band,
        coefficients: Array1::from(vec![1.0 + shift, -0.3 * shift, 0.4]),
        n_parameters: 3,
        n_relevant_bases: 2,
        standard_deviation: 1.1,
        uncertainty: CoefficientUncertainty::Covariance(Array2::from_diag(&Array1::from(vec![
            0.01, 0.02, 0.03,
        ]))),
        basis_function_id: match band {
            Band::Blue => 56,
            Band::Red => 57,
        },
    }
}

fn sources() -> Vec<SourceRecords> {
    let mut records = Vec::new();
    for id in 0..12 {
        let shift = id as f64 * 0.1;
        records.push(record(id, Band::Blue, shift));
        if id % 3 != 0 {
            records.push(record(id, Band::Red, -shift));
        }
    }
    SourceRecords::group(records)
}

fn request() -> BatchRequest {
    BatchRequest {
        options: SamplingOptions {
            truncation: true,
            with_covariance: true,
            ..SamplingOptions::default()
        },
        pseudo_grid: Some(Array1::linspace(2.0, 58.0, 15).to_vec()),
        absolute: Some(AbsoluteRequest {
            wavelengths: Array1::linspace(340.0, 1040.0, 36).to_vec(),
            policy: MergePolicy::MaskedCoverage,
        }),
        extrema: true,
        lines: true,
    }
}

#[test]
fn model_loads_from_json() {
    let model = InstrumentModel::from_json_str(MODEL_JSON).expect("model json");
    assert_eq!(model.version, "integration");
    assert_eq!(model.band(Band::Red).transformation[[1, 0]], 0.2);
    let (lo, hi) = model.combined_wavelength_range();
    assert_eq!((lo, hi), (330.0, 1050.0));
}

#[test]
fn malformed_model_is_rejected() {
    let broken = MODEL_JSON.replace("[630.0, 670.0]", "[670.0, 630.0]");
    assert!(InstrumentModel::from_json_str(&broken).is_err());
    assert!(InstrumentModel::from_json_str("{}").is_err());
}

#[test]
fn batch_results_do_not_depend_on_source_order() {
    let model = InstrumentModel::from_json_str(MODEL_JSON).expect("model json");
    let forward_sources = sources();
    let mut reversed_sources = forward_sources.clone();
    reversed_sources.reverse();

    let forward = SpectrumEngine::new(model.clone())
        .expect("engine")
        .process_batch(&forward_sources, &request());
    let reversed = SpectrumEngine::new(model)
        .expect("engine")
        .process_batch(&reversed_sources, &request());

    assert_eq!(forward.len(), 12);
    let ids: Vec<i64> = forward.iter().map(|o| o.source_id).collect();
    assert_eq!(ids, (0..12).collect::<Vec<_>>());
    for outcome in &forward {
        let twin = reversed
            .iter()
            .find(|o| o.source_id == outcome.source_id)
            .expect("same sources");
        let a = outcome.result.as_ref().expect("processed");
        let b = twin.result.as_ref().expect("processed");
        assert_eq!(a.internal, b.internal);
        assert_eq!(a.extrema, b.extrema);
        assert_eq!(a.lines, b.lines);
        let (ma, mb) = (
            a.absolute.as_ref().expect("absolute"),
            b.absolute.as_ref().expect("absolute"),
        );
        assert_eq!(ma.missing, mb.missing);
        assert!(same_bits(ma.flux.iter(), mb.flux.iter()));
        assert!(same_bits(ma.error.iter(), mb.error.iter()));
        let (ca, cb) = (
            ma.covariance.as_ref().expect("covariance"),
            mb.covariance.as_ref().expect("covariance"),
        );
        assert!(same_bits(ca.iter(), cb.iter()));
    }
}

// NaN marks uncovered samples, so compare bit patterns
fn same_bits<'a>(
    a: impl Iterator<Item = &'a f64>,
    b: impl Iterator<Item = &'a f64>,
) -> bool {
    a.map(|v| v.to_bits()).eq(b.map(|v| v.to_bits()))
}

#[test]
fn single_band_sources_are_masked_where_only_red_would_inform() {
    let model = InstrumentModel::from_json_str(MODEL_JSON).expect("model json");
    let engine = SpectrumEngine::new(model).expect("engine");
    let outcomes = engine.process_batch(&sources(), &request());
    let blue_only = outcomes[0].result.as_ref().expect("processed");
    let spectrum = blue_only.absolute.as_ref().expect("absolute requested");
    for (j, &w) in spectrum.positions.iter().enumerate() {
        assert_eq!(spectrum.missing[j], w >= 670.0, "wavelength {w}");
        assert_eq!(spectrum.flux[j].is_nan(), w >= 670.0);
    }
    assert!(blue_only.internal.red.is_none());
    assert!(blue_only.extrema.blue.is_some());

    let both = outcomes[1].result.as_ref().expect("processed");
    let merged = both.absolute.as_ref().expect("absolute requested");
    assert_eq!(merged.covered_count(), merged.len());
}

#[test]
fn a_bad_record_only_fails_its_own_source() {
    let model = InstrumentModel::from_json_str(MODEL_JSON).expect("model json");
    let engine = SpectrumEngine::new(model).expect("engine");
    let mut batch = sources();
    if let Some(r) = batch[4].bands.red.as_mut() {
        r.coefficients = Array1::from(vec![1.0, 2.0]);
    }
    let outcomes = engine.process_batch(&batch, &request());
    for (i, outcome) in outcomes.iter().enumerate() {
        if i == 4 {
            assert!(matches!(outcome.result, Err(SpectrumError::Record(_))));
        } else {
            assert!(outcome.result.is_ok(), "source {i}: {:?}", outcome.result);
        }
    }
}
