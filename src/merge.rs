//! Combines the blue and red samples of a source into one absolute spectrum.

use crate::dispersion::interpolate;
use crate::model::BlendTable;
use crate::types::{Band, BandPair, MergedSpectrum, SampledBandSpectrum};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("no sampled data for band(s): {}", format_bands(.bands))]
    MissingBand { bands: Vec<Band> },
}

fn format_bands(bands: &[Band]) -> String {
    bands
        .iter()
        .map(|b| b.tag())
        .collect::<Vec<_>>()
        .join(", ")
}

/// What to do when only one band is available. There is no default: the
/// calibration and photometry callers want different answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The whole merged result is NaN.
    FullyMissing,
    /// The present band is copied unweighted; positions it does not cover
    /// (its blend weight is zero) are NaN.
    MaskedCoverage,
}

/// Blend weights of both bands on a wavelength grid.
///
/// The blue weight is interpolated from the table, held constant beyond its
/// ends and clamped to [0, 1]; the red weight is its complement.
pub fn blend_weights(table: &BlendTable, wavelengths: &[f64]) -> BandPair<Array1<f64>> {
    let xs = &table.wavelengths;
    let ys = &table.blue_weights;
    let blue: Array1<f64> = wavelengths
        .iter()
        .map(|&w| {
            let v = if xs.len() == 1 || w <= xs[0] {
                ys[0]
            } else if w >= xs[xs.len() - 1] {
                ys[ys.len() - 1]
            } else {
                interpolate(xs, ys, w)
            };
            v.clamp(0.0, 1.0)
        })
        .collect();
    let red = blue.mapv(|b| 1.0 - b);
    BandPair::new(blue, red)
}

/// Merges per-band samples with wavelength-dependent weights.
///
/// Bands are treated as independent: `var = sum w^2 sigma^2` and each band's
/// covariance is scaled by the outer product of its own weights. The merged
/// covariance is present only when every contributing band carries one.
///
/// # Panics
/// If the present bands disagree on their positions or the weights do not
/// match the grid length.
pub fn merge_bands(
    samples: BandPair<Option<&SampledBandSpectrum>>,
    weights: &BandPair<Array1<f64>>,
    policy: MergePolicy,
) -> Result<MergedSpectrum, MergeError> {
    match (samples.blue, samples.red) {
        (Some(blue), Some(red)) => Ok(merge_two(blue, red, weights)),
        (Some(only), None) | (None, Some(only)) => {
            assert_eq!(
                weights[only.band].len(),
                only.len(),
                "blend weights must match the sampling grid"
            );
            Ok(match policy {
                MergePolicy::FullyMissing => fully_missing(only),
                MergePolicy::MaskedCoverage => masked_coverage(only, &weights[only.band]),
            })
        }
        (None, None) => Err(MergeError::MissingBand {
            bands: Band::ALL.to_vec(),
        }),
    }
}

fn merge_two(
    blue: &SampledBandSpectrum,
    red: &SampledBandSpectrum,
    weights: &BandPair<Array1<f64>>,
) -> MergedSpectrum {
    let m = blue.len();
    assert_eq!(
        blue.positions, red.positions,
        "both bands must be sampled on the same grid"
    );
    assert!(
        weights.blue.len() == m && weights.red.len() == m,
        "blend weights must match the sampling grid"
    );
    let bands = BandPair::new(blue, red);

    let mut flux = Array1::<f64>::zeros(m);
    let mut error = Array1::<f64>::zeros(m);
    let mut missing = Array1::from_elem(m, false);
    for j in 0..m {
        let mut f = 0.0;
        let mut var = 0.0;
        let mut informed = false;
        for band in Band::ALL {
            let w = weights[band][j];
            if w == 0.0 {
                continue;
            }
            informed = true;
            f += w * bands[band].flux[j];
            var += w * w * bands[band].error[j] * bands[band].error[j];
        }
        if informed {
            flux[j] = f;
            error[j] = var.sqrt();
        } else {
            flux[j] = f64::NAN;
            error[j] = f64::NAN;
            missing[j] = true;
        }
    }

    let covariance = match (&blue.covariance, &red.covariance) {
        (Some(cb), Some(cr)) => {
            let mut cov = Array2::<f64>::zeros((m, m));
            for (band, c) in [(Band::Blue, cb), (Band::Red, cr)] {
                let w = &weights[band];
                for j in 0..m {
                    if w[j] == 0.0 {
                        continue;
                    }
                    for k in 0..m {
                        if w[k] != 0.0 {
                            cov[[j, k]] += w[j] * w[k] * c[[j, k]];
                        }
                    }
                }
            }
            mask_covariance(&mut cov, &missing);
            Some(cov)
        }
        (None, None) => None,
        _ => {
            log::debug!("only one band carries a covariance; merged covariance dropped");
            None
        }
    };

    MergedSpectrum {
        positions: blue.positions.clone(),
        flux,
        error,
        covariance,
        missing,
    }
}

fn fully_missing(only: &SampledBandSpectrum) -> MergedSpectrum {
    let m = only.len();
    MergedSpectrum {
        positions: only.positions.clone(),
        flux: Array1::from_elem(m, f64::NAN),
        error: Array1::from_elem(m, f64::NAN),
        covariance: only
            .covariance
            .as_ref()
            .map(|_| Array2::from_elem((m, m), f64::NAN)),
        missing: Array1::from_elem(m, true),
    }
}

fn masked_coverage(only: &SampledBandSpectrum, own_weights: &Array1<f64>) -> MergedSpectrum {
    let missing = own_weights.mapv(|w| w == 0.0);
    let mut flux = only.flux.clone();
    let mut error = only.error.clone();
    for (j, &m) in missing.iter().enumerate() {
        if m {
            flux[j] = f64::NAN;
            error[j] = f64::NAN;
        }
    }
    let covariance = only.covariance.clone().map(|mut cov| {
        mask_covariance(&mut cov, &missing);
        cov
    });
    MergedSpectrum {
        positions: only.positions.clone(),
        flux,
        error,
        covariance,
        missing,
    }
}

fn mask_covariance(cov: &mut Array2<f64>, missing: &Array1<bool>) {
    for (j, &m) in missing.iter().enumerate() {
        if m {
            cov.row_mut(j).fill(f64::NAN);
            cov.column_mut(j).fill(f64::NAN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn spectrum(band: Band, flux: Array1<f64>, error: Array1<f64>) -> SampledBandSpectrum {
        let m = flux.len();
        let covariance = Some(Array2::from_diag(&error.mapv(|e| e * e)));
        SampledBandSpectrum {
            band,
            positions: Array1::linspace(400.0, 800.0, m),
            flux,
            error,
            covariance,
        }
    }

    #[test]
    fn weights_interpolate_clamp_and_complement() {
        let table = BlendTable::linear_crossover(600.0, 50.0);
        let w = blend_weights(&table, &[400.0, 550.0, 575.0, 600.0, 650.0, 900.0]);
        assert_eq!(w.blue, array![1.0, 1.0, 0.75, 0.5, 0.0, 0.0]);
        for j in 0..6 {
            assert_abs_diff_eq!(w.blue[j] + w.red[j], 1.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn two_band_merge_weights_flux_and_variance() {
        let blue = spectrum(Band::Blue, array![2.0, 4.0, 6.0], array![0.1, 0.2, 0.3]);
        let red = spectrum(Band::Red, array![1.0, 3.0, 5.0], array![0.4, 0.5, 0.6]);
        let weights = BandPair::new(array![1.0, 0.5, 0.0], array![0.0, 0.5, 1.0]);
        let merged = merge_bands(
            BandPair::new(Some(&blue), Some(&red)),
            &weights,
            MergePolicy::MaskedCoverage,
        )
        .expect("merge");
        assert_eq!(merged.flux, array![2.0, 3.5, 5.0]);
        assert_abs_diff_eq!(merged.error[0], 0.1, epsilon = 1e-15);
        assert_abs_diff_eq!(
            merged.error[1],
            (0.25 * 0.04 + 0.25 * 0.25f64).sqrt(),
            epsilon = 1e-15
        );
        assert_abs_diff_eq!(merged.error[2], 0.6, epsilon = 1e-15);
        let cov = merged
            .covariance
            .as_ref()
            .expect("both bands carry covariance");
        for j in 0..3 {
            assert_abs_diff_eq!(cov[[j, j]], merged.error[j].powi(2), epsilon = 1e-14);
        }
        assert_eq!(merged.covered_count(), 3);
    }

    #[test]
    fn positions_with_no_weight_from_either_band_are_missing() {
        let blue = spectrum(Band::Blue, array![2.0, 4.0, 6.0], array![0.1, 0.2, 0.3]);
        let red = spectrum(Band::Red, array![1.0, 3.0, 5.0], array![0.4, 0.5, 0.6]);
        let weights = BandPair::new(array![1.0, 0.0, 0.0], array![0.0, 0.0, 1.0]);
        let merged = merge_bands(
            BandPair::new(Some(&blue), Some(&red)),
            &weights,
            MergePolicy::FullyMissing,
        )
        .expect("merge");
        assert_eq!(merged.missing, array![false, true, false]);
        assert_eq!(merged.flux[0], 2.0);
        assert!(merged.flux[1].is_nan() && merged.error[1].is_nan());
        assert_eq!(merged.flux[2], 5.0);
        assert_eq!(merged.covered_count(), 2);
        let cov = merged.covariance.as_ref().expect("covariance");
        for k in 0..3 {
            assert!(cov[[1, k]].is_nan() && cov[[k, 1]].is_nan());
        }
        assert_abs_diff_eq!(cov[[0, 0]], 0.01, epsilon = 1e-15);
        assert_abs_diff_eq!(cov[[2, 2]], 0.36, epsilon = 1e-15);
        assert_eq!(cov[[0, 2]], 0.0);
    }

    #[test]
    fn merged_covariance_scales_each_band_by_its_weight_outer_product() {
        let mut blue = spectrum(Band::Blue, array![1.0, 1.0], array![1.0, 1.0]);
        let mut red = spectrum(Band::Red, array![1.0, 1.0], array![1.0, 1.0]);
        blue.covariance = Some(array![[1.0, 0.5], [0.5, 1.0]]);
        red.covariance = Some(array![[2.0, -0.4], [-0.4, 2.0]]);
        let weights = BandPair::new(array![0.8, 0.3], array![0.2, 0.7]);
        let merged = merge_bands(
            BandPair::new(Some(&blue), Some(&red)),
            &weights,
            MergePolicy::FullyMissing,
        )
        .expect("merge");
        let cov = merged.covariance.expect("covariance");
        let expected = 0.8 * 0.3 * 0.5 + 0.2 * 0.7 * -0.4;
        assert_abs_diff_eq!(cov[[0, 1]], expected, epsilon = 1e-15);
        assert_abs_diff_eq!(cov[[1, 0]], expected, epsilon = 1e-15);
    }

    #[test]
    fn fully_missing_policy_blanks_everything() {
        let red = spectrum(Band::Red, array![1.0, 3.0], array![0.4, 0.5]);
        let weights = BandPair::new(array![1.0, 0.0], array![0.0, 1.0]);
        let merged = merge_bands(BandPair::new(None, Some(&red)), &weights, MergePolicy::FullyMissing)
            .expect("merge");
        assert!(merged.flux.iter().all(|v| v.is_nan()));
        assert!(merged.error.iter().all(|v| v.is_nan()));
        assert!(merged.missing.iter().all(|&m| m));
        assert!(merged.covariance.expect("shape kept").iter().all(|v| v.is_nan()));
    }

    #[test]
    fn masked_policy_copies_the_present_band_where_it_has_weight() {
        let red = spectrum(Band::Red, array![1.0, 3.0, 5.0], array![0.4, 0.5, 0.6]);
        let weights = BandPair::new(array![1.0, 0.5, 0.0], array![0.0, 0.5, 1.0]);
        let merged = merge_bands(BandPair::new(None, Some(&red)), &weights, MergePolicy::MaskedCoverage)
            .expect("merge");
        assert!(merged.flux[0].is_nan() && merged.error[0].is_nan());
        assert_eq!(merged.missing, array![true, false, false]);
        // unweighted copy
        assert_eq!(merged.flux[1], 3.0);
        assert_eq!(merged.error[2], 0.6);
        let cov = merged.covariance.expect("covariance");
        assert!(cov[[0, 1]].is_nan() && cov[[1, 0]].is_nan());
        assert_abs_diff_eq!(cov[[2, 2]], 0.36, epsilon = 1e-15);
    }

    #[test]
    fn no_band_names_both_tags() {
        let weights = BandPair::new(array![1.0], array![0.0]);
        let err = merge_bands(BandPair::new(None, None), &weights, MergePolicy::MaskedCoverage)
            .expect_err("nothing to merge");
        assert_eq!(
            err,
            MergeError::MissingBand {
                bands: vec![Band::Blue, Band::Red]
            }
        );
        assert_eq!(err.to_string(), "no sampled data for band(s): blue, red");
    }
}
