//! Reference values and invariants for the ramp filter kernels and
//! the calibration reciprocal.

use std::sync::Arc;

use proptest::prelude::*;

use slicecast::calibrate::Calibration;
use slicecast::preprocess::filters::{RampFilter, gaussian, ramlak, shepp};
use slicecast::sino::projections_to_sino;

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-6, "index {i}: actual {a}, expected {e}");
    }
}

#[test]
fn ramlak_four_point_reference() {
    assert_close(&ramlak(4), &[0.0, 0.125, 0.25, 0.125]);
}

#[test]
fn shepp_five_point_reference() {
    assert_close(&shepp(5), &[0.0, 0.074839, 0.121092, 0.121092, 0.074839]);
}

#[test]
fn ramlak_filters_two_row_projection() {
    let mut data = vec![1.1, 0.2, 3.5, 2.7, 1.3, 2.5, 0.1, 4.8, 5.2, 0.6];
    let mut filter = RampFilter::new(5, Arc::new(ramlak(5))).unwrap();
    filter.apply(&mut data);
    assert_close(
        &data[..5],
        &[0.024381, -0.989666, 0.999279, 0.250950, -0.284944],
    );
}

proptest! {
    /// Ramp filters are symmetric about the midpoint (n+1)/2.
    #[test]
    fn ramp_filters_are_symmetric(n in 2usize..96) {
        let r = ramlak(n);
        let s = shepp(n);
        for i in 1..n {
            prop_assert!((r[i] - r[n - i]).abs() < 1e-7);
            prop_assert!((s[i] - s[n - i]).abs() < 1e-7);
        }
    }

    /// The Gaussian window never exceeds one and mirrors about mid.
    #[test]
    fn gaussian_window_is_bounded_and_mirrored(n in 3usize..64, sigma in 0.01f32..2.0) {
        let g = gaussian(n, sigma);
        let mid = (n + 1) / 2;
        for (i, &v) in g.iter().enumerate() {
            prop_assert!((0.0..=1.0).contains(&v), "index {}: {}", i, v);
        }
        for j in mid..n {
            let mirrored = 2 * mid - j;
            if mirrored > 0 && mirrored < mid {
                prop_assert!((g[j] - g[mirrored]).abs() < 1e-7);
            }
        }
    }

    /// Reciprocal is 1/(mean(flat) - mean(dark)) where the denominator
    /// is non-zero, and exactly 1 where it vanishes.
    #[test]
    fn reciprocal_matches_definition(
        darks in proptest::collection::vec(0u16..200, 6),
        flats in proptest::collection::vec(0u16..200, 6),
    ) {
        let pixels = 3;
        let cal = Calibration::new(pixels, 2, 2);
        cal.accept_dark(&darks[..3]);
        cal.accept_dark(&darks[3..]);
        cal.accept_flat(&flats[..3]);
        cal.accept_flat(&flats[3..]);
        cal.recompute();
        let maps = cal.maps().unwrap();

        for i in 0..pixels {
            let dark_mean = (darks[i] as f32 + darks[i + 3] as f32) / 2.0;
            let flat_mean = (flats[i] as f32 + flats[i + 3] as f32) / 2.0;
            let expected = if dark_mean == flat_mean {
                1.0
            } else {
                1.0 / (flat_mean - dark_mean)
            };
            prop_assert!((maps.reciprocal[i] - expected).abs() < 1e-6);
            prop_assert!((maps.dark_mean[i] - dark_mean).abs() < 1e-6);
        }
    }

    /// Transposing (projection, row, col) to (row, projection, col)
    /// relocates every sample exactly.
    #[test]
    fn transpose_round_trip(
        rows in 1usize..6,
        cols in 1usize..6,
        group_size in 1usize..6,
    ) {
        let group: Vec<f32> = (0..rows * cols * group_size).map(|v| v as f32).collect();
        let mut sino = vec![0.0; group.len()];
        projections_to_sino(&group, &mut sino, rows, cols, group_size);
        for r in 0..rows {
            for g in 0..group_size {
                for c in 0..cols {
                    prop_assert_eq!(
                        sino[r * group_size * cols + g * cols + c],
                        group[g * rows * cols + r * cols + c]
                    );
                }
            }
        }
    }
}
