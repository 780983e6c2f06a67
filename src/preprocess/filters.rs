use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::FilterKind;
use crate::error::{Error, Result};

/// Low-pass window width used when Gaussian damping is enabled.
const GAUSSIAN_SIGMA: f32 = 0.06;

/// DFT bin frequencies in cycles per sample: `i/n` below the midpoint,
/// `i/n - 1` above it.
pub fn frequency(n: usize) -> Vec<f32> {
    let mid = n.div_ceil(2);
    (0..n)
        .map(|i| {
            if i < mid {
                i as f32 / n as f32
            } else {
                i as f32 / n as f32 - 1.0
            }
        })
        .collect()
}

/// Ram-Lak ramp, `(2/n) * |f|`. The 2/n factor compensates for the
/// unnormalised forward/inverse transform pair.
pub fn ramlak(n: usize) -> Vec<f32> {
    let c = 2.0 / n as f32;
    frequency(n).iter().map(|f| c * f.abs()).collect()
}

/// Shepp-Logan ramp, the Ram-Lak windowed by `sinc(f)`.
pub fn shepp(n: usize) -> Vec<f32> {
    let c = 2.0 / n as f32;
    frequency(n)
        .iter()
        .map(|&f| {
            if f == 0.0 {
                0.0
            } else {
                let t = std::f32::consts::PI * f;
                c * (f * t.sin() / t).abs()
            }
        })
        .collect()
}

/// Gaussian low-pass window, mirrored about the midpoint. Index 0 is
/// left at zero, matching the ramp filters it multiplies.
pub fn gaussian(n: usize, sigma: f32) -> Vec<f32> {
    let mid = (n + 1) / 2;
    let weight = |i: usize| {
        let u = i as f32 / mid as f32;
        (-(u * u) / (2.0 * sigma * sigma)).exp()
    };
    let mut result = vec![0.0; n];
    for (i, r) in result.iter_mut().enumerate().take(mid).skip(1) {
        *r = weight(i);
    }
    for (j, r) in result.iter_mut().enumerate().skip(mid) {
        *r = weight(2 * mid - j);
    }
    result
}

/// Frequency-domain table for the configured ramp filter.
pub fn filter_table(kind: FilterKind, cols: usize, gaussian_lowpass: bool) -> Vec<f32> {
    let mut table = match kind {
        FilterKind::Ramlak => ramlak(cols),
        FilterKind::Shepp => shepp(cols),
    };
    if gaussian_lowpass {
        for (t, g) in table.iter_mut().zip(gaussian(cols, GAUSSIAN_SIGMA)) {
            *t *= g;
        }
    }
    table
}

/// Row-wise ramp filtering with worker-private plans and scratch. Each
/// preprocessing worker owns one of these so FFT plans are reused
/// without contention.
///
/// The transform pair is unnormalised in the FFTW convention; the
/// 2/n factor baked into the tables accounts for it.
pub struct RampFilter {
    table: Arc<Vec<f32>>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    line: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl RampFilter {
    pub fn new(cols: usize, table: Arc<Vec<f32>>) -> Result<Self> {
        if cols == 0 || table.len() != cols {
            return Err(Error::FftPlan(format!(
                "cannot plan length-{cols} row transform with a {}-entry filter",
                table.len()
            )));
        }
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(cols);
        let inverse = planner.plan_fft_inverse(cols);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Ok(Self {
            table,
            forward,
            inverse,
            line: vec![Complex::default(); cols],
            scratch: vec![Complex::default(); scratch_len],
        })
    }

    /// Replace the filter table (viewer switched filters). Plans are
    /// kept; the table length must match the planned width.
    pub fn set_table(&mut self, table: Arc<Vec<f32>>) {
        debug_assert_eq!(table.len(), self.line.len());
        self.table = table;
    }

    /// Filter every detector row of one projection in place.
    pub fn apply(&mut self, data: &mut [f32]) {
        let cols = self.line.len();
        for row in data.chunks_exact_mut(cols) {
            for (c, &v) in self.line.iter_mut().zip(row.iter()) {
                *c = Complex::new(v, 0.0);
            }
            self.forward
                .process_with_scratch(&mut self.line, &mut self.scratch);
            for (c, &h) in self.line.iter_mut().zip(self.table.iter()) {
                *c *= h;
            }
            self.inverse
                .process_with_scratch(&mut self.line, &mut self.scratch);
            for (v, c) in row.iter_mut().zip(&self.line) {
                *v = c.re;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!(
                (a - e).abs() < 1e-6,
                "index {i}: actual {a}, expected {e}"
            );
        }
    }

    #[test]
    fn ramlak_reference_values() {
        assert_close(&ramlak(4), &[0.0, 0.125, 0.25, 0.125]);
    }

    #[test]
    fn shepp_reference_values() {
        assert_close(&shepp(5), &[0.0, 0.074839, 0.121092, 0.121092, 0.074839]);
    }

    #[test]
    fn ramps_are_symmetric_about_midpoint() {
        for n in [4usize, 5, 8, 16, 33] {
            let r = ramlak(n);
            let s = shepp(n);
            for i in 1..n {
                assert!((r[i] - r[n - i]).abs() < 1e-7, "ramlak({n})[{i}]");
                assert!((s[i] - s[n - i]).abs() < 1e-7, "shepp({n})[{i}]");
            }
        }
    }

    #[test]
    fn gaussian_window_shape() {
        let g = gaussian(8, 0.5);
        assert_eq!(g[0], 0.0);
        // monotonically decreasing up to the midpoint
        assert!(g[1] > g[2] && g[2] > g[3]);
        // mirrored
        assert!((g[3] - g[5]).abs() < 1e-7);
        assert!((g[2] - g[6]).abs() < 1e-7);
    }

    #[test]
    fn ramlak_filters_reference_rows() {
        let table = Arc::new(ramlak(5));
        let mut filter = RampFilter::new(5, table).unwrap();
        let mut data = vec![1.1, 0.2, 3.5, 2.7, 1.3, 2.5, 0.1, 4.8, 5.2, 0.6];
        filter.apply(&mut data);
        assert_close(
            &data[..5],
            &[0.024381, -0.989666, 0.999279, 0.250950, -0.284944],
        );
    }

    #[test]
    fn zero_width_plan_fails() {
        assert!(matches!(
            RampFilter::new(0, Arc::new(vec![])),
            Err(Error::FftPlan(_))
        ));
    }

    #[test]
    fn constant_row_is_annihilated() {
        // Both ramps zero the DC bin, so a constant row filters to ~0.
        let table = Arc::new(shepp(8));
        let mut filter = RampFilter::new(8, table).unwrap();
        let mut data = vec![3.0; 8];
        filter.apply(&mut data);
        for v in data {
            assert!(v.abs() < 1e-5);
        }
    }
}
