use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::PaganinSettings;
use crate::error::{Error, Result};

/// Propagation kernel for single-distance Paganin phase retrieval:
/// `(4πβ) / (1 + D·λ·δ·(kx² + ky²))`, with wave numbers folded around
/// the per-axis Nyquist midpoints.
pub fn paganin_kernel(rows: usize, cols: usize, s: &PaganinSettings) -> Vec<f32> {
    let mid_r = (rows + 1) / 2;
    let mid_c = (cols + 1) / 2;
    let dk = s.pixel_size / (2.0 * PI);

    let mut kernel = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        let fi = if i < mid_r { i } else { 2 * mid_r - i };
        let kx = fi as f32 * dk;
        for j in 0..cols {
            let fj = if j < mid_c { j } else { 2 * mid_c - j };
            let ky = fj as f32 * dk;
            let k_squared = kx * kx + ky * ky;
            kernel.push((4.0 * PI * s.beta) / (1.0 + s.distance * s.lambda * s.delta * k_squared));
        }
    }
    kernel
}

/// Single-distance phase retrieval: 2-D filter in frequency space,
/// then the projected-thickness log transform. One instance per
/// worker; the four FFT plans are built once and reused.
pub struct PaganinFilter {
    rows: usize,
    cols: usize,
    kernel: Vec<f32>,
    /// `λ / (4πβ)` applied after the negative log.
    log_scale: f32,
    row_forward: Arc<dyn Fft<f32>>,
    row_inverse: Arc<dyn Fft<f32>>,
    col_forward: Arc<dyn Fft<f32>>,
    col_inverse: Arc<dyn Fft<f32>>,
    freq: Vec<Complex<f32>>,
    column: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl PaganinFilter {
    pub fn new(rows: usize, cols: usize, settings: &PaganinSettings) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::FftPlan(format!(
                "cannot plan {rows}x{cols} phase transform"
            )));
        }
        let mut planner = FftPlanner::new();
        let row_forward = planner.plan_fft_forward(cols);
        let row_inverse = planner.plan_fft_inverse(cols);
        let col_forward = planner.plan_fft_forward(rows);
        let col_inverse = planner.plan_fft_inverse(rows);
        let scratch_len = [&row_forward, &row_inverse, &col_forward, &col_inverse]
            .iter()
            .map(|p| p.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);
        Ok(Self {
            rows,
            cols,
            kernel: paganin_kernel(rows, cols, settings),
            log_scale: settings.lambda / (4.0 * PI * settings.beta),
            row_forward,
            row_inverse,
            col_forward,
            col_inverse,
            freq: vec![Complex::default(); rows * cols],
            column: vec![Complex::default(); rows],
            scratch: vec![Complex::default(); scratch_len],
        })
    }

    /// Retrieve phase for one projection in place.
    pub fn apply(&mut self, data: &mut [f32]) {
        debug_assert_eq!(data.len(), self.rows * self.cols);

        for (c, &v) in self.freq.iter_mut().zip(data.iter()) {
            *c = Complex::new(v, 0.0);
        }
        self.transform_rows(true);
        self.transform_cols(true);

        for (c, &k) in self.freq.iter_mut().zip(&self.kernel) {
            *c *= k;
        }

        self.transform_cols(false);
        self.transform_rows(false);

        // Inverse pair is unnormalised; fold the 1/(rows*cols) in with
        // the log transform.
        let norm = 1.0 / (self.rows * self.cols) as f32;
        for (v, c) in data.iter_mut().zip(&self.freq) {
            let intensity = c.re * norm;
            *v = if intensity <= 0.0 {
                0.0
            } else {
                -intensity.ln() * self.log_scale
            };
        }
    }

    fn transform_rows(&mut self, forward: bool) {
        let fft = if forward {
            self.row_forward.clone()
        } else {
            self.row_inverse.clone()
        };
        for row in self.freq.chunks_exact_mut(self.cols) {
            fft.process_with_scratch(row, &mut self.scratch);
        }
    }

    fn transform_cols(&mut self, forward: bool) {
        let fft = if forward {
            self.col_forward.clone()
        } else {
            self.col_inverse.clone()
        };
        for j in 0..self.cols {
            for (i, c) in self.column.iter_mut().enumerate() {
                *c = self.freq[i * self.cols + j];
            }
            fft.process_with_scratch(&mut self.column, &mut self.scratch);
            for (i, &c) in self.column.iter().enumerate() {
                self.freq[i * self.cols + j] = c;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PaganinSettings {
        PaganinSettings {
            pixel_size: 1.0,
            lambda: 1.23e-4,
            delta: 1e-8,
            beta: 1e-10,
            distance: 40.0,
        }
    }

    #[test]
    fn kernel_dc_bin_is_four_pi_beta() {
        let s = settings();
        let kernel = paganin_kernel(4, 6, &s);
        assert!((kernel[0] - 4.0 * PI * s.beta).abs() < 1e-12);
        // every other bin is damped
        for &k in &kernel[1..] {
            assert!(k <= kernel[0]);
        }
    }

    #[test]
    fn kernel_folding_is_symmetric_per_axis() {
        let s = settings();
        let (rows, cols) = (6, 8);
        let kernel = paganin_kernel(rows, cols, &s);
        let mid_r = (rows + 1) / 2;
        let mid_c = (cols + 1) / 2;
        for i in 1..mid_r {
            for j in 1..mid_c {
                let a = kernel[i * cols + j];
                let b = kernel[(2 * mid_r - i) * cols + (2 * mid_c - j)];
                assert!((a - b).abs() < 1e-12, "({i},{j})");
            }
        }
    }

    #[test]
    fn uniform_projection_retrieves_uniform_thickness() {
        let s = settings();
        let (rows, cols) = (4, 8);
        let mut filter = PaganinFilter::new(rows, cols, &s).unwrap();
        let mut data = vec![2.0f32; rows * cols];
        filter.apply(&mut data);

        // A uniform image only has a DC component, so the filter
        // multiplies by kernel[0] = 4πβ and the log transform gives
        // -ln(2 * 4πβ) * λ/(4πβ) everywhere.
        let expected = -(2.0 * 4.0 * PI * s.beta).ln() * s.lambda / (4.0 * PI * s.beta);
        for &v in &data {
            assert!(
                (v - expected).abs() < expected.abs() * 1e-4,
                "{v} vs {expected}"
            );
        }
    }

    #[test]
    fn nonpositive_intensity_maps_to_zero() {
        let s = PaganinSettings {
            beta: 1.0 / (4.0 * PI), // kernel DC = 1, keeps values unchanged
            delta: 0.0,
            ..settings()
        };
        let mut filter = PaganinFilter::new(2, 4, &s).unwrap();
        let mut data = vec![0.0f32; 8];
        filter.apply(&mut data);
        assert_eq!(data, vec![0.0; 8]);
    }

    #[test]
    fn degenerate_shape_fails_to_plan() {
        assert!(matches!(
            PaganinFilter::new(0, 8, &settings()),
            Err(Error::FftPlan(_))
        ));
    }
}
