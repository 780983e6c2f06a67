use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

/// Flat-field maps produced by a recompute. Shared read-only with the
/// preprocessing workers; replaced wholesale on the next recompute.
pub struct CalibrationMaps {
    pub dark_mean: Vec<f32>,
    /// `1 / (flat_mean - dark_mean)`, with equal pixels mapped to 1.
    pub reciprocal: Vec<f32>,
}

struct Accumulator {
    darks: Vec<u16>,
    flats: Vec<u16>,
    received_darks: usize,
    received_flats: usize,
    needs_recompute: bool,
}

/// Aggregates dark and flat frames and computes the reciprocal gain
/// map. Writes are serialised through the accumulator lock; readers
/// only ever see a complete [`CalibrationMaps`] snapshot, so a
/// recompute never races an in-flight group.
pub struct Calibration {
    pixels: usize,
    num_darks: usize,
    num_flats: usize,
    accum: Mutex<Accumulator>,
    maps: RwLock<Option<Arc<CalibrationMaps>>>,
}

impl Calibration {
    pub fn new(pixels: usize, num_darks: usize, num_flats: usize) -> Self {
        Self {
            pixels,
            num_darks,
            num_flats,
            accum: Mutex::new(Accumulator {
                darks: vec![0; pixels * num_darks],
                flats: vec![0; pixels * num_flats],
                received_darks: 0,
                received_flats: 0,
                needs_recompute: false,
            }),
            maps: RwLock::new(None),
        }
    }

    pub fn accept_dark(&self, payload: &[u16]) {
        let mut accum = self.accum.lock().unwrap();
        *self.maps.write().unwrap() = None;
        if accum.received_darks == self.num_darks {
            warn!("more darks than expected, new dark ignored");
            return;
        }
        let slot = accum.received_darks;
        accum.darks[slot * self.pixels..(slot + 1) * self.pixels].copy_from_slice(payload);
        accum.received_darks += 1;
        accum.needs_recompute = true;
        info!(received = accum.received_darks, "dark frame stored");
    }

    pub fn accept_flat(&self, payload: &[u16]) {
        let mut accum = self.accum.lock().unwrap();
        *self.maps.write().unwrap() = None;
        if accum.received_flats == self.num_flats {
            warn!("more flats than expected, new flat ignored");
            return;
        }
        let slot = accum.received_flats;
        accum.flats[slot * self.pixels..(slot + 1) * self.pixels].copy_from_slice(payload);
        accum.received_flats += 1;
        accum.needs_recompute = true;
        info!(received = accum.received_flats, "flat frame stored");
    }

    /// True when dark/flat activity happened and at least one of each
    /// has arrived, so the next projection should trigger [`recompute`].
    ///
    /// [`recompute`]: Calibration::recompute
    pub fn pending_recompute(&self) -> bool {
        let accum = self.accum.lock().unwrap();
        accum.needs_recompute && accum.received_darks > 0 && accum.received_flats > 0
    }

    /// Average the received darks and flats and derive the reciprocal
    /// map. Runs exactly once per dark/flat burst; the accumulation
    /// window restarts afterwards.
    pub fn recompute(&self) {
        let mut accum = self.accum.lock().unwrap();
        if accum.received_darks < self.num_darks || accum.received_flats < self.num_flats {
            warn!(
                darks = accum.received_darks,
                expected_darks = self.num_darks,
                flats = accum.received_flats,
                expected_flats = self.num_flats,
                "computing reciprocal with fewer darks and/or flats than expected"
            );
        }
        info!("computing reciprocal for flat fielding");

        let dark_mean = average_images(&accum.darks, self.pixels, accum.received_darks);
        let flat_mean = average_images(&accum.flats, self.pixels, accum.received_flats);

        let reciprocal = dark_mean
            .iter()
            .zip(&flat_mean)
            .map(|(&d, &f)| if d == f { 1.0 } else { 1.0 / (f - d) })
            .collect();

        *self.maps.write().unwrap() = Some(Arc::new(CalibrationMaps {
            dark_mean,
            reciprocal,
        }));

        accum.received_darks = 0;
        accum.received_flats = 0;
        accum.needs_recompute = false;
    }

    pub fn ready(&self) -> bool {
        self.maps.read().unwrap().is_some()
    }

    /// Current maps, if a recompute has happened since the last
    /// invalidation.
    pub fn maps(&self) -> Option<Arc<CalibrationMaps>> {
        self.maps.read().unwrap().clone()
    }
}

/// Per-pixel mean over `n` stacked images. With no images the mean is
/// all zeros.
fn average_images(images: &[u16], pixels: usize, n: usize) -> Vec<f32> {
    let mut mean = vec![0.0f32; pixels];
    if n == 0 {
        return mean;
    }
    for image in images.chunks_exact(pixels).take(n) {
        for (m, &v) in mean.iter_mut().zip(image) {
            *m += v as f32;
        }
    }
    for m in &mut mean {
        *m /= n as f32;
    }
    mean
}
