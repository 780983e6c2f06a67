pub mod filters;
pub mod phase;

use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::calibrate::Calibration;
use crate::config::{Geometry, ParamCell, PipelineSettings};
use crate::error::{Error, Result};
use crate::ring::CompletedGroup;

use self::filters::RampFilter;
use self::phase::PaganinFilter;

/// `p <= 0 -> 0, else -ln p`. Applied when phase retrieval is off.
pub fn neg_log(data: &mut [f32]) {
    for v in data {
        *v = if *v <= 0.0 { 0.0 } else { -v.ln() };
    }
}

/// `(p - dark_mean) * reciprocal`, per pixel.
pub fn flat_field(data: &mut [f32], dark_mean: &[f32], reciprocal: &[f32]) {
    for ((v, &d), &r) in data.iter_mut().zip(dark_mean).zip(reciprocal) {
        *v = (*v - d) * r;
    }
}

/// Per-worker FFT state, indexed by thread rank so plans are reused
/// without contention.
struct WorkerScratch {
    filter: RampFilter,
    paganin: Option<PaganinFilter>,
    /// Version of the dynamic params the filter table was built from.
    table_version: u64,
}

/// Runs the per-projection pass over a completed group: flat-field,
/// phase retrieval or negative log, ramp filter, FDK weighting.
/// Parallelised over projections on a work-stealing pool; workers
/// snapshot the dynamic parameters at the start of each group.
pub struct ProjectionProcessor {
    pool: rayon::ThreadPool,
    cols: usize,
    pixels: usize,
    group_size: u32,
    num_projections: u32,
    calibration: Arc<Calibration>,
    params: Arc<ParamCell>,
    scratches: Vec<Mutex<WorkerScratch>>,
    /// Cone-beam pre-weights, `num_projections * pixels` entries.
    fdk_weights: Option<Arc<Vec<f32>>>,
}

impl ProjectionProcessor {
    pub fn new(
        geometry: &Geometry,
        settings: &PipelineSettings,
        calibration: Arc<Calibration>,
        params: Arc<ParamCell>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.threads.max(1))
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {e}")))?;

        let cols = geometry.cols as usize;
        let rows = geometry.rows as usize;
        let (snapshot, version) = params.snapshot();
        let table = Arc::new(filters::filter_table(
            snapshot.filter,
            cols,
            snapshot.gaussian_lowpass,
        ));

        let mut scratches = Vec::with_capacity(settings.threads.max(1));
        for _ in 0..settings.threads.max(1) {
            let paganin = settings
                .paganin
                .as_ref()
                .map(|p| PaganinFilter::new(rows, cols, p))
                .transpose()?;
            scratches.push(Mutex::new(WorkerScratch {
                filter: RampFilter::new(cols, table.clone())?,
                paganin,
                table_version: version,
            }));
        }

        Ok(Self {
            pool,
            cols,
            pixels: rows * cols,
            group_size: settings.group_size,
            num_projections: geometry.angle_count,
            calibration,
            params,
            scratches,
            fdk_weights: None,
        })
    }

    /// Install cone-beam pre-weights (one `pixels`-sized table per
    /// projection of the revolution).
    pub fn set_fdk_weights(&mut self, weights: Arc<Vec<f32>>) {
        debug_assert_eq!(
            weights.len(),
            self.num_projections as usize * self.pixels
        );
        self.fdk_weights = Some(weights);
    }

    /// Preprocess every projection of the group in place. Projections
    /// may finish out of order; the caller only observes the group
    /// once this returns.
    pub fn process_group(&self, group: &mut CompletedGroup) {
        let Some(maps) = self.calibration.maps() else {
            warn!(
                generation = group.generation,
                "group reached preprocessor without calibration, skipped"
            );
            return;
        };
        self.refresh_filter_tables();

        let first_index = group.generation * u64::from(self.group_size);
        let pixels = self.pixels;
        let num_projections = u64::from(self.num_projections);
        debug!(
            generation = group.generation,
            first_index, "preprocessing group"
        );

        self.pool.install(|| {
            group
                .data
                .par_chunks_mut(pixels)
                .enumerate()
                .for_each(|(i, projection)| {
                    let rank = rayon::current_thread_index().unwrap_or(0);
                    let mut scratch = self.scratches[rank % self.scratches.len()]
                        .lock()
                        .unwrap();

                    flat_field(projection, &maps.dark_mean, &maps.reciprocal);
                    if let Some(paganin) = &mut scratch.paganin {
                        paganin.apply(projection);
                    } else {
                        neg_log(projection);
                    }
                    scratch.filter.apply(projection);

                    if let Some(weights) = &self.fdk_weights {
                        let angle = ((first_index + i as u64) % num_projections) as usize;
                        let table = &weights[angle * pixels..(angle + 1) * pixels];
                        for (v, &w) in projection.iter_mut().zip(table) {
                            *v *= w;
                        }
                    }
                });
        });
    }

    /// Rebuild the ramp-filter tables when the viewer changed the
    /// filter selection since the last group.
    fn refresh_filter_tables(&self) {
        let version = self.params.version();
        let stale = self
            .scratches
            .iter()
            .any(|s| s.lock().unwrap().table_version != version);
        if !stale {
            return;
        }
        let (snapshot, version) = self.params.snapshot();
        let table = Arc::new(filters::filter_table(
            snapshot.filter,
            self.cols,
            snapshot.gaussian_lowpass,
        ));
        for scratch in &self.scratches {
            let mut scratch = scratch.lock().unwrap();
            scratch.filter.set_table(table.clone());
            scratch.table_version = version;
        }
        debug!(filter = %snapshot.filter, "ramp filter table rebuilt");
    }
}
