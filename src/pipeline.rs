use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::calibrate::Calibration;
use crate::config::{BeamShape, Config, DynamicParams, ParamCell, ReconMode};
use crate::error::Result;
use crate::frame::{Classifier, Frame};
use crate::geometry::{self, ProjectionVectors};
use crate::gpu::backproject::BackProjector;
use crate::gpu::{GpuContext, SinogramBuffers};
use crate::ingest::{FrameTransport, run_ingest};
use crate::preprocess::ProjectionProcessor;
use crate::ring::{CompletedGroup, GroupRing};
use crate::server::{ReconPayload, Server, StateEvent};
use crate::sino::{SinogramAssembler, SinogramUpdate};
use crate::stats::PipelineStats;

/// Timeout for all inter-stage queue waits; bounds shutdown latency.
const QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// The CPU half of the service: classification, calibration, the raw
/// ring, preprocessing, and sinogram assembly. Owns no threads itself;
/// [`Service`] wires it to a transport and the GPU, tests drive it
/// synchronously.
pub struct Pipeline {
    pub config: Config,
    pub stats: Arc<PipelineStats>,
    pub params: Arc<ParamCell>,
    pub calibration: Arc<Calibration>,
    pub ring: Arc<GroupRing>,
    classifier: Classifier,
    processor: ProjectionProcessor,
    assembler: Arc<Mutex<SinogramAssembler>>,
    completed_rx: Receiver<CompletedGroup>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let geometry = &config.geometry;
        let settings = &config.pipeline;

        let stats = PipelineStats::new();
        let params = Arc::new(ParamCell::new(DynamicParams {
            filter: settings.filter,
            gaussian_lowpass: settings.gaussian_lowpass,
            ..DynamicParams::default()
        }));
        let calibration = Arc::new(Calibration::new(
            geometry.pixels(),
            settings.num_darks,
            settings.num_flats,
        ));
        let (ring, completed_rx) = GroupRing::new(
            geometry.rows,
            geometry.cols,
            settings.group_size,
            settings.ring_capacity,
            stats.clone(),
        );
        let assembler = Arc::new(Mutex::new(SinogramAssembler::new(
            geometry.rows,
            geometry.cols,
            settings.group_size,
            geometry.angle_count,
            settings.scan_mode.recon_mode(),
        )));
        let classifier = Classifier::new(
            geometry.rows,
            geometry.cols,
            calibration.clone(),
            ring.clone(),
            stats.clone(),
        )
        .with_assembler(assembler.clone());

        let mut processor =
            ProjectionProcessor::new(geometry, settings, calibration.clone(), params.clone())?;
        if geometry.beam_shape == BeamShape::Cone {
            if let ProjectionVectors::Cone(vectors) = geometry::projection_vectors(geometry) {
                processor.set_fdk_weights(Arc::new(geometry::fdk_weights(
                    &vectors,
                    geometry.rows,
                    geometry.cols,
                )));
            }
        }

        Ok(Self {
            config,
            stats,
            params,
            calibration,
            ring,
            classifier,
            processor,
            assembler,
            completed_rx,
        })
    }

    /// Route the server's state events through the classifier.
    pub fn attach_events(&mut self, events: Sender<StateEvent>) {
        let classifier = Classifier::new(
            self.config.geometry.rows,
            self.config.geometry.cols,
            self.calibration.clone(),
            self.ring.clone(),
            self.stats.clone(),
        )
        .with_assembler(self.assembler.clone());
        self.classifier = classifier.with_events(events);
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Push one frame through classification, exactly as the ingest
    /// thread would.
    pub fn accept(&self, frame: Frame) -> Result<()> {
        self.classifier.accept(frame)
    }

    /// Wait for at most one completed group, preprocess it, and fold
    /// it into the sinogram. Returns an update when a device upload is
    /// due. This is the dispatch thread's body.
    pub fn pump(&self, timeout: Duration) -> Option<SinogramUpdate> {
        let mut group = self.completed_rx.recv_timeout(timeout).ok()?;
        self.processor.process_group(&mut group);
        self.assembler.lock().unwrap().append(&group)
    }

    /// Drain every queued group without waiting. Test convenience.
    pub fn pump_all(&self) -> Vec<SinogramUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.pump(Duration::ZERO) {
            updates.push(update);
        }
        updates
    }

    /// Snapshot of the host sinogram, shape (rows, angle_count, cols).
    pub fn sinogram(&self) -> Vec<f32> {
        self.assembler.lock().unwrap().sinogram().to_vec()
    }

    pub fn recon_mode(&self) -> ReconMode {
        self.config.pipeline.scan_mode.recon_mode()
    }
}

/// Handle to a running service: the control surface plus shutdown.
pub struct Service {
    pub server: Arc<Server>,
    pub stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Service {
    /// Bring the whole pipeline up: GPU context, device buffers, and
    /// the ingest/dispatch/upload/reconstruction threads. Fatal when
    /// the GPU or the FFT plans cannot be created.
    pub fn start(config: Config, transport: impl FrameTransport + 'static) -> Result<Service> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut pipeline = Pipeline::new(config.clone())?;
        pipeline.attach_events(events_tx);
        let pipeline = Arc::new(pipeline);

        let server = Arc::new(Server::new(
            pipeline.params.clone(),
            config.pipeline.scan_mode,
            config.pipeline.update_interval,
        ));

        let gpu = Arc::new(GpuContext::new()?);
        let sino = Arc::new(SinogramBuffers::new(
            &gpu.device,
            config.geometry.rows,
            config.geometry.cols,
            config.geometry.angle_count,
            config.pipeline.scan_mode.recon_mode(),
        ));
        let backprojector = Arc::new(BackProjector::new(&gpu, &config.geometry)?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let (upload_tx, upload_rx) = crossbeam_channel::bounded::<SinogramUpdate>(2);
        let (refresh_tx, refresh_rx) = crossbeam_channel::bounded::<u32>(2);

        let mut threads = Vec::new();

        threads.push(spawn_named("ingest", {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            let failed = failed.clone();
            move || {
                if let Err(e) = run_ingest(
                    transport,
                    pipeline.classifier(),
                    &pipeline.stats,
                    &shutdown,
                ) {
                    error!("ingest failed: {e}");
                    failed.store(true, Ordering::Relaxed);
                }
                // stream over, wind the service down
                shutdown.store(true, Ordering::Relaxed);
            }
        }));

        threads.push(spawn_named("dispatch", {
            let pipeline = pipeline.clone();
            let server = server.clone();
            let shutdown = shutdown.clone();
            move || {
                while !shutdown.load(Ordering::Relaxed) {
                    for event in events_rx.try_iter() {
                        server.handle_event(event);
                    }
                    if let Some(update) = pipeline.pump(QUEUE_TIMEOUT) {
                        if pipeline.recon_mode() == ReconMode::Alternating {
                            server.handle_event(StateEvent::RevolutionAssembled);
                        }
                        if upload_tx.send(update).is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        threads.push(spawn_named("uploader", {
            let gpu = gpu.clone();
            let sino = sino.clone();
            let shutdown = shutdown.clone();
            move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok(update) = upload_rx.recv_timeout(QUEUE_TIMEOUT) else {
                        continue;
                    };
                    match sino.upload(&gpu, &update) {
                        Ok(buffer) => {
                            info!(buffer, projections = update.projections, "sinogram uploaded");
                            if refresh_tx.send(update.projections).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("upload discarded: {e}"),
                    }
                }
            }
        }));

        threads.push(spawn_named("recon", {
            let gpu = gpu.clone();
            let sino = sino.clone();
            let backprojector = backprojector.clone();
            let server = server.clone();
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            let slice_work = server.slice_work();
            let geometry = config.geometry.clone();
            move || {
                while !shutdown.load(Ordering::Relaxed) {
                    crossbeam_channel::select! {
                        recv(refresh_rx) -> msg => {
                            if msg.is_err() { break; }
                            match backprojector.reconstruct_preview(&gpu, &sino) {
                                Ok(volume) => {
                                    pipeline
                                        .stats
                                        .previews_emitted
                                        .fetch_add(1, Ordering::Relaxed);
                                    let (snapshot, _) = pipeline.params.snapshot();
                                    if snapshot.render_surface {
                                        let p = geometry.preview_size;
                                        let vertices = crate::surface::extract_surface(
                                            &volume,
                                            [p, p, p],
                                            snapshot.iso_fraction,
                                            [1, 1, 1],
                                        );
                                        server.publish(ReconPayload::Surface { vertices });
                                    }
                                    server.publish(ReconPayload::Preview {
                                        size: geometry.preview_size,
                                        data: volume,
                                    });
                                    server.handle_event(StateEvent::PreviewRefreshed);
                                    server.request_slice_sweep();
                                }
                                Err(e) => error!("preview reconstruction failed: {e}"),
                            }
                        }
                        recv(slice_work) -> msg => {
                            let Ok(id) = msg else { break; };
                            reconstruct_latest_slice(
                                id,
                                &backprojector,
                                &gpu,
                                &sino,
                                &server,
                                &pipeline.params,
                                geometry.slice_size,
                            );
                        }
                        default(QUEUE_TIMEOUT) => {}
                    }
                }
            }
        }));

        Ok(Service {
            server,
            stats: pipeline.stats.clone(),
            shutdown,
            failed,
            threads,
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the frame stream to end and every stage to wind down.
    /// Returns false when ingest died on a protocol error.
    pub fn join(mut self) -> bool {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        !self.failed.load(Ordering::Relaxed)
    }
}

/// Reconstruct a slice, retrying until the result corresponds to the
/// newest request for that slot; superseded intermediates are never
/// published.
fn reconstruct_latest_slice(
    id: u64,
    backprojector: &BackProjector,
    gpu: &GpuContext,
    sino: &SinogramBuffers,
    server: &Server,
    params: &ParamCell,
    slice_size: u32,
) {
    loop {
        let Some(spec) = server.slices.get(id) else {
            return;
        };
        match backprojector.reconstruct_slice(gpu, sino, &spec.orientation) {
            Ok(image) => {
                if !server.slices.is_current(id, spec.version) {
                    continue; // superseded mid-flight, redo with the latest
                }
                let (snapshot, _) = params.snapshot();
                let data = crate::server::downsample(
                    &image,
                    slice_size as usize,
                    slice_size as usize,
                    snapshot.row_stride as usize,
                    snapshot.col_stride as usize,
                );
                server.publish(ReconPayload::Slice {
                    id,
                    timestamp: spec.timestamp,
                    size: slice_size,
                    data,
                });
                return;
            }
            Err(e) => {
                error!(id, "slice reconstruction failed: {e}");
                return;
            }
        }
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("thread spawn")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterKind, PipelineSettings, ScanMode};
    use crate::frame::FrameKind;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.geometry.rows = 4;
        config.geometry.cols = 5;
        config.geometry.angle_count = 16;
        config.pipeline = PipelineSettings {
            group_size: 16,
            ring_capacity: 2,
            num_darks: 1,
            num_flats: 1,
            threads: 2,
            filter: FilterKind::Shepp,
            gaussian_lowpass: false,
            paganin: None,
            scan_mode: ScanMode::Dynamic,
            update_interval: 100,
        };
        config
    }

    fn frame(kind: FrameKind, index: u32, value: u16) -> Frame {
        Frame {
            kind,
            index,
            rows: 4,
            cols: 5,
            payload: vec![value; 20],
        }
    }

    #[test]
    fn projections_before_calibration_are_dropped() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        pipeline
            .accept(frame(FrameKind::Projection, 0, 5))
            .unwrap();
        assert_eq!(
            pipeline.stats.dropped_uncalibrated.load(Ordering::Relaxed),
            1
        );
        assert!(pipeline.pump(Duration::ZERO).is_none());
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        let bad = Frame {
            kind: FrameKind::Dark,
            index: 0,
            rows: 10,
            cols: 10,
            payload: vec![0; 100],
        };
        assert!(pipeline.accept(bad).is_err());
    }

    #[test]
    fn full_revolution_produces_one_update() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        pipeline.accept(frame(FrameKind::Dark, 0, 0)).unwrap();
        pipeline.accept(frame(FrameKind::Flat, 0, 1)).unwrap();
        for i in 0..16 {
            pipeline
                .accept(frame(FrameKind::Projection, i, 2))
                .unwrap();
        }
        let updates = pipeline.pump_all();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].projections, 16);
        assert_eq!(updates[0].spans, vec![(0, 15)]);
        assert_eq!(
            pipeline.stats.preprocessed.load(Ordering::Relaxed),
            16
        );
    }
}
