use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::warn;

use crate::calibrate::Calibration;
use crate::error::{Error, Result};
use crate::ring::GroupRing;
use crate::server::StateEvent;
use crate::sino::SinogramAssembler;
use crate::stats::PipelineStats;

/// Detector readout kinds, in wire order of `scan_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Dark = 0,
    Flat = 1,
    Projection = 2,
}

impl FrameKind {
    pub fn from_scan_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(FrameKind::Dark),
            1 => Some(FrameKind::Flat),
            2 => Some(FrameKind::Projection),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageAttributes {
    scan_index: i64,
}

/// Metadata half of the two-part wire message.
#[derive(Debug, Deserialize)]
struct FrameMeta {
    frame: u32,
    image_attributes: ImageAttributes,
    shape: [u32; 2],
}

/// Expected payload length in bytes for a metadata blob; lets framed
/// transports size their read before the samples arrive.
pub fn payload_size(meta: &[u8]) -> Result<usize> {
    let meta: FrameMeta = serde_json::from_slice(meta)?;
    Ok(meta.shape[0] as usize * meta.shape[1] as usize * size_of::<u16>())
}

/// One detector readout: metadata plus decoded 16-bit samples,
/// row-major.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    /// Sequence index, monotonic within kind.
    pub index: u32,
    pub rows: u32,
    pub cols: u32,
    pub payload: Vec<u16>,
}

impl Frame {
    /// Parse the metadata blob and the raw payload that follows it.
    /// The payload is `rows * cols` little-endian u16 samples.
    pub fn parse(meta: &[u8], payload: &[u8]) -> Result<Frame> {
        let meta: FrameMeta = serde_json::from_slice(meta)?;
        let kind = FrameKind::from_scan_index(meta.image_attributes.scan_index)
            .ok_or(Error::UnknownScanIndex(meta.image_attributes.scan_index))?;

        let [rows, cols] = meta.shape;
        let expected = rows as usize * cols as usize * size_of::<u16>();
        if payload.len() != expected {
            return Err(Error::PayloadSize {
                expected,
                actual: payload.len(),
            });
        }

        let samples = payload
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();

        Ok(Frame {
            kind,
            index: meta.frame,
            rows,
            cols,
            payload: samples,
        })
    }
}

/// Routes incoming frames to the calibration aggregator or the raw
/// projection ring, and triggers the one-shot reciprocal recompute on
/// the first projection after dark/flat activity.
pub struct Classifier {
    rows: u32,
    cols: u32,
    calibration: Arc<Calibration>,
    ring: Arc<GroupRing>,
    assembler: Option<Arc<Mutex<SinogramAssembler>>>,
    stats: Arc<PipelineStats>,
    events: Option<crossbeam_channel::Sender<StateEvent>>,
}

impl Classifier {
    pub fn new(
        rows: u32,
        cols: u32,
        calibration: Arc<Calibration>,
        ring: Arc<GroupRing>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            rows,
            cols,
            calibration,
            ring,
            assembler: None,
            stats,
            events: None,
        }
    }

    /// Attach a state-event sender so the server's state machine can
    /// observe calibration activity.
    pub fn with_events(mut self, events: crossbeam_channel::Sender<StateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach the sinogram assembler so a recalibration also discards
    /// the partially assembled revolution, not just the staged ring.
    pub fn with_assembler(mut self, assembler: Arc<Mutex<SinogramAssembler>>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    fn emit(&self, event: StateEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Drop everything staged for the current revolution. A dark/flat
    /// burst restarts acquisition, and columns assembled before it
    /// must never survive into the next emitted revolution.
    fn reset_staging(&self) {
        self.ring.reset();
        if let Some(assembler) = &self.assembler {
            assembler.lock().unwrap().reset();
        }
    }

    /// Accept one frame from the transport. Shape mismatches are
    /// reported to the caller; everything downstream is logged and
    /// counted here.
    pub fn accept(&self, frame: Frame) -> Result<()> {
        if frame.rows != self.rows || frame.cols != self.cols {
            return Err(Error::ShapeMismatch {
                rows: self.rows,
                cols: self.cols,
                actual_rows: frame.rows,
                actual_cols: frame.cols,
            });
        }

        match frame.kind {
            FrameKind::Dark => {
                self.calibration.accept_dark(&frame.payload);
                self.reset_staging();
                self.emit(StateEvent::DarkFlatActivity);
            }
            FrameKind::Flat => {
                self.calibration.accept_flat(&frame.payload);
                self.reset_staging();
                self.emit(StateEvent::DarkFlatActivity);
            }
            FrameKind::Projection => {
                if self.calibration.pending_recompute() {
                    self.calibration.recompute();
                    self.emit(StateEvent::CalibrationReady);
                }
                if !self.calibration.ready() {
                    warn!(index = frame.index, "projection before dark/flat, dropped");
                    self.stats
                        .dropped_uncalibrated
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(());
                }
                self.stats
                    .projections_accepted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.ring.push(frame.index, &frame.payload);
            }
        }
        Ok(())
    }
}
