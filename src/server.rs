use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use strum::Display;
use tracing::{debug, info, warn};

use crate::config::{FilterKind, ParamCell, ReconMode, ScanMode};
use crate::geometry::Orientation;

/// Logical slice slots the viewer can address; `SetSlice` timestamps
/// map onto these modulo [`MAX_SLICES`].
pub const MAX_SLICES: u64 = 8;

/// Capacity of the outgoing payload channel. The streaming side drains
/// it; a full channel sheds the oldest kind of traffic (new payloads)
/// rather than blocking reconstruction.
const PAYLOAD_CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
pub enum ServerState {
    #[default]
    Idle,
    Ready,
    Acquiring,
    Reconstructing,
}

/// States the viewer may request directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Idle,
    Ready,
    Acquiring,
}

/// Pipeline-internal notifications that drive the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateEvent {
    /// A dark or flat frame arrived; acquisition restarts.
    DarkFlatActivity,
    /// The reciprocal map was recomputed.
    CalibrationReady,
    /// A full revolution was assembled (alternating mode).
    RevolutionAssembled,
    /// A preview refresh finished.
    PreviewRefreshed,
}

/// Viewer control operations, one variant per RPC.
#[derive(Clone, Debug)]
pub enum ControlCommand {
    SetServerState(TargetState),
    SetScanMode {
        mode: ScanMode,
        update_interval: u32,
    },
    SetDownsampling {
        col_stride: u32,
        row_stride: u32,
    },
    SetProjectionFilter(FilterKind),
    /// Toggle surface-mesh rendering of the preview and pick the
    /// iso-value, as a fraction of the volume's [min, max].
    SetRenderPolicy {
        surface_mesh: bool,
        iso_fraction: f32,
    },
    SetSlice {
        timestamp: u64,
        orientation: Orientation,
    },
}

/// Payloads streamed back to the viewer.
#[derive(Clone, Debug)]
pub enum ReconPayload {
    Preview {
        size: u32,
        data: Vec<f32>,
    },
    /// Triangle soup extracted from the preview volume when the
    /// surface rendering policy is active.
    Surface {
        vertices: Vec<crate::surface::SurfaceVertex>,
    },
    Slice {
        id: u64,
        timestamp: u64,
        size: u32,
        data: Vec<f32>,
    },
}

#[derive(Clone, Debug)]
pub struct SliceSpec {
    pub timestamp: u64,
    pub orientation: Orientation,
    /// Bumped on every update; readers compare before emitting so a
    /// superseded request never ships a stale image.
    pub version: u64,
}

/// Latest requested orientation per logical slice.
pub struct SliceRegistry {
    slices: Mutex<HashMap<u64, SliceSpec>>,
    versions: AtomicU64,
}

impl SliceRegistry {
    pub fn new() -> Self {
        Self {
            slices: Mutex::new(HashMap::new()),
            versions: AtomicU64::new(0),
        }
    }

    /// Record a slice request; returns the slot id and the version to
    /// reconstruct against.
    pub fn set(&self, timestamp: u64, orientation: Orientation) -> (u64, u64) {
        let id = timestamp % MAX_SLICES;
        let version = self.versions.fetch_add(1, Ordering::AcqRel) + 1;
        self.slices.lock().unwrap().insert(
            id,
            SliceSpec {
                timestamp,
                orientation,
                version,
            },
        );
        (id, version)
    }

    pub fn get(&self, id: u64) -> Option<SliceSpec> {
        self.slices.lock().unwrap().get(&id).cloned()
    }

    /// True when `version` is still the newest request for the slice.
    pub fn is_current(&self, id: u64, version: u64) -> bool {
        self.slices
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|s| s.version == version)
    }

    /// All registered slices, for the recompute sweep after a buffer
    /// flip.
    pub fn all(&self) -> Vec<(u64, SliceSpec)> {
        self.slices
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, spec)| (id, spec.clone()))
            .collect()
    }
}

impl Default for SliceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Control surface and global state machine of the service. Commands
/// arrive from the viewer RPC, events from the pipeline; payloads go
/// out through a bounded channel the streaming endpoint drains.
pub struct Server {
    state: Mutex<ServerState>,
    scan_mode: Mutex<(ScanMode, u32)>,
    /// The device buffers and the assembler cursor are built for this
    /// reconstruction path at startup; mode changes that would alter
    /// it are refused.
    startup_recon: ReconMode,
    params: Arc<ParamCell>,
    pub slices: SliceRegistry,
    payload_tx: Sender<ReconPayload>,
    payload_rx: Receiver<ReconPayload>,
    /// Slice ids whose reconstruction should be (re)run.
    slice_work_tx: Sender<u64>,
    slice_work_rx: Receiver<u64>,
}

impl Server {
    pub fn new(params: Arc<ParamCell>, scan_mode: ScanMode, update_interval: u32) -> Self {
        let (payload_tx, payload_rx) = crossbeam_channel::bounded(PAYLOAD_CHANNEL_CAPACITY);
        let (slice_work_tx, slice_work_rx) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(ServerState::Idle),
            scan_mode: Mutex::new((scan_mode, update_interval)),
            startup_recon: scan_mode.recon_mode(),
            params,
            slices: SliceRegistry::new(),
            payload_tx,
            payload_rx,
            slice_work_tx,
            slice_work_rx,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    pub fn scan_mode(&self) -> (ScanMode, u32) {
        *self.scan_mode.lock().unwrap()
    }

    /// Receiver for `GetReconData` streaming. Single consumer.
    pub fn subscribe(&self) -> Receiver<ReconPayload> {
        self.payload_rx.clone()
    }

    /// Receiver for the slice-reconstruction worker.
    pub fn slice_work(&self) -> Receiver<u64> {
        self.slice_work_rx.clone()
    }

    pub fn handle_command(&self, command: ControlCommand) {
        match command {
            ControlCommand::SetServerState(target) => {
                let mut state = self.state.lock().unwrap();
                let next = match target {
                    TargetState::Idle => ServerState::Idle,
                    TargetState::Ready => ServerState::Ready,
                    TargetState::Acquiring => ServerState::Acquiring,
                };
                info!(from = %state, to = %next, "server state change");
                *state = next;
            }
            ControlCommand::SetScanMode {
                mode,
                update_interval,
            } => {
                let state = self.state();
                if matches!(state, ServerState::Acquiring | ServerState::Reconstructing) {
                    warn!(%state, "scan mode change ignored while acquiring");
                    return;
                }
                if mode.recon_mode() != self.startup_recon {
                    warn!(
                        %mode,
                        "scan mode refused: the reconstruction path is fixed at startup"
                    );
                    return;
                }
                info!(%mode, update_interval, "scan mode set");
                *self.scan_mode.lock().unwrap() = (mode, update_interval);
                // entering a mode arms the service
                let mut current = self.state.lock().unwrap();
                if *current == ServerState::Idle {
                    *current = ServerState::Ready;
                }
            }
            ControlCommand::SetDownsampling {
                col_stride,
                row_stride,
            } => {
                self.params.update(|p| {
                    p.col_stride = col_stride.max(1);
                    p.row_stride = row_stride.max(1);
                });
            }
            ControlCommand::SetProjectionFilter(filter) => {
                info!(%filter, "projection filter set");
                self.params.update(|p| p.filter = filter);
            }
            ControlCommand::SetRenderPolicy {
                surface_mesh,
                iso_fraction,
            } => {
                self.params.update(|p| {
                    p.render_surface = surface_mesh;
                    p.iso_fraction = iso_fraction.clamp(0.0, 1.0);
                });
            }
            ControlCommand::SetSlice {
                timestamp,
                orientation,
            } => {
                let (id, version) = self.slices.set(timestamp, orientation);
                debug!(id, version, timestamp, "slice requested");
                let _ = self.slice_work_tx.send(id);
            }
        }
    }

    pub fn handle_event(&self, event: StateEvent) {
        let mut state = self.state.lock().unwrap();
        let next = match (*state, event) {
            (ServerState::Acquiring | ServerState::Reconstructing, StateEvent::DarkFlatActivity) => {
                Some(ServerState::Ready)
            }
            (ServerState::Ready, StateEvent::CalibrationReady) => Some(ServerState::Acquiring),
            (ServerState::Acquiring, StateEvent::RevolutionAssembled) => {
                Some(ServerState::Reconstructing)
            }
            (ServerState::Reconstructing, StateEvent::PreviewRefreshed) => {
                Some(ServerState::Acquiring)
            }
            _ => None,
        };
        if let Some(next) = next {
            debug!(from = %*state, to = %next, ?event, "state transition");
            *state = next;
        }
    }

    /// Queue a payload for the streaming endpoint. A full channel
    /// drops the payload with a warning; reconstruction never blocks
    /// on a slow viewer.
    pub fn publish(&self, payload: ReconPayload) {
        match self.payload_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("viewer stream backlogged, payload dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Queue a recompute of every registered slice (buffer flipped).
    pub fn request_slice_sweep(&self) {
        for (id, _) in self.slices.all() {
            let _ = self.slice_work_tx.send(id);
        }
    }
}

/// Stride-decimate a row-major image for the viewer.
pub fn downsample(data: &[f32], rows: usize, cols: usize, row_stride: usize, col_stride: usize) -> Vec<f32> {
    let (row_stride, col_stride) = (row_stride.max(1), col_stride.max(1));
    let mut out = Vec::with_capacity(rows.div_ceil(row_stride) * cols.div_ceil(col_stride));
    for r in (0..rows).step_by(row_stride) {
        for c in (0..cols).step_by(col_stride) {
            out.push(data[r * cols + c]);
        }
    }
    out
}
