use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BeamShape {
    #[default]
    Parallel,
    Cone,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum AngleRange {
    /// Angles span [0, π).
    #[default]
    Half,
    /// Angles span [0, 2π).
    Full,
}

/// Acquisition modes exposed to the viewer. Static and dynamic scans
/// assemble whole revolutions and flip between two device buffers;
/// continuous scans patch a single shared buffer group by group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Static,
    #[default]
    Dynamic,
    Continuous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconMode {
    Alternating,
    Continuous,
}

impl ScanMode {
    pub fn recon_mode(self) -> ReconMode {
        match self {
            ScanMode::Static | ScanMode::Dynamic => ReconMode::Alternating,
            ScanMode::Continuous => ReconMode::Continuous,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Ramlak,
    #[default]
    Shepp,
}

/// Acquisition geometry. Volume ranges are the reconstruction window
/// in world units; the detector is rows x cols pixels of
/// pixel_height x pixel_width each.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Geometry {
    pub beam_shape: BeamShape,
    pub rows: u32,
    pub cols: u32,
    pub angle_count: u32,
    pub angle_range: AngleRange,
    pub slice_size: u32,
    pub preview_size: u32,
    pub pixel_width: f32,
    pub pixel_height: f32,
    /// Source-to-rotation-axis distance (cone beam only).
    pub source_origin: f32,
    /// Rotation-axis-to-detector distance (cone beam only).
    pub origin_detector: f32,
    pub volume_min: [f32; 3],
    pub volume_max: [f32; 3],
}

impl Geometry {
    pub fn pixels(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            beam_shape: BeamShape::Parallel,
            rows: 128,
            cols: 128,
            angle_count: 128,
            angle_range: AngleRange::Half,
            slice_size: 128,
            preview_size: 32,
            pixel_width: 1.0,
            pixel_height: 1.0,
            source_origin: 2.0,
            origin_detector: 2.0,
            volume_min: [-1.0, -1.0, -1.0],
            volume_max: [1.0, 1.0, 1.0],
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PaganinSettings {
    pub pixel_size: f32,
    /// X-ray wavelength.
    pub lambda: f32,
    /// Refractive index decrement (real part).
    pub delta: f32,
    /// Attenuation coefficient (imaginary part).
    pub beta: f32,
    /// Sample-to-detector propagation distance.
    pub distance: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Projections per group. Must divide angle_count.
    pub group_size: u32,
    /// Live generations in the raw ring.
    pub ring_capacity: usize,
    pub num_darks: usize,
    pub num_flats: usize,
    /// Preprocessing worker threads.
    pub threads: usize,
    pub filter: FilterKind,
    pub gaussian_lowpass: bool,
    pub scan_mode: ScanMode,
    /// Preview refresh interval hint for dynamic scans, in ms.
    pub update_interval: u32,
    /// Table-valued, so it stays last for TOML emission.
    pub paganin: Option<PaganinSettings>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            group_size: 32,
            ring_capacity: 4,
            num_darks: 10,
            num_flats: 10,
            threads: 4,
            filter: FilterKind::Shepp,
            gaussian_lowpass: false,
            scan_mode: ScanMode::Dynamic,
            update_interval: 100,
            paganin: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub geometry: Geometry,
    pub pipeline: PipelineSettings,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    /// Group size must divide the projections per revolution; the raw
    /// ring bitmap also caps it at 64.
    pub fn validate(&self) -> Result<()> {
        let g = self.pipeline.group_size;
        if g == 0 || g > 64 || !self.geometry.angle_count.is_multiple_of(g) {
            return Err(Error::Config(format!(
                "group size {} must be in 1..=64 and divide angle count {}",
                g, self.geometry.angle_count
            )));
        }
        Ok(())
    }
}

/// Viewer-tunable parameters. Workers snapshot the struct at the start
/// of a generation; the version counter lets them detect staleness
/// without holding the lock while working.
#[derive(Clone, Debug)]
pub struct DynamicParams {
    pub filter: FilterKind,
    pub gaussian_lowpass: bool,
    /// Emit an iso-surface mesh alongside each preview refresh.
    pub render_surface: bool,
    /// Iso-value as a fraction of the current preview [min, max].
    pub iso_fraction: f32,
    pub col_stride: u32,
    pub row_stride: u32,
}

impl Default for DynamicParams {
    fn default() -> Self {
        Self {
            filter: FilterKind::Shepp,
            gaussian_lowpass: false,
            render_surface: false,
            iso_fraction: 0.5,
            col_stride: 1,
            row_stride: 1,
        }
    }
}

/// Shared cell for [`DynamicParams`] with a version counter bumped on
/// every write.
pub struct ParamCell {
    params: RwLock<DynamicParams>,
    version: AtomicU64,
}

impl ParamCell {
    pub fn new(params: DynamicParams) -> Self {
        Self {
            params: RwLock::new(params),
            version: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> (DynamicParams, u64) {
        let guard = self.params.read().unwrap();
        (guard.clone(), self.version.load(Ordering::Acquire))
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn update(&self, f: impl FnOnce(&mut DynamicParams)) {
        let mut guard = self.params.write().unwrap();
        f(&mut guard);
        self.version.fetch_add(1, Ordering::Release);
    }
}

impl Default for ParamCell {
    fn default() -> Self {
        Self::new(DynamicParams::default())
    }
}
