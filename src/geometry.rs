use glam::{Mat3, Vec3};
use tracing::warn;

use crate::config::{AngleRange, BeamShape, Geometry};

/// Oblique slice orientation from the viewer: axis1, axis2, base, in
/// that order, 3 components each.
pub type Orientation = [f32; 9];

/// Per-projection vectors for a parallel beam: ray direction, detector
/// centre, and the two detector basis vectors (column and row pitch).
#[derive(Clone, Copy, Debug)]
pub struct ParallelVec {
    pub ray: Vec3,
    pub det: Vec3,
    pub u: Vec3,
    pub v: Vec3,
}

/// Per-projection vectors for a cone beam: point source, detector
/// centre, and the detector basis.
#[derive(Clone, Copy, Debug)]
pub struct ConeVec {
    pub source: Vec3,
    pub det: Vec3,
    pub u: Vec3,
    pub v: Vec3,
}

#[derive(Clone, Debug)]
pub enum ProjectionVectors {
    Parallel(Vec<ParallelVec>),
    Cone(Vec<ConeVec>),
}

/// Rotation angles for `n` projections over the configured range.
pub fn default_angles(n: u32, range: AngleRange) -> Vec<f32> {
    let span = match range {
        AngleRange::Half => std::f32::consts::PI,
        AngleRange::Full => std::f32::consts::TAU,
    };
    (0..n).map(|i| i as f32 * span / n as f32).collect()
}

/// Synthesise the per-projection vector tuples for the configured
/// geometry.
pub fn projection_vectors(geometry: &Geometry) -> ProjectionVectors {
    let angles = default_angles(geometry.angle_count, geometry.angle_range);
    let (pw, ph) = (geometry.pixel_width, geometry.pixel_height);
    match geometry.beam_shape {
        BeamShape::Parallel => ProjectionVectors::Parallel(
            angles
                .iter()
                .map(|&a| ParallelVec {
                    ray: Vec3::new(a.sin(), -a.cos(), 0.0),
                    det: Vec3::ZERO,
                    u: Vec3::new(a.cos() * pw, a.sin() * pw, 0.0),
                    v: Vec3::new(0.0, 0.0, ph),
                })
                .collect(),
        ),
        BeamShape::Cone => ProjectionVectors::Cone(
            angles
                .iter()
                .map(|&a| ConeVec {
                    source: Vec3::new(
                        a.sin() * geometry.source_origin,
                        -a.cos() * geometry.source_origin,
                        0.0,
                    ),
                    det: Vec3::new(
                        -a.sin() * geometry.origin_detector,
                        a.cos() * geometry.origin_detector,
                        0.0,
                    ),
                    u: Vec3::new(a.cos() * pw, a.sin() * pw, 0.0),
                    v: Vec3::new(0.0, 0.0, ph),
                })
                .collect(),
        ),
    }
}

/// Affine transform taking the oblique slice plane onto the centred
/// axis-aligned slab of half-extent `k`: a translation, a rotation
/// onto the plane frame, and an anisotropic scale.
///
/// The slab thickness axis uses the geometric mean of the two in-plane
/// scales so the thin slab stays proportionate.
pub fn slice_transform(
    base: Vec3,
    axis1: Vec3,
    axis2: Vec3,
    k: f32,
) -> (Vec3, Mat3, Vec3) {
    let center = base + 0.5 * (axis1 + axis2);
    let delta = -center;

    let x_axis = axis1.try_normalize().unwrap_or(Vec3::X);
    let normal = axis1.cross(axis2).try_normalize().unwrap_or_else(|| {
        warn!("degenerate slice orientation, axes are collinear");
        Vec3::Z
    });
    let y_axis = normal.cross(x_axis);
    // rows of the rotation are the plane frame: world -> plane coords
    let rot = Mat3::from_cols(x_axis, y_axis, normal).transpose();

    let len1 = axis1.length().max(f32::EPSILON);
    let len2 = axis2.length().max(f32::EPSILON);
    let sx = 2.0 * k / len1;
    let sy = 2.0 * k / len2;
    let scale = Vec3::new(sx, sy, (sx * sy).sqrt());

    (delta, rot, scale)
}

impl ProjectionVectors {
    pub fn len(&self) -> usize {
        match self {
            ProjectionVectors::Parallel(v) => v.len(),
            ProjectionVectors::Cone(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transform every projection's vectors so the requested oblique
    /// cut becomes the canonical centred slab. Parallel beams keep
    /// their detector basis convention; cone beams also move the
    /// source.
    pub fn for_slice(&self, orientation: &Orientation, rows: u32, cols: u32, k: f32) -> Self {
        let axis1 = Vec3::from_slice(&orientation[0..3]);
        let axis2 = Vec3::from_slice(&orientation[3..6]);
        let base = Vec3::from_slice(&orientation[6..9]);
        let (delta, rot, scale) = slice_transform(base, axis1, axis2, k);
        let (rows, cols) = (rows as f32, cols as f32);

        match self {
            ProjectionVectors::Parallel(vecs) => ProjectionVectors::Parallel(
                vecs.iter()
                    .map(|p| {
                        let mut det = p.det + 0.5 * (cols * p.u + rows * p.v);
                        let ray = scale * (rot * p.ray);
                        det = scale * (rot * (det + delta));
                        let u = scale * (rot * p.u);
                        let v = scale * (rot * p.v);
                        det -= 0.5 * (cols * u + rows * v);
                        ParallelVec { ray, det, u, v }
                    })
                    .collect(),
            ),
            ProjectionVectors::Cone(vecs) => ProjectionVectors::Cone(
                vecs.iter()
                    .map(|c| ConeVec {
                        source: scale * (rot * (c.source + delta)),
                        det: scale * (rot * (c.det + delta)),
                        u: scale * (rot * c.u),
                        v: scale * (rot * c.v),
                    })
                    .collect(),
            ),
        }
    }
}

/// FDK cone-beam pre-weights: `ρ / ‖y − s‖` per detector pixel, one
/// table per projection, flattened projection-major.
pub fn fdk_weights(vectors: &[ConeVec], rows: u32, cols: u32) -> Vec<f32> {
    let mut weights = Vec::with_capacity(vectors.len() * rows as usize * cols as usize);
    for vec in vectors {
        let rho = (vec.det - vec.source).length();
        for r in 0..rows {
            for c in 0..cols {
                let y = vec.det + r as f32 * vec.v + c as f32 * vec.u;
                weights.push(rho / (y - vec.source).length());
            }
        }
    }
    weights
}
