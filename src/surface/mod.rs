pub mod tables;

use glam::Vec3;

use self::tables::{EDGE_CONNECTION, EDGE_DIRECTION, EDGE_TABLE, TRI_TABLE, VERTEX_OFFSET};

/// One triangle corner with its surface normal. Triangles are emitted
/// as consecutive vertex triples.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SurfaceVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

/// Interpolation parameter of the iso crossing between two corner
/// values, clamped to the edge.
fn crossing_offset(iso: f32, v0: f32, v1: f32) -> f32 {
    let delta = v1 - v0;
    if delta.abs() < f32::EPSILON {
        0.5
    } else {
        ((iso - v0) / delta).clamp(0.0, 1.0)
    }
}

fn sample(volume: &[f32], dims: [u32; 3], x: u32, y: u32, z: u32) -> f32 {
    let x = x.min(dims[0] - 1) as usize;
    let y = y.min(dims[1] - 1) as usize;
    let z = z.min(dims[2] - 1) as usize;
    volume[(z * dims[1] as usize + y) * dims[0] as usize + x]
}

/// Central-difference gradient, pointing out of the dense region.
fn normal_at(volume: &[f32], dims: [u32; 3], x: u32, y: u32, z: u32) -> Vec3 {
    let grad = Vec3::new(
        sample(volume, dims, x.saturating_sub(1), y, z) - sample(volume, dims, x + 1, y, z),
        sample(volume, dims, x, y.saturating_sub(1), z) - sample(volume, dims, x, y + 1, z),
        sample(volume, dims, x, y, z.saturating_sub(1)) - sample(volume, dims, x, y, z + 1),
    );
    grad.try_normalize().unwrap_or(Vec3::Z)
}

/// Marching cubes over a volume of shape `dims` (x fastest), sampled
/// at `stride` voxels per axis. `iso_fraction` selects the iso-value
/// inside the volume's [min, max]. Output positions are normalised to
/// [-0.5, 0.5] per axis.
pub fn extract_surface(
    volume: &[f32],
    dims: [u32; 3],
    iso_fraction: f32,
    stride: [u32; 3],
) -> Vec<SurfaceVertex> {
    debug_assert_eq!(
        volume.len(),
        dims.iter().map(|&d| d as usize).product::<usize>()
    );
    let [dx, dy, dz] = stride.map(|s| s.max(1));

    let (v_min, v_max) = volume.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    let iso = v_min + (v_max - v_min) * iso_fraction;

    let inv_dims = Vec3::new(
        1.0 / dims[0] as f32,
        1.0 / dims[1] as f32,
        1.0 / dims[2] as f32,
    );

    let mut corner_values = [0.0f32; 8];
    let mut edge_vertices = [Vec3::ZERO; 12];
    let mut edge_normals = [Vec3::ZERO; 12];
    let mut vertices = Vec::new();

    for z in (0..dims[2]).step_by(dz as usize) {
        for y in (0..dims[1]).step_by(dy as usize) {
            for x in (0..dims[0]).step_by(dx as usize) {
                for (i, offset) in VERTEX_OFFSET.iter().enumerate() {
                    corner_values[i] = sample(
                        volume,
                        dims,
                        x + offset[0] * dx,
                        y + offset[1] * dy,
                        z + offset[2] * dz,
                    );
                }

                let mut cube_index = 0usize;
                for (i, &v) in corner_values.iter().enumerate() {
                    if v <= iso {
                        cube_index |= 1 << i;
                    }
                }
                let edge_flags = EDGE_TABLE[cube_index];
                if edge_flags == 0 {
                    continue;
                }

                for edge in 0..12 {
                    if edge_flags & (1 << edge) == 0 {
                        continue;
                    }
                    let [i0, i1] = EDGE_CONNECTION[edge];
                    let offset = crossing_offset(iso, corner_values[i0], corner_values[i1]);

                    let position = Vec3::new(
                        x as f32
                            + (VERTEX_OFFSET[i0][0] as f32 + offset * EDGE_DIRECTION[edge][0])
                                * dx as f32,
                        y as f32
                            + (VERTEX_OFFSET[i0][1] as f32 + offset * EDGE_DIRECTION[edge][1])
                                * dy as f32,
                        z as f32
                            + (VERTEX_OFFSET[i0][2] as f32 + offset * EDGE_DIRECTION[edge][2])
                                * dz as f32,
                    );
                    edge_vertices[edge] = position;
                    edge_normals[edge] = normal_at(
                        volume,
                        dims,
                        position.x as u32,
                        position.y as u32,
                        position.z as u32,
                    );
                }

                let triangles = &TRI_TABLE[cube_index];
                for triangle in 0..5 {
                    if triangles[3 * triangle] < 0 {
                        break;
                    }
                    for corner in 0..3 {
                        let edge = triangles[3 * triangle + corner] as usize;
                        let position = edge_vertices[edge] * inv_dims - 0.5;
                        vertices.push(SurfaceVertex {
                            position: position.to_array(),
                            normal: edge_normals[edge].to_array(),
                        });
                    }
                }
            }
        }
    }

    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_volume(dim: u32, radius: f32) -> Vec<f32> {
        let mut volume = Vec::with_capacity((dim as usize).pow(3));
        for z in 0..dim {
            for y in 0..dim {
                for x in 0..dim {
                    let p = Vec3::new(
                        (x as f32 + 0.5) / dim as f32 - 0.5,
                        (y as f32 + 0.5) / dim as f32 - 0.5,
                        (z as f32 + 0.5) / dim as f32 - 0.5,
                    );
                    volume.push(if p.length() < radius { 1.0 } else { 0.0 });
                }
            }
        }
        volume
    }

    #[test]
    fn empty_volume_produces_no_triangles() {
        let volume = vec![0.0; 8 * 8 * 8];
        // uniform volume: iso == min == max, every corner <= iso, no edges
        let vertices = extract_surface(&volume, [8, 8, 8], 0.5, [1, 1, 1]);
        assert!(vertices.is_empty());
    }

    #[test]
    fn triangle_count_is_multiple_of_three() {
        let volume = sphere_volume(16, 0.3);
        let vertices = extract_surface(&volume, [16, 16, 16], 0.5, [1, 1, 1]);
        assert!(!vertices.is_empty());
        assert_eq!(vertices.len() % 3, 0);
    }

    #[test]
    fn sphere_vertices_stay_on_shell() {
        let dim = 32u32;
        let radius = 0.3f32;
        let volume = sphere_volume(dim, radius);
        let vertices = extract_surface(&volume, [dim; 3], 0.5, [1, 1, 1]);
        assert!(!vertices.is_empty());
        let shell = 2.0 / dim as f32;
        for v in &vertices {
            let r = Vec3::from_array(v.position).length();
            assert!(
                (r - radius).abs() <= shell,
                "vertex at radius {r}, expected {radius} +/- {shell}"
            );
        }
    }

    #[test]
    fn normals_are_unit_length_and_outward() {
        let dim = 32u32;
        let volume = sphere_volume(dim, 0.3);
        let vertices = extract_surface(&volume, [dim; 3], 0.5, [1, 1, 1]);
        for v in &vertices {
            let n = Vec3::from_array(v.normal);
            assert!((n.length() - 1.0).abs() < 1e-4);
            // outward: aligned with the position direction on a sphere
            let p = Vec3::from_array(v.position);
            if p.length() > 1e-3 {
                assert!(n.dot(p.normalize()) > 0.0, "normal flipped at {p:?}");
            }
        }
    }

    #[test]
    fn stride_reduces_triangle_count() {
        let volume = sphere_volume(32, 0.35);
        let fine = extract_surface(&volume, [32; 3], 0.5, [1, 1, 1]);
        let coarse = extract_surface(&volume, [32; 3], 0.5, [2, 2, 2]);
        assert!(!coarse.is_empty());
        assert!(coarse.len() < fine.len());
    }

    #[test]
    fn crossing_offset_clamps_and_handles_flat_edges() {
        assert_eq!(crossing_offset(0.5, 0.0, 1.0), 0.5);
        assert_eq!(crossing_offset(2.0, 0.0, 1.0), 1.0);
        assert_eq!(crossing_offset(-1.0, 0.0, 1.0), 0.0);
        assert_eq!(crossing_offset(0.5, 0.7, 0.7), 0.5);
    }
}
