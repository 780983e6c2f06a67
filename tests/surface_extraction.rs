//! Iso-surface extraction over a synthetic preview volume.

use glam::Vec3;

use slicecast::surface::extract_surface;

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
fn sphere_mesh_hugs_the_iso_shell() {
    let dim = 32u32;
    let radius = 0.3f32;
    let volume = sphere_volume(dim, radius);

    let vertices = extract_surface(&volume, [dim; 3], 0.5, [1, 1, 1]);
    assert!(!vertices.is_empty());
    assert_eq!(vertices.len() % 3, 0, "whole triangles only");

    let shell = 2.0 * 1.0 / dim as f32;
    for vertex in &vertices {
        let r = Vec3::from_array(vertex.position).length();
        assert!(
            (r - radius).abs() <= shell,
            "vertex at radius {r}, shell is {radius} +/- {shell}"
        );

        let n = Vec3::from_array(vertex.normal);
        assert!((n.length() - 1.0).abs() < 1e-4, "normal length {}", n.length());
    }
}

#[test]
fn strided_extraction_stays_within_the_coarser_shell() {
    let dim = 32u32;
    let radius = 0.3f32;
    let volume = sphere_volume(dim, radius);

    let stride = [2u32, 2, 2];
    let vertices = extract_surface(&volume, [dim; 3], 0.5, stride);
    assert!(!vertices.is_empty());

    let shell = 2.0 * 2.0 / dim as f32;
    for vertex in &vertices {
        let r = Vec3::from_array(vertex.position).length();
        assert!((r - radius).abs() <= shell, "vertex at radius {r}");
    }
}

#[test]
fn positions_stay_in_the_unit_cube() {
    let volume = sphere_volume(16, 0.45);
    let vertices = extract_surface(&volume, [16; 3], 0.5, [1, 1, 1]);
    for vertex in &vertices {
        for &c in &vertex.position {
            assert!((-0.5..=0.5).contains(&c), "coordinate {c} out of range");
        }
    }
}
