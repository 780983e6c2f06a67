use std::sync::Mutex;

use bytemuck::cast_slice;
use glam::Vec3;
use tracing::debug;

use crate::config::{Geometry, ReconMode};
use crate::error::{Error, Result};
use crate::geometry::{ConeVec, Orientation, ParallelVec, ProjectionVectors, projection_vectors};
use crate::gpu::{GpuContext, SinogramBuffers};

/// Shader-side per-projection record: detector basis, corner, and ray
/// direction (parallel) or source position (cone).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuProjection {
    c0: [f32; 4],
    c1: [f32; 4],
    origin: [f32; 4],
    dir: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct BpParams {
    num_projections: u32,
    rows: u32,
    cols: u32,
    is_cone: u32,
    out_x: u32,
    out_y: u32,
    out_z: u32,
    _pad: u32,
    vol_min: [f32; 4],
    vol_max: [f32; 4],
}

fn vec4(v: Vec3) -> [f32; 4] {
    [v.x, v.y, v.z, 0.0]
}

fn parallel_record(p: &ParallelVec, rows: f32, cols: f32) -> GpuProjection {
    let corner = p.det - 0.5 * cols * p.u - 0.5 * rows * p.v;
    GpuProjection {
        c0: vec4(p.u),
        c1: vec4(p.v),
        origin: vec4(corner),
        dir: vec4(p.ray),
    }
}

fn cone_record(c: &ConeVec, rows: f32, cols: f32) -> GpuProjection {
    let corner = c.det - 0.5 * cols * c.u - 0.5 * rows * c.v;
    GpuProjection {
        c0: vec4(c.u),
        c1: vec4(c.v),
        origin: vec4(corner),
        dir: vec4(c.source),
    }
}

fn gpu_records(vectors: &ProjectionVectors, rows: u32, cols: u32) -> (Vec<GpuProjection>, bool) {
    let (rows, cols) = (rows as f32, cols as f32);
    match vectors {
        ProjectionVectors::Parallel(vecs) => (
            vecs.iter().map(|p| parallel_record(p, rows, cols)).collect(),
            false,
        ),
        ProjectionVectors::Cone(vecs) => (
            vecs.iter().map(|c| cone_record(c, rows, cols)).collect(),
            true,
        ),
    }
}

/// Drives the slice and preview back-projection passes against the
/// active sinogram buffer. Requests are serialised; the back-end is
/// treated as supporting one dispatch at a time.
pub struct BackProjector {
    slice_pipeline: wgpu::ComputePipeline,
    preview_pipeline: wgpu::ComputePipeline,
    bind_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    vectors_buffer: wgpu::Buffer,
    slice_output: wgpu::Buffer,
    slice_staging: wgpu::Buffer,
    preview_output: wgpu::Buffer,
    preview_staging: wgpu::Buffer,
    base_vectors: ProjectionVectors,
    geometry: Geometry,
    /// Half-extent of the reconstruction window along x.
    k: f32,
    recon_lock: Mutex<()>,
}

impl BackProjector {
    pub fn new(ctx: &GpuContext, geometry: &Geometry) -> Result<Self> {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("backproject"),
            source: wgpu::ShaderSource::Wgsl(include_str!("backproject.wgsl").into()),
        });

        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("backproject"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_entry(3, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("backproject"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let slice_pipeline = make_pipeline("slice_main");
        let preview_pipeline = make_pipeline("preview_main");

        let base_vectors = projection_vectors(geometry);
        let vectors_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("projection_vectors"),
            size: (base_vectors.len() * size_of::<GpuProjection>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("backproject_params"),
            size: size_of::<BpParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let slice_bytes = u64::from(geometry.slice_size) * u64::from(geometry.slice_size) * 4;
        let preview_bytes = u64::from(geometry.preview_size).pow(3) * 4;
        let make_out = |label, size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let make_staging = |label, size| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        };

        Ok(Self {
            slice_pipeline,
            preview_pipeline,
            bind_layout,
            params_buffer,
            vectors_buffer,
            slice_output: make_out("slice_out", slice_bytes),
            slice_staging: make_staging("slice_staging", slice_bytes),
            preview_output: make_out("preview_out", preview_bytes),
            preview_staging: make_staging("preview_staging", preview_bytes),
            base_vectors,
            geometry: geometry.clone(),
            k: geometry.volume_max[0],
            recon_lock: Mutex::new(()),
        })
    }

    /// Back-project the oblique cut described by `orientation` from
    /// the active sinogram. Pure function of the buffer contents at
    /// dispatch time.
    pub fn reconstruct_slice(
        &self,
        ctx: &GpuContext,
        sino: &SinogramBuffers,
        orientation: &Orientation,
    ) -> Result<Vec<f32>> {
        let _serial = self.recon_lock.lock().unwrap();
        debug!(
            axis1 = ?&orientation[0..3],
            axis2 = ?&orientation[3..6],
            base = ?&orientation[6..9],
            buffer = sino.active_index(),
            "reconstructing slice"
        );

        let transformed = self.base_vectors.for_slice(
            orientation,
            self.geometry.rows,
            self.geometry.cols,
            self.k,
        );
        let (records, is_cone) = gpu_records(&transformed, self.geometry.rows, self.geometry.cols);
        ctx.queue
            .write_buffer(&self.vectors_buffer, 0, cast_slice(&records));

        let s = self.geometry.slice_size;
        let params = BpParams {
            num_projections: self.geometry.angle_count,
            rows: self.geometry.rows,
            cols: self.geometry.cols,
            is_cone: is_cone as u32,
            out_x: s,
            out_y: s,
            out_z: 1,
            _pad: 0,
            vol_min: [-self.k, -self.k, 0.0, 0.0],
            vol_max: [self.k, self.k, 0.0, 0.0],
        };

        let groups = (s.div_ceil(8), s.div_ceil(8), 1);
        self.dispatch(
            ctx,
            sino,
            &self.slice_pipeline,
            &params,
            &self.slice_output,
            &self.slice_staging,
            groups,
            (s as usize * s as usize) * 4,
        )
    }

    /// Back-project the low-resolution preview volume from the active
    /// sinogram. Output intensities are scaled by `(P/cols)^3` to
    /// preserve integrated intensity at the reduced resolution.
    pub fn reconstruct_preview(
        &self,
        ctx: &GpuContext,
        sino: &SinogramBuffers,
    ) -> Result<Vec<f32>> {
        let _serial = self.recon_lock.lock().unwrap();

        let (records, is_cone) =
            gpu_records(&self.base_vectors, self.geometry.rows, self.geometry.cols);
        ctx.queue
            .write_buffer(&self.vectors_buffer, 0, cast_slice(&records));

        let p = self.geometry.preview_size;
        let params = BpParams {
            num_projections: self.geometry.angle_count,
            rows: self.geometry.rows,
            cols: self.geometry.cols,
            is_cone: is_cone as u32,
            out_x: p,
            out_y: p,
            out_z: p,
            _pad: 0,
            vol_min: [
                self.geometry.volume_min[0],
                self.geometry.volume_min[1],
                self.geometry.volume_min[2],
                0.0,
            ],
            vol_max: [
                self.geometry.volume_max[0],
                self.geometry.volume_max[1],
                self.geometry.volume_max[2],
                0.0,
            ],
        };

        let groups = (p.div_ceil(4), p.div_ceil(4), p.div_ceil(4));
        let mut volume = self.dispatch(
            ctx,
            sino,
            &self.preview_pipeline,
            &params,
            &self.preview_output,
            &self.preview_staging,
            groups,
            (p as usize).pow(3) * 4,
        )?;

        let factor = p as f32 / self.geometry.cols as f32;
        let scale = factor * factor * factor;
        for v in &mut volume {
            *v *= scale;
        }
        Ok(volume)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        ctx: &GpuContext,
        sino: &SinogramBuffers,
        pipeline: &wgpu::ComputePipeline,
        params: &BpParams,
        output: &wgpu::Buffer,
        staging: &wgpu::Buffer,
        groups: (u32, u32, u32),
        out_bytes: usize,
    ) -> Result<Vec<f32>> {
        // In continuous mode the single device buffer is shared with
        // the uploader; hold its lock across dispatch and readback.
        let _shared = match sino.mode() {
            ReconMode::Continuous => Some(sino.shared_lock()),
            ReconMode::Alternating => None,
        };

        ctx.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(params));

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("backproject"),
            layout: &self.bind_layout,
            entries: &[
                bind(0, &self.params_buffer),
                bind(1, &self.vectors_buffer),
                bind(2, sino.read_buffer()),
                bind(3, output),
            ],
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("backproject"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("backproject"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        }
        encoder.copy_buffer_to_buffer(output, 0, staging, 0, out_bytes as u64);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        staging.slice(..).map_async(wgpu::MapMode::Read, |_| {});
        ctx.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::Gpu(format!("device poll: {e:?}")))?;

        let result = {
            let view = staging.slice(..).get_mapped_range();
            cast_slice::<u8, f32>(&view).to_vec()
        };
        staging.unmap();
        Ok(result)
    }
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bind<'a>(binding: u32, buffer: &'a wgpu::Buffer) -> wgpu::BindGroupEntry<'a> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}
