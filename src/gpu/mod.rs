pub mod backproject;

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::config::ReconMode;
use crate::error::{Error, Result};
use crate::sino::SinogramUpdate;

/// Headless device context. Created once at startup; adapter or device
/// acquisition failure is fatal.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Gpu(format!("no suitable adapter: {e}")))?;

        info!("GPU adapter: {}", adapter.get_info().name);

        let adapter_limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("slicecast"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits {
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                ..wgpu::Limits::default()
            },
            ..Default::default()
        }))
        .map_err(|e| Error::Gpu(format!("device request failed: {e}")))?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }
}

/// Device-resident sinogram storage.
///
/// Alternating mode keeps two allocations; the uploader fills the
/// inactive one and flips the active index atomically once the copy is
/// queued, so readers never observe a torn buffer. Continuous mode
/// uses allocation 0 only, shared between uploads and readers under
/// `shared`; a slice served in that mode represents an arbitrary
/// point inside the last update window.
pub struct SinogramBuffers {
    buffers: [wgpu::Buffer; 2],
    active: AtomicUsize,
    mode: ReconMode,
    shared: Mutex<()>,
    rows: u32,
    cols: u32,
    num_projections: u32,
}

impl SinogramBuffers {
    pub fn new(
        device: &wgpu::Device,
        rows: u32,
        cols: u32,
        num_projections: u32,
        mode: ReconMode,
    ) -> Self {
        let size = u64::from(rows) * u64::from(cols) * u64::from(num_projections) * 4;
        let make = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        Self {
            buffers: [make("sinogram_a"), make("sinogram_b")],
            active: AtomicUsize::new(0),
            mode,
            shared: Mutex::new(()),
            rows,
            cols,
            num_projections,
        }
    }

    pub fn mode(&self) -> ReconMode {
        self.mode
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Buffer readers should back-project from right now.
    pub fn read_buffer(&self) -> &wgpu::Buffer {
        &self.buffers[self.active_index()]
    }

    /// Guard readers must hold in continuous mode so a patch upload
    /// cannot interleave with a dispatch. No-op granularity in
    /// alternating mode is handled by the caller never taking it.
    pub fn shared_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.shared.lock().unwrap()
    }

    /// Copy the updated angular spans to the device. In alternating
    /// mode this targets the inactive buffer and flips it active once
    /// the copy is queued; in continuous mode it patches the shared
    /// buffer in place under the reader lock.
    ///
    /// A device copy error discards the update: the buffers keep their
    /// previous contents and no flip happens.
    pub fn upload(&self, ctx: &GpuContext, update: &SinogramUpdate) -> Result<usize> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        match self.mode {
            ReconMode::Alternating => {
                let target = 1 - self.active_index();
                self.write_spans(ctx, &self.buffers[target], update);
                ctx.queue.submit(std::iter::empty());
                self.check_copy(ctx)?;
                self.active.store(target, Ordering::Release);
                Ok(target)
            }
            ReconMode::Continuous => {
                let _guard = self.shared_lock();
                self.write_spans(ctx, &self.buffers[0], update);
                ctx.queue.submit(std::iter::empty());
                self.check_copy(ctx)?;
                Ok(0)
            }
        }
    }

    fn check_copy(&self, ctx: &GpuContext) -> Result<()> {
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            warn!("sinogram upload failed, generation discarded: {e}");
            return Err(Error::Gpu(format!("sinogram upload: {e}")));
        }
        Ok(())
    }

    fn write_spans(&self, ctx: &GpuContext, buffer: &wgpu::Buffer, update: &SinogramUpdate) {
        let n = self.num_projections as usize;
        let cols = self.cols as usize;
        for &(begin, end) in &update.spans {
            let (begin, end) = (begin as usize, end as usize);
            for r in 0..self.rows as usize {
                let start = (r * n + begin) * cols;
                let len = (end - begin + 1) * cols;
                let bytes: &[u8] = bytemuck::cast_slice(&update.data[start..start + len]);
                ctx.queue
                    .write_buffer(buffer, (start * 4) as u64, bytes);
            }
        }
    }
}
