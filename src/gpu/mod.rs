//! GPU context and kernel plumbing.
//!
//! Every kernel in this module tree follows the same contract: the
//! constructor validates geometry and compiles pipelines, `run()` encodes
//! one synchronous dispatch sequence into a caller-provided encoder, and
//! `dispose()` frees only the buffers the kernel allocated itself.
//! Bind groups are created per `run()` from the buffers passed in, so
//! retargeting an output never leaves stale attachment state behind.

mod aggregate;
mod bounds_reduce;
mod deposit;
mod fft;
mod gradient;
mod integrate;
mod near_field;
mod particle_state;
mod poisson;
mod pyramid;
mod sample;
mod traverse;

/// Assembled WGSL sources for every kernel variant, exposed so the
/// shader-validation suite can run them through naga without a device.
#[doc(hidden)]
pub mod shaders {
    pub use super::aggregate::{merge_wgsl, scatter_wgsl, MASK_CLEAR_SHADER};
    pub use super::bounds_reduce::{FINAL_SHADER, PARTIAL_SHADER};
    pub use super::deposit::{deposit_wgsl, CLEAR_SHADER, MERGE_SHADER};
    pub use super::fft::{convert_wgsl, extract_wgsl, stage_wgsl, COPY_SHADER};
    pub use super::gradient::gradient_wgsl;
    pub use super::integrate::{DRIFT_SHADER, KICK_SHADER};
    pub use super::near_field::near_field_wgsl;
    pub use super::poisson::poisson_wgsl;
    pub use super::pyramid::pyramid_wgsl;
    pub use super::sample::sample_wgsl;
    pub use super::traverse::traversal_wgsl;
}

pub use aggregate::AggregateKernel;
pub use bounds_reduce::BoundsReduceKernel;
pub use deposit::DepositKernel;
pub use fft::{FftDirection, FftKernel};
pub use gradient::GradientKernel;
pub use integrate::{DriftKernel, KickDt, KickKernel};
pub use near_field::NearFieldKernel;
pub use particle_state::ParticleState;
pub use poisson::PoissonKernel;
pub use pyramid::PyramidKernel;
pub use sample::ForceSampleKernel;
pub use traverse::TraversalKernel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CoreError;

/// Invocations per workgroup for every 1D dispatch in the crate.
pub(crate) const WORKGROUP_SIZE: u32 = 256;

/// Fixed-point scale for atomic moment accumulation. Deposits are
/// quantized to 1/65536, which stands in for additive float blending.
pub(crate) const MOMENT_SCALE: f32 = 65536.0;

pub(crate) fn groups_for(count: u32) -> u32 {
    count.div_ceil(WORKGROUP_SIZE)
}

/// Headless GPU device shared by one or more orchestrators.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    /// Acquire a compute-capable adapter and device. No surface is
    /// created; rendering belongs to the host application.
    pub fn new() -> Result<Arc<Self>, CoreError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Arc<Self>, CoreError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                CoreError::UnsupportedPlatform(
                    "no compute-capable GPU adapter found".into(),
                )
            })?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Gravity Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::warn!("GPU device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::SeqCst);
        });

        Ok(Arc::new(Self { device, queue, lost }))
    }

    /// `DeviceLost` once the device has reported loss; checked at the top
    /// of every orchestrator operation.
    pub fn check_alive(&self) -> Result<(), CoreError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(CoreError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Reject allocations the device cannot bind as a single storage
    /// buffer.
    pub(crate) fn ensure_storage_fits(&self, bytes: u64, what: &str) -> Result<(), CoreError> {
        let max = self.device.limits().max_storage_buffer_binding_size as u64;
        if bytes > max {
            return Err(CoreError::UnsupportedPlatform(format!(
                "{} needs {} bytes, device caps storage bindings at {}",
                what, bytes, max
            )));
        }
        Ok(())
    }

    /// Blocking staging-buffer readback.
    pub(crate) fn read_buffer(
        &self,
        buffer: &wgpu::Buffer,
        bytes: u64,
    ) -> Result<Vec<u8>, CoreError> {
        self.check_alive()?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => {
                self.check_alive()?;
                return Err(CoreError::InvalidState(
                    "readback buffer mapping failed".into(),
                ));
            }
        }

        let data = slice.get_mapped_range();
        let out = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }
}

/// A storage buffer plus the ownership bit that governs disposal.
///
/// Kernels that allocate their own scratch hold it as an owned
/// `GridBuffer`; buffers handed in from outside are wrapped borrowed and
/// survive the kernel's `dispose()`.
pub struct GridBuffer {
    buffer: wgpu::Buffer,
    owned: bool,
    destroyed: bool,
}

impl GridBuffer {
    pub(crate) fn owned(buffer: wgpu::Buffer) -> Self {
        Self {
            buffer,
            owned: true,
            destroyed: false,
        }
    }

    /// Wrap a buffer owned by the caller; `dispose()` leaves it alive.
    pub fn external(buffer: wgpu::Buffer) -> Self {
        Self {
            buffer,
            owned: false,
            destroyed: false,
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Destroy the underlying buffer if this wrapper owns it. Idempotent.
    pub(crate) fn dispose(&mut self) {
        if self.owned && !self.destroyed {
            self.buffer.destroy();
        }
        self.destroyed = true;
    }
}

pub(crate) fn storage_buffer(device: &wgpu::Device, label: &str, bytes: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes.max(4),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

pub(crate) fn uniform_init(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    (pipeline, bind_group_layout)
}

pub(crate) fn bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: b.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

/// World-to-grid coordinate helpers shared by deposit, aggregation,
/// sampling, and traversal. The bounds buffer holds `[min, max]` as two
/// `vec4<f32>` texels.
pub(crate) const GRID_WGSL: &str = r#"
fn world_to_grid(p: vec3<f32>, bmin: vec3<f32>, bmax: vec3<f32>, n: u32) -> vec3<f32> {
    let ext = max(bmax - bmin, vec3<f32>(1e-6));
    let rel = clamp((p - bmin) / ext, vec3<f32>(0.0), vec3<f32>(1.0));
    return rel * f32(n);
}

fn grid_cell(g: vec3<f32>, n: u32) -> vec3<u32> {
    return min(vec3<u32>(g), vec3<u32>(n - 1u));
}
"#;

#[cfg(test)]
pub(crate) mod test_support {
    //! Device acquisition and buffer plumbing for kernel-level tests.
    //! Tests skip silently when the machine has no adapter.

    use std::sync::Arc;

    use super::{storage_buffer, GpuContext};

    pub fn context() -> Option<Arc<GpuContext>> {
        match GpuContext::new() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                eprintln!("skipping GPU test: {}", e);
                None
            }
        }
    }

    pub fn bounds_buffer(ctx: &GpuContext, min: [f32; 3], max: [f32; 3]) -> wgpu::Buffer {
        let buffer = storage_buffer(&ctx.device, "Test Bounds", 32);
        let data: [f32; 8] = [min[0], min[1], min[2], 0.0, max[0], max[1], max[2], 0.0];
        ctx.queue
            .write_buffer(&buffer, 0, bytemuck::cast_slice(&data));
        buffer
    }

    pub fn upload_f32(ctx: &GpuContext, label: &str, data: &[f32]) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        ctx.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            })
    }

    pub fn read_f32(ctx: &GpuContext, buffer: &wgpu::Buffer, len: usize) -> Vec<f32> {
        let raw = ctx
            .read_buffer(buffer, len as u64 * 4)
            .expect("test readback");
        bytemuck::cast_slice(&raw).to_vec()
    }

    pub fn submit(ctx: &GpuContext, encoder: wgpu::CommandEncoder) {
        ctx.queue.submit(std::iter::once(encoder.finish()));
    }

    pub fn encoder(ctx: &GpuContext) -> wgpu::CommandEncoder {
        ctx.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Test Encoder"),
            })
    }
}
