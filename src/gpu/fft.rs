//! Stockham radix-2 FFT over the packed 3D grid.
//!
//! Three axis passes of log2(N) stages each, ping-ponging between two
//! complex buffers so no stage ever reads its own write target. The
//! forward transform starts by lifting the real mass grid into complex
//! cells (optionally normalized to density by the cell volume); the
//! inverse ends by extracting the real part with the 1/N^3 factor.
//! Whenever an axis pass leaves its result in the scratch buffer the
//! result is copied back to the primary, so every axis starts from a
//! known-good source.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_buffer, storage_entry, uniform_entry,
    uniform_init, GpuContext, GridBuffer,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FftDirection {
    Forward,
    Inverse,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct StageParams {
    n: u32,
    s: u32,
    axis: u32,
    ns: u32,
    sign: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ScaleParams {
    n: u32,
    s: u32,
    normalize: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CopyParams {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct FftKernel {
    convert_pipeline: wgpu::ComputePipeline,
    convert_layout: wgpu::BindGroupLayout,
    stage_pipeline: wgpu::ComputePipeline,
    stage_layout: wgpu::BindGroupLayout,
    extract_pipeline: wgpu::ComputePipeline,
    extract_layout: wgpu::BindGroupLayout,
    copy_pipeline: wgpu::ComputePipeline,
    copy_layout: wgpu::BindGroupLayout,
    ping: [GridBuffer; 2],
    /// Indexed `[direction][axis][stage]`, flattened.
    stage_params: Vec<wgpu::Buffer>,
    convert_params: wgpu::Buffer,
    extract_params: wgpu::Buffer,
    copy_params: wgpu::Buffer,
    layout: PackedLayout,
    log2n: u32,
    voxels: u32,
}

impl FftKernel {
    /// `mass_channels` is the stride of the real input grid (1 for a
    /// plain mass grid, 4 when the grid also carries centers of mass;
    /// the mass lives in the last channel). `normalize_density` divides
    /// by the cell volume on the way in.
    pub fn new(
        ctx: &GpuContext,
        layout: PackedLayout,
        mass_channels: u32,
        normalize_density: bool,
    ) -> Result<Self, CoreError> {
        let n = layout.n();
        if !n.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "FFT grid size {} is not a power of two",
                n
            )));
        }
        let log2n = n.trailing_zeros();
        let voxels = layout.voxel_count();
        let complex_bytes = layout.texel_count() as u64 * 8;
        ctx.ensure_storage_fits(complex_bytes, "FFT spectrum")?;

        let (convert_pipeline, convert_layout) = compute_pipeline(
            &ctx.device,
            "Fft Convert Pipeline",
            &convert_wgsl(mass_channels),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, true),
                uniform_entry(3),
            ],
        );
        let (stage_pipeline, stage_layout) = compute_pipeline(
            &ctx.device,
            "Fft Stage Pipeline",
            &stage_wgsl(),
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );
        let (extract_pipeline, extract_layout) = compute_pipeline(
            &ctx.device,
            "Fft Extract Pipeline",
            &extract_wgsl(),
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );
        let (copy_pipeline, copy_layout) = compute_pipeline(
            &ctx.device,
            "Fft Copy Pipeline",
            COPY_SHADER,
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );

        let ping = [
            GridBuffer::owned(storage_buffer(&ctx.device, "Fft Complex A", complex_bytes)),
            GridBuffer::owned(storage_buffer(&ctx.device, "Fft Complex B", complex_bytes)),
        ];

        let mut stage_params = Vec::with_capacity(2 * 3 * log2n as usize);
        for sign in [-1.0f32, 1.0] {
            for axis in 0..3u32 {
                for stage in 0..log2n {
                    stage_params.push(uniform_init(
                        &ctx.device,
                        "Fft Stage Params",
                        bytemuck::bytes_of(&StageParams {
                            n,
                            s: layout.slices_per_row(),
                            axis,
                            ns: 2u32 << stage,
                            sign,
                            _pad0: 0.0,
                            _pad1: 0.0,
                            _pad2: 0.0,
                        }),
                    ));
                }
            }
        }

        let convert_params = uniform_init(
            &ctx.device,
            "Fft Convert Params",
            bytemuck::bytes_of(&ScaleParams {
                n,
                s: layout.slices_per_row(),
                normalize: normalize_density as u32,
                _pad: 0,
            }),
        );
        let extract_params = uniform_init(
            &ctx.device,
            "Fft Extract Params",
            bytemuck::bytes_of(&ScaleParams {
                n,
                s: layout.slices_per_row(),
                normalize: 0,
                _pad: 0,
            }),
        );
        let copy_params = uniform_init(
            &ctx.device,
            "Fft Copy Params",
            bytemuck::bytes_of(&CopyParams {
                total: layout.texel_count(),
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            }),
        );

        Ok(Self {
            convert_pipeline,
            convert_layout,
            stage_pipeline,
            stage_layout,
            extract_pipeline,
            extract_layout,
            copy_pipeline,
            copy_layout,
            ping,
            stage_params,
            convert_params,
            extract_params,
            copy_params,
            layout,
            log2n,
            voxels,
        })
    }

    /// The primary complex buffer; holds the spectrum after `forward`.
    pub fn spectrum(&self) -> &wgpu::Buffer {
        self.ping[0].buffer()
    }

    /// Real grid in, spectrum out (in [`Self::spectrum`]).
    pub fn forward(&self, ctx: &GpuContext, encoder: &mut wgpu::CommandEncoder, mass: &wgpu::Buffer, bounds: &wgpu::Buffer) {
        let bg = bind_group(
            &ctx.device,
            "Fft Convert Bind Group",
            &self.convert_layout,
            &[mass, self.ping[0].buffer(), bounds, &self.convert_params],
        );
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Fft Convert Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.convert_pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
        }
        self.run_stages(ctx, encoder, FftDirection::Forward, None);
    }

    /// Spectrum in (left untouched), real grid out.
    pub fn inverse(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        spectrum: &wgpu::Buffer,
        real_out: &wgpu::Buffer,
    ) {
        self.run_stages(ctx, encoder, FftDirection::Inverse, Some(spectrum));
        let bg = bind_group(
            &ctx.device,
            "Fft Extract Bind Group",
            &self.extract_layout,
            &[self.ping[0].buffer(), real_out, &self.extract_params],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Fft Extract Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.extract_pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
    }

    fn run_stages(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        dir: FftDirection,
        external_input: Option<&wgpu::Buffer>,
    ) {
        let dir_idx = match dir {
            FftDirection::Forward => 0usize,
            FftDirection::Inverse => 1,
        };
        let mut cur = 0usize;
        for axis in 0..3u32 {
            for stage in 0..self.log2n {
                // The first inverse stage reads the caller's spectrum and
                // writes the scratch half, so even the primary spectrum
                // buffer may be passed back in without aliasing a write
                // target.
                let external_first = axis == 0 && stage == 0 && external_input.is_some();
                let (src, dst, next) = if external_first {
                    (external_input.unwrap(), self.ping[1].buffer(), 1usize)
                } else {
                    (self.ping[cur].buffer(), self.ping[1 - cur].buffer(), 1 - cur)
                };
                let params =
                    &self.stage_params[(dir_idx * 3 + axis as usize) * self.log2n as usize + stage as usize];
                let bg = bind_group(
                    &ctx.device,
                    "Fft Stage Bind Group",
                    &self.stage_layout,
                    &[src, dst, params],
                );
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Fft Stage Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.stage_pipeline);
                pass.set_bind_group(0, &bg, &[]);
                pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
                drop(pass);
                cur = next;
            }
            if cur != 0 {
                let bg = bind_group(
                    &ctx.device,
                    "Fft Copy Bind Group",
                    &self.copy_layout,
                    &[self.ping[1].buffer(), self.ping[0].buffer(), &self.copy_params],
                );
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Fft Copy Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.copy_pipeline);
                pass.set_bind_group(0, &bg, &[]);
                pass.dispatch_workgroups(groups_for(self.layout.texel_count()), 1, 1);
                drop(pass);
                cur = 0;
            }
        }
    }

    pub fn dispose(&mut self) {
        for b in self.ping.iter_mut() {
            b.dispose();
        }
    }
}

pub fn convert_wgsl(mass_channels: u32) -> String {
    let mass_offset = mass_channels - 1;
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    normalize: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<storage, read> mass: array<f32>;
@group(0) @binding(1) var<storage, read_write> spectrum: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: Params;
{packed}
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let n = params.n;
    if idx >= n * n * n {{
        return;
    }}
    let vi = voxel_index(ordinal_to_voxel(idx, n), n, params.s);
    var norm = 1.0;
    if params.normalize != 0u {{
        let ext = max(bounds[1].xyz - bounds[0].xyz, vec3<f32>(1e-6));
        let cell_volume = ext.x * ext.y * ext.z / f32(n * n * n);
        norm = 1.0 / cell_volume;
    }}
    spectrum[vi] = vec2<f32>(mass[vi * {stride}u + {offset}u] * norm, 0.0);
}}
"#,
        packed = PACKED_WGSL,
        stride = mass_channels,
        offset = mass_offset,
    )
}

pub fn stage_wgsl() -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    axis: u32,
    ns: u32,
    sign: f32,
    _pad0: f32,
    _pad1: f32,
    _pad2: f32,
}};

@group(0) @binding(0) var<storage, read> src: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

const TWO_PI: f32 = 6.283185307179586;
{packed}
fn axis_coord(v: vec3<u32>, axis: u32) -> u32 {{
    if axis == 0u {{
        return v.x;
    }}
    if axis == 1u {{
        return v.y;
    }}
    return v.z;
}}

fn with_axis(v: vec3<u32>, axis: u32, c: u32) -> vec3<u32> {{
    var r = v;
    if axis == 0u {{
        r.x = c;
    }} else if axis == 1u {{
        r.y = c;
    }} else {{
        r.z = c;
    }}
    return r;
}}

fn cmul(a: vec2<f32>, b: vec2<f32>) -> vec2<f32> {{
    return vec2<f32>(a.x * b.x - a.y * b.y, a.x * b.y + a.y * b.x);
}}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let n = params.n;
    if idx >= n * n * n {{
        return;
    }}
    let v = ordinal_to_voxel(idx, n);
    let t = axis_coord(v, params.axis);

    let half = params.ns / 2u;
    let base = (t / params.ns) * half;
    let offset = t % half;
    let even = base + offset;
    let odd = even + n / 2u;

    let angle = params.sign * TWO_PI * f32(t % params.ns) / f32(params.ns);
    let twiddle = vec2<f32>(cos(angle), sin(angle));

    let a = src[voxel_index(with_axis(v, params.axis, even), n, params.s)];
    let b = src[voxel_index(with_axis(v, params.axis, odd), n, params.s)];
    dst[voxel_index(v, n, params.s)] = a + cmul(twiddle, b);
}}
"#,
        packed = PACKED_WGSL,
    )
}

pub fn extract_wgsl() -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    normalize: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<storage, read> spectrum: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> grid: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;
{packed}
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let n = params.n;
    if idx >= n * n * n {{
        return;
    }}
    let vi = voxel_index(ordinal_to_voxel(idx, n), n, params.s);
    grid[vi] = spectrum[vi].x / f32(n * n * n);
}}
"#,
        packed = PACKED_WGSL,
    )
}

pub const COPY_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read> src: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.total {
        return;
    }
    dst[idx] = src[idx];
}
"#;
