//! Mass deposition onto the particle-mesh grid.
//!
//! Particles scatter their mass (NGP) or trilinear mass fractions (CIC)
//! into fixed-point atomic cells; a merge pass converts the accumulator
//! to the float mass grid. With the near-field correction enabled the
//! grid also accumulates mass-weighted positions so each cell carries
//! its center of mass.

use bytemuck::{Pod, Zeroable};

use crate::config::Assignment;
use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_buffer, storage_entry, uniform_entry,
    uniform_init, GpuContext, GridBuffer, GRID_WGSL, MOMENT_SCALE,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DepositParams {
    n: u32,
    s: u32,
    count: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct MergeParams {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct DepositKernel {
    clear_pipeline: wgpu::ComputePipeline,
    clear_layout: wgpu::BindGroupLayout,
    deposit_pipeline: wgpu::ComputePipeline,
    deposit_layout: wgpu::BindGroupLayout,
    merge_pipeline: wgpu::ComputePipeline,
    merge_layout: wgpu::BindGroupLayout,
    accum: GridBuffer,
    deposit_params: wgpu::Buffer,
    merge_params: wgpu::Buffer,
    count: u32,
    total_elements: u32,
}

impl DepositKernel {
    /// `with_com` widens the grid to four channels
    /// `(sum m*x, sum m*y, sum m*z, sum m)`; otherwise one mass channel.
    pub fn new(
        ctx: &GpuContext,
        layout: PackedLayout,
        assignment: Assignment,
        count: u32,
        with_com: bool,
    ) -> Result<Self, CoreError> {
        let channels = if with_com { 4u32 } else { 1u32 };
        let total_elements = layout.texel_count() * channels;
        ctx.ensure_storage_fits(total_elements as u64 * 4, "deposit accumulator")?;

        let source = deposit_wgsl(assignment, channels);
        let (deposit_pipeline, deposit_layout) = compute_pipeline(
            &ctx.device,
            "Deposit Pipeline",
            &source,
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, true),
                uniform_entry(3),
            ],
        );
        let (merge_pipeline, merge_layout) = compute_pipeline(
            &ctx.device,
            "Deposit Merge Pipeline",
            MERGE_SHADER,
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );
        let (clear_pipeline, clear_layout) = compute_pipeline(
            &ctx.device,
            "Deposit Clear Pipeline",
            CLEAR_SHADER,
            &[storage_entry(0, false), uniform_entry(1)],
        );

        let accum = GridBuffer::owned(storage_buffer(
            &ctx.device,
            "Deposit Accumulator",
            total_elements as u64 * 4,
        ));
        let deposit_params = uniform_init(
            &ctx.device,
            "Deposit Params",
            bytemuck::bytes_of(&DepositParams {
                n: layout.n(),
                s: layout.slices_per_row(),
                count,
                _pad: 0,
            }),
        );
        let merge_params = uniform_init(
            &ctx.device,
            "Deposit Merge Params",
            bytemuck::bytes_of(&MergeParams {
                total: total_elements,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            }),
        );

        Ok(Self {
            clear_pipeline,
            clear_layout,
            deposit_pipeline,
            deposit_layout,
            merge_pipeline,
            merge_layout,
            accum,
            deposit_params,
            merge_params,
            count,
            total_elements,
        })
    }

    /// Clear, scatter, merge. `grid` receives the float mass grid.
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        particles: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
        grid: &wgpu::Buffer,
    ) {
        let clear_bg = bind_group(
            &ctx.device,
            "Deposit Clear Bind Group",
            &self.clear_layout,
            &[self.accum.buffer(), &self.merge_params],
        );
        let deposit_bg = bind_group(
            &ctx.device,
            "Deposit Bind Group",
            &self.deposit_layout,
            &[particles, self.accum.buffer(), bounds, &self.deposit_params],
        );
        let merge_bg = bind_group(
            &ctx.device,
            "Deposit Merge Bind Group",
            &self.merge_layout,
            &[self.accum.buffer(), grid, &self.merge_params],
        );

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Deposit Clear Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.clear_pipeline);
            pass.set_bind_group(0, &clear_bg, &[]);
            pass.dispatch_workgroups(groups_for(self.total_elements), 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Deposit Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.deposit_pipeline);
            pass.set_bind_group(0, &deposit_bg, &[]);
            pass.dispatch_workgroups(groups_for(self.count), 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Deposit Merge Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.merge_pipeline);
            pass.set_bind_group(0, &merge_bg, &[]);
            pass.dispatch_workgroups(groups_for(self.total_elements), 1, 1);
        }
    }

    pub fn dispose(&mut self) {
        self.accum.dispose();
    }
}

/// Compose the scatter shader for one assignment scheme and channel
/// count. Exposed to the shader-validation tests.
pub fn deposit_wgsl(assignment: Assignment, channels: u32) -> String {
    let scatter_body = if channels == 4 {
        r#"    atomicAdd(&accum[base + 0u], i32(round(w * p.w * p.x * SCALE)));
    atomicAdd(&accum[base + 1u], i32(round(w * p.w * p.y * SCALE)));
    atomicAdd(&accum[base + 2u], i32(round(w * p.w * p.z * SCALE)));
    atomicAdd(&accum[base + 3u], i32(round(w * p.w * SCALE)));"#
    } else {
        r#"    atomicAdd(&accum[base], i32(round(w * p.w * SCALE)));"#
    };

    let assign_block = match assignment {
        Assignment::Ngp => "    scatter(b, 1.0, p);".to_string(),
        Assignment::Cic => r#"    let f = g - vec3<f32>(b);
    for (var dz = 0u; dz < 2u; dz++) {
        for (var dy = 0u; dy < 2u; dy++) {
            for (var dx = 0u; dx < 2u; dx++) {
                let d = vec3<u32>(dx, dy, dz);
                let cell = min(b + d, vec3<u32>(params.n - 1u));
                let t = mix(vec3<f32>(1.0) - f, f, vec3<f32>(d));
                scatter(cell, t.x * t.y * t.z, p);
            }
        }
    }"#
        .to_string(),
    };

    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    count: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<storage, read> particles: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> accum: array<atomic<i32>>;
@group(0) @binding(2) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: Params;

const SCALE: f32 = {scale:.1};
{packed}{grid}
fn scatter(cell: vec3<u32>, w: f32, p: vec4<f32>) {{
    let base = voxel_index(cell, params.n, params.s) * {channels}u;
{scatter_body}
}}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if idx >= params.count {{
        return;
    }}
    let p = particles[idx];
    if !(p.w > 0.0) {{
        return;
    }}
    let g = world_to_grid(p.xyz, bounds[0].xyz, bounds[1].xyz, params.n);
    let b = grid_cell(g, params.n);
{assign_block}
}}
"#,
        scale = MOMENT_SCALE,
        packed = PACKED_WGSL,
        grid = GRID_WGSL,
        channels = channels,
        scatter_body = scatter_body,
        assign_block = assign_block,
    )
}

pub const MERGE_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read> accum: array<i32>;
@group(0) @binding(1) var<storage, read_write> grid: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

const SCALE: f32 = 65536.0;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.total {
        return;
    }
    grid[idx] = f32(accum[idx]) / SCALE;
}
"#;

pub const CLEAR_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read_write> accum: array<atomic<i32>>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.total {
        return;
    }
    atomicStore(&accum[idx], 0);
}
"#;
