//! World-bounds reduction.
//!
//! Hierarchical min/max over live particle positions: one shared-memory
//! pass produces per-workgroup partials, a single-workgroup pass folds
//! them into the resident bounds buffer. The result never leaves the
//! GPU; every kernel that needs bounds samples the same two texels.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_buffer, storage_entry, uniform_entry,
    uniform_init, GpuContext, GridBuffer,
};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ReduceParams {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct BoundsReduceKernel {
    partial_pipeline: wgpu::ComputePipeline,
    partial_layout: wgpu::BindGroupLayout,
    final_pipeline: wgpu::ComputePipeline,
    final_layout: wgpu::BindGroupLayout,
    partials: GridBuffer,
    partial_params: wgpu::Buffer,
    final_params: wgpu::Buffer,
    num_partials: u32,
}

impl BoundsReduceKernel {
    pub fn new(ctx: &GpuContext, count: u32) -> Result<Self, CoreError> {
        let num_partials = groups_for(count).max(1);
        let (partial_pipeline, partial_layout) = compute_pipeline(
            &ctx.device,
            "Bounds Partial Pipeline",
            PARTIAL_SHADER,
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );
        let (final_pipeline, final_layout) = compute_pipeline(
            &ctx.device,
            "Bounds Final Pipeline",
            FINAL_SHADER,
            &[storage_entry(0, true), storage_entry(1, false), uniform_entry(2)],
        );
        let partials = GridBuffer::owned(storage_buffer(
            &ctx.device,
            "Bounds Partials",
            num_partials as u64 * 32,
        ));
        Ok(Self {
            partial_pipeline,
            partial_layout,
            final_pipeline,
            final_layout,
            partials,
            partial_params: uniform_init(
                &ctx.device,
                "Bounds Partial Params",
                bytemuck::bytes_of(&ReduceParams {
                    total: count,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }),
            ),
            final_params: uniform_init(
                &ctx.device,
                "Bounds Final Params",
                bytemuck::bytes_of(&ReduceParams {
                    total: num_partials,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }),
            ),
            num_partials,
        })
    }

    /// Reduce live particle positions into the bounds buffer. Leaves the
    /// previous bounds untouched when no particle carries mass.
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        particles: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
    ) {
        let bg = bind_group(
            &ctx.device,
            "Bounds Partial Bind Group",
            &self.partial_layout,
            &[particles, self.partials.buffer(), &self.partial_params],
        );
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Bounds Partial Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.partial_pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(self.num_partials, 1, 1);
        }
        let bg = bind_group(
            &ctx.device,
            "Bounds Final Bind Group",
            &self.final_layout,
            &[self.partials.buffer(), bounds, &self.final_params],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Bounds Final Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.final_pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }

    pub fn dispose(&mut self) {
        self.partials.dispose();
    }
}

pub const PARTIAL_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read> particles: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> partials: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

const BIG: f32 = 3.0e38;

var<workgroup> smin: array<vec3<f32>, 256>;
var<workgroup> smax: array<vec3<f32>, 256>;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    var lo = vec3<f32>(BIG);
    var hi = vec3<f32>(-BIG);
    if gid.x < params.total {
        let p = particles[gid.x];
        let finite = p.x == p.x && p.y == p.y && p.z == p.z;
        if p.w > 0.0 && finite {
            lo = p.xyz;
            hi = p.xyz;
        }
    }
    smin[lid.x] = lo;
    smax[lid.x] = hi;
    workgroupBarrier();

    for (var stride = 128u; stride > 0u; stride = stride >> 1u) {
        if lid.x < stride {
            smin[lid.x] = min(smin[lid.x], smin[lid.x + stride]);
            smax[lid.x] = max(smax[lid.x], smax[lid.x + stride]);
        }
        workgroupBarrier();
    }

    if lid.x == 0u {
        partials[wid.x * 2u] = vec4<f32>(smin[0], 0.0);
        partials[wid.x * 2u + 1u] = vec4<f32>(smax[0], 0.0);
    }
}
"#;

pub const FINAL_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read> partials: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> bounds: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: Params;

const BIG: f32 = 3.0e38;

var<workgroup> smin: array<vec3<f32>, 256>;
var<workgroup> smax: array<vec3<f32>, 256>;

@compute @workgroup_size(256)
fn main(@builtin(local_invocation_id) lid: vec3<u32>) {
    var lo = vec3<f32>(BIG);
    var hi = vec3<f32>(-BIG);
    for (var i = lid.x; i < params.total; i += 256u) {
        lo = min(lo, partials[i * 2u].xyz);
        hi = max(hi, partials[i * 2u + 1u].xyz);
    }
    smin[lid.x] = lo;
    smax[lid.x] = hi;
    workgroupBarrier();

    for (var stride = 128u; stride > 0u; stride = stride >> 1u) {
        if lid.x < stride {
            smin[lid.x] = min(smin[lid.x], smin[lid.x + stride]);
            smax[lid.x] = max(smax[lid.x], smax[lid.x + stride]);
        }
        workgroupBarrier();
    }

    // No live particle: keep the previous bounds.
    if lid.x == 0u && smin[0].x <= smax[0].x {
        bounds[0] = vec4<f32>(smin[0], 0.0);
        bounds[1] = vec4<f32>(smax[0], 0.0);
    }
}
"#;
