//! Force sampling at particle positions.
//!
//! Gathers the three real-space force grids with trilinear weights that
//! mirror the CIC deposit stencil. Overwrite mode seeds the per-particle
//! force buffer; accumulate mode layers the near-field correction on top
//! of the mesh far field.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext, GRID_WGSL,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct SampleParams {
    n: u32,
    s: u32,
    count: u32,
    accumulate: u32,
}

pub struct ForceSampleKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params_overwrite: wgpu::Buffer,
    params_accumulate: wgpu::Buffer,
    count: u32,
}

impl ForceSampleKernel {
    pub fn new(ctx: &GpuContext, layout: PackedLayout, count: u32) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Force Sample Pipeline",
            &sample_wgsl(),
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
                storage_entry(5, true),
                uniform_entry(6),
            ],
        );
        let make = |accumulate: u32| {
            uniform_init(
                &ctx.device,
                "Force Sample Params",
                bytemuck::bytes_of(&SampleParams {
                    n: layout.n(),
                    s: layout.slices_per_row(),
                    count,
                    accumulate,
                }),
            )
        };
        Ok(Self {
            pipeline,
            layout_bg,
            params_overwrite: make(0),
            params_accumulate: make(1),
            count,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        particles: &wgpu::Buffer,
        force_grids: [&wgpu::Buffer; 3],
        force_out: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
        accumulate: bool,
    ) {
        let params = if accumulate {
            &self.params_accumulate
        } else {
            &self.params_overwrite
        };
        let bg = bind_group(
            &ctx.device,
            "Force Sample Bind Group",
            &self.layout_bg,
            &[
                particles,
                force_grids[0],
                force_grids[1],
                force_grids[2],
                force_out,
                bounds,
                params,
            ],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Force Sample Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.count), 1, 1);
    }
}

pub fn sample_wgsl() -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    count: u32,
    accumulate: u32,
}};

@group(0) @binding(0) var<storage, read> particles: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> fx: array<f32>;
@group(0) @binding(2) var<storage, read> fy: array<f32>;
@group(0) @binding(3) var<storage, read> fz: array<f32>;
@group(0) @binding(4) var<storage, read_write> force: array<vec4<f32>>;
@group(0) @binding(5) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(6) var<uniform> params: Params;
{packed}{grid}
fn fetch(cell: vec3<u32>) -> vec3<f32> {{
    let vi = voxel_index(cell, params.n, params.s);
    return vec3<f32>(fx[vi], fy[vi], fz[vi]);
}}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if idx >= params.count {{
        return;
    }}
    let p = particles[idx];
    if !(p.w > 0.0) {{
        if params.accumulate == 0u {{
            force[idx] = vec4<f32>(0.0);
        }}
        return;
    }}

    let n = params.n;
    let g = world_to_grid(p.xyz, bounds[0].xyz, bounds[1].xyz, n);
    let b = grid_cell(g, n);
    let f = g - vec3<f32>(b);

    var acc = vec3<f32>(0.0);
    for (var dz = 0u; dz < 2u; dz++) {{
        for (var dy = 0u; dy < 2u; dy++) {{
            for (var dx = 0u; dx < 2u; dx++) {{
                let d = vec3<u32>(dx, dy, dz);
                let cell = min(b + d, vec3<u32>(n - 1u));
                let t = mix(vec3<f32>(1.0) - f, f, vec3<f32>(d));
                acc += fetch(cell) * (t.x * t.y * t.z);
            }}
        }}
    }}

    if params.accumulate != 0u {{
        force[idx] = force[idx] + vec4<f32>(acc, 0.0);
    }} else {{
        force[idx] = vec4<f32>(acc, 0.0);
    }}
}}
"#,
        packed = PACKED_WGSL,
        grid = GRID_WGSL,
    )
}
