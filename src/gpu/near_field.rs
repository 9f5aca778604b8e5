//! Real-space short-range correction for the particle-mesh pipeline.
//!
//! Each voxel accumulates the softened Newtonian pull of every cell in
//! its radius-R window, evaluated at the voxel's center of mass and
//! wrapped by minimum image across the world box. The result fills three
//! near-force grids that the sampling kernel layers on top of the mesh
//! far field.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct NearFieldParams {
    n: u32,
    s: u32,
    g: f32,
    softening: f32,
}

pub struct NearFieldKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    voxels: u32,
}

impl NearFieldKernel {
    pub fn new(
        ctx: &GpuContext,
        layout: PackedLayout,
        radius: u32,
        gravity_strength: f32,
        softening: f32,
    ) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Near Field Pipeline",
            &near_field_wgsl(radius),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, true),
                uniform_entry(5),
            ],
        );
        let params = uniform_init(
            &ctx.device,
            "Near Field Params",
            bytemuck::bytes_of(&NearFieldParams {
                n: layout.n(),
                s: layout.slices_per_row(),
                g: gravity_strength,
                softening: softening.max(1e-6),
            }),
        );
        Ok(Self {
            pipeline,
            layout_bg,
            params,
            voxels: layout.voxel_count(),
        })
    }

    /// `mass_grid` is the four-channel deposit grid
    /// `(sum m*x, sum m*y, sum m*z, sum m)`.
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        mass_grid: &wgpu::Buffer,
        near_grids: [&wgpu::Buffer; 3],
        bounds: &wgpu::Buffer,
    ) {
        let bg = bind_group(
            &ctx.device,
            "Near Field Bind Group",
            &self.layout_bg,
            &[
                mass_grid,
                near_grids[0],
                near_grids[1],
                near_grids[2],
                bounds,
                &self.params,
            ],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Near Field Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
    }
}

pub fn near_field_wgsl(radius: u32) -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    g: f32,
    softening: f32,
}};

@group(0) @binding(0) var<storage, read> mass_grid: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> nfx: array<f32>;
@group(0) @binding(2) var<storage, read_write> nfy: array<f32>;
@group(0) @binding(3) var<storage, read_write> nfz: array<f32>;
@group(0) @binding(4) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(5) var<uniform> params: Params;

const RADIUS: i32 = {radius};
{packed}
fn wrap_cell(c: i32, n: i32) -> u32 {{
    return u32(((c % n) + n) % n);
}}

fn cell_com(cell: vec3<u32>, bmin: vec3<f32>, cell_size: vec3<f32>) -> vec4<f32> {{
    let moments = mass_grid[voxel_index(cell, params.n, params.s)];
    if moments.w > 0.0 {{
        return vec4<f32>(moments.xyz / moments.w, moments.w);
    }}
    let center = bmin + (vec3<f32>(cell) + vec3<f32>(0.5)) * cell_size;
    return vec4<f32>(center, 0.0);
}}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let n = params.n;
    if idx >= n * n * n {{
        return;
    }}
    let v = ordinal_to_voxel(idx, n);
    let vi = voxel_index(v, n, params.s);

    let bmin = bounds[0].xyz;
    let ext = max(bounds[1].xyz - bmin, vec3<f32>(1e-6));
    let cell_size = ext / f32(n);

    let here = cell_com(v, bmin, cell_size);
    let eps2 = params.softening * params.softening;
    let ni = i32(n);

    var acc = vec3<f32>(0.0);
    for (var dz = -RADIUS; dz <= RADIUS; dz++) {{
        for (var dy = -RADIUS; dy <= RADIUS; dy++) {{
            for (var dx = -RADIUS; dx <= RADIUS; dx++) {{
                if dx == 0 && dy == 0 && dz == 0 {{
                    continue;
                }}
                let cell = vec3<u32>(
                    wrap_cell(i32(v.x) + dx, ni),
                    wrap_cell(i32(v.y) + dy, ni),
                    wrap_cell(i32(v.z) + dz, ni),
                );
                let moments = mass_grid[voxel_index(cell, params.n, params.s)];
                if moments.w <= 0.0 {{
                    continue;
                }}
                let com = moments.xyz / moments.w;
                var delta = here.xyz - com;
                delta -= ext * round(delta / ext);
                let d2 = dot(delta, delta) + eps2;
                let inv = 1.0 / max(d2 * sqrt(d2), 1e-10);
                acc -= params.g * moments.w * delta * inv;
            }}
        }}
    }}

    nfx[vi] = acc.x;
    nfy[vi] = acc.y;
    nfz[vi] = acc.z;
}}
"#,
        radius = radius,
        packed = PACKED_WGSL,
    )
}
