//! Moment pyramid reduction.
//!
//! Level i+1 is built from level i by summing each 2x2x2 child group
//! into its parent voxel. All levels of one attachment live in a single
//! buffer; every pass reads the child region and writes the disjoint
//! parent region, so a plain read-write binding is hazard-free.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext,
};
use crate::layout::{LevelSet, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct PyramidParams {
    child_n: u32,
    child_s: u32,
    child_off: u32,
    parent_n: u32,
    parent_s: u32,
    parent_off: u32,
    _pad0: u32,
    _pad1: u32,
}

pub struct PyramidKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    /// One parameter block per reduction pass, finest first.
    level_params: Vec<(wgpu::Buffer, u32)>,
    quadrupole: bool,
}

impl PyramidKernel {
    pub fn new(ctx: &GpuContext, levels: &LevelSet, quadrupole: bool) -> Result<Self, CoreError> {
        let mut entries = vec![uniform_entry(0), storage_entry(1, false)];
        if quadrupole {
            entries.push(storage_entry(2, false));
            entries.push(storage_entry(3, false));
        }
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Pyramid Pipeline",
            &pyramid_wgsl(quadrupole),
            &entries,
        );

        let mut level_params = Vec::new();
        for level in 1..levels.num_levels() {
            let child = levels.layout(level - 1);
            let parent = levels.layout(level);
            let params = uniform_init(
                &ctx.device,
                "Pyramid Params",
                bytemuck::bytes_of(&PyramidParams {
                    child_n: child.n(),
                    child_s: child.slices_per_row(),
                    child_off: levels.offset(level - 1),
                    parent_n: parent.n(),
                    parent_s: parent.slices_per_row(),
                    parent_off: levels.offset(level),
                    _pad0: 0,
                    _pad1: 0,
                }),
            );
            level_params.push((params, parent.voxel_count()));
        }

        Ok(Self {
            pipeline,
            layout_bg,
            level_params,
            quadrupole,
        })
    }

    /// Run all reduction passes, finest to root.
    pub fn build_all(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        a0: &wgpu::Buffer,
        a1: Option<&wgpu::Buffer>,
        a2: Option<&wgpu::Buffer>,
    ) -> Result<(), CoreError> {
        if self.quadrupole && (a1.is_none() || a2.is_none()) {
            return Err(CoreError::InvalidState(
                "quadrupole pyramid needs A1 and A2 attachments".into(),
            ));
        }
        for (params, parent_voxels) in &self.level_params {
            let mut buffers: Vec<&wgpu::Buffer> = vec![params, a0];
            if self.quadrupole {
                buffers.push(a1.unwrap());
                buffers.push(a2.unwrap());
            }
            let bg = bind_group(
                &ctx.device,
                "Pyramid Bind Group",
                &self.layout_bg,
                &buffers,
            );
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Pyramid Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(*parent_voxels), 1, 1);
        }
        Ok(())
    }
}

pub fn pyramid_wgsl(quadrupole: bool) -> String {
    let quad_bindings = if quadrupole {
        r#"@group(0) @binding(2) var<storage, read_write> a1: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> a2: array<vec2<f32>>;
"#
    } else {
        ""
    };
    let quad_decl = if quadrupole {
        r#"    var sum1 = vec4<f32>(0.0);
    var sum2 = vec2<f32>(0.0);
"#
    } else {
        ""
    };
    let quad_gather = if quadrupole {
        r#"                sum1 += a1[ci];
                sum2 += a2[ci];
"#
    } else {
        ""
    };
    let quad_store = if quadrupole {
        r#"    a1[pi] = sum1;
    a2[pi] = sum2;
"#
    } else {
        ""
    };
    format!(
        r#"struct Params {{
    child_n: u32,
    child_s: u32,
    child_off: u32,
    parent_n: u32,
    parent_s: u32,
    parent_off: u32,
    _pad0: u32,
    _pad1: u32,
}};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> a0: array<vec4<f32>>;
{quad_bindings}{packed}
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let pn = params.parent_n;
    if idx >= pn * pn * pn {{
        return;
    }}
    let pv = ordinal_to_voxel(idx, pn);

    var sum0 = vec4<f32>(0.0);
{quad_decl}
    // Standard octant order keeps the float sums deterministic.
    for (var dz = 0u; dz < 2u; dz++) {{
        for (var dy = 0u; dy < 2u; dy++) {{
            for (var dx = 0u; dx < 2u; dx++) {{
                let cv = pv * 2u + vec3<u32>(dx, dy, dz);
                let ci = params.child_off + voxel_index(cv, params.child_n, params.child_s);
                sum0 += a0[ci];
{quad_gather}            }}
        }}
    }}

    let pi = params.parent_off + voxel_index(pv, params.parent_n, params.parent_s);
    a0[pi] = sum0;
{quad_store}}}
"#,
        quad_bindings = quad_bindings,
        quad_decl = quad_decl,
        quad_gather = quad_gather,
        quad_store = quad_store,
        packed = PACKED_WGSL,
    )
}
