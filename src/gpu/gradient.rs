//! Spectral differentiation.
//!
//! One program, three dispatches: each writes the acceleration spectrum
//! for one axis as F_hat = -i * k * phi_hat. The Nyquist mode has no
//! well-defined odd derivative and is zeroed.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GradientParams {
    n: u32,
    s: u32,
    axis: u32,
    _pad: u32,
}

pub struct GradientKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    axis_params: [wgpu::Buffer; 3],
    voxels: u32,
}

impl GradientKernel {
    pub fn new(ctx: &GpuContext, layout: PackedLayout) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Gradient Pipeline",
            &gradient_wgsl(),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, true),
                uniform_entry(3),
            ],
        );
        let axis_params = [0u32, 1, 2].map(|axis| {
            uniform_init(
                &ctx.device,
                "Gradient Params",
                bytemuck::bytes_of(&GradientParams {
                    n: layout.n(),
                    s: layout.slices_per_row(),
                    axis,
                    _pad: 0,
                }),
            )
        });
        Ok(Self {
            pipeline,
            layout_bg,
            axis_params,
            voxels: layout.voxel_count(),
        })
    }

    /// Potential spectrum in, three force-component spectra out.
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        potential: &wgpu::Buffer,
        force_spectra: [&wgpu::Buffer; 3],
        bounds: &wgpu::Buffer,
    ) {
        for axis in 0..3 {
            let bg = bind_group(
                &ctx.device,
                "Gradient Bind Group",
                &self.layout_bg,
                &[potential, force_spectra[axis], bounds, &self.axis_params[axis]],
            );
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Gradient Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
        }
    }
}

pub fn gradient_wgsl() -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    axis: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<storage, read> potential: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> force: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: Params;

const TWO_PI: f32 = 6.283185307179586;
{packed}
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    let n = params.n;
    if idx >= n * n * n {{
        return;
    }}
    let v = ordinal_to_voxel(idx, n);
    let vi = voxel_index(v, n, params.s);
    let ext = max(bounds[1].xyz - bounds[0].xyz, vec3<f32>(1e-6));

    let ni = v[params.axis];
    var m = i32(ni);
    if ni > n / 2u {{
        m = m - i32(n);
    }}
    var k = TWO_PI * f32(m) / ext[params.axis];
    if n % 2u == 0u && ni == n / 2u {{
        k = 0.0;
    }}

    let phi = potential[vi];
    // -i * k * (re + i*im) = k*im - i*k*re
    force[vi] = vec2<f32>(k * phi.y, -k * phi.x);
}}
"#,
        packed = PACKED_WGSL,
    )
}
