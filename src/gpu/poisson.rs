//! Poisson solve in k-space.
//!
//! Applies the gravitational Green's function to the density spectrum,
//! undoes the mass-assignment filter, and optionally shapes the
//! long-range split. |k|^2 comes from the discrete Laplacian eigenvalue
//! by default, with the continuous wavenumber as the alternative; the
//! split window always uses the continuous |k|.

use bytemuck::{Pod, Zeroable};

use crate::config::{MeshConfig, SplitMode};
use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct PoissonParams {
    n: u32,
    s: u32,
    use_discrete: u32,
    split: u32,
    g: f32,
    k_cut: f32,
    sigma: f32,
    deconv_order: u32,
}

pub struct PoissonKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    voxels: u32,
}

impl PoissonKernel {
    pub fn new(
        ctx: &GpuContext,
        layout: PackedLayout,
        mesh: &MeshConfig,
        gravity_strength: f32,
    ) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Poisson Pipeline",
            &poisson_wgsl(),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, true),
                uniform_entry(3),
            ],
        );
        let split = match mesh.split {
            SplitMode::None => 0u32,
            SplitMode::Sharp => 1,
            SplitMode::Gaussian => 2,
        };
        let params = uniform_init(
            &ctx.device,
            "Poisson Params",
            bytemuck::bytes_of(&PoissonParams {
                n: layout.n(),
                s: layout.slices_per_row(),
                use_discrete: mesh.use_discrete as u32,
                split,
                g: gravity_strength,
                k_cut: mesh.k_cut,
                sigma: mesh.split_sigma,
                deconv_order: mesh.deconvolve_order(),
            }),
        );
        Ok(Self {
            pipeline,
            layout_bg,
            params,
            voxels: layout.voxel_count(),
        })
    }

    /// Density spectrum in, potential spectrum out. DC mode zeroed.
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        density: &wgpu::Buffer,
        potential: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
    ) {
        let bg = bind_group(
            &ctx.device,
            "Poisson Bind Group",
            &self.layout_bg,
            &[density, potential, bounds, &self.params],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Poisson Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.voxels), 1, 1);
    }
}

pub fn poisson_wgsl() -> String {
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    use_discrete: u32,
    split: u32,
    g: f32,
    k_cut: f32,
    sigma: f32,
    deconv_order: u32,
}};

@group(0) @binding(0) var<storage, read> density: array<vec2<f32>>;
@group(0) @binding(1) var<storage, read_write> potential: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: Params;

const PI: f32 = 3.141592653589793;
const TWO_PI: f32 = 6.283185307179586;
{packed}
fn sinc(x: f32) -> f32 {{
    if abs(x) < 1e-6 {{
        return 1.0;
    }}
    return sin(x) / x;
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
    let ext = max(bounds[1].xyz - bounds[0].xyz, vec3<f32>(1e-6));

    var k2_cont = 0.0;
    var k2_disc = 0.0;
    var window = 1.0;
    for (var c = 0u; c < 3u; c++) {{
        let ni = v[c];
        var m = i32(ni);
        if ni > n / 2u {{
            m = m - i32(n);
        }}
        let len = ext[c];
        let kc = TWO_PI * f32(m) / len;
        k2_cont += kc * kc;
        let h = len / f32(n);
        let kd = 2.0 / h * sin(PI * f32(ni) / f32(n));
        k2_disc += kd * kd;
        window *= sinc(PI * f32(m) / f32(n));
    }}

    if k2_cont < 1e-12 {{
        potential[vi] = vec2<f32>(0.0, 0.0);
        return;
    }}

    var k2 = k2_cont;
    if params.use_discrete != 0u {{
        k2 = max(k2_disc, 1e-12);
    }}

    var factor = -4.0 * PI * params.g / k2;
    if params.deconv_order > 0u {{
        factor /= pow(max(window, 1e-6), f32(params.deconv_order));
    }}
    if params.split == 1u {{
        if sqrt(k2_cont) >= params.k_cut {{
            factor = 0.0;
        }}
    }} else if params.split == 2u {{
        factor *= exp(-0.5 * params.sigma * params.sigma * k2_cont);
    }}

    potential[vi] = density[vi] * factor;
}}
"#,
        packed = PACKED_WGSL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Assignment;
    use crate::gpu::test_support as ts;

    #[test]
    fn solve_is_linear_in_density() {
        let Some(ctx) = ts::context() else { return };
        let layout = PackedLayout::new(8, 2).unwrap();
        let mesh = MeshConfig {
            assignment: Assignment::Cic,
            grid_size: 8,
            slices_per_row: 2,
            ..MeshConfig::default()
        };
        let kernel = PoissonKernel::new(&ctx, layout, &mesh, 0.5).unwrap();
        let floats = layout.texel_count() as usize * 2;

        let noise = |seed: usize| -> Vec<f32> {
            (0..floats)
                .map(|i| (((i + seed) * 2246822519usize) % 1000) as f32 / 500.0 - 1.0)
                .collect()
        };
        let rho1 = noise(1);
        let rho2 = noise(2);
        let combo: Vec<f32> = rho1
            .iter()
            .zip(&rho2)
            .map(|(a, b)| 2.5 * a - 1.5 * b)
            .collect();

        let bounds = ts::bounds_buffer(&ctx, [0.0; 3], [1.0; 3]);
        let mut outputs = Vec::new();
        for (label, rho) in [("r1", &rho1), ("r2", &rho2), ("combo", &combo)] {
            let src = ts::upload_f32(&ctx, label, rho);
            let dst = ts::upload_f32(&ctx, "Test Phi", &vec![0.0; floats]);
            let mut encoder = ts::encoder(&ctx);
            kernel.run(&ctx, &mut encoder, &src, &dst, &bounds);
            ts::submit(&ctx, encoder);
            outputs.push(ts::read_f32(&ctx, &dst, floats));
        }

        let peak = outputs[2].iter().fold(1e-6f32, |m, x| m.max(x.abs()));
        for i in 0..floats {
            let expect = 2.5 * outputs[0][i] - 1.5 * outputs[1][i];
            assert!(
                (outputs[2][i] - expect).abs() <= 1e-4 * peak,
                "mode {}: {} != {}",
                i,
                outputs[2][i],
                expect
            );
        }
    }

    #[test]
    fn dc_mode_is_zeroed() {
        let Some(ctx) = ts::context() else { return };
        let layout = PackedLayout::new(8, 2).unwrap();
        let kernel =
            PoissonKernel::new(&ctx, layout, &MeshConfig {
                grid_size: 8,
                slices_per_row: 2,
                ..MeshConfig::default()
            }, 1.0)
            .unwrap();
        let floats = layout.texel_count() as usize * 2;
        let rho = vec![1.0f32; floats];
        let src = ts::upload_f32(&ctx, "Test Rho", &rho);
        let dst = ts::upload_f32(&ctx, "Test Phi", &vec![7.0; floats]);
        let bounds = ts::bounds_buffer(&ctx, [0.0; 3], [1.0; 3]);
        let mut encoder = ts::encoder(&ctx);
        kernel.run(&ctx, &mut encoder, &src, &dst, &bounds);
        ts::submit(&ctx, encoder);
        let phi = ts::read_f32(&ctx, &dst, floats);
        assert_eq!(phi[0], 0.0);
        assert_eq!(phi[1], 0.0);
    }
}
