//! Octree level-0 aggregation.
//!
//! Particles scatter monopole moments (and raw second moments in the
//! quadrupole variant) into fixed-point atomics; the merge pass writes
//! the float attachments at the base of the all-levels moment buffers
//! and, when enabled, sets one occupancy bit per non-empty voxel.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::deposit::CLEAR_SHADER;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_buffer, storage_entry, uniform_entry,
    uniform_init, GpuContext, GridBuffer, GRID_WGSL, MOMENT_SCALE,
};
use crate::layout::{PackedLayout, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ScatterParams {
    n: u32,
    s: u32,
    count: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct TotalParams {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct AggregateKernel {
    clear_pipeline: wgpu::ComputePipeline,
    clear_layout: wgpu::BindGroupLayout,
    mask_clear_pipeline: Option<wgpu::ComputePipeline>,
    mask_clear_layout: Option<wgpu::BindGroupLayout>,
    scatter_pipeline: wgpu::ComputePipeline,
    scatter_layout: wgpu::BindGroupLayout,
    merge_pipeline: wgpu::ComputePipeline,
    merge_layout: wgpu::BindGroupLayout,
    a0_accum: GridBuffer,
    a1_accum: Option<GridBuffer>,
    a2_accum: Option<GridBuffer>,
    scatter_params: wgpu::Buffer,
    merge_params: wgpu::Buffer,
    clear_params_a0: wgpu::Buffer,
    clear_params_a1: Option<wgpu::Buffer>,
    clear_params_a2: Option<wgpu::Buffer>,
    mask_params: Option<wgpu::Buffer>,
    quadrupole: bool,
    use_mask: bool,
    count: u32,
    texels: u32,
    mask_words: u32,
}

impl AggregateKernel {
    pub fn new(
        ctx: &GpuContext,
        layout: PackedLayout,
        count: u32,
        quadrupole: bool,
        use_mask: bool,
    ) -> Result<Self, CoreError> {
        let texels = layout.texel_count();
        ctx.ensure_storage_fits(texels as u64 * 16, "aggregation accumulator")?;

        let (clear_pipeline, clear_layout) = compute_pipeline(
            &ctx.device,
            "Aggregate Clear Pipeline",
            CLEAR_SHADER,
            &[storage_entry(0, false), uniform_entry(1)],
        );

        let mut scatter_entries = vec![
            storage_entry(0, true),
            storage_entry(1, true),
            uniform_entry(2),
            storage_entry(3, false),
        ];
        if quadrupole {
            scatter_entries.push(storage_entry(4, false));
            scatter_entries.push(storage_entry(5, false));
        }
        let (scatter_pipeline, scatter_layout) = compute_pipeline(
            &ctx.device,
            "Aggregate Scatter Pipeline",
            &scatter_wgsl(quadrupole),
            &scatter_entries,
        );

        let mut merge_entries = vec![
            uniform_entry(0),
            storage_entry(1, true),
            storage_entry(2, false),
        ];
        let mut next_binding = 3;
        if quadrupole {
            merge_entries.push(storage_entry(3, true));
            merge_entries.push(storage_entry(4, false));
            merge_entries.push(storage_entry(5, true));
            merge_entries.push(storage_entry(6, false));
            next_binding = 7;
        }
        if use_mask {
            merge_entries.push(storage_entry(next_binding, false));
        }
        let (merge_pipeline, merge_layout) = compute_pipeline(
            &ctx.device,
            "Aggregate Merge Pipeline",
            &merge_wgsl(quadrupole, use_mask),
            &merge_entries,
        );

        let (mask_clear_pipeline, mask_clear_layout) = if use_mask {
            let (p, l) = compute_pipeline(
                &ctx.device,
                "Occupancy Clear Pipeline",
                MASK_CLEAR_SHADER,
                &[storage_entry(0, false), uniform_entry(1)],
            );
            (Some(p), Some(l))
        } else {
            (None, None)
        };

        let a0_accum = GridBuffer::owned(storage_buffer(
            &ctx.device,
            "Aggregate A0 Accumulator",
            texels as u64 * 16,
        ));
        let (a1_accum, a2_accum) = if quadrupole {
            (
                Some(GridBuffer::owned(storage_buffer(
                    &ctx.device,
                    "Aggregate A1 Accumulator",
                    texels as u64 * 16,
                ))),
                Some(GridBuffer::owned(storage_buffer(
                    &ctx.device,
                    "Aggregate A2 Accumulator",
                    texels as u64 * 8,
                ))),
            )
        } else {
            (None, None)
        };

        let total_uniform = |label: &str, total: u32| {
            uniform_init(
                &ctx.device,
                label,
                bytemuck::bytes_of(&TotalParams {
                    total,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }),
            )
        };

        let mask_words = texels.div_ceil(32);
        Ok(Self {
            clear_pipeline,
            clear_layout,
            mask_clear_pipeline,
            mask_clear_layout,
            scatter_pipeline,
            scatter_layout,
            merge_pipeline,
            merge_layout,
            a0_accum,
            a1_accum,
            a2_accum,
            scatter_params: uniform_init(
                &ctx.device,
                "Aggregate Scatter Params",
                bytemuck::bytes_of(&ScatterParams {
                    n: layout.n(),
                    s: layout.slices_per_row(),
                    count,
                    _pad: 0,
                }),
            ),
            merge_params: total_uniform("Aggregate Merge Params", texels),
            clear_params_a0: total_uniform("Aggregate Clear A0 Params", texels * 4),
            clear_params_a1: quadrupole
                .then(|| total_uniform("Aggregate Clear A1 Params", texels * 4)),
            clear_params_a2: quadrupole
                .then(|| total_uniform("Aggregate Clear A2 Params", texels * 2)),
            mask_params: use_mask.then(|| total_uniform("Occupancy Clear Params", mask_words)),
            quadrupole,
            use_mask,
            count,
            texels,
            mask_words,
        })
    }

    /// Clear, scatter, merge. `a1`/`a2` are required in the quadrupole
    /// variant, `mask` when occupancy tracking is on; missing inputs are
    /// an `InvalidState`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        particles: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
        a0: &wgpu::Buffer,
        a1: Option<&wgpu::Buffer>,
        a2: Option<&wgpu::Buffer>,
        mask: Option<&wgpu::Buffer>,
    ) -> Result<(), CoreError> {
        if self.quadrupole && (a1.is_none() || a2.is_none()) {
            return Err(CoreError::InvalidState(
                "quadrupole aggregation needs A1 and A2 attachments".into(),
            ));
        }
        if self.use_mask && mask.is_none() {
            return Err(CoreError::InvalidState(
                "occupancy tracking needs a mask buffer".into(),
            ));
        }

        // Clear all fixed-point accumulators.
        let mut clears: Vec<(&wgpu::Buffer, &wgpu::Buffer, u32)> = vec![(
            self.a0_accum.buffer(),
            &self.clear_params_a0,
            self.texels * 4,
        )];
        if let (Some(a1a), Some(p)) = (&self.a1_accum, &self.clear_params_a1) {
            clears.push((a1a.buffer(), p, self.texels * 4));
        }
        if let (Some(a2a), Some(p)) = (&self.a2_accum, &self.clear_params_a2) {
            clears.push((a2a.buffer(), p, self.texels * 2));
        }
        for (buffer, params, total) in clears {
            let bg = bind_group(
                &ctx.device,
                "Aggregate Clear Bind Group",
                &self.clear_layout,
                &[buffer, params],
            );
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Aggregate Clear Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.clear_pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(total), 1, 1);
        }
        if let (Some(pipeline), Some(layout), Some(params), Some(mask)) = (
            &self.mask_clear_pipeline,
            &self.mask_clear_layout,
            &self.mask_params,
            mask,
        ) {
            let bg = bind_group(
                &ctx.device,
                "Occupancy Clear Bind Group",
                layout,
                &[mask, params],
            );
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Occupancy Clear Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(self.mask_words), 1, 1);
        }

        // Scatter particle moments.
        let mut scatter_buffers: Vec<&wgpu::Buffer> = vec![
            particles,
            bounds,
            &self.scatter_params,
            self.a0_accum.buffer(),
        ];
        if let (Some(a1a), Some(a2a)) = (&self.a1_accum, &self.a2_accum) {
            scatter_buffers.push(a1a.buffer());
            scatter_buffers.push(a2a.buffer());
        }
        let bg = bind_group(
            &ctx.device,
            "Aggregate Scatter Bind Group",
            &self.scatter_layout,
            &scatter_buffers,
        );
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Aggregate Scatter Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.scatter_pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups_for(self.count), 1, 1);
        }

        // Merge to float attachments (level 0 sits at offset zero).
        let mut merge_buffers: Vec<&wgpu::Buffer> =
            vec![&self.merge_params, self.a0_accum.buffer(), a0];
        if self.quadrupole {
            merge_buffers.push(self.a1_accum.as_ref().unwrap().buffer());
            merge_buffers.push(a1.unwrap());
            merge_buffers.push(self.a2_accum.as_ref().unwrap().buffer());
            merge_buffers.push(a2.unwrap());
        }
        if let Some(mask) = mask {
            merge_buffers.push(mask);
        }
        let bg = bind_group(
            &ctx.device,
            "Aggregate Merge Bind Group",
            &self.merge_layout,
            &merge_buffers,
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Aggregate Merge Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.merge_pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.texels), 1, 1);
        Ok(())
    }

    pub fn dispose(&mut self) {
        self.a0_accum.dispose();
        if let Some(b) = &mut self.a1_accum {
            b.dispose();
        }
        if let Some(b) = &mut self.a2_accum {
            b.dispose();
        }
    }
}

pub fn scatter_wgsl(quadrupole: bool) -> String {
    let quad_bindings = if quadrupole {
        r#"@group(0) @binding(4) var<storage, read_write> a1_accum: array<atomic<i32>>;
@group(0) @binding(5) var<storage, read_write> a2_accum: array<atomic<i32>>;
"#
    } else {
        ""
    };
    let quad_scatter = if quadrupole {
        r#"    let q_base = vi * 4u;
    atomicAdd(&a1_accum[q_base + 0u], i32(round(m * p.x * p.x * SCALE)));
    atomicAdd(&a1_accum[q_base + 1u], i32(round(m * p.y * p.y * SCALE)));
    atomicAdd(&a1_accum[q_base + 2u], i32(round(m * p.z * p.z * SCALE)));
    atomicAdd(&a1_accum[q_base + 3u], i32(round(m * p.x * p.y * SCALE)));
    atomicAdd(&a2_accum[vi * 2u + 0u], i32(round(m * p.x * p.z * SCALE)));
    atomicAdd(&a2_accum[vi * 2u + 1u], i32(round(m * p.y * p.z * SCALE)));
"#
    } else {
        ""
    };
    format!(
        r#"struct Params {{
    n: u32,
    s: u32,
    count: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<storage, read> particles: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<storage, read_write> a0_accum: array<atomic<i32>>;
{quad_bindings}
const SCALE: f32 = {scale:.1};
{packed}{grid}
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if idx >= params.count {{
        return;
    }}
    let pm = particles[idx];
    let m = pm.w;
    if !(m > 0.0) {{
        return;
    }}
    let p = pm.xyz;
    let g = world_to_grid(p, bounds[0].xyz, bounds[1].xyz, params.n);
    let cell = grid_cell(g, params.n);
    let vi = voxel_index(cell, params.n, params.s);

    let base = vi * 4u;
    atomicAdd(&a0_accum[base + 0u], i32(round(m * p.x * SCALE)));
    atomicAdd(&a0_accum[base + 1u], i32(round(m * p.y * SCALE)));
    atomicAdd(&a0_accum[base + 2u], i32(round(m * p.z * SCALE)));
    atomicAdd(&a0_accum[base + 3u], i32(round(m * SCALE)));
{quad_scatter}}}
"#,
        quad_bindings = quad_bindings,
        quad_scatter = quad_scatter,
        scale = MOMENT_SCALE,
        packed = PACKED_WGSL,
        grid = GRID_WGSL,
    )
}

pub fn merge_wgsl(quadrupole: bool, use_mask: bool) -> String {
    let quad_bindings = if quadrupole {
        r#"@group(0) @binding(3) var<storage, read> a1_accum: array<i32>;
@group(0) @binding(4) var<storage, read_write> a1: array<vec4<f32>>;
@group(0) @binding(5) var<storage, read> a2_accum: array<i32>;
@group(0) @binding(6) var<storage, read_write> a2: array<vec2<f32>>;
"#
    } else {
        ""
    };
    let mask_binding = if use_mask {
        let binding = if quadrupole { 7 } else { 3 };
        format!(
            "@group(0) @binding({}) var<storage, read_write> occupancy: array<atomic<u32>>;\n",
            binding
        )
    } else {
        String::new()
    };
    let quad_merge = if quadrupole {
        r#"    a1[idx] = vec4<f32>(
        f32(a1_accum[idx * 4u + 0u]),
        f32(a1_accum[idx * 4u + 1u]),
        f32(a1_accum[idx * 4u + 2u]),
        f32(a1_accum[idx * 4u + 3u]),
    ) / SCALE;
    a2[idx] = vec2<f32>(f32(a2_accum[idx * 2u + 0u]), f32(a2_accum[idx * 2u + 1u])) / SCALE;
"#
    } else {
        ""
    };
    let mask_merge = if use_mask {
        r#"    if moments.w > 0.0 {
        atomicOr(&occupancy[idx / 32u], 1u << (idx % 32u));
    }
"#
    } else {
        ""
    };
    format!(
        r#"struct Params {{
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> a0_accum: array<i32>;
@group(0) @binding(2) var<storage, read_write> a0: array<vec4<f32>>;
{quad_bindings}{mask_binding}
const SCALE: f32 = 65536.0;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if idx >= params.total {{
        return;
    }}
    let moments = vec4<f32>(
        f32(a0_accum[idx * 4u + 0u]),
        f32(a0_accum[idx * 4u + 1u]),
        f32(a0_accum[idx * 4u + 2u]),
        f32(a0_accum[idx * 4u + 3u]),
    ) / SCALE;
    a0[idx] = moments;
{quad_merge}{mask_merge}}}
"#,
        quad_bindings = quad_bindings,
        mask_binding = mask_binding,
        quad_merge = quad_merge,
        mask_merge = mask_merge,
    )
}

pub const MASK_CLEAR_SHADER: &str = r#"struct Params {
    total: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read_write> occupancy: array<atomic<u32>>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.total {
        return;
    }
    atomicStore(&occupancy[idx], 0u);
}
"#;
