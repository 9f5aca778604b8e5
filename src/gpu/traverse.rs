//! Barnes-Hut tree walk.
//!
//! Each particle descends the moment pyramid from the root. At every
//! level it scans the 3x3x3 window around its own voxel and applies the
//! improved acceptance criterion `d > s/theta + delta`, where `delta` is
//! the distance from the cell's center of mass to its geometric center.
//! Accepted cells contribute their multipole and are recorded in a
//! 27-bit window mask so their children are skipped one level down.
//!
//! A rejected cell is only partially refined below: the next window
//! rescans just the children adjacent to the particle. The walk
//! therefore adds the cell's residual - its moments minus exactly the
//! children the finer window will visit - at the current level, with the
//! residual's own aggregate center of mass. Combined with the window
//! mask this counts every cell exactly once, and the force degrades
//! gracefully to per-cell monopoles as theta shrinks. Level 0 finishes
//! with a direct softened sum over the near window, where the particle's
//! own voxel contributes only through its stored center of mass.

use bytemuck::{Pod, Zeroable};

use crate::config::TreeConfig;
use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext, GRID_WGSL,
};
use crate::layout::{LevelSet, MAX_LEVELS, PACKED_WGSL};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct TraversalParams {
    count: u32,
    num_levels: u32,
    theta: f32,
    softening: f32,
    g: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct TraversalKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    level_table: wgpu::Buffer,
    quadrupole: bool,
    use_mask: bool,
    count: u32,
}

impl TraversalKernel {
    pub fn new(
        ctx: &GpuContext,
        levels: &LevelSet,
        count: u32,
        tree: &TreeConfig,
        theta: f32,
        softening: f32,
        gravity_strength: f32,
    ) -> Result<Self, CoreError> {
        let quadrupole = tree.quadrupole;
        let use_mask = tree.use_occupancy_masks;

        let mut entries = vec![storage_entry(0, true), storage_entry(1, true)];
        let mut binding = 2;
        if quadrupole {
            entries.push(storage_entry(2, true));
            entries.push(storage_entry(3, true));
            binding = 4;
        }
        entries.push(storage_entry(binding, false)); // force
        entries.push(storage_entry(binding + 1, true)); // bounds
        entries.push(uniform_entry(binding + 2)); // level table
        entries.push(uniform_entry(binding + 3)); // params
        if use_mask {
            entries.push(storage_entry(binding + 4, true));
        }

        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Traversal Pipeline",
            &traversal_wgsl(quadrupole, use_mask, tree.near_field_radius),
            &entries,
        );

        let mut table = [[0u32; 4]; MAX_LEVELS as usize];
        for level in 0..levels.num_levels() {
            let l = levels.layout(level);
            table[level as usize] = [l.n(), l.slices_per_row(), levels.offset(level), 0];
        }
        let level_table = uniform_init(
            &ctx.device,
            "Traversal Level Table",
            bytemuck::cast_slice(&table),
        );
        let params = uniform_init(
            &ctx.device,
            "Traversal Params",
            bytemuck::bytes_of(&TraversalParams {
                count,
                num_levels: levels.num_levels(),
                theta: theta.max(1e-6),
                softening: softening.max(1e-6),
                g: gravity_strength,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            }),
        );

        Ok(Self {
            pipeline,
            layout_bg,
            params,
            level_table,
            quadrupole,
            use_mask,
            count,
        })
    }

    /// Walk the tree for every particle, replacing `force`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        particles: &wgpu::Buffer,
        a0: &wgpu::Buffer,
        a1: Option<&wgpu::Buffer>,
        a2: Option<&wgpu::Buffer>,
        force: &wgpu::Buffer,
        bounds: &wgpu::Buffer,
        mask: Option<&wgpu::Buffer>,
    ) -> Result<(), CoreError> {
        if self.quadrupole && (a1.is_none() || a2.is_none()) {
            return Err(CoreError::InvalidState(
                "quadrupole traversal needs A1 and A2 attachments".into(),
            ));
        }
        if self.use_mask && mask.is_none() {
            return Err(CoreError::InvalidState(
                "traversal fast path needs an occupancy mask".into(),
            ));
        }

        let mut buffers: Vec<&wgpu::Buffer> = vec![particles, a0];
        if self.quadrupole {
            buffers.push(a1.unwrap());
            buffers.push(a2.unwrap());
        }
        buffers.push(force);
        buffers.push(bounds);
        buffers.push(&self.level_table);
        buffers.push(&self.params);
        if let Some(mask) = mask {
            buffers.push(mask);
        }

        let bg = bind_group(
            &ctx.device,
            "Traversal Bind Group",
            &self.layout_bg,
            &buffers,
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Traversal Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.count), 1, 1);
        Ok(())
    }
}

pub fn traversal_wgsl(quadrupole: bool, use_mask: bool, near_radius: u32) -> String {
    let mut binding = 2u32;
    let quad_bindings = if quadrupole {
        binding = 4;
        r#"@group(0) @binding(2) var<storage, read> a1: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> a2: array<vec2<f32>>;
"#
        .to_string()
    } else {
        String::new()
    };
    let force_binding = binding;
    let bounds_binding = binding + 1;
    let table_binding = binding + 2;
    let params_binding = binding + 3;
    let mask_binding = if use_mask {
        format!(
            "@group(0) @binding({}) var<storage, read> occupancy: array<u32>;\n",
            binding + 4
        )
    } else {
        String::new()
    };

    let accept_expr = if quadrupole {
        "mono_accel(cell_a0.w, r, eps2) + quad_accel(cell_a0, cell_a1, cell_a2, r, eps2)"
    } else {
        "mono_accel(cell_a0.w, r, eps2)"
    };
    let residual_expr = if quadrupole {
        "mono_accel(cell_a0.w, rr, eps2) + quad_accel(cell_a0, cell_a1, cell_a2, rr, eps2)"
    } else {
        "mono_accel(cell_a0.w, rr, eps2)"
    };
    let root_accept = if quadrupole {
        "mono_accel(root.w, r, eps2) + quad_accel(root, a1[info.z], a2[info.z], r, eps2)"
    } else {
        "mono_accel(root.w, r, eps2)"
    };

    let quad_helpers = if quadrupole {
        r#"
fn quad_accel(m0: vec4<f32>, m1: vec4<f32>, m2: vec2<f32>, r: vec3<f32>, eps2: f32) -> vec3<f32> {
    let m = max(m0.w, 1e-10);
    let com = m0.xyz / m;
    // Second central moments about the center of mass.
    let sxx = m1.x - m * com.x * com.x;
    let syy = m1.y - m * com.y * com.y;
    let szz = m1.z - m * com.z * com.z;
    let sxy = m1.w - m * com.x * com.y;
    let sxz = m2.x - m * com.x * com.z;
    let syz = m2.y - m * com.y * com.z;
    let tr = sxx + syy + szz;
    let qxx = 3.0 * sxx - tr;
    let qyy = 3.0 * syy - tr;
    let qzz = 3.0 * szz - tr;
    let qr = vec3<f32>(
        qxx * r.x + 3.0 * sxy * r.y + 3.0 * sxz * r.z,
        3.0 * sxy * r.x + qyy * r.y + 3.0 * syz * r.z,
        3.0 * sxz * r.x + 3.0 * syz * r.y + qzz * r.z,
    );
    let d2 = dot(r, r) + eps2;
    let d = sqrt(d2);
    let d5 = max(d2 * d2 * d, 1e-10);
    let d7 = max(d5 * d2, 1e-10);
    return qr / d5 - 2.5 * dot(r, qr) * r / d7;
}
"#
    } else {
        ""
    };

    let quad_cell_fetch = if quadrupole {
        r#"                    var cell_a1 = a1[mi];
                    var cell_a2 = a2[mi];
"#
    } else {
        ""
    };
    let quad_child_subtract = if quadrupole {
        r#"                                cell_a1 -= a1[chi];
                                cell_a2 -= a2[chi];
"#
    } else {
        ""
    };

    let mask_check = if use_mask {
        r#"                    if ((occupancy[fi / 32u] >> (fi % 32u)) & 1u) == 0u {
                        continue;
                    }
"#
    } else {
        ""
    };

    format!(
        r#"struct Params {{
    count: u32,
    num_levels: u32,
    theta: f32,
    softening: f32,
    g: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}};

@group(0) @binding(0) var<storage, read> particles: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> a0: array<vec4<f32>>;
{quad_bindings}@group(0) @binding({force_binding}) var<storage, read_write> force: array<vec4<f32>>;
@group(0) @binding({bounds_binding}) var<storage, read> bounds: array<vec4<f32>>;
@group(0) @binding({table_binding}) var<uniform> levels: array<vec4<u32>, {max_levels}>;
@group(0) @binding({params_binding}) var<uniform> params: Params;
{mask_binding}
const NEAR_R: i32 = {near_radius};
{packed}{grid}
fn mono_accel(m: f32, r: vec3<f32>, eps2: f32) -> vec3<f32> {{
    let d2 = dot(r, r) + eps2;
    return m * r / max(d2 * sqrt(d2), 1e-10);
}}
{quad_helpers}
fn window_bit(rel: vec3<i32>) -> u32 {{
    return 1u << u32((rel.z + 1) * 9 + (rel.y + 1) * 3 + (rel.x + 1));
}}

fn window_accepted(mask: u32, rel: vec3<i32>) -> bool {{
    if any(abs(rel) > vec3<i32>(1)) {{
        return false;
    }}
    return (mask & window_bit(rel)) != 0u;
}}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if idx >= params.count {{
        return;
    }}
    let pm = particles[idx];
    if !(pm.w > 0.0) || pm.x != pm.x || pm.y != pm.y || pm.z != pm.z {{
        force[idx] = vec4<f32>(0.0);
        return;
    }}
    let pos = pm.xyz;
    let bmin = bounds[0].xyz;
    let bmax = bounds[1].xyz;
    let ext = max(bmax - bmin, vec3<f32>(1e-6));
    let eps2 = params.softening * params.softening;
    let theta = params.theta;
    let num_levels = params.num_levels;

    let n0 = levels[0].x;
    let v0 = grid_cell(world_to_grid(pos, bmin, bmax, n0), n0);

    var acc = vec3<f32>(0.0);

    // Root cell: accept outright when far enough, otherwise descend.
    {{
        let info = levels[num_levels - 1u];
        let root = a0[info.z];
        if root.w <= 0.0 {{
            force[idx] = vec4<f32>(0.0);
            return;
        }}
        let com = root.xyz / root.w;
        let side = max(ext.x, max(ext.y, ext.z));
        let center = bmin + 0.5 * ext;
        let r = com - pos;
        let d = length(r);
        let delta = length(com - center);
        if d > side / theta + delta {{
            acc += params.g * ({root_accept});
            force[idx] = vec4<f32>(acc, 0.0);
            return;
        }}
    }}

    // Acceptance bits for the 3x3x3 window one level up; bit index is
    // the cell's offset from the particle voxel at that level.
    var parent_mask = 0u;

    for (var l: i32 = i32(num_levels) - 2; l >= 1; l--) {{
        let lu = u32(l);
        let info = levels[lu];
        let nl = info.x;
        let cell_size = ext / f32(nl);
        let side = max(cell_size.x, max(cell_size.y, cell_size.z));
        let v = v0 >> vec3<u32>(lu);
        let vp = v >> vec3<u32>(1u);

        // Geometry of the next finer scan, which decides what descends.
        let finfo = levels[lu - 1u];
        let vf = v0 >> vec3<u32>(lu - 1u);
        var next_r = 1;
        if lu == 1u {{
            next_r = NEAR_R;
        }}

        var new_mask = 0u;

        for (var dz = -1; dz <= 1; dz++) {{
            for (var dy = -1; dy <= 1; dy++) {{
                for (var dx = -1; dx <= 1; dx++) {{
                    if dx == 0 && dy == 0 && dz == 0 {{
                        continue;
                    }}
                    let ci = vec3<i32>(v) + vec3<i32>(dx, dy, dz);
                    if any(ci < vec3<i32>(0)) || any(ci >= vec3<i32>(i32(nl))) {{
                        continue;
                    }}
                    let c = vec3<u32>(ci);
                    // Mass already counted through the coarser window.
                    let prel = vec3<i32>(c >> vec3<u32>(1u)) - vec3<i32>(vp);
                    if window_accepted(parent_mask, prel) {{
                        continue;
                    }}
                    let mi = info.z + voxel_index(c, nl, info.y);
                    var cell_a0 = a0[mi];
                    if cell_a0.w <= 0.0 {{
                        continue;
                    }}
{quad_cell_fetch}                    let com = cell_a0.xyz / cell_a0.w;
                    let center = bmin + (vec3<f32>(c) + vec3<f32>(0.5)) * cell_size;
                    let r = com - pos;
                    let d = length(r);
                    let delta = length(com - center);
                    if d > side / theta + delta {{
                        acc += params.g * ({accept_expr});
                        new_mask |= window_bit(vec3<i32>(dx, dy, dz));
                        continue;
                    }}
                    // Rejected: only the children inside the next window
                    // descend. Add the remainder here; no later window
                    // reaches it.
                    for (var oz = 0u; oz < 2u; oz++) {{
                        for (var oy = 0u; oy < 2u; oy++) {{
                            for (var ox = 0u; ox < 2u; ox++) {{
                                let ch = c * 2u + vec3<u32>(ox, oy, oz);
                                let crel = vec3<i32>(ch) - vec3<i32>(vf);
                                if all(abs(crel) <= vec3<i32>(next_r)) {{
                                    let chi = finfo.z + voxel_index(ch, finfo.x, finfo.y);
                                    cell_a0 -= a0[chi];
{quad_child_subtract}                                }}
                            }}
                        }}
                    }}
                    if cell_a0.w > 1e-6 {{
                        let rcom = cell_a0.xyz / cell_a0.w;
                        let rr = rcom - pos;
                        acc += params.g * ({residual_expr});
                    }}
                }}
            }}
        }}
        parent_mask = new_mask;
    }}

    // Level 0: direct softened sum over the near window. The particle's
    // own voxel contributes through its stored center of mass.
    {{
        let info = levels[0];
        let nl = info.x;
        let vp = v0 >> vec3<u32>(1u);
        for (var dz = -NEAR_R; dz <= NEAR_R; dz++) {{
            for (var dy = -NEAR_R; dy <= NEAR_R; dy++) {{
                for (var dx = -NEAR_R; dx <= NEAR_R; dx++) {{
                    let ci = vec3<i32>(v0) + vec3<i32>(dx, dy, dz);
                    if any(ci < vec3<i32>(0)) || any(ci >= vec3<i32>(i32(nl))) {{
                        continue;
                    }}
                    let c = vec3<u32>(ci);
                    let prel = vec3<i32>(c >> vec3<u32>(1u)) - vec3<i32>(vp);
                    if window_accepted(parent_mask, prel) {{
                        continue;
                    }}
                    let fi = voxel_index(c, nl, info.y);
{mask_check}                    let cell_a0 = a0[fi];
                    if cell_a0.w <= 0.0 {{
                        continue;
                    }}
                    let r = cell_a0.xyz / cell_a0.w - pos;
                    acc += params.g * mono_accel(cell_a0.w, r, eps2);
                }}
            }}
        }}
    }}

    force[idx] = vec4<f32>(acc, 0.0);
}}
"#,
        quad_bindings = quad_bindings,
        force_binding = force_binding,
        bounds_binding = bounds_binding,
        table_binding = table_binding,
        params_binding = params_binding,
        mask_binding = mask_binding,
        max_levels = MAX_LEVELS,
        near_radius = near_radius as i32,
        packed = PACKED_WGSL,
        grid = GRID_WGSL,
        quad_helpers = quad_helpers,
        quad_cell_fetch = quad_cell_fetch,
        quad_child_subtract = quad_child_subtract,
        root_accept = root_accept,
        accept_expr = accept_expr,
        residual_expr = residual_expr,
    )
}
