//! Integration kernels.
//!
//! Kick updates velocity from the force buffer with the acceleration
//! clamp, damping, and speed clamp applied in that order; drift advances
//! positions. Particles carrying NaN mass or velocity pass through
//! unchanged so one bad slot cannot poison its neighbors.

use bytemuck::{Pod, Zeroable};

use crate::error::CoreError;
use crate::gpu::{
    bind_group, compute_pipeline, groups_for, storage_entry, uniform_entry, uniform_init,
    GpuContext,
};

/// Which of the kick's two precreated timesteps to apply; KDK uses the
/// half step on both sides of the drift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KickDt {
    Full,
    Half,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct KickParams {
    dt: f32,
    damping: f32,
    max_speed: f32,
    max_accel: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DriftParams {
    dt: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
}

pub struct KickKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params_full: wgpu::Buffer,
    params_half: wgpu::Buffer,
    count: u32,
}

impl KickKernel {
    pub fn new(
        ctx: &GpuContext,
        count: u32,
        dt: f32,
        damping: f32,
        max_speed: f32,
        max_accel: f32,
    ) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Kick Pipeline",
            KICK_SHADER,
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                uniform_entry(4),
            ],
        );
        let make = |label: &str, dt: f32| {
            uniform_init(
                &ctx.device,
                label,
                bytemuck::bytes_of(&KickParams {
                    dt,
                    damping,
                    max_speed,
                    max_accel,
                    count,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }),
            )
        };
        Ok(Self {
            pipeline,
            layout_bg,
            params_full: make("Kick Params", dt),
            params_half: make("Kick Half Params", dt * 0.5),
            count,
        })
    }

    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        positions: &wgpu::Buffer,
        velocity_in: &wgpu::Buffer,
        force: &wgpu::Buffer,
        velocity_out: &wgpu::Buffer,
        dt: KickDt,
    ) {
        let params = match dt {
            KickDt::Full => &self.params_full,
            KickDt::Half => &self.params_half,
        };
        let bg = bind_group(
            &ctx.device,
            "Kick Bind Group",
            &self.layout_bg,
            &[positions, velocity_in, force, velocity_out, params],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Kick Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.count), 1, 1);
    }
}

pub struct DriftKernel {
    pipeline: wgpu::ComputePipeline,
    layout_bg: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    count: u32,
}

impl DriftKernel {
    pub fn new(ctx: &GpuContext, count: u32, dt: f32) -> Result<Self, CoreError> {
        let (pipeline, layout_bg) = compute_pipeline(
            &ctx.device,
            "Drift Pipeline",
            DRIFT_SHADER,
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                uniform_entry(3),
            ],
        );
        let params = uniform_init(
            &ctx.device,
            "Drift Params",
            bytemuck::bytes_of(&DriftParams {
                dt,
                count,
                _pad0: 0,
                _pad1: 0,
            }),
        );
        Ok(Self {
            pipeline,
            layout_bg,
            params,
            count,
        })
    }

    pub fn run(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        position_in: &wgpu::Buffer,
        velocity: &wgpu::Buffer,
        position_out: &wgpu::Buffer,
    ) {
        let bg = bind_group(
            &ctx.device,
            "Drift Bind Group",
            &self.layout_bg,
            &[position_in, velocity, position_out, &self.params],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Drift Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(groups_for(self.count), 1, 1);
    }
}

pub const KICK_SHADER: &str = r#"struct Params {
    dt: f32,
    damping: f32,
    max_speed: f32,
    max_accel: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> velocity_in: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read> force: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> velocity_out: array<vec4<f32>>;
@group(0) @binding(4) var<uniform> params: Params;

fn is_nan3(v: vec3<f32>) -> bool {
    return v.x != v.x || v.y != v.y || v.z != v.z;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.count {
        return;
    }
    let vin = velocity_in[idx];
    let mass = positions[idx].w;

    // Frozen: NaN state passes through untouched.
    if mass != mass || is_nan3(vin.xyz) {
        velocity_out[idx] = vin;
        return;
    }

    var a = force[idx].xyz;
    if is_nan3(a) {
        a = vec3<f32>(0.0);
    }
    let alen = length(a);
    if alen > params.max_accel {
        a *= params.max_accel / alen;
    }

    var v = vin.xyz + a * params.dt;
    v *= 1.0 - params.damping;
    let vlen = length(v);
    if vlen > params.max_speed {
        v *= params.max_speed / vlen;
    }

    velocity_out[idx] = vec4<f32>(v, vin.w);
}
"#;

pub const DRIFT_SHADER: &str = r#"struct Params {
    dt: f32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
};

@group(0) @binding(0) var<storage, read> position_in: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> velocity: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> position_out: array<vec4<f32>>;
@group(0) @binding(3) var<uniform> params: Params;

fn is_nan3(v: vec3<f32>) -> bool {
    return v.x != v.x || v.y != v.y || v.z != v.z;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x;
    if idx >= params.count {
        return;
    }
    let p = position_in[idx];
    let v = velocity[idx].xyz;

    // Mass rides along; frozen slots keep their position.
    if p.w != p.w || is_nan3(v) {
        position_out[idx] = p;
        return;
    }
    position_out[idx] = vec4<f32>(p.xyz + v * params.dt, p.w);
}
"#;
