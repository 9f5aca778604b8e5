//! Particle ping-pong state.
//!
//! Two buffer pairs hold `(x, y, z, mass)` and `(vx, vy, vz, 0)` per
//! slot. Integrator kernels read the current half and write the other;
//! the swap at the end of `step()` is what makes frame N+1 observe frame
//! N's writes. A force pair backs the KDK integrator's `(f_prev, f_new)`
//! exchange.

use wgpu::util::DeviceExt;

use crate::config::ParticleData;
use crate::error::CoreError;
use crate::gpu::{GpuContext, GridBuffer};

pub struct ParticleState {
    pos: [GridBuffer; 2],
    vel: [GridBuffer; 2],
    force: [GridBuffer; 2],
    pos_cur: usize,
    vel_cur: usize,
    force_cur: usize,
    count: u32,
    capacity: u32,
}

impl ParticleState {
    pub fn new(ctx: &GpuContext, data: &ParticleData) -> Result<Self, CoreError> {
        data.validate()?;
        let capacity = data.capacity();
        let count = data.count();
        let bytes = capacity as u64 * 16;
        ctx.ensure_storage_fits(bytes, "particle state")?;

        let zeroes = vec![0.0f32; capacity as usize * 4];
        let velocities: &[f32] = data.velocities.as_deref().unwrap_or(&zeroes);

        let make = |label: &str, contents: &[f32]| {
            GridBuffer::owned(ctx.device.create_buffer_init(
                &wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(contents),
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                },
            ))
        };

        // Both halves start identical so the first frame may read either.
        let pos = [
            make("Position Mass A", &data.positions),
            make("Position Mass B", &data.positions),
        ];
        let vel = [
            make("Velocity A", velocities),
            make("Velocity B", velocities),
        ];
        let force = [
            make("Force A", &zeroes),
            make("Force B", &zeroes),
        ];

        Ok(Self {
            pos,
            vel,
            force,
            pos_cur: 0,
            vel_cur: 0,
            force_cur: 0,
            count,
            capacity,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current positions; valid until the next swap.
    pub fn positions(&self) -> &wgpu::Buffer {
        self.pos[self.pos_cur].buffer()
    }

    /// The write target for the next drift.
    pub fn positions_back(&self) -> &wgpu::Buffer {
        self.pos[1 - self.pos_cur].buffer()
    }

    pub fn swap_positions(&mut self) {
        self.pos_cur = 1 - self.pos_cur;
    }

    pub fn velocities(&self) -> &wgpu::Buffer {
        self.vel[self.vel_cur].buffer()
    }

    pub fn velocities_back(&self) -> &wgpu::Buffer {
        self.vel[1 - self.vel_cur].buffer()
    }

    pub fn swap_velocities(&mut self) {
        self.vel_cur = 1 - self.vel_cur;
    }

    /// Forces from the previous force build (KDK's `f_prev`; the only
    /// force buffer the Euler path touches).
    pub fn force_front(&self) -> &wgpu::Buffer {
        self.force[self.force_cur].buffer()
    }

    /// Target for the in-step force rebuild (KDK's `f_new`).
    pub fn force_back(&self) -> &wgpu::Buffer {
        self.force[1 - self.force_cur].buffer()
    }

    pub fn swap_forces(&mut self) {
        self.force_cur = 1 - self.force_cur;
    }

    pub fn read_positions(&self, ctx: &GpuContext) -> Result<Vec<f32>, CoreError> {
        let bytes = self.capacity as u64 * 16;
        let raw = ctx.read_buffer(self.positions(), bytes)?;
        Ok(bytemuck::cast_slice(&raw).to_vec())
    }

    pub fn read_velocities(&self, ctx: &GpuContext) -> Result<Vec<f32>, CoreError> {
        let bytes = self.capacity as u64 * 16;
        let raw = ctx.read_buffer(self.velocities(), bytes)?;
        Ok(bytemuck::cast_slice(&raw).to_vec())
    }

    /// Count slots whose position, mass, or velocity is NaN/Inf. This is
    /// the optional validation pass behind the numeric-warning policy; it
    /// costs a readback, so callers run it on their own schedule.
    pub fn count_non_finite(&self, ctx: &GpuContext) -> Result<u32, CoreError> {
        let positions = self.read_positions(ctx)?;
        let velocities = self.read_velocities(ctx)?;
        let mut bad = 0u32;
        for i in 0..self.count as usize {
            let p = &positions[i * 4..i * 4 + 4];
            let v = &velocities[i * 4..i * 4 + 3];
            if p.iter().chain(v.iter()).any(|x| !x.is_finite()) {
                bad += 1;
            }
        }
        Ok(bad)
    }

    pub fn dispose(&mut self) {
        for b in self.pos.iter_mut().chain(self.vel.iter_mut()).chain(self.force.iter_mut()) {
            b.dispose();
        }
    }
}
