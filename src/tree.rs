//! Barnes-Hut orchestrator.
//!
//! One `step()` aggregates the finest octree level, reduces the moment
//! pyramid, walks the tree for every particle, and integrates, all in a
//! single submission. The bounds reduction runs on its coarse schedule
//! when no fixed world box was configured.

use std::sync::Arc;

use crate::config::{GravityConfig, IntegratorKind};
use crate::error::CoreError;
use crate::gpu::{
    storage_buffer, AggregateKernel, BoundsReduceKernel, DriftKernel, GpuContext, GridBuffer,
    KickDt, KickKernel, ParticleState, PyramidKernel, TraversalKernel,
};
use crate::layout::LevelSet;

pub struct GravityTree {
    ctx: Arc<GpuContext>,
    particles: ParticleState,
    levels: LevelSet,
    integrator: IntegratorKind,
    bounds_interval: u32,
    bounds_buffer: GridBuffer,
    bounds_kernel: Option<BoundsReduceKernel>,
    aggregate: AggregateKernel,
    pyramid: PyramidKernel,
    traverse: TraversalKernel,
    kick: KickKernel,
    drift: DriftKernel,
    a0: GridBuffer,
    a1: Option<GridBuffer>,
    a2: Option<GridBuffer>,
    mask: Option<GridBuffer>,
    frame: u64,
    kdk_primed: bool,
    disposed: bool,
}

impl GravityTree {
    pub fn new(config: &GravityConfig) -> Result<Self, CoreError> {
        let ctx = GpuContext::new()?;
        Self::with_context(ctx, config)
    }

    pub fn with_context(ctx: Arc<GpuContext>, config: &GravityConfig) -> Result<Self, CoreError> {
        config.validate_tree()?;
        let levels = config.tree.levels()?;
        let device = &ctx.device;

        let particles = ParticleState::new(&ctx, &config.particle_data)?;
        let count = particles.count();
        let total = levels.total_texels() as u64;
        ctx.ensure_storage_fits(total * 16, "tree moment pyramid")?;

        let bounds_buffer = GridBuffer::owned(storage_buffer(device, "World Bounds", 32));
        let auto_bounds = config.world_bounds.is_none();
        if let Some(b) = &config.world_bounds {
            let data: [f32; 8] = [
                b.min.x, b.min.y, b.min.z, 0.0, b.max.x, b.max.y, b.max.z, 0.0,
            ];
            ctx.queue
                .write_buffer(bounds_buffer.buffer(), 0, bytemuck::cast_slice(&data));
        }
        let bounds_kernel = if auto_bounds {
            Some(BoundsReduceKernel::new(&ctx, count)?)
        } else {
            None
        };

        let quadrupole = config.tree.quadrupole;
        let use_mask = config.tree.use_occupancy_masks;
        let aggregate = AggregateKernel::new(&ctx, levels.finest(), count, quadrupole, use_mask)?;
        let pyramid = PyramidKernel::new(&ctx, &levels, quadrupole)?;
        let traverse = TraversalKernel::new(
            &ctx,
            &levels,
            count,
            &config.tree,
            config.theta,
            config.softening,
            config.gravity_strength,
        )?;
        let kick = KickKernel::new(
            &ctx,
            count,
            config.dt,
            config.damping,
            config.max_speed,
            config.max_accel,
        )?;
        let drift = DriftKernel::new(&ctx, count, config.dt)?;

        let a0 = GridBuffer::owned(storage_buffer(device, "Tree A0 Moments", total * 16));
        let a1 = quadrupole
            .then(|| GridBuffer::owned(storage_buffer(device, "Tree A1 Moments", total * 16)));
        let a2 = quadrupole
            .then(|| GridBuffer::owned(storage_buffer(device, "Tree A2 Moments", total * 8)));
        let mask_words = levels.finest().texel_count().div_ceil(32) as u64;
        let mask = use_mask
            .then(|| GridBuffer::owned(storage_buffer(device, "Occupancy Mask", mask_words * 4)));

        log::debug!(
            "tree pipeline ready: {} particles, {} levels, finest {}^3",
            count,
            levels.num_levels(),
            levels.finest().n()
        );

        Ok(Self {
            ctx,
            particles,
            levels,
            integrator: config.integrator,
            bounds_interval: config.bounds_refresh_interval,
            bounds_buffer,
            bounds_kernel,
            aggregate,
            pyramid,
            traverse,
            kick,
            drift,
            a0,
            a1,
            a2,
            mask,
            frame: 0,
            kdk_primed: false,
            disposed: false,
        })
    }

    pub fn step(&mut self) -> Result<(), CoreError> {
        self.ctx.check_alive()?;
        if self.disposed {
            return Err(CoreError::InvalidState("orchestrator is disposed".into()));
        }

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Tree Step Encoder"),
            });

        if let Some(bounds_kernel) = &self.bounds_kernel {
            if self.frame % self.bounds_interval as u64 == 0 {
                bounds_kernel.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.bounds_buffer.buffer(),
                );
            }
        }

        match self.integrator {
            IntegratorKind::Euler => {
                self.encode_forces(&mut encoder, self.particles.force_front())?;
                self.kick.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.particles.velocities(),
                    self.particles.force_front(),
                    self.particles.velocities_back(),
                    KickDt::Full,
                );
                self.particles.swap_velocities();
                self.drift.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.particles.velocities(),
                    self.particles.positions_back(),
                );
                self.particles.swap_positions();
            }
            IntegratorKind::Kdk => {
                if !self.kdk_primed {
                    self.encode_forces(&mut encoder, self.particles.force_front())?;
                    self.kdk_primed = true;
                }
                self.kick.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.particles.velocities(),
                    self.particles.force_front(),
                    self.particles.velocities_back(),
                    KickDt::Half,
                );
                self.particles.swap_velocities();
                self.drift.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.particles.velocities(),
                    self.particles.positions_back(),
                );
                self.particles.swap_positions();
                // Rebuild the octree at the drifted positions.
                self.encode_forces(&mut encoder, self.particles.force_back())?;
                self.kick.run(
                    &self.ctx,
                    &mut encoder,
                    self.particles.positions(),
                    self.particles.velocities(),
                    self.particles.force_back(),
                    self.particles.velocities_back(),
                    KickDt::Half,
                );
                self.particles.swap_velocities();
                self.particles.swap_forces();
            }
        }

        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.frame += 1;
        Ok(())
    }

    fn encode_forces(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        force_out: &wgpu::Buffer,
    ) -> Result<(), CoreError> {
        let bounds = self.bounds_buffer.buffer();
        let a1 = self.a1.as_ref().map(|b| b.buffer());
        let a2 = self.a2.as_ref().map(|b| b.buffer());
        let mask = self.mask.as_ref().map(|b| b.buffer());

        self.aggregate.run(
            &self.ctx,
            encoder,
            self.particles.positions(),
            bounds,
            self.a0.buffer(),
            a1,
            a2,
            mask,
        )?;
        self.pyramid
            .build_all(&self.ctx, encoder, self.a0.buffer(), a1, a2)?;
        self.traverse.run(
            &self.ctx,
            encoder,
            self.particles.positions(),
            self.a0.buffer(),
            a1,
            a2,
            force_out,
            bounds,
            mask,
        )?;
        Ok(())
    }

    /// Live position buffer for rendering; valid until the next `step()`.
    pub fn current_positions(&self) -> &wgpu::Buffer {
        self.particles.positions()
    }

    pub fn current_velocities(&self) -> &wgpu::Buffer {
        self.particles.velocities()
    }

    pub fn particle_count(&self) -> u32 {
        self.particles.count()
    }

    pub fn read_positions(&self) -> Result<Vec<f32>, CoreError> {
        self.particles.read_positions(&self.ctx)
    }

    pub fn read_velocities(&self) -> Result<Vec<f32>, CoreError> {
        self.particles.read_velocities(&self.ctx)
    }

    /// Optional numeric validation pass; see the mesh counterpart.
    pub fn validate_numerics(&self) -> Result<u32, CoreError> {
        let bad = self.particles.count_non_finite(&self.ctx)?;
        if bad > 0 {
            log::warn!("tree step produced {} non-finite particle slots", bad);
        }
        Ok(bad)
    }

    /// Monopole moments of one pyramid level, for inspection.
    pub(crate) fn read_level_moments(&self, level: u32) -> Result<Vec<f32>, CoreError> {
        let total = self.levels.total_texels() as u64 * 16;
        let raw = self.ctx.read_buffer(self.a0.buffer(), total)?;
        let all: Vec<f32> = bytemuck::cast_slice(&raw).to_vec();
        let start = self.levels.offset(level) as usize * 4;
        let len = self.levels.layout(level).texel_count() as usize * 4;
        Ok(all[start..start + len].to_vec())
    }

    /// Free all owned GPU resources. Idempotent; also called by `Drop`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.particles.dispose();
        self.bounds_buffer.dispose();
        if let Some(k) = &mut self.bounds_kernel {
            k.dispose();
        }
        self.aggregate.dispose();
        self.a0.dispose();
        if let Some(b) = &mut self.a1 {
            b.dispose();
        }
        if let Some(b) = &mut self.a2 {
            b.dispose();
        }
        if let Some(b) = &mut self.mask {
            b.dispose();
        }
        self.disposed = true;
    }
}

impl Drop for GravityTree {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParticleData, WorldBounds};
    use crate::gpu::test_support as ts;
    use glam::Vec3;

    fn cloud(count: usize) -> Vec<(Vec3, f32)> {
        (0..count)
            .map(|i| {
                let h = |k: usize| ((i * 37 + k * 2246822519) % 1800) as f32 / 1000.0 - 0.9;
                (Vec3::new(h(1), h(2), h(3)), 0.5 + ((i * 3) % 10) as f32 / 10.0)
            })
            .collect()
    }

    fn stepped_tree(ctx: std::sync::Arc<GpuContext>, quadrupole: bool) -> GravityTree {
        let particles = cloud(60);
        let mut config = GravityConfig::new(ParticleData::from_particles(&particles));
        config.world_bounds = Some(WorldBounds::centered(1.0));
        config.tree.num_levels = 5;
        config.tree.slices_per_row = 4;
        config.tree.quadrupole = quadrupole;
        let mut sim = GravityTree::with_context(ctx, &config).expect("tree");
        sim.step().expect("step");
        sim
    }

    #[test]
    fn pyramid_parents_sum_their_children() {
        let Some(ctx) = ts::context() else { return };
        let sim = stepped_tree(ctx, false);
        let levels = &sim.levels;
        for level in 1..levels.num_levels() {
            let child = sim.read_level_moments(level - 1).expect("child moments");
            let parent = sim.read_level_moments(level).expect("parent moments");
            let cl = levels.layout(level - 1);
            let pl = levels.layout(level);
            let pn = pl.n();
            for pz in 0..pn {
                for py in 0..pn {
                    for px in 0..pn {
                        let mut sum = [0.0f32; 4];
                        for dz in 0..2 {
                            for dy in 0..2 {
                                for dx in 0..2 {
                                    let ci = cl
                                        .voxel_index([2 * px + dx, 2 * py + dy, 2 * pz + dz])
                                        as usize;
                                    for c in 0..4 {
                                        sum[c] += child[ci * 4 + c];
                                    }
                                }
                            }
                        }
                        let pi = pl.voxel_index([px, py, pz]) as usize;
                        for c in 0..4 {
                            assert!(
                                (parent[pi * 4 + c] - sum[c]).abs() < 1e-3,
                                "level {} voxel ({},{},{}) channel {}: {} != {}",
                                level,
                                px,
                                py,
                                pz,
                                c,
                                parent[pi * 4 + c],
                                sum[c]
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn root_mass_matches_particles() {
        let Some(ctx) = ts::context() else { return };
        let sim = stepped_tree(ctx, true);
        let particles = cloud(60);
        let expected: f32 = particles.iter().map(|(_, m)| m).sum();
        let root_level = sim.levels.num_levels() - 1;
        let root = sim.read_level_moments(root_level).expect("root moments");
        assert!(
            (root[3] - expected).abs() < 0.05,
            "root mass {} != particle mass {}",
            root[3],
            expected
        );
    }
}
