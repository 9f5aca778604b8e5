//! Particle-mesh orchestrator.
//!
//! One `step()` runs the full PM pipeline in a single submission:
//! deposit, forward FFT, Poisson solve, spectral gradient, three inverse
//! FFTs, force sampling, the optional near-field correction, and the
//! integrator. The orchestrator owns the particle ping-pong, every grid
//! buffer, and the resident bounds texels.

use std::sync::Arc;

use crate::config::{GravityConfig, IntegratorKind};
use crate::error::CoreError;
use crate::gpu::{
    storage_buffer, BoundsReduceKernel, DepositKernel, DriftKernel, FftKernel, ForceSampleKernel,
    GpuContext, GradientKernel, GridBuffer, KickDt, KickKernel, NearFieldKernel, ParticleState,
    PoissonKernel,
};
use crate::layout::PackedLayout;

pub struct GravityMesh {
    ctx: Arc<GpuContext>,
    particles: ParticleState,
    layout: PackedLayout,
    integrator: IntegratorKind,
    bounds_interval: u32,
    bounds_buffer: GridBuffer,
    bounds_kernel: Option<BoundsReduceKernel>,
    deposit: DepositKernel,
    fft: FftKernel,
    poisson: PoissonKernel,
    gradient: GradientKernel,
    sample: ForceSampleKernel,
    near: Option<NearFieldKernel>,
    kick: KickKernel,
    drift: DriftKernel,
    mass_grid: GridBuffer,
    potential: GridBuffer,
    force_spectra: [GridBuffer; 3],
    force_grids: [GridBuffer; 3],
    near_grids: Option<[GridBuffer; 3]>,
    frame: u64,
    kdk_primed: bool,
    disposed: bool,
}

impl GravityMesh {
    pub fn new(config: &GravityConfig) -> Result<Self, CoreError> {
        let ctx = GpuContext::new()?;
        Self::with_context(ctx, config)
    }

    /// Build on an already-acquired device, so several orchestrators can
    /// share one.
    pub fn with_context(ctx: Arc<GpuContext>, config: &GravityConfig) -> Result<Self, CoreError> {
        config.validate_mesh()?;
        let layout = config.mesh.layout()?;
        let device = &ctx.device;

        let particles = ParticleState::new(&ctx, &config.particle_data)?;
        let count = particles.count();
        let near_enabled = config.mesh.near_field_radius > 0;
        let channels = if near_enabled { 4u32 } else { 1 };
        let texels = layout.texel_count() as u64;
        ctx.ensure_storage_fits(texels * channels as u64 * 4, "mesh mass grid")?;

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

        let deposit = DepositKernel::new(&ctx, layout, config.mesh.assignment, count, near_enabled)?;
        let fft = FftKernel::new(&ctx, layout, channels, true)?;
        let poisson = PoissonKernel::new(&ctx, layout, &config.mesh, config.gravity_strength)?;
        let gradient = GradientKernel::new(&ctx, layout)?;
        let sample = ForceSampleKernel::new(&ctx, layout, count)?;
        let near = if near_enabled {
            Some(NearFieldKernel::new(
                &ctx,
                layout,
                config.mesh.near_field_radius,
                config.gravity_strength,
                config.softening,
            )?)
        } else {
            None
        };
        let kick = KickKernel::new(
            &ctx,
            count,
            config.dt,
            config.damping,
            config.max_speed,
            config.max_accel,
        )?;
        let drift = DriftKernel::new(&ctx, count, config.dt)?;

        let mass_grid = GridBuffer::owned(storage_buffer(
            device,
            "Mesh Mass Grid",
            texels * channels as u64 * 4,
        ));
        let potential = GridBuffer::owned(storage_buffer(device, "Potential Spectrum", texels * 8));
        let force_spectra = ["Force Spectrum X", "Force Spectrum Y", "Force Spectrum Z"]
            .map(|label| GridBuffer::owned(storage_buffer(device, label, texels * 8)));
        let force_grids = ["Force Grid X", "Force Grid Y", "Force Grid Z"]
            .map(|label| GridBuffer::owned(storage_buffer(device, label, texels * 4)));
        let near_grids = near_enabled.then(|| {
            ["Near Grid X", "Near Grid Y", "Near Grid Z"]
                .map(|label| GridBuffer::owned(storage_buffer(device, label, texels * 4)))
        });

        log::debug!(
            "mesh pipeline ready: {} particles, grid {}^3 packed {}x{}",
            count,
            layout.n(),
            layout.tex_width(),
            layout.tex_height()
        );

        Ok(Self {
            ctx,
            particles,
            layout,
            integrator: config.integrator,
            bounds_interval: config.bounds_refresh_interval,
            bounds_buffer,
            bounds_kernel,
            deposit,
            fft,
            poisson,
            gradient,
            sample,
            near,
            kick,
            drift,
            mass_grid,
            potential,
            force_spectra,
            force_grids,
            near_grids,
            frame: 0,
            kdk_primed: false,
            disposed: false,
        })
    }

    /// Advance the simulation one frame.
    pub fn step(&mut self) -> Result<(), CoreError> {
        self.ctx.check_alive()?;
        if self.disposed {
            return Err(CoreError::InvalidState("orchestrator is disposed".into()));
        }

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Mesh Step Encoder"),
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
                self.encode_forces(&mut encoder, self.particles.force_front());
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
                    self.encode_forces(&mut encoder, self.particles.force_front());
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
                self.encode_forces(&mut encoder, self.particles.force_back());
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

    fn encode_forces(&self, encoder: &mut wgpu::CommandEncoder, force_out: &wgpu::Buffer) {
        let bounds = self.bounds_buffer.buffer();
        self.deposit.run(
            &self.ctx,
            encoder,
            self.particles.positions(),
            bounds,
            self.mass_grid.buffer(),
        );
        self.fft
            .forward(&self.ctx, encoder, self.mass_grid.buffer(), bounds);
        self.poisson.run(
            &self.ctx,
            encoder,
            self.fft.spectrum(),
            self.potential.buffer(),
            bounds,
        );
        self.gradient.run(
            &self.ctx,
            encoder,
            self.potential.buffer(),
            [
                self.force_spectra[0].buffer(),
                self.force_spectra[1].buffer(),
                self.force_spectra[2].buffer(),
            ],
            bounds,
        );
        for axis in 0..3 {
            self.fft.inverse(
                &self.ctx,
                encoder,
                self.force_spectra[axis].buffer(),
                self.force_grids[axis].buffer(),
            );
        }
        self.sample.run(
            &self.ctx,
            encoder,
            self.particles.positions(),
            [
                self.force_grids[0].buffer(),
                self.force_grids[1].buffer(),
                self.force_grids[2].buffer(),
            ],
            force_out,
            bounds,
            false,
        );
        if let (Some(near), Some(near_grids)) = (&self.near, &self.near_grids) {
            near.run(
                &self.ctx,
                encoder,
                self.mass_grid.buffer(),
                [
                    near_grids[0].buffer(),
                    near_grids[1].buffer(),
                    near_grids[2].buffer(),
                ],
                bounds,
            );
            self.sample.run(
                &self.ctx,
                encoder,
                self.particles.positions(),
                [
                    near_grids[0].buffer(),
                    near_grids[1].buffer(),
                    near_grids[2].buffer(),
                ],
                force_out,
                bounds,
                true,
            );
        }
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

    /// Optional numeric validation pass: counts NaN/Inf slots, logs a
    /// warning, and leaves freezing to the integrator.
    pub fn validate_numerics(&self) -> Result<u32, CoreError> {
        let bad = self.particles.count_non_finite(&self.ctx)?;
        if bad > 0 {
            log::warn!("mesh step produced {} non-finite particle slots", bad);
        }
        Ok(bad)
    }

    pub(crate) fn read_mass_grid(&self) -> Result<Vec<f32>, CoreError> {
        let channels = if self.near.is_some() { 4u64 } else { 1 };
        let bytes = self.layout.texel_count() as u64 * channels * 4;
        let raw = self.ctx.read_buffer(self.mass_grid.buffer(), bytes)?;
        Ok(bytemuck::cast_slice(&raw).to_vec())
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
        self.deposit.dispose();
        self.fft.dispose();
        self.mass_grid.dispose();
        self.potential.dispose();
        for b in self.force_spectra.iter_mut().chain(self.force_grids.iter_mut()) {
            b.dispose();
        }
        if let Some(grids) = &mut self.near_grids {
            for b in grids.iter_mut() {
                b.dispose();
            }
        }
        self.disposed = true;
    }
}

impl Drop for GravityMesh {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Assignment, ParticleData, WorldBounds};
    use crate::gpu::test_support as ts;
    use glam::Vec3;

    fn cloud(count: usize) -> Vec<(Vec3, f32)> {
        (0..count)
            .map(|i| {
                let h = |k: usize| ((i * 31 + k * 2654435761) % 1800) as f32 / 1000.0 - 0.9;
                (Vec3::new(h(1), h(2), h(3)), 0.5 + ((i * 7) % 10) as f32 / 10.0)
            })
            .collect()
    }

    #[test]
    fn deposit_conserves_mass() {
        let Some(ctx) = ts::context() else { return };
        for (assignment, near_radius) in [(Assignment::Ngp, 0u32), (Assignment::Cic, 1)] {
            let particles = cloud(100);
            let expected: f32 = particles.iter().map(|(_, m)| m).sum();
            let mut config = GravityConfig::new(ParticleData::from_particles(&particles));
            config.world_bounds = Some(WorldBounds::centered(1.0));
            config.mesh.assignment = assignment;
            config.mesh.grid_size = 16;
            config.mesh.slices_per_row = 4;
            config.mesh.near_field_radius = near_radius;

            let mut sim = GravityMesh::with_context(ctx.clone(), &config).expect("mesh");
            sim.step().expect("step");
            let grid = sim.read_mass_grid().expect("grid readback");
            let total: f32 = if near_radius > 0 {
                grid.chunks(4).map(|c| c[3]).sum()
            } else {
                grid.iter().sum()
            };
            assert!(
                (total - expected).abs() < 0.05,
                "{:?}: grid mass {} != particle mass {}",
                assignment,
                total,
                expected
            );
        }
    }

    #[test]
    fn construction_rejects_bad_mesh_config() {
        let Some(ctx) = ts::context() else { return };
        let mut config = GravityConfig::new(ParticleData::from_particles(&cloud(4)));
        config.mesh.grid_size = 48;
        assert!(matches!(
            GravityMesh::with_context(ctx, &config),
            Err(CoreError::InvalidConfig(_))
        ));
    }
}
