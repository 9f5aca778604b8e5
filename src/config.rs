//! Simulation configuration.
//!
//! [`GravityConfig`] carries everything an orchestrator needs: the
//! particle upload, world geometry, integration constants, and the
//! mesh/tree solver knobs. Validation happens once at orchestrator
//! construction and reports [`CoreError::InvalidConfig`] or
//! [`CoreError::CapacityExceeded`].

use glam::Vec3;

use crate::error::CoreError;
use crate::layout::{LevelSet, PackedLayout};

/// Mass-assignment scheme for the particle-mesh deposit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Nearest grid point: all mass to one cell.
    Ngp,
    /// Cloud in cell: trilinear spread over the 2x2x2 cell cube.
    Cic,
}

impl Assignment {
    /// Order of the assignment window, which is also the default
    /// deconvolution order in the Poisson solver.
    pub fn order(&self) -> u32 {
        match self {
            Assignment::Ngp => 1,
            Assignment::Cic => 2,
        }
    }
}

/// Long/short-range force split applied in k-space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// No split; the mesh carries the full force.
    None,
    /// Sharp cutoff: modes with |k| >= k_cut are zeroed.
    Sharp,
    /// Gaussian window exp(-sigma^2 |k|^2 / 2).
    Gaussian,
}

/// Time integration scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegratorKind {
    /// kick(dt) then drift(dt) with this step's forces.
    Euler,
    /// Kick-drift-kick leapfrog; symplectic, owns a force ping-pong.
    Kdk,
}

/// Axis-aligned world box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl WorldBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Cube centered on the origin with the given half-extent.
    pub fn centered(half_extent: f32) -> Self {
        Self {
            min: Vec3::splat(-half_extent),
            max: Vec3::splat(half_extent),
        }
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    fn validate(&self) -> Result<(), CoreError> {
        let s = self.size();
        if !(s.x > 0.0 && s.y > 0.0 && s.z > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "world bounds must have positive extent, got {:?}..{:?}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Initial particle state, laid out as the GPU expects it.
///
/// `positions` is `[x, y, z, mass]` per slot, row-major over a
/// `width x height` slot grid. Slots past `count` are padding and must
/// carry zero mass.
#[derive(Clone, Debug)]
pub struct ParticleData {
    pub positions: Vec<f32>,
    /// `[vx, vy, vz, 0]` per slot; zeros when omitted.
    pub velocities: Option<Vec<f32>>,
    /// Live particle count; defaults to `width * height`.
    pub count: Option<u32>,
    pub width: u32,
    pub height: u32,
}

impl ParticleData {
    /// Pack `(position, mass)` tuples into a slot grid sized
    /// `width >= ceil(sqrt(n))`, square-ish, padding with inert slots.
    pub fn from_particles(particles: &[(Vec3, f32)]) -> Self {
        let n = particles.len() as u32;
        let width = (n as f64).sqrt().ceil().max(1.0) as u32;
        let height = n.div_ceil(width).max(1);
        let mut positions = vec![0.0f32; (width * height * 4) as usize];
        for (i, (p, m)) in particles.iter().enumerate() {
            positions[i * 4] = p.x;
            positions[i * 4 + 1] = p.y;
            positions[i * 4 + 2] = p.z;
            positions[i * 4 + 3] = *m;
        }
        Self {
            positions,
            velocities: None,
            count: Some(n),
            width,
            height,
        }
    }

    pub fn with_velocities(mut self, velocities: &[Vec3]) -> Self {
        let slots = (self.width * self.height) as usize;
        let mut v = vec![0.0f32; slots * 4];
        for (i, vel) in velocities.iter().enumerate().take(slots) {
            v[i * 4] = vel.x;
            v[i * 4 + 1] = vel.y;
            v[i * 4 + 2] = vel.z;
        }
        self.velocities = Some(v);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.width * self.height
    }

    pub fn count(&self) -> u32 {
        self.count.unwrap_or_else(|| self.capacity())
    }

    pub(crate) fn validate(&self) -> Result<(), CoreError> {
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::InvalidConfig(
                "particle slot grid must be non-empty".into(),
            ));
        }
        let count = self.count();
        if count > self.capacity() {
            return Err(CoreError::CapacityExceeded(format!(
                "{} particles exceed {}x{} slots",
                count, self.width, self.height
            )));
        }
        let expect = (self.capacity() * 4) as usize;
        if self.positions.len() != expect {
            return Err(CoreError::InvalidConfig(format!(
                "positions length {} does not match {} slots * 4",
                self.positions.len(),
                self.capacity()
            )));
        }
        if let Some(v) = &self.velocities {
            if v.len() != expect {
                return Err(CoreError::InvalidConfig(format!(
                    "velocities length {} does not match {} slots * 4",
                    v.len(),
                    self.capacity()
                )));
            }
        }
        Ok(())
    }
}

/// Hard maximum for the mesh real-space correction radius, in voxels.
pub const MAX_NEAR_FIELD_RADIUS: u32 = 4;

/// Hard maximum for the tree's level-0 direct window. Beyond two voxels
/// the window outgrows the parent-level acceptance mask and cells could
/// be counted twice.
pub const MAX_TREE_NEAR_RADIUS: u32 = 2;

/// Particle-mesh solver options.
#[derive(Clone, Copy, Debug)]
pub struct MeshConfig {
    pub assignment: Assignment,
    /// Cells per axis; must be a power of two for the FFT.
    pub grid_size: u32,
    pub slices_per_row: u32,
    pub split: SplitMode,
    /// Sharp-split cutoff in wavenumber units.
    pub k_cut: f32,
    /// Gaussian-split width.
    pub split_sigma: f32,
    /// Real-space correction radius in voxels; 0 disables the
    /// correction, otherwise clamped into `[1, MAX_NEAR_FIELD_RADIUS]`.
    pub near_field_radius: u32,
    /// Assignment-filter deconvolution order; `None` follows the
    /// assignment scheme (1 for NGP, 2 for CIC).
    pub deconvolve_order: Option<u32>,
    /// Use the discrete Laplacian eigenvalue for |k|^2 instead of the
    /// continuous wavenumber.
    pub use_discrete: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            assignment: Assignment::Cic,
            grid_size: 64,
            slices_per_row: 8,
            split: SplitMode::None,
            k_cut: 0.0,
            split_sigma: 0.0,
            near_field_radius: 0,
            deconvolve_order: None,
            use_discrete: true,
        }
    }
}

impl MeshConfig {
    pub fn layout(&self) -> Result<PackedLayout, CoreError> {
        PackedLayout::new(self.grid_size, self.slices_per_row)
    }

    pub fn deconvolve_order(&self) -> u32 {
        self.deconvolve_order.unwrap_or_else(|| self.assignment.order())
    }

    fn validate(&self) -> Result<(), CoreError> {
        if !self.grid_size.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "mesh grid size {} is not a power of two",
                self.grid_size
            )));
        }
        self.layout()?;
        if self.near_field_radius > MAX_NEAR_FIELD_RADIUS {
            return Err(CoreError::CapacityExceeded(format!(
                "near-field radius {} exceeds maximum {}",
                self.near_field_radius, MAX_NEAR_FIELD_RADIUS
            )));
        }
        if self.split == SplitMode::Sharp && self.k_cut <= 0.0 {
            return Err(CoreError::InvalidConfig(
                "sharp split requires k_cut > 0".into(),
            ));
        }
        if self.split == SplitMode::Gaussian && self.split_sigma <= 0.0 {
            return Err(CoreError::InvalidConfig(
                "gaussian split requires split_sigma > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Barnes-Hut solver options.
#[derive(Clone, Copy, Debug)]
pub struct TreeConfig {
    /// Pyramid depth; the finest grid has `2^(num_levels - 1)` cells per
    /// axis.
    pub num_levels: u32,
    pub slices_per_row: u32,
    /// Track per-voxel occupancy bits and skip empty cells before any
    /// moment fetch.
    pub use_occupancy_masks: bool,
    /// Carry quadrupole moments through the pyramid and traversal.
    pub quadrupole: bool,
    /// Direct-sum window radius at level 0, in voxels.
    pub near_field_radius: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            num_levels: 7,
            slices_per_row: 8,
            use_occupancy_masks: false,
            quadrupole: false,
            near_field_radius: 1,
        }
    }
}

impl TreeConfig {
    pub fn grid_size(&self) -> u32 {
        1u32 << (self.num_levels.saturating_sub(1))
    }

    pub fn levels(&self) -> Result<LevelSet, CoreError> {
        LevelSet::new(self.num_levels, self.slices_per_row)
    }

    fn validate(&self) -> Result<(), CoreError> {
        self.levels()?;
        if self.near_field_radius == 0 || self.near_field_radius > MAX_TREE_NEAR_RADIUS {
            return Err(CoreError::CapacityExceeded(format!(
                "tree near-field radius {} must lie in [1, {}]",
                self.near_field_radius, MAX_TREE_NEAR_RADIUS
            )));
        }
        Ok(())
    }
}

/// Full orchestrator configuration.
#[derive(Clone, Debug)]
pub struct GravityConfig {
    pub particle_data: ParticleData,
    /// Timestep; defaults to 1/60.
    pub dt: f32,
    pub gravity_strength: f32,
    /// Plummer softening; clamped to at least 1e-6 in force kernels.
    pub softening: f32,
    /// Fraction of velocity removed each step.
    pub damping: f32,
    pub max_speed: f32,
    pub max_accel: f32,
    /// Multipole acceptance parameter for the tree walk.
    pub theta: f32,
    /// Fixed world box; `None` enables the periodic bounds reduction.
    pub world_bounds: Option<WorldBounds>,
    /// Frames between bounds reductions when bounds are automatic.
    pub bounds_refresh_interval: u32,
    pub integrator: IntegratorKind,
    pub mesh: MeshConfig,
    pub tree: TreeConfig,
}

impl GravityConfig {
    pub fn new(particle_data: ParticleData) -> Self {
        Self {
            particle_data,
            dt: 1.0 / 60.0,
            gravity_strength: 1.0,
            softening: 0.01,
            damping: 0.0,
            max_speed: 1.0e30,
            max_accel: 1.0e30,
            theta: 0.5,
            world_bounds: None,
            bounds_refresh_interval: 16,
            integrator: IntegratorKind::Euler,
            mesh: MeshConfig::default(),
            tree: TreeConfig::default(),
        }
    }

    pub(crate) fn validate_common(&self) -> Result<(), CoreError> {
        self.particle_data.validate()?;
        if let Some(b) = &self.world_bounds {
            b.validate()?;
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "dt must be finite and positive, got {}",
                self.dt
            )));
        }
        if self.bounds_refresh_interval == 0 {
            return Err(CoreError::InvalidConfig(
                "bounds_refresh_interval must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(CoreError::InvalidConfig(format!(
                "damping {} must lie in [0, 1]",
                self.damping
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_mesh(&self) -> Result<(), CoreError> {
        self.validate_common()?;
        self.mesh.validate()
    }

    pub(crate) fn validate_tree(&self) -> Result<(), CoreError> {
        self.validate_common()?;
        self.tree.validate()
    }
}
