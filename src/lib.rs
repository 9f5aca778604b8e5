//! # ngrav - GPU N-body gravity
//!
//! GPU-resident gravitational N-body simulation with two interchangeable
//! solvers, built entirely on wgpu compute:
//!
//! - **Particle-mesh** ([`GravityMesh`]): deposit mass onto a regular
//!   grid, solve Poisson's equation in Fourier space (Stockham FFT),
//!   take the spectral gradient, sample the force field at particles,
//!   and optionally add a short-range real-space correction.
//! - **Barnes-Hut tree** ([`GravityTree`]): aggregate particles into the
//!   finest level of a regular octree, reduce a pyramid of monopole (and
//!   optionally quadrupole) moments, then walk the pyramid per particle
//!   under a multipole acceptance criterion.
//!
//! Both orchestrators own their particle ping-pong state and advance one
//! frame per [`GravityMesh::step`] / [`GravityTree::step`]. Rendering,
//! seeding, and UI are the host application's business; the position and
//! velocity buffers are exposed for exactly that.
//!
//! ## Quick start
//!
//! ```ignore
//! use ngrav::prelude::*;
//!
//! let data = ParticleData::from_particles(&[
//!     (Vec3::new(-1.0, 0.0, 0.0), 1.0),
//!     (Vec3::new(1.0, 0.0, 0.0), 1.0),
//! ]);
//! let mut config = GravityConfig::new(data);
//! config.gravity_strength = 1e-3;
//! config.softening = 0.1;
//! config.world_bounds = Some(WorldBounds::centered(2.0));
//!
//! let mut sim = GravityTree::new(&config)?;
//! for _ in 0..100 {
//!     sim.step()?;
//! }
//! # Ok::<(), ngrav::CoreError>(())
//! ```
//!
//! ## Layout
//!
//! Every 3D grid in the crate - mass grids, spectra, octree levels -
//! lives in a 2D texel address space through one shared convention,
//! [`PackedLayout`]. All simulation state stays on the GPU; the only
//! readbacks are the explicit `read_*` snapshots and the optional
//! numeric validation pass.

mod config;
mod error;
mod gpu;
mod layout;
mod mesh;
mod tree;

pub use config::{
    Assignment, GravityConfig, IntegratorKind, MeshConfig, ParticleData, SplitMode, TreeConfig,
    WorldBounds, MAX_NEAR_FIELD_RADIUS, MAX_TREE_NEAR_RADIUS,
};
pub use error::CoreError;
pub use glam::{Vec2, Vec3, Vec4};
pub use gpu::{GpuContext, GridBuffer};
pub use layout::{LevelSet, PackedLayout, MAX_LEVELS};
pub use mesh::GravityMesh;
pub use tree::GravityTree;

pub use bytemuck;

#[doc(hidden)]
pub use gpu::shaders as shader_sources;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::config::{
        Assignment, GravityConfig, IntegratorKind, MeshConfig, ParticleData, SplitMode,
        TreeConfig, WorldBounds,
    };
    pub use crate::error::CoreError;
    pub use crate::gpu::GpuContext;
    pub use crate::layout::PackedLayout;
    pub use crate::mesh::GravityMesh;
    pub use crate::tree::GravityTree;
    pub use crate::{Vec2, Vec3, Vec4};
}
