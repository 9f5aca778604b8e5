//! Error types for the gravity core.
//!
//! Construction-time problems (bad grid geometry, missing GPU features,
//! oversized particle sets) and dispatch-time problems (unset inputs,
//! device loss) all surface through [`CoreError`].

use std::fmt;

/// Errors surfaced by orchestrators and kernels.
#[derive(Debug)]
pub enum CoreError {
    /// A required GPU capability is missing (no adapter, compute limits
    /// too small for the requested grid). Raised at construction; fatal.
    UnsupportedPlatform(String),
    /// Inconsistent configuration: grid size not a power of two, level
    /// count incompatible with grid size, degenerate bounds, and so on.
    /// Raised at construction; fatal.
    InvalidConfig(String),
    /// A kernel was dispatched with a required input left unset.
    InvalidState(String),
    /// Particle count exceeds texture capacity, or a radius exceeds its
    /// hard maximum. Raised at construction.
    CapacityExceeded(String),
    /// The GPU device was lost. Every subsequent kernel call returns this
    /// until the orchestrator is disposed.
    DeviceLost,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::UnsupportedPlatform(msg) => {
                write!(f, "Unsupported platform: {}", msg)
            }
            CoreError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            CoreError::InvalidState(msg) => write!(f, "Invalid kernel state: {}", msg),
            CoreError::CapacityExceeded(msg) => write!(f, "Capacity exceeded: {}", msg),
            CoreError::DeviceLost => write!(f, "GPU device lost"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<wgpu::RequestDeviceError> for CoreError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        CoreError::UnsupportedPlatform(format!("failed to create GPU device: {}", e))
    }
}
