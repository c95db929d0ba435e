//! # Stable Fluids Prelude
//!
//! Commonly used types in one import:
//!
//! ```rust
//! use stable_fluids::prelude::*;
//!
//! fn main() -> Result<(), FluidError> {
//!     let mut solver = CpuFluidSimulation::new(&FluidConfig::new(64, 64))?;
//!     solver.step(&StepInput::with_force(
//!         1.0 / 60.0,
//!         Vector2::new(0.0, 0.0),
//!         Vector2::new(0.01, 0.0),
//!     ));
//!     let velocity = solver.read_velocity()?;
//!     assert_eq!(velocity.size(), solver.grid_size());
//!     Ok(())
//! }
//! ```

pub use crate::compositor::{cycling_dye, DyeField, Rgba};
pub use crate::error::FluidError;
pub use crate::grid::{Field, GridSize, ScalarField, VectorField};
pub use crate::simulation::cpu::CpuFluidSimulation;
pub use crate::simulation::gpu::{
    ComputeFluidSimulation, FluidUniforms, GpuContext, PixelFluidSimulation,
};
pub use crate::simulation::params::{FluidConfig, SimulationParameters, StepInput};
pub use crate::simulation::stats::SolverStats;
pub use crate::simulation::traits::FluidSolver;

pub use cgmath::Vector2;
