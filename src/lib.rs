// src/lib.rs
//! Stable Fluids
//!
//! A real-time 2D incompressible fluid solver after Stam's Stable Fluids,
//! with interchangeable CPU, `wgpu` compute and `wgpu` fragment-pass backends
//! behind the [`FluidSolver`](simulation::traits::FluidSolver) trait.

pub mod compositor;
pub mod error;
pub mod grid;
pub mod prelude;
pub mod simulation;
pub mod wgpu_utils;

pub use error::{FluidError, Result};
