// src/simulation/mod.rs
//! Simulation system
//!
//! The solver trait, its parameters, the per-cell kernels and the three
//! backends that run them.

pub mod cpu;
pub mod gpu;
pub mod kernels;
pub mod params;
pub mod stats;
pub mod traits;
