//! Core solver trait
//!
//! Defines the interface every backend implements. The step is split into the
//! same three phases as the host-facing controllers drive it: advection and
//! diffusion, force injection, then projection.

use super::params::{SimulationParameters, StepInput};
use super::stats::SolverStats;
use crate::error::Result;
use crate::grid::{GridSize, VectorField};
use cgmath::Vector2;

/// A Stable Fluids solver over one fixed-size grid
///
/// Implementations own their buffers exclusively. A step always runs every
/// stage; `&mut self` keeps steps on one instance from overlapping.
pub trait FluidSolver {
    /// Backend name for logs and UI
    fn name(&self) -> &str;

    /// Allocated grid size, after work-group rounding
    fn grid_size(&self) -> GridSize;

    /// Parameters in effect for the current step
    fn parameters(&self) -> &SimulationParameters;

    /// Queue parameters for the next step
    ///
    /// They are latched at the start of the next [`pre_step`](Self::pre_step).
    fn set_parameters(&mut self, parameters: SimulationParameters);

    /// Advect the current field into the work field and diffuse it
    ///
    /// Latches any parameters queued by [`set_parameters`](Self::set_parameters).
    ///
    /// # Arguments
    /// * `delta_time` - Step length in seconds; values at or below zero are clamped
    fn pre_step(&mut self, delta_time: f32);

    /// Add a Gaussian impulse to the work field
    ///
    /// Each cell gains `force * exp(-exponent * d²)`, where `d` is its distance
    /// from `origin`. Always runs, even for a zero vector.
    ///
    /// # Arguments
    /// * `origin` - Impulse centre in grid-normalized coordinates, `(0, 0)` at the grid centre
    /// * `force` - Velocity added at the centre, already scaled by `force_scale`
    /// * `exponent` - Falloff sharpness; larger values give a tighter splat
    fn apply_point_force(&mut self, origin: Vector2<f32>, force: Vector2<f32>, exponent: f32);

    /// Add a per-cell force field to the work field
    fn apply_force_field(&mut self, force: &VectorField) -> Result<()>;

    /// Project the work field onto a divergence-free field, which becomes current
    fn post_step(&mut self);

    /// Zero the current velocity field
    fn clear_velocity(&mut self);

    /// Replace the current velocity field
    fn write_velocity(&mut self, field: &VectorField) -> Result<()>;

    /// Copy the current velocity field to host memory
    fn read_velocity(&self) -> Result<VectorField>;

    /// Step counters
    fn stats(&self) -> &SolverStats;

    /// Release all grid buffers; further calls are no-ops
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;

    /// Run one complete step
    ///
    /// Runs [`pre_step`](Self::pre_step), then
    /// [`apply_point_force`](Self::apply_point_force) with the input's force
    /// scaled by the active `force_scale`, then [`post_step`](Self::post_step).
    ///
    /// # Arguments
    /// * `input` - Time step and pointer force for this frame; an inactive
    ///   input still runs the force stage with a zero vector
    fn step(&mut self, input: &StepInput) {
        self.pre_step(input.delta_time);
        let params = *self.parameters();
        let force = input.effective_force(&params);
        self.apply_point_force(input.force_origin, force, params.force_exponent);
        self.post_step();
    }
}
