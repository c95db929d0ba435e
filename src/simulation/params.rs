//! Simulation parameters and per-step input
//!
//! Parameters follow a builder style:
//!
//! ```
//! use stable_fluids::simulation::params::SimulationParameters;
//!
//! let params = SimulationParameters::default()
//!     .with_viscosity(1e-4)
//!     .with_force_scale(150.0)
//!     .with_force_exponent(400.0);
//! assert_eq!(params.force_exponent, 400.0);
//! ```

use crate::grid::GridSize;
use crate::error::Result;
use cgmath::{InnerSpace, Vector2, Zero};
use rand::Rng;

/// Jacobi sweeps per diffusion and per pressure solve
pub const JACOBI_ITERATIONS: usize = 20;

/// Lower bound applied to viscosity and time step before they divide anything
pub const MIN_COEFFICIENT: f32 = 1e-12;

/// Scale applied to the unit-circle vector of a random push
const RANDOM_PUSH_SCALE: f32 = 0.025;

/// Tunable solver parameters, read at the start of each step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParameters {
    /// Kinematic viscosity; clamped away from zero before use
    pub viscosity: f32,
    /// Multiplier turning a raw pointer impulse into a force vector
    pub force_scale: f32,
    /// Sharpness of the Gaussian force falloff
    pub force_exponent: f32,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            viscosity: 1e-6,
            force_scale: 300.0,
            force_exponent: 200.0,
        }
    }
}

impl SimulationParameters {
    pub fn with_viscosity(mut self, viscosity: f32) -> Self {
        self.viscosity = viscosity;
        self
    }

    pub fn with_force_scale(mut self, force_scale: f32) -> Self {
        self.force_scale = force_scale;
        self
    }

    pub fn with_force_exponent(mut self, force_exponent: f32) -> Self {
        self.force_exponent = force_exponent;
        self
    }

    /// Diffusion coefficients `(alpha, beta)` for one Jacobi solve
    pub fn diffusion_coefficients(&self, dx: f32, delta_time: f32) -> (f32, f32) {
        let alpha = dx * dx / (self.viscosity.max(MIN_COEFFICIENT) * delta_time.max(MIN_COEFFICIENT));
        (alpha, 4.0 + alpha)
    }
}

/// Pressure Poisson coefficients `(alpha, beta)`
pub fn pressure_coefficients(dx: f32) -> (f32, f32) {
    (-dx * dx, 4.0)
}

/// Transient input for one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInput {
    /// Elapsed time in seconds
    pub delta_time: f32,
    /// Force origin in grid-normalized coordinates
    pub force_origin: Vector2<f32>,
    /// Raw impulse, scaled by `force_scale` when applied
    pub force_vector: Vector2<f32>,
    /// Whether a pointer is currently pushing the fluid
    pub active: bool,
}

impl StepInput {
    /// A step without any pointer interaction
    pub fn idle(delta_time: f32) -> Self {
        Self {
            delta_time,
            force_origin: Vector2::zero(),
            force_vector: Vector2::zero(),
            active: false,
        }
    }

    /// A step pushing the fluid with `impulse` at `origin`
    ///
    /// # Arguments
    /// * `delta_time` - Step length in seconds
    /// * `origin` - Push centre in grid-normalized coordinates, `(0, 0)` at the
    ///   grid centre and one unit per grid height
    /// * `impulse` - Unscaled force; the solver multiplies it by `force_scale`
    pub fn with_force(delta_time: f32, origin: Vector2<f32>, impulse: Vector2<f32>) -> Self {
        Self {
            delta_time,
            force_origin: origin,
            force_vector: impulse,
            active: true,
        }
    }

    /// Pointer drag: the pointer's displacement since last frame is the impulse
    pub fn drag(delta_time: f32, origin: Vector2<f32>, previous_origin: Vector2<f32>) -> Self {
        Self::with_force(delta_time, origin, origin - previous_origin)
    }

    /// Random push at `origin`, a vector inside the unit circle
    pub fn random_push(delta_time: f32, origin: Vector2<f32>, rng: &mut impl Rng) -> Self {
        let impulse = loop {
            let candidate = Vector2::new(rng.random_range(-1.0..=1.0), rng.random_range(-1.0..=1.0));
            if candidate.magnitude2() <= 1.0 {
                break candidate;
            }
        };
        Self::with_force(delta_time, origin, impulse * RANDOM_PUSH_SCALE)
    }

    /// Force vector actually injected this step
    pub fn effective_force(&self, params: &SimulationParameters) -> Vector2<f32> {
        if self.active {
            self.force_vector * params.force_scale
        } else {
            Vector2::zero()
        }
    }
}

/// Solver construction settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluidConfig {
    pub width: u32,
    pub height: u32,
    pub parameters: SimulationParameters,
}

impl FluidConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            parameters: SimulationParameters::default(),
        }
    }

    /// Size the grid from a target surface and a simulation scale
    pub fn for_surface(surface_width: u32, surface_height: u32, scale: f32) -> Result<Self> {
        let size = GridSize::from_surface(surface_width, surface_height, scale, 1)?;
        Ok(Self::new(size.width, size.height))
    }

    pub fn with_parameters(mut self, parameters: SimulationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Requested grid rounded up to a backend's work-group granularity
    pub fn grid_size(&self, granularity: u32) -> Result<GridSize> {
        GridSize::aligned(self.width, self.height, granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluidError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_diffusion_coefficients() {
        let params = SimulationParameters::default().with_viscosity(1e-3);
        let dx = 1.0 / 64.0;
        let (alpha, beta) = params.diffusion_coefficients(dx, 1.0 / 60.0);
        let expected = dx * dx / (1e-3 * (1.0 / 60.0));
        assert!((alpha - expected).abs() / expected < 1e-5);
        assert_eq!(beta, 4.0 + alpha);
    }

    #[test]
    fn test_zero_viscosity_and_time_are_clamped() {
        let params = SimulationParameters::default().with_viscosity(0.0);
        let (alpha, beta) = params.diffusion_coefficients(1.0 / 64.0, 0.0);
        assert!(alpha.is_finite());
        assert!(beta.is_finite());
        assert!(alpha > 0.0);
    }

    #[test]
    fn test_pressure_coefficients() {
        let (alpha, beta) = pressure_coefficients(0.5);
        assert_eq!(alpha, -0.25);
        assert_eq!(beta, 4.0);
    }

    #[test]
    fn test_inactive_input_injects_nothing() {
        let params = SimulationParameters::default();
        let mut input = StepInput::with_force(0.016, Vector2::new(0.1, 0.0), Vector2::new(1.0, 2.0));
        assert_eq!(input.effective_force(&params), Vector2::new(300.0, 600.0));
        input.active = false;
        assert_eq!(input.effective_force(&params), Vector2::zero());
    }

    #[test]
    fn test_drag_uses_pointer_displacement() {
        let input = StepInput::drag(0.016, Vector2::new(0.25, 0.5), Vector2::new(0.2, 0.5));
        assert!(input.active);
        assert!((input.force_vector.x - 0.05).abs() < 1e-6);
        assert_eq!(input.force_vector.y, 0.0);
    }

    #[test]
    fn test_random_push_stays_in_scaled_circle() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let input = StepInput::random_push(0.016, Vector2::zero(), &mut rng);
            assert!(input.force_vector.magnitude() <= RANDOM_PUSH_SCALE + 1e-6);
        }
    }

    #[test]
    fn test_config_for_surface() {
        let config = FluidConfig::for_surface(1920, 1080, 0.5).unwrap();
        assert_eq!((config.width, config.height), (960, 540));
        let aligned = config.grid_size(8).unwrap();
        assert_eq!((aligned.width, aligned.height), (960, 544));
    }

    #[test]
    fn test_oversized_config_is_rejected() {
        let config = FluidConfig::new(u32::MAX, 64);
        assert!(matches!(config.grid_size(8), Err(FluidError::Allocation { .. })));
        assert!(config.grid_size(1).is_ok());
    }
}
