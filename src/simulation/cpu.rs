//! CPU solver backend
//!
//! Runs every stage on host [`Field`](crate::grid::Field)s, parallelised over
//! rows with rayon for larger grids. Its results are the reference the GPU
//! backends are compared against.

use super::kernels;
use super::params::{pressure_coefficients, FluidConfig, SimulationParameters, JACOBI_ITERATIONS};
use super::stats::SolverStats;
use super::traits::FluidSolver;
use crate::error::{FluidError, Result};
use crate::grid::{Field, GridBuffers, GridSize, ScalarField, VectorField, VelocitySlot};
use cgmath::Vector2;
use log::{debug, info, trace, warn};

type HostBuffers = GridBuffers<VectorField, ScalarField>;

pub struct CpuFluidSimulation {
    name: String,
    size: GridSize,
    buffers: Option<HostBuffers>,
    parameters: SimulationParameters,
    pending: SimulationParameters,
    delta_time: f32,
    stats: SolverStats,
}

impl CpuFluidSimulation {
    pub fn new(config: &FluidConfig) -> Result<Self> {
        let size = config.grid_size(1)?;
        let buffers = GridBuffers::allocate(size, |_| Field::zeros(size), |_| Field::zeros(size))?;
        info!("Allocated CPU fluid grid {}", size);

        Ok(Self {
            name: "CPU Stable Fluids".to_string(),
            size,
            buffers: Some(buffers),
            parameters: config.parameters,
            pending: config.parameters,
            delta_time: 0.0,
            stats: SolverStats::new(),
        })
    }

    /// Borrow the current velocity field without copying it
    pub fn velocity_field(&self) -> Result<&VectorField> {
        self.live().map(|buffers| buffers.velocity(VelocitySlot::Current))
    }

    fn live(&self) -> Result<&HostBuffers> {
        self.buffers.as_ref().ok_or(FluidError::Disposed)
    }

    fn live_mut(&mut self, stage: &str) -> Option<&mut HostBuffers> {
        if self.buffers.is_none() {
            warn!("{} called on disposed solver '{}'", stage, self.name);
        }
        self.buffers.as_mut()
    }
}

impl FluidSolver for CpuFluidSimulation {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid_size(&self) -> GridSize {
        self.size
    }

    fn parameters(&self) -> &SimulationParameters {
        &self.parameters
    }

    fn set_parameters(&mut self, parameters: SimulationParameters) {
        self.pending = parameters;
    }

    fn pre_step(&mut self, delta_time: f32) {
        self.parameters = self.pending;
        self.delta_time = delta_time;
        let dx = self.size.dx();
        let (alpha, beta) = self.parameters.diffusion_coefficients(dx, delta_time);
        let Some(buffers) = self.live_mut("pre_step") else {
            return;
        };

        buffers.write_velocity(VelocitySlot::Work, |grid, out| {
            kernels::advect(grid.velocity(VelocitySlot::Current), delta_time, dx, out)
        });

        // The advected field is the right-hand side of every diffusion sweep
        buffers.write_velocity(VelocitySlot::Current, |grid, out| {
            out.copy_from(grid.velocity(VelocitySlot::Work))
        });

        for _ in 0..JACOBI_ITERATIONS {
            buffers.write_velocity(VelocitySlot::Spare, |grid, out| {
                kernels::jacobi_vector(
                    grid.velocity(VelocitySlot::Work),
                    grid.velocity(VelocitySlot::Current),
                    alpha,
                    beta,
                    out,
                )
            });
            buffers.swap_work();
        }
        trace!("Advected and diffused with alpha {alpha}, beta {beta}");
    }

    fn apply_point_force(&mut self, origin: Vector2<f32>, force: Vector2<f32>, exponent: f32) {
        let Some(buffers) = self.live_mut("apply_point_force") else {
            return;
        };
        buffers.write_velocity(VelocitySlot::Spare, |grid, out| {
            kernels::apply_point_force(grid.velocity(VelocitySlot::Work), origin, force, exponent, out)
        });
        buffers.swap_work();
    }

    fn apply_force_field(&mut self, force: &VectorField) -> Result<()> {
        force.check_size(self.size)?;
        let buffers = self.buffers.as_mut().ok_or(FluidError::Disposed)?;
        buffers.write_velocity(VelocitySlot::Spare, |grid, out| {
            kernels::apply_force_field(grid.velocity(VelocitySlot::Work), force, out)
        });
        buffers.swap_work();
        Ok(())
    }

    fn post_step(&mut self) {
        let dx = self.size.dx();
        let (alpha, beta) = pressure_coefficients(dx);
        let Some(buffers) = self.live_mut("post_step") else {
            return;
        };

        buffers.write_divergence_and_pressure(|grid, divergence, pressure| {
            kernels::projection_setup(grid.velocity(VelocitySlot::Work), dx, divergence, pressure)
        });

        for _ in 0..JACOBI_ITERATIONS {
            buffers.write_pressure_back(|grid, out| {
                kernels::jacobi_scalar(grid.pressure_front(), grid.divergence(), alpha, beta, out)
            });
            buffers.swap_pressure();
        }

        buffers.write_velocity(VelocitySlot::Spare, |grid, out| {
            kernels::projection_finish(
                grid.velocity(VelocitySlot::Work),
                grid.pressure_front(),
                dx,
                out,
            )
        });
        buffers.promote_spare();

        self.stats.record_step(self.delta_time);
    }

    fn clear_velocity(&mut self) {
        if let Some(buffers) = self.live_mut("clear_velocity") {
            buffers.velocity_mut(VelocitySlot::Current).fill([0.0; 2]);
        }
    }

    fn write_velocity(&mut self, field: &VectorField) -> Result<()> {
        field.check_size(self.size)?;
        let buffers = self.buffers.as_mut().ok_or(FluidError::Disposed)?;
        buffers.velocity_mut(VelocitySlot::Current).copy_from(field);
        Ok(())
    }

    fn read_velocity(&self) -> Result<VectorField> {
        self.velocity_field().cloned()
    }

    fn stats(&self) -> &SolverStats {
        &self.stats
    }

    fn dispose(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.release(drop, drop);
            debug!("Released CPU fluid grid {}", self.size);
        }
    }

    fn is_disposed(&self) -> bool {
        self.buffers.is_none()
    }
}

impl Drop for CpuFluidSimulation {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::params::StepInput;
    use cgmath::InnerSpace;

    const DT: f32 = 1.0 / 60.0;

    fn solver(width: u32, height: u32) -> CpuFluidSimulation {
        CpuFluidSimulation::new(&FluidConfig::new(width, height)).unwrap()
    }

    #[test]
    fn test_zero_field_stays_zero() {
        let mut sim = solver(16, 12);
        for _ in 0..10 {
            sim.step(&StepInput::idle(DT));
        }
        let velocity = sim.read_velocity().unwrap();
        assert!(velocity.as_slice().iter().all(|v| *v == [0.0, 0.0]));
        assert_eq!(sim.stats().step_count, 10);
    }

    #[test]
    fn test_uniform_field_is_preserved() {
        let mut sim = solver(16, 16);
        let uniform = Field::from_fn(sim.grid_size(), |_, _| [0.3, -0.2]).unwrap();
        sim.write_velocity(&uniform).unwrap();
        sim.step(&StepInput::idle(DT));

        let velocity = sim.read_velocity().unwrap();
        for v in velocity.as_slice() {
            assert!((v[0] - 0.3).abs() < 1e-5);
            assert!((v[1] + 0.2).abs() < 1e-5);
        }
    }

    #[test]
    fn test_extreme_velocity_stays_finite() {
        let mut sim = solver(8, 8);
        let extreme = Field::from_fn(sim.grid_size(), |_, _| [-1.0e20, 0.0]).unwrap();
        sim.write_velocity(&extreme).unwrap();
        sim.step(&StepInput::idle(DT));
        sim.step(&StepInput::with_force(DT, Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0)));

        let velocity = sim.read_velocity().unwrap();
        assert!(velocity
            .as_slice()
            .iter()
            .all(|v| v[0].is_finite() && v[1].is_finite()));
        assert_eq!(sim.stats().step_count, 2);
    }

    #[test]
    fn test_point_force_scenario() {
        let params = SimulationParameters::default().with_force_scale(1.0);
        let config = FluidConfig::new(64, 64).with_parameters(params);
        let mut sim = CpuFluidSimulation::new(&config).unwrap();
        let dx = sim.grid_size().dx();

        sim.pre_step(DT);
        sim.apply_point_force(Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0), 200.0);
        let forced = sim
            .buffers
            .as_ref()
            .unwrap()
            .velocity(VelocitySlot::Work)
            .clone();
        sim.post_step();

        let velocity = sim.read_velocity().unwrap();
        let centre = velocity.vector(32, 32);
        let far = velocity.vector(32, 56);
        assert!(centre.x > 0.0);
        assert!(centre.x > far.magnitude());
        assert!(kernels::divergence_norm(&velocity, dx) < kernels::divergence_norm(&forced, dx));
    }

    #[test]
    fn test_vortex_energy_decays() {
        let params = SimulationParameters::default().with_viscosity(0.1);
        let config = FluidConfig::new(32, 32).with_parameters(params);
        let mut sim = CpuFluidSimulation::new(&config).unwrap();

        // Gaussian stream function centred on the grid
        let sigma2 = 36.0f32;
        let vortex = Field::from_fn(sim.grid_size(), |x, y| {
            let dx = x as f32 - 15.5;
            let dy = y as f32 - 15.5;
            let psi = (-(dx * dx + dy * dy) / sigma2).exp();
            [0.2 * dy * psi / 3.0, -0.2 * dx * psi / 3.0]
        })
        .unwrap();
        sim.write_velocity(&vortex).unwrap();

        let e0 = kernels::kinetic_energy(&sim.read_velocity().unwrap());
        sim.step(&StepInput::idle(DT));
        let e1 = kernels::kinetic_energy(&sim.read_velocity().unwrap());
        sim.step(&StepInput::idle(DT));
        let e2 = kernels::kinetic_energy(&sim.read_velocity().unwrap());

        assert!(e0 > 0.0);
        assert!(e1 < e0);
        assert!(e2 < e1);
    }

    #[test]
    fn test_parameters_latch_at_pre_step() {
        let mut sim = solver(8, 8);
        let updated = SimulationParameters::default().with_viscosity(0.5);
        sim.set_parameters(updated);
        assert_eq!(sim.parameters().viscosity, 1e-6);
        sim.pre_step(DT);
        assert_eq!(*sim.parameters(), updated);
    }

    #[test]
    fn test_current_buffer_rotates_every_step() {
        let mut sim = solver(8, 8);
        let current = |sim: &CpuFluidSimulation| {
            sim.buffers.as_ref().unwrap().velocity_index(VelocitySlot::Current)
        };
        let mut seen = vec![current(&sim)];
        for _ in 0..3 {
            sim.step(&StepInput::idle(DT));
            let index = current(&sim);
            assert_ne!(Some(&index), seen.last());
            seen.push(index);
        }
        assert_eq!(seen, [0, 1, 2, 0]);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut sim = solver(8, 8);
        sim.step(&StepInput::idle(DT));
        sim.dispose();
        sim.dispose();
        assert!(sim.is_disposed());
        assert!(matches!(sim.read_velocity(), Err(FluidError::Disposed)));

        sim.step(&StepInput::idle(DT));
        sim.clear_velocity();
        assert_eq!(sim.stats().step_count, 1);
    }

    #[test]
    fn test_zero_sized_grid_is_rejected() {
        let result = CpuFluidSimulation::new(&FluidConfig::new(0, 16));
        assert!(matches!(result, Err(FluidError::InvalidGridSize { .. })));
    }

    #[test]
    fn test_write_velocity_checks_size() {
        let mut sim = solver(8, 8);
        let wrong = Field::zeros(GridSize::new(4, 4).unwrap()).unwrap();
        assert!(matches!(
            sim.write_velocity(&wrong),
            Err(FluidError::FieldSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_clear_velocity() {
        let mut sim = solver(8, 8);
        let field = Field::from_fn(sim.grid_size(), |x, _| [x as f32, 1.0]).unwrap();
        sim.write_velocity(&field).unwrap();
        sim.clear_velocity();
        let velocity = sim.read_velocity().unwrap();
        assert!(velocity.as_slice().iter().all(|v| *v == [0.0, 0.0]));
    }
}
