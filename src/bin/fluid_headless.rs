//! Headless fluid runner
//!
//! Pushes the fluid from the grid centre on the chosen backend and logs
//! kinetic energy and divergence after every step.
//!
//! ```text
//! fluid-headless [cpu|compute|pixel] [steps] [size]
//! ```

use anyhow::{bail, Context};
use log::info;
use stable_fluids::prelude::*;
use stable_fluids::simulation::kernels::{divergence_norm, kinetic_energy};

const DELTA_TIME: f32 = 1.0 / 60.0;

fn create_solver(backend: &str, config: &FluidConfig) -> anyhow::Result<Box<dyn FluidSolver>> {
    let solver: Box<dyn FluidSolver> = match backend {
        "cpu" => Box::new(CpuFluidSimulation::new(config)?),
        "compute" => Box::new(ComputeFluidSimulation::new(GpuContext::new()?, config)?),
        "pixel" => Box::new(PixelFluidSimulation::new(GpuContext::new()?, config)?),
        other => bail!("unknown backend '{other}', expected cpu, compute or pixel"),
    };
    Ok(solver)
}

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match args.get(index) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid argument '{value}'")),
        None => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let backend = args.get(1).map(String::as_str).unwrap_or("cpu");
    let steps: u32 = parse_arg(&args, 2, 120)?;
    let size: u32 = parse_arg(&args, 3, 64)?;

    let parameters = SimulationParameters::default().with_force_scale(1.0);
    let config = FluidConfig::new(size, size).with_parameters(parameters);
    let mut solver = create_solver(backend, &config)
        .with_context(|| format!("failed to create {backend} solver"))?;
    let grid = solver.grid_size();
    info!("Running {} on a {} grid for {} steps", solver.name(), grid, steps);

    let mut dye = DyeField::new(grid.width * 2, grid.height * 2)?;
    let origin = Vector2::new(0.0, 0.0);

    for step in 0..steps {
        let input = StepInput::with_force(DELTA_TIME, origin, Vector2::new(1.0, 0.0));
        solver.step(&input);

        let velocity = solver.read_velocity()?;
        dye.inject(origin, cycling_dye(step as f32 * DELTA_TIME), parameters.force_exponent);
        dye.advect(&velocity, DELTA_TIME);

        info!(
            "step {:4}: energy {:.6e}, divergence {:.6e}",
            step,
            kinetic_energy(&velocity),
            divergence_norm(&velocity, grid.dx())
        );
    }

    let stats = solver.stats();
    info!(
        "Finished {} steps, {:.1} steps per simulated second",
        stats.step_count,
        stats.frequency()
    );
    solver.dispose();
    Ok(())
}
