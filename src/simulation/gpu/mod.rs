//! GPU solver backends
//!
//! Two `wgpu` renditions of the same step: [`ComputeFluidSimulation`] runs each
//! stage as a compute dispatch over storage buffers, [`PixelFluidSimulation`]
//! as a fullscreen fragment pass over float textures. Both share the device
//! handle, the uniform block and the allocation guard defined here.

pub mod compute;
pub mod pixel;
mod readback;

pub use compute::ComputeFluidSimulation;
pub use pixel::PixelFluidSimulation;

use super::params::{pressure_coefficients, SimulationParameters};
use crate::error::{FluidError, Result};
use crate::grid::GridSize;
use cgmath::Vector2;
use log::info;
use std::sync::Arc;
use wgpu::{Device, Queue};

/// WGSL shared by every kernel: the uniform block and edge clamping
const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");

/// Prefix a kernel body with the shared WGSL header
fn shader_source(kernel: &str) -> String {
    format!("{COMMON_WGSL}\n{kernel}")
}

/// Device and queue shared by GPU solvers
#[derive(Clone)]
pub struct GpuContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    downlevel: wgpu::DownlevelCapabilities,
}

impl GpuContext {
    /// Open a headless device on the default high-performance adapter
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;
        info!("Using GPU adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Fluid Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            downlevel: adapter.get_downlevel_capabilities(),
        })
    }

    /// Wrap a device the host application already owns
    pub fn from_parts(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            device,
            queue,
            downlevel: wgpu::DownlevelCapabilities::default(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn supports_compute(&self) -> bool {
        self.downlevel
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
    }

    /// Run `create` inside out-of-memory and validation error scopes
    ///
    /// `wgpu` reports creation failures asynchronously; popping the scopes
    /// turns them into an [`FluidError::Allocation`] for `what`.
    pub(crate) fn guarded<T>(&self, what: &str, create: impl FnOnce(&Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        match out_of_memory.or(validation) {
            Some(error) => Err(FluidError::allocation(what, error)),
            None => Ok(value),
        }
    }

    /// Reject grids whose largest field exceeds a device limit
    pub(crate) fn check_buffer_limit(&self, what: &str, bytes: u64) -> Result<()> {
        let limits = self.device.limits();
        let max = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        if bytes > max {
            return Err(FluidError::allocation(
                what,
                format!("{bytes} bytes exceeds the device limit of {max}"),
            ));
        }
        Ok(())
    }

    pub(crate) fn check_texture_limit(&self, size: GridSize) -> Result<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        if size.width > max || size.height > max {
            return Err(FluidError::allocation(
                format!("{size} texture"),
                format!("dimension exceeds the device limit of {max}"),
            ));
        }
        Ok(())
    }
}

/// Uniform block read by every kernel
///
/// Matches `FluidUniforms` in `shaders/common.wgsl`; 64 bytes with explicit
/// padding.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FluidUniforms {
    pub size: [u32; 2],
    pub dx: f32,
    pub delta_time: f32,
    pub diffusion_alpha: f32,
    pub diffusion_beta: f32,
    pub pressure_alpha: f32,
    pub pressure_beta: f32,
    pub force_origin: [f32; 2],
    pub force_vector: [f32; 2],
    pub force_exponent: f32,
    pub _padding: [f32; 3],
}

impl FluidUniforms {
    pub fn new(size: GridSize) -> Self {
        let dx = size.dx();
        let (pressure_alpha, pressure_beta) = pressure_coefficients(dx);
        Self {
            size: [size.width, size.height],
            dx,
            delta_time: 0.0,
            diffusion_alpha: 0.0,
            diffusion_beta: 4.0,
            pressure_alpha,
            pressure_beta,
            force_origin: [0.0; 2],
            force_vector: [0.0; 2],
            force_exponent: 0.0,
            _padding: [0.0; 3],
        }
    }

    /// Time step and diffusion coefficients for the advection phase
    pub fn set_step(&mut self, parameters: &SimulationParameters, delta_time: f32) {
        let (alpha, beta) = parameters.diffusion_coefficients(self.dx, delta_time);
        self.delta_time = delta_time;
        self.diffusion_alpha = alpha;
        self.diffusion_beta = beta;
    }

    pub fn set_force(&mut self, origin: Vector2<f32>, force: Vector2<f32>, exponent: f32) {
        self.force_origin = origin.into();
        self.force_vector = force.into();
        self.force_exponent = exponent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<FluidUniforms>(), 64);
        assert_eq!(std::mem::offset_of!(FluidUniforms, force_origin), 32);
        assert_eq!(std::mem::offset_of!(FluidUniforms, force_exponent), 48);
    }

    #[test]
    fn test_uniform_coefficients() {
        let size = GridSize::new(64, 32).unwrap();
        let mut uniforms = FluidUniforms::new(size);
        assert_eq!(uniforms.dx, 1.0 / 32.0);
        assert_eq!(uniforms.pressure_alpha, -(1.0 / 32.0) * (1.0 / 32.0));
        assert_eq!(uniforms.pressure_beta, 4.0);

        let params = SimulationParameters::default().with_viscosity(1e-3);
        uniforms.set_step(&params, 0.02);
        let (alpha, beta) = params.diffusion_coefficients(1.0 / 32.0, 0.02);
        assert_eq!(uniforms.diffusion_alpha, alpha);
        assert_eq!(uniforms.diffusion_beta, beta);
    }

    #[test]
    fn test_shader_source_has_header() {
        let source = shader_source("fn main() {}");
        assert!(source.starts_with(COMMON_WGSL));
        assert!(source.contains("struct FluidUniforms"));
        assert!(source.ends_with("fn main() {}"));
    }

    /// Open a device for GPU tests
    ///
    /// GPU tests are `#[ignore]`d by default; run them with
    /// `cargo test -- --ignored` on a machine with an adapter.
    pub(crate) fn test_context() -> GpuContext {
        let _ = env_logger::builder().is_test(true).try_init();
        GpuContext::new().expect("GPU tests need a graphics adapter")
    }
}
