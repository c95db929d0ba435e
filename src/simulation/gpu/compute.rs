//! Compute-shader backend
//!
//! Fields live in storage buffers of `vec2<f32>` or `f32`, one element per
//! cell. Every stage is one dispatch of 8x8 work groups, so the grid is
//! rounded up to a multiple of eight in both dimensions.

use super::readback::{read_staging, staging_buffer};
use super::{shader_source, FluidUniforms, GpuContext};
use crate::error::{FluidError, Result};
use crate::grid::{GridBuffers, GridSize, VectorField, VelocitySlot};
use crate::simulation::params::{FluidConfig, SimulationParameters, JACOBI_ITERATIONS};
use crate::simulation::stats::SolverStats;
use crate::simulation::traits::FluidSolver;
use crate::wgpu_utils::{
    binding_types, BindGroupBuilder, BindGroupLayoutBuilder, BindGroupLayoutWithDesc,
    UniformBuffer,
};
use cgmath::Vector2;
use log::{debug, info, warn};
use wgpu::{Buffer, ComputePipeline, Device};

/// Work-group edge length; kernels declare `@workgroup_size(8, 8)`
pub const WORKGROUP_SIZE: u32 = 8;

const GRID_WGSL: &str = include_str!("shaders/compute/grid.wgsl");

fn kernel_source(kernel: &str) -> String {
    shader_source(&format!("{GRID_WGSL}\n{kernel}"))
}

fn create_compute_pipeline(
    device: &Device,
    label: &str,
    kernel: &str,
    layout: &BindGroupLayoutWithDesc,
) -> ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(kernel_source(kernel).into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout.layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Layouts and pipelines for every stage
struct Kernels {
    /// uniforms, one input, one output
    unary: BindGroupLayoutWithDesc,
    /// uniforms, two inputs, one output
    binary: BindGroupLayoutWithDesc,
    /// uniforms, one input, two outputs
    split: BindGroupLayoutWithDesc,
    advect: ComputePipeline,
    jacobi_vector: ComputePipeline,
    point_force: ComputePipeline,
    force_field: ComputePipeline,
    projection_setup: ComputePipeline,
    jacobi_scalar: ComputePipeline,
    projection_finish: ComputePipeline,
}

impl Kernels {
    fn new(device: &Device) -> Self {
        let unary = BindGroupLayoutBuilder::new()
            .next_binding_compute(binding_types::uniform())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::storage_buffer_read_write())
            .create(device, "Fluid Unary Layout");
        let binary = BindGroupLayoutBuilder::new()
            .next_binding_compute(binding_types::uniform())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::storage_buffer_read_write())
            .create(device, "Fluid Binary Layout");
        let split = BindGroupLayoutBuilder::new()
            .next_binding_compute(binding_types::uniform())
            .next_binding_compute(binding_types::storage_buffer_read_only())
            .next_binding_compute(binding_types::storage_buffer_read_write())
            .next_binding_compute(binding_types::storage_buffer_read_write())
            .create(device, "Fluid Split Layout");

        let pipeline = |label: &str, source: &str, layout: &BindGroupLayoutWithDesc| {
            create_compute_pipeline(device, label, source, layout)
        };
        Self {
            advect: pipeline(
                "Advect",
                include_str!("shaders/compute/advect.wgsl"),
                &unary,
            ),
            jacobi_vector: pipeline(
                "Jacobi Vector",
                include_str!("shaders/compute/jacobi_vector.wgsl"),
                &binary,
            ),
            point_force: pipeline(
                "Point Force",
                include_str!("shaders/compute/point_force.wgsl"),
                &unary,
            ),
            force_field: pipeline(
                "Force Field",
                include_str!("shaders/compute/force_field.wgsl"),
                &binary,
            ),
            projection_setup: pipeline(
                "Projection Setup",
                include_str!("shaders/compute/projection_setup.wgsl"),
                &split,
            ),
            jacobi_scalar: pipeline(
                "Jacobi Scalar",
                include_str!("shaders/compute/jacobi_scalar.wgsl"),
                &binary,
            ),
            projection_finish: pipeline(
                "Projection Finish",
                include_str!("shaders/compute/projection_finish.wgsl"),
                &binary,
            ),
            unary,
            binary,
            split,
        }
    }
}

/// Records dispatches into one encoder
struct Recorder<'a> {
    device: &'a Device,
    uniforms: &'a Buffer,
    encoder: wgpu::CommandEncoder,
    workgroups: (u32, u32),
}

impl<'a> Recorder<'a> {
    fn new(device: &'a Device, uniforms: &'a Buffer, size: GridSize, label: &str) -> Self {
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        Self {
            device,
            uniforms,
            encoder,
            workgroups: (size.width / WORKGROUP_SIZE, size.height / WORKGROUP_SIZE),
        }
    }

    /// Dispatch `pipeline` with the uniforms followed by `buffers` as bindings
    fn dispatch(
        &mut self,
        label: &str,
        pipeline: &ComputePipeline,
        layout: &BindGroupLayoutWithDesc,
        buffers: &[&Buffer],
    ) {
        let bind_group = buffers
            .iter()
            .fold(BindGroupBuilder::new(layout).buffer(self.uniforms), |builder, buffer| {
                builder.buffer(buffer)
            })
            .create(self.device, label);

        let mut pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(self.workgroups.0, self.workgroups.1, 1);
    }

    fn submit(self, queue: &wgpu::Queue) {
        queue.submit(std::iter::once(self.encoder.finish()));
    }
}

type StorageBuffers = GridBuffers<Buffer, Buffer>;

pub struct ComputeFluidSimulation {
    name: String,
    context: GpuContext,
    size: GridSize,
    vector_bytes: u64,
    buffers: Option<StorageBuffers>,
    force_buffer: Option<Buffer>,
    kernels: Kernels,
    uniforms: FluidUniforms,
    uniform_buffer: UniformBuffer<FluidUniforms>,
    parameters: SimulationParameters,
    pending: SimulationParameters,
    stats: SolverStats,
}

impl ComputeFluidSimulation {
    pub fn new(context: GpuContext, config: &FluidConfig) -> Result<Self> {
        let size = config.grid_size(WORKGROUP_SIZE)?;
        if !context.supports_compute() {
            return Err(FluidError::Unsupported("compute shaders".to_string()));
        }
        let vector_bytes = size.byte_len(8)?;
        let scalar_bytes = size.byte_len(4)?;
        context.check_buffer_limit(&format!("{size} velocity buffer"), vector_bytes)?;

        let storage = |label: &str, bytes: u64| {
            context.guarded(label, |device| storage_buffer(device, label, bytes))
        };
        let buffers = GridBuffers::allocate(
            size,
            |label| storage(label, vector_bytes),
            |label| storage(label, scalar_bytes),
        )?;
        let kernels = context.guarded("fluid compute pipelines", Kernels::new)?;
        let uniforms = FluidUniforms::new(size);
        let uniform_buffer = UniformBuffer::new_with_data(context.device(), &uniforms);
        info!("Allocated compute fluid grid {}", size);

        Ok(Self {
            name: "Compute Stable Fluids".to_string(),
            context,
            size,
            vector_bytes,
            buffers: Some(buffers),
            force_buffer: None,
            kernels,
            uniforms,
            uniform_buffer,
            parameters: config.parameters,
            pending: config.parameters,
            stats: SolverStats::new(),
        })
    }

    /// Storage buffer currently holding the velocity field, for rendering
    pub fn velocity_buffer(&self) -> Result<&Buffer> {
        self.buffers
            .as_ref()
            .map(|buffers| buffers.velocity(VelocitySlot::Current))
            .ok_or(FluidError::Disposed)
    }

    fn live(&self, stage: &str) -> bool {
        if self.buffers.is_none() {
            warn!("{} called on disposed solver '{}'", stage, self.name);
            return false;
        }
        true
    }

    fn upload_uniforms(&mut self) {
        self.uniform_buffer
            .update_content(self.context.queue(), self.uniforms);
    }
}

fn storage_buffer(device: &Device, label: &str, bytes: u64) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

impl FluidSolver for ComputeFluidSimulation {
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
        if !self.live("pre_step") {
            return;
        }
        self.uniforms.set_step(&self.parameters, delta_time);
        self.upload_uniforms();

        let kernels = &self.kernels;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            self.size,
            "Fluid Pre Step",
        );

        recorder.dispatch(
            "Advect",
            &kernels.advect,
            &kernels.unary,
            &[
                buffers.velocity(VelocitySlot::Current),
                buffers.velocity(VelocitySlot::Work),
            ],
        );
        recorder.encoder.copy_buffer_to_buffer(
            buffers.velocity(VelocitySlot::Work),
            0,
            buffers.velocity(VelocitySlot::Current),
            0,
            self.vector_bytes,
        );
        for _ in 0..JACOBI_ITERATIONS {
            recorder.dispatch(
                "Jacobi Vector",
                &kernels.jacobi_vector,
                &kernels.binary,
                &[
                    buffers.velocity(VelocitySlot::Work),
                    buffers.velocity(VelocitySlot::Current),
                    buffers.velocity(VelocitySlot::Spare),
                ],
            );
            buffers.swap_work();
        }
        recorder.submit(self.context.queue());
    }

    fn apply_point_force(&mut self, origin: Vector2<f32>, force: Vector2<f32>, exponent: f32) {
        if !self.live("apply_point_force") {
            return;
        }
        self.uniforms.set_force(origin, force, exponent);
        self.upload_uniforms();

        let kernels = &self.kernels;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            self.size,
            "Fluid Point Force",
        );
        recorder.dispatch(
            "Point Force",
            &kernels.point_force,
            &kernels.unary,
            &[
                buffers.velocity(VelocitySlot::Work),
                buffers.velocity(VelocitySlot::Spare),
            ],
        );
        buffers.swap_work();
        recorder.submit(self.context.queue());
    }

    fn apply_force_field(&mut self, force: &VectorField) -> Result<()> {
        force.check_size(self.size)?;
        if self.buffers.is_none() {
            return Err(FluidError::Disposed);
        }
        if self.force_buffer.is_none() {
            let bytes = self.vector_bytes;
            let buffer = self.context.guarded("force field buffer", |device| {
                storage_buffer(device, "force field", bytes)
            })?;
            self.force_buffer = Some(buffer);
        }

        let kernels = &self.kernels;
        let (Some(buffers), Some(force_buffer)) = (self.buffers.as_mut(), self.force_buffer.as_ref())
        else {
            return Err(FluidError::Disposed);
        };
        self.context
            .queue()
            .write_buffer(force_buffer, 0, bytemuck::cast_slice(force.as_slice()));

        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            self.size,
            "Fluid Force Field",
        );
        recorder.dispatch(
            "Force Field",
            &kernels.force_field,
            &kernels.binary,
            &[
                buffers.velocity(VelocitySlot::Work),
                force_buffer,
                buffers.velocity(VelocitySlot::Spare),
            ],
        );
        buffers.swap_work();
        recorder.submit(self.context.queue());
        Ok(())
    }

    fn post_step(&mut self) {
        if !self.live("post_step") {
            return;
        }
        self.upload_uniforms();

        let kernels = &self.kernels;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            self.size,
            "Fluid Post Step",
        );

        recorder.dispatch(
            "Projection Setup",
            &kernels.projection_setup,
            &kernels.split,
            &[
                buffers.velocity(VelocitySlot::Work),
                buffers.divergence(),
                buffers.pressure_front(),
            ],
        );
        for _ in 0..JACOBI_ITERATIONS {
            recorder.dispatch(
                "Jacobi Scalar",
                &kernels.jacobi_scalar,
                &kernels.binary,
                &[
                    buffers.pressure_front(),
                    buffers.divergence(),
                    buffers.pressure_back(),
                ],
            );
            buffers.swap_pressure();
        }
        recorder.dispatch(
            "Projection Finish",
            &kernels.projection_finish,
            &kernels.binary,
            &[
                buffers.velocity(VelocitySlot::Work),
                buffers.pressure_front(),
                buffers.velocity(VelocitySlot::Spare),
            ],
        );
        buffers.promote_spare();
        recorder.submit(self.context.queue());

        self.stats.record_step(self.uniforms.delta_time);
    }

    fn clear_velocity(&mut self) {
        if !self.live("clear_velocity") {
            return;
        }
        if let Some(buffers) = &self.buffers {
            let mut encoder =
                self.context
                    .device()
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("Fluid Clear"),
                    });
            encoder.clear_buffer(buffers.velocity(VelocitySlot::Current), 0, None);
            self.context.queue().submit(std::iter::once(encoder.finish()));
        }
    }

    fn write_velocity(&mut self, field: &VectorField) -> Result<()> {
        field.check_size(self.size)?;
        let buffers = self.buffers.as_ref().ok_or(FluidError::Disposed)?;
        self.context.queue().write_buffer(
            buffers.velocity(VelocitySlot::Current),
            0,
            bytemuck::cast_slice(field.as_slice()),
        );
        Ok(())
    }

    fn read_velocity(&self) -> Result<VectorField> {
        let source = self.velocity_buffer()?;
        let bytes = self.vector_bytes;
        let device = self.context.device();
        let staging = staging_buffer(device, "Velocity Readback", bytes);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Velocity Readback"),
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, bytes);
        self.context.queue().submit(std::iter::once(encoder.finish()));

        VectorField::from_data(self.size, read_staging(device, &staging)?)
    }

    fn stats(&self) -> &SolverStats {
        &self.stats
    }

    fn dispose(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.release(|buffer| buffer.destroy(), |buffer| buffer.destroy());
            if let Some(force) = self.force_buffer.take() {
                force.destroy();
            }
            debug!("Released compute fluid grid {}", self.size);
        }
    }

    fn is_disposed(&self) -> bool {
        self.buffers.is_none()
    }
}

impl Drop for ComputeFluidSimulation {
    fn drop(&mut self) {
        self.dispose();
    }
}
