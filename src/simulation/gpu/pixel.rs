//! Fragment-pass backend
//!
//! Fields live in `Rg32Float` and `R32Float` textures. Every stage draws one
//! fullscreen triangle into the output texture, reading its inputs with
//! `textureLoad`, so any grid size works without rounding.

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
use wgpu::{Device, RenderPipeline, TextureFormat};

pub const VELOCITY_FORMAT: TextureFormat = TextureFormat::Rg32Float;
pub const SCALAR_FORMAT: TextureFormat = TextureFormat::R32Float;

const FULLSCREEN_WGSL: &str = include_str!("shaders/pixel/fullscreen.wgsl");

/// A grid-sized texture and its default view
pub struct GridTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl GridTexture {
    fn new(device: &Device, label: &str, size: GridSize, format: TextureFormat) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

fn extent(size: GridSize) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn create_render_pipeline(
    device: &Device,
    label: &str,
    kernel: &str,
    layout: &BindGroupLayoutWithDesc,
    format: TextureFormat,
) -> RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(shader_source(&format!("{FULLSCREEN_WGSL}\n{kernel}")).into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout.layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        multiview: None,
        cache: None,
    })
}

struct Passes {
    /// uniforms and one input texture
    unary: BindGroupLayoutWithDesc,
    /// uniforms and two input textures
    binary: BindGroupLayoutWithDesc,
    advect: RenderPipeline,
    jacobi_vector: RenderPipeline,
    point_force: RenderPipeline,
    force_field: RenderPipeline,
    divergence: RenderPipeline,
    jacobi_scalar: RenderPipeline,
    projection_finish: RenderPipeline,
}

impl Passes {
    fn new(device: &Device) -> Self {
        let unary = BindGroupLayoutBuilder::new()
            .next_binding_fragment(binding_types::uniform())
            .next_binding_fragment(binding_types::texture_2d_unfilterable())
            .create(device, "Fluid Pixel Unary Layout");
        let binary = BindGroupLayoutBuilder::new()
            .next_binding_fragment(binding_types::uniform())
            .next_binding_fragment(binding_types::texture_2d_unfilterable())
            .next_binding_fragment(binding_types::texture_2d_unfilterable())
            .create(device, "Fluid Pixel Binary Layout");

        let pipeline = |label: &str,
                        source: &str,
                        layout: &BindGroupLayoutWithDesc,
                        format: TextureFormat| {
            create_render_pipeline(device, label, source, layout, format)
        };
        Self {
            advect: pipeline(
                "Pixel Advect",
                include_str!("shaders/pixel/advect.wgsl"),
                &unary,
                VELOCITY_FORMAT,
            ),
            jacobi_vector: pipeline(
                "Pixel Jacobi Vector",
                include_str!("shaders/pixel/jacobi_vector.wgsl"),
                &binary,
                VELOCITY_FORMAT,
            ),
            point_force: pipeline(
                "Pixel Point Force",
                include_str!("shaders/pixel/point_force.wgsl"),
                &unary,
                VELOCITY_FORMAT,
            ),
            force_field: pipeline(
                "Pixel Force Field",
                include_str!("shaders/pixel/force_field.wgsl"),
                &binary,
                VELOCITY_FORMAT,
            ),
            divergence: pipeline(
                "Pixel Divergence",
                include_str!("shaders/pixel/divergence.wgsl"),
                &unary,
                SCALAR_FORMAT,
            ),
            jacobi_scalar: pipeline(
                "Pixel Jacobi Scalar",
                include_str!("shaders/pixel/jacobi_scalar.wgsl"),
                &binary,
                SCALAR_FORMAT,
            ),
            projection_finish: pipeline(
                "Pixel Projection Finish",
                include_str!("shaders/pixel/projection_finish.wgsl"),
                &binary,
                VELOCITY_FORMAT,
            ),
            unary,
            binary,
        }
    }
}

/// Records fullscreen passes into one encoder
struct Recorder<'a> {
    device: &'a Device,
    uniforms: &'a wgpu::Buffer,
    encoder: wgpu::CommandEncoder,
}

impl<'a> Recorder<'a> {
    fn new(device: &'a Device, uniforms: &'a wgpu::Buffer, label: &str) -> Self {
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        Self {
            device,
            uniforms,
            encoder,
        }
    }

    fn begin<'p>(
        encoder: &'p mut wgpu::CommandEncoder,
        label: &str,
        target: &'p wgpu::TextureView,
    ) -> wgpu::RenderPass<'p> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }

    /// Draw `pipeline` into `target` with the uniforms followed by `inputs` bound
    fn draw(
        &mut self,
        label: &str,
        pipeline: &RenderPipeline,
        layout: &BindGroupLayoutWithDesc,
        inputs: &[&GridTexture],
        target: &GridTexture,
    ) {
        let bind_group = inputs
            .iter()
            .fold(BindGroupBuilder::new(layout).buffer(self.uniforms), |builder, input| {
                builder.texture(&input.view)
            })
            .create(self.device, label);

        let mut pass = Self::begin(&mut self.encoder, label, &target.view);
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    /// Zero `target` with an empty pass
    fn clear(&mut self, label: &str, target: &GridTexture) {
        Self::begin(&mut self.encoder, label, &target.view);
    }

    fn submit(self, queue: &wgpu::Queue) {
        queue.submit(std::iter::once(self.encoder.finish()));
    }
}

type TextureBuffers = GridBuffers<GridTexture, GridTexture>;

pub struct PixelFluidSimulation {
    name: String,
    context: GpuContext,
    size: GridSize,
    /// Tight and copy-aligned byte widths of one velocity row
    row_bytes: u32,
    padded_row_bytes: u32,
    buffers: Option<TextureBuffers>,
    force_texture: Option<GridTexture>,
    passes: Passes,
    uniforms: FluidUniforms,
    uniform_buffer: UniformBuffer<FluidUniforms>,
    parameters: SimulationParameters,
    pending: SimulationParameters,
    stats: SolverStats,
}

impl PixelFluidSimulation {
    pub fn new(context: GpuContext, config: &FluidConfig) -> Result<Self> {
        let size = config.grid_size(1)?;
        context.check_texture_limit(size)?;
        let row_bytes = size.padded_row_bytes(8, 1)?;
        let padded_row_bytes = size.padded_row_bytes(8, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)?;

        let texture = |label: &str, format| {
            context.guarded(label, |device| GridTexture::new(device, label, size, format))
        };
        let buffers = GridBuffers::allocate(
            size,
            |label| texture(label, VELOCITY_FORMAT),
            |label| texture(label, SCALAR_FORMAT),
        )?;
        let passes = context.guarded("fluid render pipelines", Passes::new)?;
        let uniforms = FluidUniforms::new(size);
        let uniform_buffer = UniformBuffer::new_with_data(context.device(), &uniforms);
        info!("Allocated pixel fluid grid {}", size);

        Ok(Self {
            name: "Pixel Stable Fluids".to_string(),
            context,
            size,
            row_bytes,
            padded_row_bytes,
            buffers: Some(buffers),
            force_texture: None,
            passes,
            uniforms,
            uniform_buffer,
            parameters: config.parameters,
            pending: config.parameters,
            stats: SolverStats::new(),
        })
    }

    /// Texture currently holding the velocity field, for rendering
    pub fn velocity_texture(&self) -> Result<&GridTexture> {
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

    /// Upload a host vector field into `texture`
    fn write_texture(&self, texture: &GridTexture, field: &VectorField) {
        self.context.queue().write_texture(
            texture.texture.as_image_copy(),
            bytemuck::cast_slice(field.as_slice()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.row_bytes),
                rows_per_image: Some(self.size.height),
            },
            extent(self.size),
        );
    }
}

impl FluidSolver for PixelFluidSimulation {
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

        let passes = &self.passes;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            "Fluid Pixel Pre Step",
        );

        recorder.draw(
            "Pixel Advect",
            &passes.advect,
            &passes.unary,
            &[buffers.velocity(VelocitySlot::Current)],
            buffers.velocity(VelocitySlot::Work),
        );
        recorder.encoder.copy_texture_to_texture(
            buffers.velocity(VelocitySlot::Work).texture.as_image_copy(),
            buffers.velocity(VelocitySlot::Current).texture.as_image_copy(),
            extent(self.size),
        );
        for _ in 0..JACOBI_ITERATIONS {
            recorder.draw(
                "Pixel Jacobi Vector",
                &passes.jacobi_vector,
                &passes.binary,
                &[
                    buffers.velocity(VelocitySlot::Work),
                    buffers.velocity(VelocitySlot::Current),
                ],
                buffers.velocity(VelocitySlot::Spare),
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

        let passes = &self.passes;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            "Fluid Pixel Point Force",
        );
        recorder.draw(
            "Pixel Point Force",
            &passes.point_force,
            &passes.unary,
            &[buffers.velocity(VelocitySlot::Work)],
            buffers.velocity(VelocitySlot::Spare),
        );
        buffers.swap_work();
        recorder.submit(self.context.queue());
    }

    fn apply_force_field(&mut self, force: &VectorField) -> Result<()> {
        force.check_size(self.size)?;
        if self.buffers.is_none() {
            return Err(FluidError::Disposed);
        }
        if self.force_texture.is_none() {
            let size = self.size;
            let texture = self.context.guarded("force field texture", |device| {
                GridTexture::new(device, "force field", size, VELOCITY_FORMAT)
            })?;
            self.force_texture = Some(texture);
        }
        if let Some(texture) = &self.force_texture {
            self.write_texture(texture, force);
        }

        let passes = &self.passes;
        let (Some(buffers), Some(force_texture)) =
            (self.buffers.as_mut(), self.force_texture.as_ref())
        else {
            return Err(FluidError::Disposed);
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            "Fluid Pixel Force Field",
        );
        recorder.draw(
            "Pixel Force Field",
            &passes.force_field,
            &passes.binary,
            &[buffers.velocity(VelocitySlot::Work), force_texture],
            buffers.velocity(VelocitySlot::Spare),
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

        let passes = &self.passes;
        let Some(buffers) = self.buffers.as_mut() else {
            return;
        };
        let mut recorder = Recorder::new(
            self.context.device(),
            self.uniform_buffer.buffer(),
            "Fluid Pixel Post Step",
        );

        recorder.draw(
            "Pixel Divergence",
            &passes.divergence,
            &passes.unary,
            &[buffers.velocity(VelocitySlot::Work)],
            buffers.divergence(),
        );
        recorder.clear("Pixel Pressure Clear", buffers.pressure_front());
        for _ in 0..JACOBI_ITERATIONS {
            recorder.draw(
                "Pixel Jacobi Scalar",
                &passes.jacobi_scalar,
                &passes.binary,
                &[buffers.pressure_front(), buffers.divergence()],
                buffers.pressure_back(),
            );
            buffers.swap_pressure();
        }
        recorder.draw(
            "Pixel Projection Finish",
            &passes.projection_finish,
            &passes.binary,
            &[
                buffers.velocity(VelocitySlot::Work),
                buffers.pressure_front(),
            ],
            buffers.velocity(VelocitySlot::Spare),
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
            let mut recorder = Recorder::new(
                self.context.device(),
                self.uniform_buffer.buffer(),
                "Fluid Pixel Clear",
            );
            recorder.clear("Pixel Velocity Clear", buffers.velocity(VelocitySlot::Current));
            recorder.submit(self.context.queue());
        }
    }

    fn write_velocity(&mut self, field: &VectorField) -> Result<()> {
        field.check_size(self.size)?;
        let target = self.velocity_texture()?;
        self.write_texture(target, field);
        Ok(())
    }

    fn read_velocity(&self) -> Result<VectorField> {
        let source = self.velocity_texture()?;
        let width = self.size.width as usize;
        let padded_row_bytes = self.padded_row_bytes;
        let device = self.context.device();
        let staging = staging_buffer(
            device,
            "Velocity Texture Readback",
            padded_row_bytes as u64 * self.size.height as u64,
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Velocity Texture Readback"),
        });
        encoder.copy_texture_to_buffer(
            source.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(self.size.height),
                },
            },
            extent(self.size),
        );
        self.context.queue().submit(std::iter::once(encoder.finish()));

        let padded: Vec<[f32; 2]> = read_staging(device, &staging)?;
        let data = padded
            .chunks_exact(padded_row_bytes as usize / 8)
            .flat_map(|row| row[..width].iter().copied())
            .collect();
        VectorField::from_data(self.size, data)
    }

    fn stats(&self) -> &SolverStats {
        &self.stats
    }

    fn dispose(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            let destroy = |grid: GridTexture| grid.texture.destroy();
            buffers.release(destroy, destroy);
            if let Some(force) = self.force_texture.take() {
                destroy(force);
            }
            debug!("Released pixel fluid grid {}", self.size);
        }
    }

    fn is_disposed(&self) -> bool {
        self.buffers.is_none()
    }
}

impl Drop for PixelFluidSimulation {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::cpu::CpuFluidSimulation;
    use crate::simulation::gpu::tests::test_context;
    use crate::simulation::params::StepInput;

    const DT: f32 = 1.0 / 60.0;

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn test_odd_sizes_are_not_rounded() {
        let context = test_context();
        let sim = PixelFluidSimulation::new(context, &FluidConfig::new(30, 17)).unwrap();
        assert_eq!(sim.grid_size(), GridSize::new(30, 17).unwrap());
    }

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn test_readback_strips_row_padding() {
        let context = test_context();
        let mut sim = PixelFluidSimulation::new(context, &FluidConfig::new(13, 5)).unwrap();
        let field = VectorField::from_fn(sim.grid_size(), |x, y| [x as f32, y as f32]).unwrap();
        sim.write_velocity(&field).unwrap();
        assert_eq!(sim.read_velocity().unwrap(), field);
    }

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn test_matches_cpu_solver() {
        let context = test_context();
        let config = FluidConfig::new(24, 20);
        let mut gpu = PixelFluidSimulation::new(context, &config).unwrap();
        let mut cpu = CpuFluidSimulation::new(&config).unwrap();

        let input = StepInput::with_force(DT, Vector2::new(-0.1, 0.1), Vector2::new(0.02, 0.0));
        for _ in 0..3 {
            gpu.step(&input);
            cpu.step(&input);
        }

        let gpu_velocity = gpu.read_velocity().unwrap();
        let cpu_velocity = cpu.read_velocity().unwrap();
        let max_difference = gpu_velocity
            .as_slice()
            .iter()
            .zip(cpu_velocity.as_slice())
            .map(|(p, q)| (p[0] - q[0]).abs().max((p[1] - q[1]).abs()))
            .fold(0.0, f32::max);
        assert!(max_difference < 1e-3);
    }

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn test_clear_and_dispose() {
        let context = test_context();
        let mut sim = PixelFluidSimulation::new(context, &FluidConfig::new(8, 8)).unwrap();
        let field = VectorField::from_fn(sim.grid_size(), |_, _| [1.0, 2.0]).unwrap();
        sim.write_velocity(&field).unwrap();
        sim.clear_velocity();
        let cleared = sim.read_velocity().unwrap();
        assert!(cleared.as_slice().iter().all(|v| *v == [0.0, 0.0]));

        sim.dispose();
        assert!(sim.is_disposed());
        assert!(matches!(sim.read_velocity(), Err(FluidError::Disposed)));
    }
}
