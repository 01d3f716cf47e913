use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use glam::Mat4;
use wgpu::util::DeviceExt;

use super::{BufferHandle, DeviceCaps, RenderContext, TextureHandle};
use crate::commands::{Command, CommandList, ComputeKernel, DispatchCommand, KernelUniforms, PixelRect};
use crate::error::LightingError;
use crate::globals::ShaderGlobals;
use crate::scene::ShadowSplitData;

pub const SHADOW_MAP_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Everything a caster renderer needs to draw one light's (or cascade's) casters into the
/// bound tile.
#[derive(Debug, Clone, Copy)]
pub struct ShadowCasterDraw {
    pub light_index: usize,
    pub split: ShadowSplitData,
    pub view: Mat4,
    pub projection: Mat4,
    pub reversed_z: bool,
}

/// Draws the scene's shadow casters. Implemented by the mesh renderer that owns the
/// geometry; the pass arrives with viewport and scissor already set.
pub trait ShadowCasterRenderer {
    fn draw_shadow_casters(&mut self, pass: &mut wgpu::RenderPass<'_>, draw: &ShadowCasterDraw);
}

struct GpuBuffer {
    label: &'static str,
    size: u64,
    buffer: wgpu::Buffer,
}

struct ShadowMapTexture {
    size: u32,
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct ComputeResources {
    bounds_pipeline: wgpu::ComputePipeline,
    bounds_bgl: Arc<wgpu::BindGroupLayout>,
    culling_pipeline: wgpu::ComputePipeline,
    culling_bgl: Arc<wgpu::BindGroupLayout>,
}

/// Executes command lists on a wgpu device. Dispatches run in their own compute pass and
/// shadow draws in depth-only render passes, all recorded into one encoder per submit.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: DeviceCaps,
    next_handle: u32,
    buffers: HashMap<u32, GpuBuffer>,
    live_shadow_maps: HashMap<u32, ShadowMapTexture>,
    shadow_map_pool: Vec<ShadowMapTexture>,
    globals: ShaderGlobals,
    compute: Option<ComputeResources>,
    encoder: Option<wgpu::CommandEncoder>,
    caster_renderer: Option<Box<dyn ShadowCasterRenderer>>,
    render_target: Option<TextureHandle>,
    pending_clear: bool,
    viewport: PixelRect,
    scissor: Option<PixelRect>,
    view: Mat4,
    projection: Mat4,
}

impl WgpuContext {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, caps: DeviceCaps) -> Self {
        Self {
            device,
            queue,
            caps,
            next_handle: 0,
            buffers: HashMap::new(),
            live_shadow_maps: HashMap::new(),
            shadow_map_pool: Vec::new(),
            globals: ShaderGlobals::new(),
            compute: None,
            encoder: None,
            caster_renderer: None,
            render_target: None,
            pending_clear: false,
            viewport: PixelRect::default(),
            scissor: None,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }

    /// Creates a device without a surface.
    pub fn headless(caps: DeviceCaps) -> Result<Self> {
        pollster::block_on(Self::request_headless(caps))
    }

    async fn request_headless(caps: DeviceCaps) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Lighting Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;
        Ok(Self::new(device, queue, caps))
    }

    pub fn set_caster_renderer(&mut self, renderer: Box<dyn ShadowCasterRenderer>) {
        self.caster_renderer = Some(renderer);
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&handle.0).map(|entry| &entry.buffer)
    }

    /// View of a live shadow map for binding in the lit passes.
    pub fn shadow_map_view(&self, handle: TextureHandle) -> Option<&wgpu::TextureView> {
        self.live_shadow_maps.get(&handle.0).map(|map| &map.view)
    }

    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn clear_depth(&self) -> f32 {
        if self.caps.reversed_z {
            0.0
        } else {
            1.0
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Lighting Encoder") })
        })
    }

    fn gpu_buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer, LightingError> {
        self.buffers.get(&handle.0).ok_or(LightingError::UnknownBuffer(handle.0))
    }

    fn ensure_compute(&mut self) {
        let device = &self.device;
        self.compute.get_or_insert_with(|| {
            let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            };
            let uniform = wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            };

            let bounds_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Cluster Bounds BGL"),
                entries: &[uniform, storage(1, false)],
            }));
            let culling_bgl = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Cluster Light Culling BGL"),
                entries: &[
                    uniform,
                    storage(1, true),
                    storage(2, true),
                    storage(3, false),
                    storage(4, false),
                    storage(5, false),
                ],
            }));

            let pipeline = |label: &'static str, source: &'static str, layout: &wgpu::BindGroupLayout| {
                let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
                let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[layout],
                    push_constant_ranges: &[],
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some("main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
            };

            ComputeResources {
                bounds_pipeline: pipeline(
                    ComputeKernel::ClusterBounds.label(),
                    include_str!("../../assets/shaders/cluster_bounds.wgsl"),
                    bounds_bgl.as_ref(),
                ),
                culling_pipeline: pipeline(
                    ComputeKernel::LightCulling.label(),
                    include_str!("../../assets/shaders/cluster_light_culling.wgsl"),
                    culling_bgl.as_ref(),
                ),
                bounds_bgl,
                culling_bgl,
            }
        });
    }

    fn run_dispatch(&mut self, dispatch: &DispatchCommand) -> Result<()> {
        let uniform_bytes: &[u8] = match &dispatch.uniforms {
            KernelUniforms::ClusterBounds(params) => bytemuck::bytes_of(params),
            KernelUniforms::LightCulling(params) => bytemuck::bytes_of(params),
        };
        let kernel = dispatch.kernel();
        let uniforms = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(kernel.label()),
            contents: uniform_bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        self.ensure_compute();
        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() }];
        for (slot, handle) in dispatch.bindings.iter().enumerate() {
            let buffer = &self.gpu_buffer(*handle)?.buffer;
            entries.push(wgpu::BindGroupEntry { binding: slot as u32 + 1, resource: buffer.as_entire_binding() });
        }
        let expected = match kernel {
            ComputeKernel::ClusterBounds => 2,
            ComputeKernel::LightCulling => 6,
        };
        if entries.len() != expected {
            return Err(anyhow!(
                "{} dispatch has {} bindings, expected {}",
                kernel.label(),
                entries.len() - 1,
                expected - 1
            ));
        }

        let compute = self.compute.as_ref().context("Compute pipelines missing")?;
        let (pipeline, layout) = match kernel {
            ComputeKernel::ClusterBounds => (&compute.bounds_pipeline, compute.bounds_bgl.as_ref()),
            ComputeKernel::LightCulling => (&compute.culling_pipeline, compute.culling_bgl.as_ref()),
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label()),
            layout,
            entries: &entries,
        });
        let pipeline = pipeline.clone();
        let [x, y, z] = dispatch.groups;
        let mut pass = self
            .encoder()
            .begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(kernel.label()), timestamp_writes: None });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn begin_shadow_pass(&mut self, light_index: Option<usize>, split: ShadowSplitData) -> Result<()> {
        let target = self.render_target.context("Shadow pass issued with no render target bound")?;
        let load = if self.pending_clear { wgpu::LoadOp::Clear(self.clear_depth()) } else { wgpu::LoadOp::Load };
        self.pending_clear = false;
        let encoder = self.encoder.get_or_insert_with(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Lighting Encoder") })
        });
        let map = self.live_shadow_maps.get(&target.0).ok_or(LightingError::UnknownTexture(target.0))?;
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Shadow Caster Pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &map.view,
                depth_ops: Some(wgpu::Operations { load, store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        let Some(light_index) = light_index else {
            return Ok(());
        };
        let viewport = self.viewport;
        pass.set_viewport(viewport.x, viewport.y, viewport.width, viewport.height, 0.0, 1.0);
        let scissor = self.scissor.unwrap_or(viewport);
        pass.set_scissor_rect(
            scissor.x.max(0.0) as u32,
            scissor.y.max(0.0) as u32,
            scissor.width.max(0.0) as u32,
            scissor.height.max(0.0) as u32,
        );
        if let Some(renderer) = self.caster_renderer.as_mut() {
            let draw = ShadowCasterDraw {
                light_index,
                split,
                view: self.view,
                projection: self.projection,
                reversed_z: self.caps.reversed_z,
            };
            renderer.draw_shadow_casters(&mut pass, &draw);
        }
        Ok(())
    }

    fn flush_clear(&mut self) -> Result<()> {
        if self.pending_clear {
            self.begin_shadow_pass(None, ShadowSplitData::default())?;
        }
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::BeginSample(name) => self.encoder().push_debug_group(name),
            Command::EndSample(_) => self.encoder().pop_debug_group(),
            Command::SetGlobal { property, value } => self.globals.set(*property, value.clone()),
            Command::SetKeyword { keyword, enabled } => self.globals.set_keyword(*keyword, *enabled),
            Command::SetRenderTarget(texture) => {
                self.flush_clear()?;
                let size = self
                    .live_shadow_maps
                    .get(&texture.0)
                    .map(|map| map.size)
                    .ok_or(LightingError::UnknownTexture(texture.0))? as f32;
                self.render_target = Some(*texture);
                self.viewport = PixelRect::new(0.0, 0.0, size, size);
                self.scissor = None;
            }
            Command::ClearRenderTarget { depth, .. } => self.pending_clear |= *depth,
            Command::SetViewport(rect) => self.viewport = *rect,
            Command::EnableScissor(rect) => self.scissor = Some(*rect),
            Command::DisableScissor => self.scissor = None,
            Command::SetViewProjection { view, projection } => {
                self.view = *view;
                self.projection = *projection;
            }
            Command::DrawShadows { light_index, split } => self.begin_shadow_pass(Some(*light_index), *split)?,
            Command::Dispatch(dispatch) => self.run_dispatch(dispatch)?,
            // Passes are already ordered; wgpu synchronizes storage writes between them.
            Command::ComputeBarrier => {}
        }
        Ok(())
    }
}

impl RenderContext for WgpuContext {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_buffer(&mut self, label: &'static str, size: u64) -> Result<BufferHandle> {
        let aligned = size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: aligned,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = self.allocate_handle();
        self.buffers.insert(handle, GpuBuffer { label, size, buffer });
        Ok(BufferHandle(handle))
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let entry = self.buffers.remove(&handle.0).ok_or(LightingError::UnknownBuffer(handle.0))?;
        entry.buffer.destroy();
        Ok(())
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.get(&handle.0).map(|entry| entry.size)
    }

    fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let entry = self.gpu_buffer(handle)?;
        let end = offset + data.len() as u64;
        if end > entry.size {
            return Err(LightingError::BufferSizeMismatch { label: entry.label, expected: end, actual: entry.size }.into());
        }
        self.queue.write_buffer(&entry.buffer, offset, data);
        Ok(())
    }

    fn acquire_shadow_map(&mut self, size: u32) -> Result<TextureHandle> {
        let size = size.max(1);
        let map = match self.shadow_map_pool.iter().position(|map| map.size == size) {
            Some(index) => self.shadow_map_pool.swap_remove(index),
            None => {
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("Shadow Map"),
                    size: wgpu::Extent3d { width: size, height: size, depth_or_array_layers: 1 },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: SHADOW_MAP_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                ShadowMapTexture { size, _texture: texture, view }
            }
        };
        let handle = self.allocate_handle();
        self.live_shadow_maps.insert(handle, map);
        Ok(TextureHandle(handle))
    }

    fn release_shadow_map(&mut self, handle: TextureHandle) -> Result<()> {
        let map = self.live_shadow_maps.remove(&handle.0).ok_or(LightingError::UnknownTexture(handle.0))?;
        if self.render_target == Some(handle) {
            self.render_target = None;
            self.pending_clear = false;
        }
        self.shadow_map_pool.push(map);
        Ok(())
    }

    fn execute(&mut self, commands: &mut CommandList) -> Result<()> {
        let name = commands.name();
        for command in commands.take() {
            log::trace!("[{name}] {command:?}");
            self.apply(&command)?;
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        self.flush_clear()?;
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
        Ok(())
    }

    fn globals(&self) -> &ShaderGlobals {
        &self.globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn shadow_maps_are_pooled_by_size() {
        let mut ctx = WgpuContext::headless(DeviceCaps::default()).expect("headless device");
        let first = ctx.acquire_shadow_map(512).unwrap();
        ctx.release_shadow_map(first).unwrap();
        let _second = ctx.acquire_shadow_map(512).unwrap();
        assert!(ctx.shadow_map_pool.is_empty());
        let buffer = ctx.create_buffer("Test", 6).unwrap();
        assert_eq!(ctx.buffer_size(buffer), Some(6));
        ctx.submit().unwrap();
    }
}
