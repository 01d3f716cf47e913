use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use glam::Mat4;

use super::{BufferHandle, DeviceCaps, RenderContext, TextureHandle};
use crate::clusters::{
    compute_cluster_bounds, cull_lights, ClusterAabb, ClusterBoundsParams, CullingStats, GpuLightSource,
    LightCullingParams, LightGridEntry, LightIndexList, CLUSTER_AABB_SIZE, GPU_LIGHT_SOURCE_SIZE,
    INDEX_ENTRY_SIZE, LIGHT_GRID_ENTRY_SIZE,
};
use crate::commands::{Command, CommandList, DispatchCommand, KernelUniforms, PixelRect};
use crate::error::LightingError;
use crate::globals::ShaderGlobals;
use crate::scene::ShadowSplitData;

#[derive(Debug)]
struct HostBuffer {
    label: &'static str,
    size: u64,
    words: Vec<u32>,
}

impl HostBuffer {
    fn new(label: &'static str, size: u64) -> Self {
        Self { label, size, words: vec![0; size.div_ceil(4) as usize] }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..size]
    }
}

/// One shadow caster draw as the executor saw it, with the raster state that was bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowDrawRecord {
    pub target: TextureHandle,
    pub light_index: usize,
    pub viewport: PixelRect,
    pub scissor: Option<PixelRect>,
    pub view: Mat4,
    pub projection: Mat4,
    pub split: ShadowSplitData,
}

/// CPU executor. Kernels run on the rayon pool against host memory, and every command is
/// kept for inspection. Reading a buffer written by an earlier dispatch without a
/// [`Command::ComputeBarrier`] in between fails with [`LightingError::MissingBarrier`].
#[derive(Debug, Default)]
pub struct HostContext {
    caps: DeviceCaps,
    next_handle: u32,
    buffers: HashMap<u32, HostBuffer>,
    shadow_maps: HashMap<u32, u32>,
    globals: ShaderGlobals,
    executed: Vec<Command>,
    shadow_draws: Vec<ShadowDrawRecord>,
    render_target: Option<TextureHandle>,
    viewport: PixelRect,
    scissor: Option<PixelRect>,
    view: Mat4,
    projection: Mat4,
    unsynchronized: HashSet<u32>,
    open_samples: Vec<&'static str>,
    dispatches: u32,
    submits: u32,
    last_culling: Option<CullingStats>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self { caps, ..Self::default() }
    }

    pub fn executed(&self) -> &[Command] {
        &self.executed
    }

    pub fn shadow_draws(&self) -> &[ShadowDrawRecord] {
        &self.shadow_draws
    }

    /// Forgets executed commands and draws; globals and buffers are kept.
    pub fn clear_history(&mut self) {
        self.executed.clear();
        self.shadow_draws.clear();
    }

    pub fn live_shadow_maps(&self) -> usize {
        self.shadow_maps.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn shadow_map_size(&self, handle: TextureHandle) -> Option<u32> {
        self.shadow_maps.get(&handle.0).copied()
    }

    pub fn buffer_label(&self, handle: BufferHandle) -> Option<&'static str> {
        self.buffers.get(&handle.0).map(|buffer| buffer.label)
    }

    pub fn dispatch_count(&self) -> u32 {
        self.dispatches
    }

    pub fn submit_count(&self) -> u32 {
        self.submits
    }

    pub fn last_culling_stats(&self) -> Option<CullingStats> {
        self.last_culling
    }

    /// Copies a buffer out as a slice of `T`. `None` when the handle is unknown or the
    /// buffer does not hold a whole number of `T`.
    pub fn read_pod<T: bytemuck::Pod>(&self, handle: BufferHandle) -> Option<Vec<T>> {
        let buffer = self.buffers.get(&handle.0)?;
        let bytes = &bytemuck::cast_slice::<u32, u8>(&buffer.words)[..buffer.size as usize];
        let stride = std::mem::size_of::<T>();
        if stride == 0 || bytes.len() % stride != 0 {
            return None;
        }
        Some(bytes.chunks_exact(stride).map(bytemuck::pod_read_unaligned).collect())
    }

    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer, LightingError> {
        self.buffers.get(&handle.0).ok_or(LightingError::UnknownBuffer(handle.0))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer, LightingError> {
        self.buffers.get_mut(&handle.0).ok_or(LightingError::UnknownBuffer(handle.0))
    }

    fn expect_size(&self, handle: BufferHandle, expected: u64, exact: bool) -> Result<(), LightingError> {
        let buffer = self.buffer(handle)?;
        let fits = if exact { buffer.size == expected } else { buffer.size >= expected };
        if !fits {
            return Err(LightingError::BufferSizeMismatch { label: buffer.label, expected, actual: buffer.size });
        }
        Ok(())
    }

    fn expect_synchronized(&self, handle: BufferHandle) -> Result<(), LightingError> {
        if self.unsynchronized.contains(&handle.0) {
            let label = self.buffer(handle)?.label;
            return Err(LightingError::MissingBarrier { label });
        }
        Ok(())
    }

    fn binding(dispatch: &DispatchCommand, slot: usize) -> Result<BufferHandle> {
        dispatch
            .bindings
            .get(slot)
            .copied()
            .ok_or_else(|| anyhow!("{} dispatch is missing binding {slot}", dispatch.kernel().label()))
    }

    fn run_dispatch(&mut self, dispatch: &DispatchCommand) -> Result<()> {
        for handle in &dispatch.bindings {
            self.expect_synchronized(*handle)?;
        }
        match &dispatch.uniforms {
            KernelUniforms::ClusterBounds(params) => self.run_cluster_bounds(dispatch, params)?,
            KernelUniforms::LightCulling(params) => self.run_light_culling(dispatch, params)?,
        }
        self.dispatches += 1;
        Ok(())
    }

    fn run_cluster_bounds(&mut self, dispatch: &DispatchCommand, params: &ClusterBoundsParams) -> Result<()> {
        let clusters = Self::binding(dispatch, 0)?;
        self.expect_size(clusters, params.cluster_count() as u64 * CLUSTER_AABB_SIZE, true)?;
        let buffer = self.buffer_mut(clusters)?;
        let out: &mut [ClusterAabb] = bytemuck::try_cast_slice_mut(&mut buffer.words)
            .map_err(|err| anyhow!("cluster bounds buffer is not a record array: {err}"))?;
        compute_cluster_bounds(params, dispatch.groups, out);
        self.unsynchronized.insert(clusters.0);
        Ok(())
    }

    fn run_light_culling(&mut self, dispatch: &DispatchCommand, params: &LightCullingParams) -> Result<()> {
        let lights = Self::binding(dispatch, 0)?;
        let clusters = Self::binding(dispatch, 1)?;
        let counter = Self::binding(dispatch, 2)?;
        let index_list = Self::binding(dispatch, 3)?;
        let grid = Self::binding(dispatch, 4)?;

        let light_count = params.light_count() as u64;
        let cluster_count = params.cluster_count() as u64;
        self.expect_size(lights, light_count * GPU_LIGHT_SOURCE_SIZE, false)?;
        self.expect_size(clusters, cluster_count * CLUSTER_AABB_SIZE, true)?;
        self.expect_size(counter, INDEX_ENTRY_SIZE, false)?;
        self.expect_size(index_list, params.index_capacity().max(1) * INDEX_ENTRY_SIZE, true)?;
        self.expect_size(grid, cluster_count * LIGHT_GRID_ENTRY_SIZE, true)?;

        let light_words = (light_count * GPU_LIGHT_SOURCE_SIZE / 4) as usize;
        let light_records: Vec<GpuLightSource> =
            bytemuck::cast_slice(&self.buffer(lights)?.words[..light_words]).to_vec();
        let cluster_records: Vec<ClusterAabb> = bytemuck::cast_slice(&self.buffer(clusters)?.words).to_vec();
        let start = self.buffer(counter)?.words[0];
        let capacity = params.index_capacity() as usize;
        let mut entries = std::mem::take(&mut self.buffer_mut(index_list)?.words);
        entries.truncate(capacity);

        let list = LightIndexList::from_parts(start, entries);
        let (entries, stats) = cull_lights(params, dispatch.groups, &light_records, &cluster_records, &list);
        let (next, mut words) = list.into_parts();
        words.resize(capacity.max(1), 0);

        self.buffer_mut(index_list)?.words = words;
        self.buffer_mut(counter)?.words[0] = next;
        let grid_buffer = self.buffer_mut(grid)?;
        let out: &mut [LightGridEntry] = bytemuck::try_cast_slice_mut(&mut grid_buffer.words)
            .map_err(|err| anyhow!("light grid buffer is not a record array: {err}"))?;
        out[..entries.len()].copy_from_slice(&entries);

        if stats.dropped > 0 {
            log::warn!(
                "Cluster light index list overflowed: {} of {} assignments dropped",
                stats.dropped,
                stats.assignments + stats.dropped
            );
        }
        self.unsynchronized.extend([counter.0, index_list.0, grid.0]);
        self.last_culling = Some(stats);
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::BeginSample(name) => self.open_samples.push(*name),
            Command::EndSample(name) => {
                if self.open_samples.pop() != Some(*name) {
                    return Err(anyhow!("sample '{name}' ended without a matching begin"));
                }
            }
            Command::SetGlobal { property, value } => self.globals.set(*property, value.clone()),
            Command::SetKeyword { keyword, enabled } => self.globals.set_keyword(*keyword, *enabled),
            Command::SetRenderTarget(texture) => {
                let size = self.shadow_map_size(*texture).ok_or(LightingError::UnknownTexture(texture.0))? as f32;
                self.render_target = Some(*texture);
                self.viewport = PixelRect::new(0.0, 0.0, size, size);
                self.scissor = None;
            }
            Command::ClearRenderTarget { .. } => {
                if self.render_target.is_none() {
                    return Err(anyhow!("clear issued with no render target bound"));
                }
            }
            Command::SetViewport(rect) => self.viewport = *rect,
            Command::EnableScissor(rect) => self.scissor = Some(*rect),
            Command::DisableScissor => self.scissor = None,
            Command::SetViewProjection { view, projection } => {
                self.view = *view;
                self.projection = *projection;
            }
            Command::DrawShadows { light_index, split } => {
                let target = self
                    .render_target
                    .ok_or_else(|| anyhow!("shadow draw for light {light_index} with no render target bound"))?;
                self.shadow_draws.push(ShadowDrawRecord {
                    target,
                    light_index: *light_index,
                    viewport: self.viewport,
                    scissor: self.scissor,
                    view: self.view,
                    projection: self.projection,
                    split: *split,
                });
            }
            Command::Dispatch(dispatch) => self.run_dispatch(dispatch)?,
            Command::ComputeBarrier => self.unsynchronized.clear(),
        }
        Ok(())
    }
}

impl RenderContext for HostContext {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_buffer(&mut self, label: &'static str, size: u64) -> Result<BufferHandle> {
        let handle = self.allocate_handle();
        self.buffers.insert(handle, HostBuffer::new(label, size));
        log::trace!("Created buffer '{label}' ({size} bytes) as {handle}");
        Ok(BufferHandle(handle))
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers.remove(&handle.0).ok_or(LightingError::UnknownBuffer(handle.0))?;
        self.unsynchronized.remove(&handle.0);
        Ok(())
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.get(&handle.0).map(|buffer| buffer.size)
    }

    fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer_mut(handle)?;
        let end = offset + data.len() as u64;
        if end > buffer.size {
            return Err(LightingError::BufferSizeMismatch { label: buffer.label, expected: end, actual: buffer.size }
                .into());
        }
        buffer.bytes_mut()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn acquire_shadow_map(&mut self, size: u32) -> Result<TextureHandle> {
        let handle = self.allocate_handle();
        self.shadow_maps.insert(handle, size.max(1));
        Ok(TextureHandle(handle))
    }

    fn release_shadow_map(&mut self, handle: TextureHandle) -> Result<()> {
        self.shadow_maps.remove(&handle.0).ok_or(LightingError::UnknownTexture(handle.0))?;
        if self.render_target == Some(handle) {
            self.render_target = None;
        }
        Ok(())
    }

    fn execute(&mut self, commands: &mut CommandList) -> Result<()> {
        let name = commands.name();
        for command in commands.take() {
            log::trace!("[{name}] {command:?}");
            self.apply(&command)?;
            self.executed.push(command);
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        if let Some(open) = self.open_samples.last() {
            return Err(anyhow!("submit with sample '{open}' still open"));
        }
        self.unsynchronized.clear();
        self.submits += 1;
        Ok(())
    }

    fn globals(&self) -> &ShaderGlobals {
        &self.globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::ShaderProperty;

    #[test]
    fn writes_past_the_end_are_rejected() {
        let mut ctx = HostContext::new();
        let buffer = ctx.create_buffer("Test", 8).unwrap();
        ctx.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        let err = ctx.write_buffer(buffer, 6, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightingError>(),
            Some(LightingError::BufferSizeMismatch { expected: 10, actual: 8, .. })
        ));
        assert_eq!(ctx.read_pod::<u32>(buffer).unwrap(), vec![0, u32::from_le_bytes([1, 2, 3, 4])]);
    }

    #[test]
    fn shadow_draws_capture_raster_state() {
        let mut ctx = HostContext::new();
        let map = ctx.acquire_shadow_map(1024).unwrap();
        let mut commands = CommandList::new("Shadows");
        commands.set_render_target(map);
        commands.set_viewport(PixelRect::new(512.0, 0.0, 512.0, 512.0));
        commands.enable_scissor(PixelRect::new(516.0, 4.0, 504.0, 504.0));
        commands.draw_shadows(3, ShadowSplitData::default());
        commands.disable_scissor();
        commands.set_global_float(ShaderProperty::ShadowBias, 0.05);
        ctx.execute(&mut commands).unwrap();

        let draw = &ctx.shadow_draws()[0];
        assert_eq!(draw.light_index, 3);
        assert_eq!(draw.target, map);
        assert_eq!(draw.viewport.x, 512.0);
        assert!(draw.scissor.is_some());
        assert_eq!(ctx.globals().float(ShaderProperty::ShadowBias), Some(0.05));
        ctx.release_shadow_map(map).unwrap();
        assert_eq!(ctx.live_shadow_maps(), 0);
    }

    #[test]
    fn drawing_without_a_target_fails() {
        let mut ctx = HostContext::new();
        let mut commands = CommandList::new("Shadows");
        commands.draw_shadows(0, ShadowSplitData::default());
        assert!(ctx.execute(&mut commands).is_err());
    }
}
