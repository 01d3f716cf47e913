//! Recorded command stream. Appends are plain `Vec` pushes; nothing runs until a
//! [`RenderContext`](crate::backend::RenderContext) executes the list.

use glam::{Mat4, Vec4};
use smallvec::SmallVec;

use crate::backend::{BufferHandle, TextureHandle};
use crate::clusters::{ClusterBoundsParams, LightCullingParams};
use crate::globals::{ShaderKeywords, ShaderProperty, ShaderValue};
use crate::scene::ShadowSplitData;

/// Pixel rectangle with the origin at the top-left of the target.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, other: &PixelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeKernel {
    ClusterBounds,
    LightCulling,
}

impl ComputeKernel {
    pub const fn label(self) -> &'static str {
        match self {
            ComputeKernel::ClusterBounds => "cluster_bounds",
            ComputeKernel::LightCulling => "cluster_light_culling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelUniforms {
    ClusterBounds(ClusterBoundsParams),
    LightCulling(LightCullingParams),
}

/// A compute dispatch. Binding order is fixed per kernel:
/// - cluster bounds: `[clusters]`
/// - light culling: `[lights, clusters, counter, index_list, grid]`
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCommand {
    pub uniforms: KernelUniforms,
    pub bindings: SmallVec<[BufferHandle; 5]>,
    pub groups: [u32; 3],
}

impl DispatchCommand {
    pub fn kernel(&self) -> ComputeKernel {
        match self.uniforms {
            KernelUniforms::ClusterBounds(_) => ComputeKernel::ClusterBounds,
            KernelUniforms::LightCulling(_) => ComputeKernel::LightCulling,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginSample(&'static str),
    EndSample(&'static str),
    SetGlobal { property: ShaderProperty, value: ShaderValue },
    SetKeyword { keyword: ShaderKeywords, enabled: bool },
    SetRenderTarget(TextureHandle),
    ClearRenderTarget { depth: bool, color: bool },
    SetViewport(PixelRect),
    EnableScissor(PixelRect),
    DisableScissor,
    SetViewProjection { view: Mat4, projection: Mat4 },
    DrawShadows { light_index: usize, split: ShadowSplitData },
    Dispatch(DispatchCommand),
    ComputeBarrier,
}

#[derive(Debug, Default)]
pub struct CommandList {
    name: &'static str,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(name: &'static str) -> Self {
        Self { name, commands: Vec::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Hands the recorded commands to an executor and leaves the list empty for reuse.
    pub fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn begin_sample(&mut self, name: &'static str) {
        self.push(Command::BeginSample(name));
    }

    pub fn end_sample(&mut self, name: &'static str) {
        self.push(Command::EndSample(name));
    }

    pub fn set_global(&mut self, property: ShaderProperty, value: ShaderValue) {
        self.push(Command::SetGlobal { property, value });
    }

    pub fn set_global_float(&mut self, property: ShaderProperty, value: f32) {
        self.set_global(property, ShaderValue::Float(value));
    }

    pub fn set_global_int(&mut self, property: ShaderProperty, value: i32) {
        self.set_global(property, ShaderValue::Int(value));
    }

    pub fn set_global_vector(&mut self, property: ShaderProperty, value: Vec4) {
        self.set_global(property, ShaderValue::Vector(value));
    }

    pub fn set_global_vector_array(&mut self, property: ShaderProperty, values: &[Vec4]) {
        self.set_global(property, ShaderValue::VectorArray(values.to_vec()));
    }

    pub fn set_global_matrix_array(&mut self, property: ShaderProperty, values: &[Mat4]) {
        self.set_global(property, ShaderValue::MatrixArray(values.to_vec()));
    }

    pub fn set_global_texture(&mut self, property: ShaderProperty, texture: TextureHandle) {
        self.set_global(property, ShaderValue::Texture(texture));
    }

    pub fn set_global_buffer(&mut self, property: ShaderProperty, buffer: BufferHandle) {
        self.set_global(property, ShaderValue::Buffer(buffer));
    }

    pub fn set_keyword(&mut self, keyword: ShaderKeywords, enabled: bool) {
        self.push(Command::SetKeyword { keyword, enabled });
    }

    pub fn set_render_target(&mut self, texture: TextureHandle) {
        self.push(Command::SetRenderTarget(texture));
    }

    pub fn clear_render_target(&mut self, depth: bool, color: bool) {
        self.push(Command::ClearRenderTarget { depth, color });
    }

    pub fn set_viewport(&mut self, rect: PixelRect) {
        self.push(Command::SetViewport(rect));
    }

    pub fn enable_scissor(&mut self, rect: PixelRect) {
        self.push(Command::EnableScissor(rect));
    }

    pub fn disable_scissor(&mut self) {
        self.push(Command::DisableScissor);
    }

    pub fn set_view_projection(&mut self, view: Mat4, projection: Mat4) {
        self.push(Command::SetViewProjection { view, projection });
    }

    pub fn draw_shadows(&mut self, light_index: usize, split: ShadowSplitData) {
        self.push(Command::DrawShadows { light_index, split });
    }

    pub fn dispatch(&mut self, uniforms: KernelUniforms, bindings: &[BufferHandle], groups: [u32; 3]) {
        self.push(Command::Dispatch(DispatchCommand {
            uniforms,
            bindings: SmallVec::from_slice(bindings),
            groups,
        }));
    }

    pub fn compute_barrier(&mut self) {
        self.push(Command::ComputeBarrier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_empties_the_list() {
        let mut list = CommandList::new("Lighting");
        list.begin_sample("Lighting");
        list.set_global_float(ShaderProperty::ShadowBias, 0.1);
        list.end_sample("Lighting");
        assert_eq!(list.len(), 3);
        let taken = list.take();
        assert_eq!(taken.len(), 3);
        assert!(list.is_empty());
        assert_eq!(list.name(), "Lighting");
    }

    #[test]
    fn scissor_rect_inside_viewport() {
        let viewport = PixelRect::new(512.0, 0.0, 512.0, 512.0);
        assert!(viewport.contains(&PixelRect::new(516.0, 4.0, 504.0, 504.0)));
        assert!(!viewport.contains(&PixelRect::new(0.0, 0.0, 8.0, 8.0)));
    }
}
