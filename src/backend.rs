//! Executors for recorded command lists.

mod gpu;
mod host;

use anyhow::Result;

use crate::commands::CommandList;
use crate::globals::ShaderGlobals;

pub use gpu::{ShadowCasterDraw, ShadowCasterRenderer, WgpuContext, SHADOW_MAP_FORMAT};
pub use host::{HostContext, ShadowDrawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCaps {
    /// Depth is cleared to 0 and compares greater-or-equal.
    pub reversed_z: bool,
}

/// Device seam the lighting passes record against. Buffers written with
/// [`write_buffer`](Self::write_buffer) become visible to the next executed dispatch.
pub trait RenderContext {
    fn caps(&self) -> DeviceCaps;

    fn create_buffer(&mut self, label: &'static str, size: u64) -> Result<BufferHandle>;

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()>;

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64>;

    fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Borrows a square depth target from the temporary pool.
    fn acquire_shadow_map(&mut self, size: u32) -> Result<TextureHandle>;

    fn release_shadow_map(&mut self, handle: TextureHandle) -> Result<()>;

    /// Runs every recorded command in order and clears the list.
    fn execute(&mut self, commands: &mut CommandList) -> Result<()>;

    /// Ends the current camera's work.
    fn submit(&mut self) -> Result<()>;

    fn globals(&self) -> &ShaderGlobals;
}

/// Returns the buffer in `slot`, recreating it when its size differs from `size`.
/// The flag is true when a new buffer was created.
pub fn ensure_buffer(
    ctx: &mut dyn RenderContext,
    slot: &mut Option<BufferHandle>,
    label: &'static str,
    size: u64,
) -> Result<(BufferHandle, bool)> {
    if let Some(handle) = *slot {
        if ctx.buffer_size(handle) == Some(size) {
            return Ok((handle, false));
        }
        ctx.release_buffer(handle)?;
        *slot = None;
    }
    let handle = ctx.create_buffer(label, size)?;
    *slot = Some(handle);
    Ok((handle, true))
}
