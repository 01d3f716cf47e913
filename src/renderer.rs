//! Per-camera lighting renderers. One variant per render path, each owning its command
//! list, packed light arrays and GPU buffers, so no state is shared between cameras.

mod clustered;
mod deferred;
mod forward;

use anyhow::Result;

use crate::backend::RenderContext;
use crate::camera::{CameraId, CullingParameters};
use crate::clusters::ClusterMetrics;
use crate::config::LightingConfig;
use crate::scene::SceneQuery;
use crate::shadows::{AtlasFrame, CascadeFrame};

pub use clustered::ClusteredRenderer;
pub use deferred::DeferredRenderer;
pub use forward::{ForwardRenderer, LightSetup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendererKind {
    Forward,
    Clustered,
    Deferred,
}

/// Summary of one camera's lighting work for the frame.
#[derive(Debug, Clone, Default)]
pub struct CameraFrameReport {
    pub camera: Option<CameraId>,
    pub visible_lights: usize,
    pub packed_lights: usize,
    pub main_light_cascaded: bool,
    pub atlas: Option<AtlasFrame>,
    pub cascades: Option<CascadeFrame>,
    pub clusters: Option<ClusterMetrics>,
}

pub enum CameraRenderer {
    Forward(ForwardRenderer),
    Clustered(ClusteredRenderer),
    Deferred(DeferredRenderer),
}

impl CameraRenderer {
    pub fn new(kind: RendererKind, config: &LightingConfig) -> Self {
        match kind {
            RendererKind::Forward => CameraRenderer::Forward(ForwardRenderer::new(config)),
            RendererKind::Clustered => CameraRenderer::Clustered(ClusteredRenderer::new(config)),
            RendererKind::Deferred => CameraRenderer::Deferred(DeferredRenderer::new(config)),
        }
    }

    pub fn kind(&self) -> RendererKind {
        match self {
            CameraRenderer::Forward(_) => RendererKind::Forward,
            CameraRenderer::Clustered(_) => RendererKind::Clustered,
            CameraRenderer::Deferred(_) => RendererKind::Deferred,
        }
    }

    /// Records, executes and submits the camera's lighting work.
    pub fn render(
        &mut self,
        ctx: &mut dyn RenderContext,
        params: &CullingParameters,
        scene: &mut dyn SceneQuery,
    ) -> Result<CameraFrameReport> {
        let mut report = match self {
            CameraRenderer::Forward(renderer) => renderer.render(ctx, params, scene),
            CameraRenderer::Clustered(renderer) => renderer.render(ctx, params, scene),
            CameraRenderer::Deferred(renderer) => renderer.render(ctx, scene),
        }?;
        report.camera = Some(params.camera);
        Ok(report)
    }

    /// Returns temporaries after a failed frame so the next one starts clean.
    pub fn abort(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        match self {
            CameraRenderer::Forward(renderer) => renderer.abort(ctx),
            CameraRenderer::Clustered(renderer) => renderer.abort(ctx),
            CameraRenderer::Deferred(renderer) => {
                renderer.abort();
                Ok(())
            }
        }
    }

    /// Frees every buffer the renderer owns.
    pub fn release(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        match self {
            CameraRenderer::Forward(renderer) => renderer.abort(ctx),
            CameraRenderer::Clustered(renderer) => renderer.release(ctx),
            CameraRenderer::Deferred(_) => Ok(()),
        }
    }
}
