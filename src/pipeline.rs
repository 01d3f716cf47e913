//! Frame driver: one renderer per camera, cameras rendered in the order given.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use crate::backend::RenderContext;
use crate::camera::{Camera, CameraId};
use crate::config::LightingConfig;
use crate::error::LightingError;
use crate::renderer::{CameraFrameReport, CameraRenderer, RendererKind};
use crate::scene::CullingSource;

#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub cameras: Vec<CameraFrameReport>,
    /// Cameras skipped because their view state could not produce a frustum.
    pub skipped: Vec<CameraId>,
}

pub struct LightingPipeline {
    config: LightingConfig,
    renderers: HashMap<CameraId, CameraRenderer>,
}

impl LightingPipeline {
    pub fn new(config: LightingConfig) -> Self {
        Self { config, renderers: HashMap::new() }
    }

    pub fn config(&self) -> &LightingConfig {
        &self.config
    }

    pub fn renderer(&self, camera: CameraId) -> Option<&CameraRenderer> {
        self.renderers.get(&camera)
    }

    pub fn renderer_count(&self) -> usize {
        self.renderers.len()
    }

    /// Swaps the configuration. Renderers are rebuilt lazily on the next frame.
    pub fn set_config(&mut self, ctx: &mut dyn RenderContext, config: LightingConfig) -> Result<()> {
        self.release_all(ctx)?;
        self.config = config;
        Ok(())
    }

    /// Culls and renders every camera. A degenerate camera is skipped with a warning.
    /// Any other error ends the frame: the failing camera's temporaries are returned,
    /// the remaining cameras are not rendered and the error is returned with the camera id.
    pub fn render_frame<S: CullingSource>(
        &mut self,
        ctx: &mut dyn RenderContext,
        cameras: &[Camera],
        source: &mut S,
    ) -> Result<FrameReport> {
        let mut report = FrameReport::default();
        let mut seen = HashSet::with_capacity(cameras.len());
        let kind = self.config.renderer_kind();

        for camera in cameras {
            let params = match camera.culling_parameters(self.config.shadow_distance) {
                Ok(params) => params,
                Err(err @ LightingError::DegenerateCamera { .. }) => {
                    log::warn!("Skipping camera: {err}");
                    report.skipped.push(camera.id);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            seen.insert(camera.id);

            if self.renderers.get(&camera.id).is_some_and(|renderer| renderer.kind() != kind) {
                if let Some(mut stale) = self.renderers.remove(&camera.id) {
                    stale.release(ctx)?;
                }
            }
            let config = &self.config;
            let renderer = self.renderers.entry(camera.id).or_insert_with(|| CameraRenderer::new(kind, config));

            let mut scene = source.cull(&params);
            match renderer.render(ctx, &params, &mut scene) {
                Ok(camera_report) => report.cameras.push(camera_report),
                Err(err) => {
                    if let Err(abort_err) = renderer.abort(ctx) {
                        log::warn!("Failed to release temporaries for camera {:?}: {abort_err:?}", camera.id);
                    }
                    return Err(err).with_context(|| format!("Failed to render camera {:?}", camera.id));
                }
            }
        }

        self.retain_cameras(ctx, &seen)?;
        Ok(report)
    }

    fn retain_cameras(&mut self, ctx: &mut dyn RenderContext, seen: &HashSet<CameraId>) -> Result<()> {
        let stale: Vec<CameraId> = self.renderers.keys().filter(|id| !seen.contains(id)).copied().collect();
        for id in stale {
            if let Some(mut renderer) = self.renderers.remove(&id) {
                log::debug!("Dropping lighting renderer for camera {id:?}");
                renderer.release(ctx)?;
            }
        }
        Ok(())
    }

    /// Frees every buffer held by the per-camera renderers.
    pub fn release_all(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        for (_, mut renderer) in self.renderers.drain() {
            renderer.release(ctx)?;
        }
        Ok(())
    }
}
