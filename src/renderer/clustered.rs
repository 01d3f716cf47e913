use anyhow::Result;

use super::forward::ForwardRenderer;
use super::CameraFrameReport;
use crate::backend::RenderContext;
use crate::camera::CullingParameters;
use crate::clusters::{ClusterGridBuilder, ClusterLightCuller};
use crate::commands::CommandList;
use crate::config::LightingConfig;
use crate::scene::SceneQuery;

const SAMPLE: &str = "Render Camera (Clustered)";

/// Forward+ path: the per-object light arrays and shadow atlases of the forward path,
/// plus every visible light binned into the view-space cluster grid.
pub struct ClusteredRenderer {
    forward: ForwardRenderer,
    grid: ClusterGridBuilder,
    culler: ClusterLightCuller,
    commands: CommandList,
}

impl ClusteredRenderer {
    pub fn new(config: &LightingConfig) -> Self {
        Self {
            forward: ForwardRenderer::new(config),
            grid: ClusterGridBuilder::new(config.cluster.clone()),
            culler: ClusterLightCuller::new(config.cluster.clone()),
            commands: CommandList::new(SAMPLE),
        }
    }

    pub fn culler(&self) -> &ClusterLightCuller {
        &self.culler
    }

    pub fn render(
        &mut self,
        ctx: &mut dyn RenderContext,
        params: &CullingParameters,
        scene: &mut dyn SceneQuery,
    ) -> Result<CameraFrameReport> {
        let mut commands = std::mem::take(&mut self.commands);
        let result = self.render_with(ctx, params, scene, &mut commands);
        commands.clear();
        self.commands = commands;
        result
    }

    fn render_with(
        &mut self,
        ctx: &mut dyn RenderContext,
        params: &CullingParameters,
        scene: &mut dyn SceneQuery,
        commands: &mut CommandList,
    ) -> Result<CameraFrameReport> {
        commands.begin_sample(SAMPLE);
        let passes = self.forward.record(ctx, params, scene, commands)?;

        self.culler.build_light_buffer(ctx, scene.visible_lights())?;
        let grid = self.grid.prepare(ctx, params, commands)?;
        self.culler.attach_grid(&grid)?;
        self.culler.cull(ctx, &grid, params.view, commands)?;
        self.culler.publish(&grid, commands)?;
        commands.end_sample(SAMPLE);

        ctx.execute(commands)?;
        self.forward.finish(ctx)?;

        let mut report = passes.report();
        report.clusters = Some(*self.culler.metrics());
        Ok(report)
    }

    pub fn abort(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        self.commands.clear();
        self.culler.reset();
        self.forward.abort(ctx)
    }

    pub fn release(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        self.abort(ctx)?;
        self.grid.release(ctx)?;
        self.culler.release(ctx)
    }
}
