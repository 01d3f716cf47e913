use anyhow::Result;
use glam::{Vec3, Vec4};
use smallvec::SmallVec;

use super::CameraFrameReport;
use crate::backend::{RenderContext, TextureHandle};
use crate::camera::CullingParameters;
use crate::commands::CommandList;
use crate::config::LightingConfig;
use crate::globals::{ShaderKeywords, ShaderProperty};
use crate::light_packer::{light_index_map, LightPacker, PackedLights};
use crate::scene::{LightKind, SceneQuery};
use crate::shadows::{AtlasFrame, CascadeBuilder, CascadeFrame, ShadowAtlasPlanner};

const SAMPLE: &str = "Render Camera";

/// Outcome of packing the visible lights and deciding who casts shadows where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightSetup {
    pub visible: usize,
    pub packed: usize,
    /// Visibility index 0 renders through the cascade atlas.
    pub main_light_cascaded: bool,
    /// Lights asking for a tile in the shared atlas.
    pub tile_demand: u32,
}

/// What the shadow passes produced for the frame.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ShadowPasses {
    pub setup: LightSetup,
    pub atlas: Option<AtlasFrame>,
    pub cascades: Option<CascadeFrame>,
}

/// Forward path with per-object light lists: at most eight lights, tiled shadows, and
/// cascades for a shadowed directional light in slot 0.
pub struct ForwardRenderer {
    packer: LightPacker,
    packed: PackedLights,
    shadow_data: Vec<Vec4>,
    cascade_count: u32,
    cascade_split: Vec3,
    shadow_map_size: u32,
    commands: CommandList,
    shadow_maps: SmallVec<[TextureHandle; 2]>,
    truncation_warned: bool,
}

impl ForwardRenderer {
    pub fn new(config: &LightingConfig) -> Self {
        let capacity = config.per_object_light_limit();
        Self {
            packer: LightPacker::new(capacity),
            packed: PackedLights::zeroed(capacity),
            shadow_data: vec![Vec4::ZERO; capacity],
            cascade_count: config.cascade_count(),
            cascade_split: config.cascade_split_ratios(),
            shadow_map_size: config.shadow_map_size.pixels(),
            commands: CommandList::new(SAMPLE),
            shadow_maps: SmallVec::new(),
            truncation_warned: false,
        }
    }

    pub fn packed(&self) -> &PackedLights {
        &self.packed
    }

    pub fn shadow_data(&self) -> &[Vec4] {
        &self.shadow_data
    }

    /// Packs the visible lights, computes each light's initial shadow data and hands the
    /// scene an index map when lights overflow the per-object capacity.
    pub fn configure_lights(&mut self, scene: &mut dyn SceneQuery) -> LightSetup {
        self.packed.clear();
        self.shadow_data.iter_mut().for_each(|slot| *slot = Vec4::ZERO);

        let lights = scene.visible_lights();
        let visible = lights.len();
        let packed = self.packer.pack(lights, &mut self.packed);
        let mut setup = LightSetup { visible, packed, ..LightSetup::default() };
        for index in 0..packed {
            if lights[index].kind == LightKind::Point {
                continue;
            }
            let shadow = ShadowAtlasPlanner::shadow_data(&*scene, index);
            if shadow.x > 0.0 {
                setup.tile_demand += 1;
                if index == 0 && lights[index].kind == LightKind::Directional && self.cascade_count > 0 {
                    setup.main_light_cascaded = true;
                    setup.tile_demand -= 1;
                }
            }
            self.shadow_data[index] = shadow;
        }

        if visible > packed && !self.truncation_warned {
            log::warn!(
                "{} visible light(s) exceed the per-object light limit ({}); the extra lights are left unlit",
                visible - packed,
                self.packer.capacity()
            );
            self.truncation_warned = true;
        } else if visible <= packed {
            self.truncation_warned = false;
        }
        if let Some(map) = light_index_map(visible, self.packer.capacity(), setup.main_light_cascaded) {
            scene.set_light_index_map(map);
        }
        setup
    }

    /// Records light setup and both shadow passes into `commands`. Shadow maps acquired
    /// here stay live until [`finish`](Self::finish) or [`abort`](Self::abort).
    pub(crate) fn record(
        &mut self,
        ctx: &mut dyn RenderContext,
        params: &CullingParameters,
        scene: &mut dyn SceneQuery,
        commands: &mut CommandList,
    ) -> Result<ShadowPasses> {
        let mut passes = ShadowPasses::default();
        if scene.visible_lights().is_empty() {
            self.packed.clear();
            commands.set_global_vector(ShaderProperty::LightData, Vec4::ZERO);
            for keyword in [
                ShaderKeywords::CASCADED_SHADOWS_HARD,
                ShaderKeywords::CASCADED_SHADOWS_SOFT,
                ShaderKeywords::SHADOWS_HARD,
                ShaderKeywords::SHADOWS_SOFT,
            ] {
                commands.set_keyword(keyword, false);
            }
            self.publish_lights(commands);
            return Ok(passes);
        }

        passes.setup = self.configure_lights(scene);
        let setup = passes.setup;

        if setup.main_light_cascaded {
            let builder =
                CascadeBuilder::new(self.shadow_map_size, params.shadow_distance, self.cascade_count, self.cascade_split);
            let frame = builder.render(ctx, &*scene, 0, commands)?;
            self.shadow_maps.push(frame.map);
            passes.cascades = Some(frame);
        } else {
            commands.set_keyword(ShaderKeywords::CASCADED_SHADOWS_HARD, false);
            commands.set_keyword(ShaderKeywords::CASCADED_SHADOWS_SOFT, false);
        }

        if setup.tile_demand > 0 {
            let planner = ShadowAtlasPlanner::new(self.shadow_map_size, params.shadow_distance);
            let first = usize::from(setup.main_light_cascaded);
            let frame = planner.render(ctx, &*scene, first, setup.tile_demand, &mut self.shadow_data, commands)?;
            self.shadow_maps.push(frame.map);
            passes.atlas = Some(frame);
        } else {
            commands.set_keyword(ShaderKeywords::SHADOWS_HARD, false);
            commands.set_keyword(ShaderKeywords::SHADOWS_SOFT, false);
        }

        commands.set_global_vector(ShaderProperty::LightData, Vec4::new(0.0, setup.packed as f32, 0.0, 0.0));
        self.publish_lights(commands);
        Ok(passes)
    }

    fn publish_lights(&self, commands: &mut CommandList) {
        commands.set_global_vector_array(ShaderProperty::VisibleLightColors, &self.packed.colors);
        commands.set_global_vector_array(
            ShaderProperty::VisibleLightDirectionsOrPositions,
            &self.packed.directions_or_positions,
        );
        commands.set_global_vector_array(ShaderProperty::VisibleLightAttenuations, &self.packed.attenuations);
        commands.set_global_vector_array(ShaderProperty::VisibleLightSpotDirections, &self.packed.spot_directions);
    }

    /// Submits the camera and returns this frame's shadow maps to the pool.
    pub(crate) fn finish(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        ctx.submit()?;
        self.release_shadow_maps(ctx)
    }

    fn release_shadow_maps(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        for map in self.shadow_maps.drain(..) {
            ctx.release_shadow_map(map)?;
        }
        Ok(())
    }

    pub fn abort(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        self.commands.clear();
        self.release_shadow_maps(ctx)
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
        let passes = self.record(ctx, params, scene, commands)?;
        commands.end_sample(SAMPLE);
        ctx.execute(commands)?;
        self.finish(ctx)?;
        Ok(passes.report())
    }
}

impl ShadowPasses {
    pub(crate) fn report(&self) -> CameraFrameReport {
        CameraFrameReport {
            camera: None,
            visible_lights: self.setup.visible,
            packed_lights: self.setup.packed,
            main_light_cascaded: self.setup.main_light_cascaded,
            atlas: self.atlas,
            cascades: self.cascades,
            clusters: None,
        }
    }
}
