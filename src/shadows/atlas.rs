use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};

use super::{atlas_split, shadow_map_size_vector, world_to_shadow_matrix, ShadowTile, MAX_SHADOW_TILES};
use crate::backend::{RenderContext, TextureHandle};
use crate::commands::CommandList;
use crate::error::LightingError;
use crate::globals::{ShaderKeywords, ShaderProperty};
use crate::scene::{DirectionalShadowRequest, LightKind, LightShadows, SceneQuery, ShadowFit};

const SAMPLE: &str = "Render Shadows";

/// What the tiled atlas pass produced this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasFrame {
    pub map: TextureHandle,
    pub split: u32,
    /// Tiles actually drawn.
    pub tiles: u32,
    pub hard: bool,
    pub soft: bool,
}

/// Packs every shadowed light except the cascaded main light into one square shadow map.
///
/// Per-light shadow data is `(strength, soft, tile offset x, tile offset y)`, offsets in
/// texture space. A light whose shadow cannot be fitted this frame gets strength 0 and
/// keeps its lighting.
#[derive(Debug, Clone, Copy)]
pub struct ShadowAtlasPlanner {
    map_size: u32,
    shadow_distance: f32,
}

impl ShadowAtlasPlanner {
    pub fn new(map_size: u32, shadow_distance: f32) -> Self {
        Self { map_size: map_size.max(1), shadow_distance }
    }

    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    /// Initial shadow data for a visible light: `(strength, soft, 0, 0)` when it has shadows
    /// enabled and something to cast them, zero otherwise. Point lights never shadow.
    pub fn shadow_data(scene: &dyn SceneQuery, light_index: usize) -> Vec4 {
        let Some(light) = scene.visible_lights().get(light_index) else {
            return Vec4::ZERO;
        };
        if light.kind == LightKind::Point || !light.casts_shadows() {
            return Vec4::ZERO;
        }
        if scene.shadow_caster_bounds(light_index).is_none() {
            return Vec4::ZERO;
        }
        let soft = if light.shadows == LightShadows::Soft { 1.0 } else { 0.0 };
        Vec4::new(light.shadow_strength, soft, 0.0, 0.0)
    }

    fn fit(&self, scene: &dyn SceneQuery, light_index: usize, tile_size: u32) -> Result<ShadowFit, LightingError> {
        let light = scene
            .visible_lights()
            .get(light_index)
            .ok_or(LightingError::ShadowUnavailable { light: light_index, reason: "not visible" })?;
        if scene.shadow_caster_bounds(light_index).is_none() {
            return Err(LightingError::ShadowUnavailable { light: light_index, reason: "no shadow casters in range" });
        }
        let fit = match light.kind {
            LightKind::Directional => scene.compute_directional_shadow(&DirectionalShadowRequest {
                light_index,
                split_index: 0,
                split_count: 1,
                split_ratios: Vec3::X,
                tile_size,
                near_plane_bias: light.shadow_near_plane,
            }),
            LightKind::Spot => scene.compute_spot_shadow(light_index),
            LightKind::Point => None,
        };
        fit.ok_or(LightingError::ShadowUnavailable { light: light_index, reason: "shadow projection could not be fitted" })
    }

    /// Draws the shadow casters of every light from `first_light` on whose shadow data has
    /// a positive strength, one tile each, then publishes the atlas globals.
    ///
    /// `tile_demand` is the number of lights that asked for a tile and picks the grid.
    /// Lights past the atlas capacity lose their shadow for the frame.
    pub fn render(
        &self,
        ctx: &mut dyn RenderContext,
        scene: &dyn SceneQuery,
        first_light: usize,
        tile_demand: u32,
        shadow_data: &mut [Vec4],
        commands: &mut CommandList,
    ) -> Result<AtlasFrame> {
        let split = atlas_split(tile_demand);
        let tile_size = self.map_size / split;
        let tile_scale = 1.0 / split as f32;
        let reversed_z = ctx.caps().reversed_z;

        let map = ctx.acquire_shadow_map(self.map_size)?;
        commands.set_render_target(map);
        commands.begin_sample(SAMPLE);
        commands.set_global_vector(
            ShaderProperty::GlobalShadowData,
            Vec4::new(tile_scale, self.shadow_distance * self.shadow_distance, 0.0, 0.0),
        );
        commands.clear_render_target(true, true);

        let mut world_to_shadow = vec![Mat4::ZERO; shadow_data.len()];
        let mut tile_index = 0u32;
        let mut hard = false;
        let mut soft = false;
        let last = scene.visible_lights().len().min(shadow_data.len());
        for light_index in first_light..last {
            if shadow_data[light_index].x <= 0.0 {
                continue;
            }
            if tile_index >= MAX_SHADOW_TILES.min(split * split) {
                log::debug!("Shadow atlas is full; light {light_index} renders unshadowed this frame");
                shadow_data[light_index].x = 0.0;
                continue;
            }
            let fit = match self.fit(scene, light_index, tile_size) {
                Ok(fit) => fit,
                Err(err) => {
                    log::debug!("{err}");
                    shadow_data[light_index].x = 0.0;
                    continue;
                }
            };

            let tile = ShadowTile::new(tile_index, split, tile_size as f32);
            tile.record(commands);
            let offset = tile.offset_f32() * tile_scale;
            shadow_data[light_index].z = offset.x;
            shadow_data[light_index].w = offset.y;

            let light = &scene.visible_lights()[light_index];
            commands.set_view_projection(fit.view, fit.projection);
            commands.set_global_float(ShaderProperty::ShadowBias, light.shadow_bias);
            commands.draw_shadows(light_index, fit.split);
            world_to_shadow[light_index] = world_to_shadow_matrix(fit.view, fit.projection, reversed_z);

            tile_index += 1;
            if shadow_data[light_index].y <= 0.0 {
                hard = true;
            } else {
                soft = true;
            }
        }

        commands.disable_scissor();
        commands.set_global_texture(ShaderProperty::ShadowMap, map);
        commands.set_global_vector_array(ShaderProperty::ShadowData, shadow_data);
        commands.set_global_matrix_array(ShaderProperty::WorldToShadowMatrices, &world_to_shadow);
        commands.set_global_vector(ShaderProperty::ShadowMapSize, shadow_map_size_vector(self.map_size));
        commands.set_keyword(ShaderKeywords::SHADOWS_HARD, hard);
        commands.set_keyword(ShaderKeywords::SHADOWS_SOFT, soft);
        commands.end_sample(SAMPLE);

        Ok(AtlasFrame { map, split, tiles: tile_index, hard, soft })
    }
}
