use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};

use super::{
    cascade_tile_matrix, shadow_map_size_vector, world_to_shadow_matrix, ShadowTile, CASCADE_ATLAS_SPLIT,
    MAX_CASCADES,
};
use crate::backend::{RenderContext, TextureHandle};
use crate::commands::CommandList;
use crate::error::LightingError;
use crate::globals::{ShaderKeywords, ShaderProperty};
use crate::scene::{DirectionalShadowRequest, LightShadows, SceneQuery};

const SAMPLE: &str = "Render Cascaded Shadows";

/// Width of each cascade as a fraction of the shadow distance: ratios clamped to
/// `[0, 1]`, made non-decreasing, then differenced. The result never sums past 1.
pub fn cascade_split_fractions(ratios: Vec3) -> [f32; 3] {
    let mut previous = 0.0f32;
    ratios.to_array().map(|ratio| {
        let boundary = previous.max(ratio.clamp(0.0, 1.0));
        let fraction = boundary - previous;
        previous = boundary;
        fraction
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeFrame {
    pub map: TextureHandle,
    pub cascades: u32,
    /// `(center, radius²)` per cascade.
    pub culling_spheres: [Vec4; MAX_CASCADES],
    /// One matrix per cascade plus the entry sampled past the last cascade.
    pub matrices: [Mat4; MAX_CASCADES + 1],
}

/// Renders the main directional light's cascades into a 2x2 atlas.
#[derive(Debug, Clone, Copy)]
pub struct CascadeBuilder {
    map_size: u32,
    shadow_distance: f32,
    cascade_count: u32,
    split_ratios: Vec3,
}

impl CascadeBuilder {
    pub fn new(map_size: u32, shadow_distance: f32, cascade_count: u32, split_ratios: Vec3) -> Self {
        Self {
            map_size: map_size.max(CASCADE_ATLAS_SPLIT),
            shadow_distance,
            cascade_count: cascade_count.min(MAX_CASCADES as u32),
            split_ratios,
        }
    }

    pub fn cascade_count(&self) -> u32 {
        self.cascade_count
    }

    /// Matrix for fragments beyond the last cascade. On reversed-depth devices every such
    /// fragment lands at depth 0 and reads as lit.
    pub fn beyond_last_cascade(reversed_z: bool) -> Mat4 {
        if reversed_z {
            let mut matrix = Mat4::ZERO;
            matrix.w_axis.w = 1.0;
            matrix
        } else {
            Mat4::ZERO
        }
    }

    pub fn render(
        &self,
        ctx: &mut dyn RenderContext,
        scene: &dyn SceneQuery,
        light_index: usize,
        commands: &mut CommandList,
    ) -> Result<CascadeFrame> {
        let light = scene
            .visible_lights()
            .get(light_index)
            .ok_or(LightingError::ShadowUnavailable { light: light_index, reason: "not visible" })?;
        let reversed_z = ctx.caps().reversed_z;
        let tile_size = self.map_size / CASCADE_ATLAS_SPLIT;

        let map = ctx.acquire_shadow_map(self.map_size)?;
        commands.set_render_target(map);
        commands.begin_sample(SAMPLE);
        commands.set_global_vector(
            ShaderProperty::GlobalShadowData,
            Vec4::new(0.0, self.shadow_distance * self.shadow_distance, 0.0, 0.0),
        );
        commands.clear_render_target(true, true);
        commands.set_global_float(ShaderProperty::ShadowBias, light.shadow_bias);

        let mut culling_spheres = [Vec4::ZERO; MAX_CASCADES];
        let mut matrices = [Mat4::ZERO; MAX_CASCADES + 1];
        matrices[MAX_CASCADES] = Self::beyond_last_cascade(reversed_z);
        let mut rendered = 0;
        for cascade in 0..self.cascade_count {
            let request = DirectionalShadowRequest {
                light_index,
                split_index: cascade,
                split_count: self.cascade_count,
                split_ratios: self.split_ratios,
                tile_size,
                near_plane_bias: light.shadow_near_plane,
            };
            let Some(fit) = scene.compute_directional_shadow(&request) else {
                log::debug!("Cascade {cascade} of light {light_index} could not be fitted");
                continue;
            };

            let tile = ShadowTile::new(cascade, CASCADE_ATLAS_SPLIT, tile_size as f32);
            tile.record(commands);
            commands.set_view_projection(fit.view, fit.projection);

            let sphere = fit.split.culling_sphere;
            culling_spheres[cascade as usize] = Vec4::new(sphere.x, sphere.y, sphere.z, sphere.w * sphere.w);
            commands.draw_shadows(light_index, fit.split);

            let world_to_shadow = world_to_shadow_matrix(fit.view, fit.projection, reversed_z);
            matrices[cascade as usize] = cascade_tile_matrix(tile.offset_f32()) * world_to_shadow;
            rendered += 1;
        }

        commands.disable_scissor();
        commands.set_global_texture(ShaderProperty::CascadedShadowMap, map);
        commands.set_global_vector_array(ShaderProperty::CascadeCullingSpheres, &culling_spheres);
        commands.set_global_matrix_array(ShaderProperty::WorldToShadowCascadeMatrices, &matrices);
        commands.set_global_vector(ShaderProperty::CascadedShadowMapSize, shadow_map_size_vector(self.map_size));
        commands.set_global_float(ShaderProperty::CascadedShadowStrength, light.shadow_strength);
        let hard = light.shadows == LightShadows::Hard;
        commands.set_keyword(ShaderKeywords::CASCADED_SHADOWS_HARD, hard);
        commands.set_keyword(ShaderKeywords::CASCADED_SHADOWS_SOFT, !hard);
        commands.end_sample(SAMPLE);

        Ok(CascadeFrame { map, cascades: rendered, culling_spheres, matrices })
    }
}
