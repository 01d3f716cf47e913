use std::collections::HashMap;

use bitflags::bitflags;
use glam::{Mat4, Vec4};

use crate::backend::{BufferHandle, TextureHandle};

/// Shader-visible properties published by the lighting passes. The set is closed and
/// resolved at compile time, so there is no per-frame name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderProperty {
    VisibleLightColors,
    VisibleLightDirectionsOrPositions,
    VisibleLightAttenuations,
    VisibleLightSpotDirections,
    VisibleLightCount,
    /// Frame-wide `(0, packed per-object light count, 0, 0)`; all zero when no light is visible.
    LightData,
    ShadowMap,
    ShadowMapSize,
    ShadowData,
    ShadowBias,
    GlobalShadowData,
    WorldToShadowMatrices,
    CascadedShadowMap,
    CascadedShadowMapSize,
    CascadedShadowStrength,
    CascadeCullingSpheres,
    WorldToShadowCascadeMatrices,
    ClusterLights,
    ClusterLightIndexList,
    ClusterLightGrid,
    ClusterTileSize,
    ClusterCount,
    ClusterCellSize,
    ClusterScreenSize,
}

impl ShaderProperty {
    pub const fn name(self) -> &'static str {
        match self {
            ShaderProperty::VisibleLightColors => "visible_light_colors",
            ShaderProperty::VisibleLightDirectionsOrPositions => "visible_light_directions_or_positions",
            ShaderProperty::VisibleLightAttenuations => "visible_light_attenuations",
            ShaderProperty::VisibleLightSpotDirections => "visible_light_spot_directions",
            ShaderProperty::VisibleLightCount => "visible_light_count",
            ShaderProperty::LightData => "light_data",
            ShaderProperty::ShadowMap => "shadow_map",
            ShaderProperty::ShadowMapSize => "shadow_map_size",
            ShaderProperty::ShadowData => "shadow_data",
            ShaderProperty::ShadowBias => "shadow_bias",
            ShaderProperty::GlobalShadowData => "global_shadow_data",
            ShaderProperty::WorldToShadowMatrices => "world_to_shadow_matrices",
            ShaderProperty::CascadedShadowMap => "cascaded_shadow_map",
            ShaderProperty::CascadedShadowMapSize => "cascaded_shadow_map_size",
            ShaderProperty::CascadedShadowStrength => "cascaded_shadow_strength",
            ShaderProperty::CascadeCullingSpheres => "cascade_culling_spheres",
            ShaderProperty::WorldToShadowCascadeMatrices => "world_to_shadow_cascade_matrices",
            ShaderProperty::ClusterLights => "cluster_lights",
            ShaderProperty::ClusterLightIndexList => "cluster_light_index_list",
            ShaderProperty::ClusterLightGrid => "cluster_light_grid",
            ShaderProperty::ClusterTileSize => "cluster_tile_size",
            ShaderProperty::ClusterCount => "cluster_count",
            ShaderProperty::ClusterCellSize => "cluster_cell_size",
            ShaderProperty::ClusterScreenSize => "cluster_screen_size",
        }
    }
}

bitflags! {
    /// Shader feature toggles driven by the shadow passes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderKeywords: u32 {
        const SHADOWS_HARD = 1 << 0;
        const SHADOWS_SOFT = 1 << 1;
        const CASCADED_SHADOWS_HARD = 1 << 2;
        const CASCADED_SHADOWS_SOFT = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShaderValue {
    Float(f32),
    Int(i32),
    Vector(Vec4),
    VectorArray(Vec<Vec4>),
    MatrixArray(Vec<Mat4>),
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

/// Shader-global state as last published by an executed command list.
#[derive(Debug, Clone, Default)]
pub struct ShaderGlobals {
    values: HashMap<ShaderProperty, ShaderValue>,
    keywords: ShaderKeywords,
}

impl ShaderGlobals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, property: ShaderProperty, value: ShaderValue) {
        self.values.insert(property, value);
    }

    pub fn get(&self, property: ShaderProperty) -> Option<&ShaderValue> {
        self.values.get(&property)
    }

    pub fn float(&self, property: ShaderProperty) -> Option<f32> {
        match self.values.get(&property) {
            Some(ShaderValue::Float(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn int(&self, property: ShaderProperty) -> Option<i32> {
        match self.values.get(&property) {
            Some(ShaderValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn vector(&self, property: ShaderProperty) -> Option<Vec4> {
        match self.values.get(&property) {
            Some(ShaderValue::Vector(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn vector_array(&self, property: ShaderProperty) -> Option<&[Vec4]> {
        match self.values.get(&property) {
            Some(ShaderValue::VectorArray(values)) => Some(values),
            _ => None,
        }
    }

    pub fn matrix_array(&self, property: ShaderProperty) -> Option<&[Mat4]> {
        match self.values.get(&property) {
            Some(ShaderValue::MatrixArray(values)) => Some(values),
            _ => None,
        }
    }

    pub fn texture(&self, property: ShaderProperty) -> Option<TextureHandle> {
        match self.values.get(&property) {
            Some(ShaderValue::Texture(handle)) => Some(*handle),
            _ => None,
        }
    }

    pub fn buffer(&self, property: ShaderProperty) -> Option<BufferHandle> {
        match self.values.get(&property) {
            Some(ShaderValue::Buffer(handle)) => Some(*handle),
            _ => None,
        }
    }

    pub fn set_keyword(&mut self, keyword: ShaderKeywords, enabled: bool) {
        self.keywords.set(keyword, enabled);
    }

    pub fn keywords(&self) -> ShaderKeywords {
        self.keywords
    }

    pub fn is_enabled(&self, keyword: ShaderKeywords) -> bool {
        self.keywords.contains(keyword)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.keywords = ShaderKeywords::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_reject_mismatched_values() {
        let mut globals = ShaderGlobals::new();
        globals.set(ShaderProperty::ShadowBias, ShaderValue::Float(0.05));
        assert_eq!(globals.float(ShaderProperty::ShadowBias), Some(0.05));
        assert_eq!(globals.vector(ShaderProperty::ShadowBias), None);
        assert_eq!(globals.int(ShaderProperty::VisibleLightCount), None);
    }

    #[test]
    fn keywords_toggle_independently() {
        let mut globals = ShaderGlobals::new();
        globals.set_keyword(ShaderKeywords::SHADOWS_HARD, true);
        globals.set_keyword(ShaderKeywords::CASCADED_SHADOWS_SOFT, true);
        globals.set_keyword(ShaderKeywords::SHADOWS_HARD, false);
        assert_eq!(globals.keywords(), ShaderKeywords::CASCADED_SHADOWS_SOFT);
    }

    #[test]
    fn property_names_are_unique() {
        use std::collections::HashSet;
        let all = [
            ShaderProperty::VisibleLightColors,
            ShaderProperty::VisibleLightDirectionsOrPositions,
            ShaderProperty::VisibleLightAttenuations,
            ShaderProperty::VisibleLightSpotDirections,
            ShaderProperty::VisibleLightCount,
            ShaderProperty::LightData,
            ShaderProperty::ShadowMap,
            ShaderProperty::ShadowMapSize,
            ShaderProperty::ShadowData,
            ShaderProperty::ShadowBias,
            ShaderProperty::GlobalShadowData,
            ShaderProperty::WorldToShadowMatrices,
            ShaderProperty::CascadedShadowMap,
            ShaderProperty::CascadedShadowMapSize,
            ShaderProperty::CascadedShadowStrength,
            ShaderProperty::CascadeCullingSpheres,
            ShaderProperty::WorldToShadowCascadeMatrices,
            ShaderProperty::ClusterLights,
            ShaderProperty::ClusterLightIndexList,
            ShaderProperty::ClusterLightGrid,
            ShaderProperty::ClusterTileSize,
            ShaderProperty::ClusterCount,
            ShaderProperty::ClusterCellSize,
            ShaderProperty::ClusterScreenSize,
        ];
        let names: HashSet<_> = all.iter().map(|property| property.name()).collect();
        assert_eq!(names.len(), all.len());
    }
}
