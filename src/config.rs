use anyhow::{Context, Result};
use glam::Vec3;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::num::NonZeroU32;
use std::path::Path;

use crate::light_packer::MAX_PER_OBJECT_LIGHTS;
use crate::renderer::RendererKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u32")]
pub enum ShadowMapSize {
    S256,
    S512,
    S1024,
    S2048,
    S4096,
}

impl ShadowMapSize {
    pub const fn pixels(self) -> u32 {
        match self {
            ShadowMapSize::S256 => 256,
            ShadowMapSize::S512 => 512,
            ShadowMapSize::S1024 => 1024,
            ShadowMapSize::S2048 => 2048,
            ShadowMapSize::S4096 => 4096,
        }
    }
}

impl TryFrom<u32> for ShadowMapSize {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            256 => Ok(ShadowMapSize::S256),
            512 => Ok(ShadowMapSize::S512),
            1024 => Ok(ShadowMapSize::S1024),
            2048 => Ok(ShadowMapSize::S2048),
            4096 => Ok(ShadowMapSize::S4096),
            other => Err(format!("unsupported shadow map size {other} (expected 256..4096, power of two)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u32")]
pub enum ShadowCascades {
    Zero,
    Two,
    Four,
}

impl ShadowCascades {
    pub const fn count(self) -> u32 {
        match self {
            ShadowCascades::Zero => 0,
            ShadowCascades::Two => 2,
            ShadowCascades::Four => 4,
        }
    }
}

impl TryFrom<u32> for ShadowCascades {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ShadowCascades::Zero),
            2 => Ok(ShadowCascades::Two),
            4 => Ok(ShadowCascades::Four),
            other => Err(format!("unsupported cascade count {other} (expected 0, 2 or 4)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderPath {
    #[default]
    Forward,
    Deferred,
}

/// Cluster grid sizing. Every field must be nonzero in a loaded config.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "ClusterConfig::default_tile_size", deserialize_with = "nonzero")]
    pub tile_size: u32,
    #[serde(default = "ClusterConfig::default_z_slices", deserialize_with = "nonzero")]
    pub z_slices: u32,
    #[serde(default = "ClusterConfig::default_max_lights", deserialize_with = "nonzero")]
    pub max_lights: u32,
    #[serde(default = "ClusterConfig::default_index_entries_per_cluster", deserialize_with = "nonzero")]
    pub index_entries_per_cluster: u32,
}

fn nonzero<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    NonZeroU32::deserialize(deserializer).map(NonZeroU32::get)
}

#[derive(Debug, Clone, Deserialize)]
pub struct LightingConfig {
    #[serde(default = "LightingConfig::default_shadow_map_size")]
    pub shadow_map_size: ShadowMapSize,
    #[serde(default = "LightingConfig::default_shadow_distance")]
    pub shadow_distance: f32,
    #[serde(default = "LightingConfig::default_shadow_cascades")]
    pub shadow_cascades: ShadowCascades,
    #[serde(default = "LightingConfig::default_two_cascade_split")]
    pub two_cascade_split: f32,
    #[serde(default = "LightingConfig::default_four_cascade_split")]
    pub four_cascade_split: [f32; 3],
    #[serde(default)]
    pub render_path: RenderPath,
    #[serde(default = "LightingConfig::default_forward_plus")]
    pub forward_plus: bool,
    #[serde(default = "LightingConfig::default_max_visible_lights")]
    pub max_visible_lights: usize,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Default)]
pub struct LightingConfigOverrides {
    pub shadow_map_size: Option<ShadowMapSize>,
    pub shadow_cascades: Option<ShadowCascades>,
    pub forward_plus: Option<bool>,
}

impl ClusterConfig {
    const fn default_tile_size() -> u32 {
        32
    }

    const fn default_z_slices() -> u32 {
        16
    }

    const fn default_max_lights() -> u32 {
        2048
    }

    const fn default_index_entries_per_cluster() -> u32 {
        1024
    }

    /// Tile edge in pixels as the grid uses it; a hand-built zero tile counts as one pixel.
    pub const fn tile_pixels(&self) -> u32 {
        if self.tile_size == 0 {
            1
        } else {
            self.tile_size
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            tile_size: Self::default_tile_size(),
            z_slices: Self::default_z_slices(),
            max_lights: Self::default_max_lights(),
            index_entries_per_cluster: Self::default_index_entries_per_cluster(),
        }
    }
}

impl LightingConfig {
    const fn default_shadow_map_size() -> ShadowMapSize {
        ShadowMapSize::S1024
    }

    const fn default_shadow_distance() -> f32 {
        100.0
    }

    const fn default_shadow_cascades() -> ShadowCascades {
        ShadowCascades::Four
    }

    const fn default_two_cascade_split() -> f32 {
        0.25
    }

    const fn default_four_cascade_split() -> [f32; 3] {
        [0.067, 0.2, 0.467]
    }

    const fn default_forward_plus() -> bool {
        true
    }

    const fn default_max_visible_lights() -> usize {
        MAX_PER_OBJECT_LIGHTS
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read lighting config {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse lighting config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Lighting config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &LightingConfigOverrides) {
        if let Some(size) = overrides.shadow_map_size {
            self.shadow_map_size = size;
        }
        if let Some(cascades) = overrides.shadow_cascades {
            self.shadow_cascades = cascades;
        }
        if let Some(forward_plus) = overrides.forward_plus {
            self.forward_plus = forward_plus;
        }
    }

    pub fn cascade_count(&self) -> u32 {
        self.shadow_cascades.count()
    }

    /// Split ratios handed to the cascade fit: the four-way vector for four cascades,
    /// otherwise `(two_split, 0, 0)`.
    pub fn cascade_split_ratios(&self) -> Vec3 {
        match self.shadow_cascades {
            ShadowCascades::Four => Vec3::from_array(self.four_cascade_split),
            _ => Vec3::new(self.two_cascade_split, 0.0, 0.0),
        }
    }

    pub fn per_object_light_limit(&self) -> usize {
        self.max_visible_lights.clamp(1, MAX_PER_OBJECT_LIGHTS)
    }

    pub fn renderer_kind(&self) -> RendererKind {
        match (self.render_path, self.forward_plus) {
            (RenderPath::Forward, true) => RendererKind::Clustered,
            (RenderPath::Forward, false) => RendererKind::Forward,
            (RenderPath::Deferred, _) => RendererKind::Deferred,
        }
    }
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            shadow_map_size: Self::default_shadow_map_size(),
            shadow_distance: Self::default_shadow_distance(),
            shadow_cascades: Self::default_shadow_cascades(),
            two_cascade_split: Self::default_two_cascade_split(),
            four_cascade_split: Self::default_four_cascade_split(),
            render_path: RenderPath::default(),
            forward_plus: Self::default_forward_plus(),
            max_visible_lights: Self::default_max_visible_lights(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl LightingConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.shadow_map_size.is_none() && self.shadow_cascades.is_none() && self.forward_plus.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: LightingConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg.shadow_map_size.pixels(), 1024);
        assert_eq!(cfg.cascade_count(), 4);
        assert_eq!(cfg.cluster.tile_size, 32);
        assert_eq!(cfg.cluster.z_slices, 16);
        assert_eq!(cfg.renderer_kind(), RendererKind::Clustered);
        assert_eq!(cfg.cascade_split_ratios(), Vec3::new(0.067, 0.2, 0.467));
    }

    #[test]
    fn two_cascades_use_single_split() {
        let cfg: LightingConfig =
            serde_json::from_str(r#"{ "shadow_cascades": 2, "two_cascade_split": 0.3 }"#).expect("parse");
        assert_eq!(cfg.cascade_split_ratios(), Vec3::new(0.3, 0.0, 0.0));
    }

    #[test]
    fn rejects_unsupported_enum_values() {
        assert!(serde_json::from_str::<LightingConfig>(r#"{ "shadow_map_size": 300 }"#).is_err());
        assert!(serde_json::from_str::<LightingConfig>(r#"{ "shadow_cascades": 3 }"#).is_err());
    }

    #[test]
    fn rejects_zero_cluster_sizes() {
        for field in ["tile_size", "z_slices", "max_lights", "index_entries_per_cluster"] {
            let json = format!(r#"{{ "cluster": {{ "{field}": 0 }} }}"#);
            assert!(serde_json::from_str::<LightingConfig>(&json).is_err(), "{field}");
        }
        let cfg: LightingConfig = serde_json::from_str(r#"{ "cluster": { "tile_size": 16 } }"#).expect("parse");
        assert_eq!(cfg.cluster.tile_pixels(), 16);
        assert_eq!(cfg.cluster.max_lights, 2048);
    }

    #[test]
    fn zero_tile_counts_as_one_pixel() {
        let cluster = ClusterConfig { tile_size: 0, ..ClusterConfig::default() };
        assert_eq!(cluster.tile_pixels(), 1);
    }

    #[test]
    fn overrides_replace_selected_fields() {
        let mut cfg = LightingConfig::default();
        let overrides = LightingConfigOverrides {
            shadow_map_size: Some(ShadowMapSize::S4096),
            shadow_cascades: None,
            forward_plus: Some(false),
        };
        assert!(!overrides.is_empty());
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.shadow_map_size, ShadowMapSize::S4096);
        assert_eq!(cfg.cascade_count(), 4);
        assert_eq!(cfg.renderer_kind(), RendererKind::Forward);
    }

    #[test]
    fn per_object_limit_is_capped() {
        let cfg = LightingConfig { max_visible_lights: 64, ..LightingConfig::default() };
        assert_eq!(cfg.per_object_light_limit(), MAX_PER_OBJECT_LIGHTS);
    }
}
