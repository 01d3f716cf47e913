//! Shadow map rendering: a tiled atlas shared by the shadow-casting spot and directional
//! lights, and a fixed 2x2 cascade atlas for the main directional light.
//!
//! Both atlases publish world-to-shadow matrices that map straight into texture space
//! `[0, 1]`, with the tile's offset and scale already applied where needed.

mod atlas;
mod cascades;

use glam::{Mat4, UVec2, Vec2, Vec4};

use crate::commands::{CommandList, PixelRect};

pub use atlas::{AtlasFrame, ShadowAtlasPlanner};
pub use cascades::{cascade_split_fractions, CascadeBuilder, CascadeFrame};

/// Largest tiled atlas is 4x4.
pub const MAX_SHADOW_TILES: u32 = 16;
pub const MAX_CASCADES: usize = 4;
pub const CASCADE_ATLAS_SPLIT: u32 = 2;
/// Scissor margin keeping filtering inside a tile.
pub const TILE_SCISSOR_INSET: f32 = 4.0;

/// Tile grid dimension for `casters` shadowed lights.
pub fn atlas_split(casters: u32) -> u32 {
    match casters {
        0 | 1 => 1,
        2..=4 => 2,
        5..=9 => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowTile {
    pub index: u32,
    /// `(column, row)` in the atlas grid.
    pub offset: UVec2,
    pub viewport: PixelRect,
    pub scissor: PixelRect,
}

impl ShadowTile {
    /// Row-major placement of tile `index` in a `split x split` grid.
    pub fn new(index: u32, split: u32, tile_size: f32) -> Self {
        let split = split.max(1);
        let offset = UVec2::new(index % split, index / split);
        let viewport = PixelRect::new(offset.x as f32 * tile_size, offset.y as f32 * tile_size, tile_size, tile_size);
        let scissor = PixelRect::new(
            viewport.x + TILE_SCISSOR_INSET,
            viewport.y + TILE_SCISSOR_INSET,
            tile_size - 2.0 * TILE_SCISSOR_INSET,
            tile_size - 2.0 * TILE_SCISSOR_INSET,
        );
        Self { index, offset, viewport, scissor }
    }

    pub fn offset_f32(&self) -> Vec2 {
        self.offset.as_vec2()
    }

    pub fn record(&self, commands: &mut CommandList) {
        commands.set_viewport(self.viewport);
        commands.enable_scissor(self.scissor);
    }
}

/// Maps world space into shadow texture space: `scale_bias * projection * view`, with the
/// projection's depth row negated on reversed-depth devices.
pub fn world_to_shadow_matrix(view: Mat4, projection: Mat4, reversed_z: bool) -> Mat4 {
    let mut projection = projection;
    if reversed_z {
        projection.x_axis.z = -projection.x_axis.z;
        projection.y_axis.z = -projection.y_axis.z;
        projection.z_axis.z = -projection.z_axis.z;
        projection.w_axis.z = -projection.w_axis.z;
    }
    let scale_bias = Mat4::from_cols(
        Vec4::new(0.5, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 0.5, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 0.5, 0.0),
        Vec4::new(0.5, 0.5, 0.5, 1.0),
    );
    scale_bias * (projection * view)
}

/// Squeezes texture space into one tile of the 2x2 cascade atlas.
pub fn cascade_tile_matrix(offset: Vec2) -> Mat4 {
    let mut tile = Mat4::IDENTITY;
    tile.x_axis.x = 0.5;
    tile.y_axis.y = 0.5;
    tile.w_axis.x = offset.x * 0.5;
    tile.w_axis.y = offset.y * 0.5;
    tile
}

/// `(1 / size, 1 / size, size, size)`
pub fn shadow_map_size_vector(size: u32) -> Vec4 {
    let size = size.max(1) as f32;
    Vec4::new(1.0 / size, 1.0 / size, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn split_follows_caster_demand() {
        let expected = [(0, 1), (1, 1), (2, 2), (4, 2), (5, 3), (9, 3), (10, 4), (16, 4), (17, 4)];
        for (casters, split) in expected {
            assert_eq!(atlas_split(casters), split, "casters = {casters}");
        }
    }

    #[test]
    fn tiles_are_row_major_with_inset_scissor() {
        let tile = ShadowTile::new(5, 3, 256.0);
        assert_eq!(tile.offset, UVec2::new(2, 1));
        assert_eq!(tile.viewport, PixelRect::new(512.0, 256.0, 256.0, 256.0));
        assert_eq!(tile.scissor, PixelRect::new(516.0, 260.0, 248.0, 248.0));
        assert!(tile.viewport.contains(&tile.scissor));
    }

    #[test]
    fn clip_space_maps_into_unit_cube() {
        let projection = Mat4::orthographic_rh_gl(-1.0, 1.0, -1.0, 1.0, 0.0, 2.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 1.0), Vec3::ZERO, Vec3::Y);
        let matrix = world_to_shadow_matrix(view, projection, false);
        let near_corner = matrix.project_point3(Vec3::new(-1.0, -1.0, 1.0));
        let far_corner = matrix.project_point3(Vec3::new(1.0, 1.0, -1.0));
        assert!(near_corner.abs_diff_eq(Vec3::new(0.0, 0.0, 0.0), 1e-5));
        assert!(far_corner.abs_diff_eq(Vec3::new(1.0, 1.0, 1.0), 1e-5));
    }

    #[test]
    fn reversed_depth_flips_only_depth() {
        let projection = Mat4::perspective_rh_gl(1.0, 1.0, 0.5, 20.0);
        let view = Mat4::IDENTITY;
        let point = Vec3::new(0.3, -0.2, -4.0);
        let regular = world_to_shadow_matrix(view, projection, false).project_point3(point);
        let reversed = world_to_shadow_matrix(view, projection, true).project_point3(point);
        assert!((regular.x - reversed.x).abs() < 1e-5);
        assert!((regular.y - reversed.y).abs() < 1e-5);
        assert!((regular.z + reversed.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cascade_tile_matrix_targets_quadrant() {
        let tile = cascade_tile_matrix(Vec2::new(1.0, 1.0));
        assert!(tile.transform_point3(Vec3::ZERO).abs_diff_eq(Vec3::new(0.5, 0.5, 0.0), 1e-6));
        assert!(tile.transform_point3(Vec3::new(1.0, 1.0, 0.7)).abs_diff_eq(Vec3::new(1.0, 1.0, 0.7), 1e-6));
    }
}
