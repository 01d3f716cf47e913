//! Clustered (Forward+) light binning: a 3D grid over the view frustum, a per-frame
//! light buffer, and a culling pass that appends light indices per cluster.

mod culling;
mod grid;
mod volume;

use glam::{Mat4, UVec3};
use winit::dpi::PhysicalSize;

use crate::config::ClusterConfig;

pub use culling::{cull_lights, ClusterLightCuller, CullingStats, IndexReservation, LightIndexList};
pub use grid::{compute_cluster_bounds, ClusterGrid, ClusterGridBuilder};
pub use volume::{cluster_aabb, cone_bounding_sphere, light_intersects_cluster, sphere_intersects_aabb};

/// Local scratch each culling workgroup collects matches into before reserving space.
pub const MAX_LIGHTS_PER_CLUSTER_SCRATCH: u32 = 1024;
pub const CLUSTER_BOUNDS_WORKGROUP: [u32; 3] = [8, 8, 4];
pub const LIGHT_CULLING_WORKGROUP: u32 = 64;
pub const MAX_DISPATCH_DIMENSION: u32 = 65_535;
const LIGHT_CLUSTER_CACHE_QUANTIZE: f32 = 1.0e-4;

pub const GPU_LIGHT_SOURCE_SIZE: u64 = std::mem::size_of::<GpuLightSource>() as u64;
pub const CLUSTER_AABB_SIZE: u64 = std::mem::size_of::<ClusterAabb>() as u64;
pub const LIGHT_GRID_ENTRY_SIZE: u64 = std::mem::size_of::<LightGridEntry>() as u64;
pub const INDEX_ENTRY_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Light record read by the culling kernel and the clustered shading pass.
///
/// `direction_angle.w` holds the full spot angle in degrees; `kind.x` the light type
/// (0 spot, 1 directional, 2 point).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuLightSource {
    pub position_range: [f32; 4],
    pub direction_angle: [f32; 4],
    pub color: [f32; 4],
    pub kind: [u32; 4],
}

/// View-space bounds of one cluster.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterAabb {
    pub min: [f32; 4],
    pub max: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightGridEntry {
    pub offset: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterBoundsParams {
    pub inverse_projection: [[f32; 4]; 4],
    /// (width, height, 1 / width, 1 / height)
    pub screen_size: [f32; 4],
    /// (x, y, z, total)
    pub cluster_counts: [u32; 4],
    /// (tile width, tile height, 0, 0)
    pub cluster_size: [u32; 4],
    /// (near, far, 0, 0)
    pub near_far: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightCullingParams {
    pub view: [[f32; 4]; 4],
    /// (light count, cluster count, index entries per cluster, dispatch width)
    pub counts: [u32; 4],
}

impl LightCullingParams {
    pub fn light_count(&self) -> u32 {
        self.counts[0]
    }

    pub fn cluster_count(&self) -> u32 {
        self.counts[1]
    }

    pub fn index_capacity(&self) -> u64 {
        self.counts[1] as u64 * self.counts[2] as u64
    }

    pub fn dispatch_width(&self) -> u32 {
        self.counts[3].max(1)
    }
}

impl ClusterBoundsParams {
    pub fn dims(&self) -> UVec3 {
        UVec3::new(self.cluster_counts[0], self.cluster_counts[1], self.cluster_counts[2])
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_counts[3]
    }
}

/// Grid dimensions for a screen size: `ceil(w / tile) x ceil(h / tile) x slices`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterDims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ClusterDims {
    pub fn for_screen(size: PhysicalSize<u32>, config: &ClusterConfig) -> Self {
        let tile = config.tile_pixels();
        Self {
            x: size.width.max(1).div_ceil(tile),
            y: size.height.max(1).div_ceil(tile),
            z: config.z_slices.max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.x.saturating_mul(self.y).saturating_mul(self.z)
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn flat_index(&self, x: u32, y: u32, z: u32) -> usize {
        cluster_flat_index(x, y, z, self.x, self.y)
    }

    /// Inverse of [`flat_index`](Self::flat_index).
    pub fn coords(&self, index: usize) -> UVec3 {
        let plane = self.x as usize * self.y as usize;
        let z = index / plane.max(1);
        let rem = index - z * plane;
        let y = rem / self.x.max(1) as usize;
        let x = rem - y * self.x as usize;
        UVec3::new(x as u32, y as u32, z as u32)
    }
}

/// Workgroup counts for the bounds kernel.
pub fn bounds_dispatch_groups(dims: ClusterDims) -> [u32; 3] {
    [
        dims.x.div_ceil(CLUSTER_BOUNDS_WORKGROUP[0]).max(1),
        dims.y.div_ceil(CLUSTER_BOUNDS_WORKGROUP[1]).max(1),
        dims.z.div_ceil(CLUSTER_BOUNDS_WORKGROUP[2]).max(1),
    ]
}

/// One culling workgroup per cluster, folded into a second dimension past the
/// per-dimension dispatch limit. Returns the groups and the folded row width.
pub fn culling_dispatch_groups(cluster_count: u32) -> ([u32; 3], u32) {
    let width = cluster_count.clamp(1, MAX_DISPATCH_DIMENSION);
    let rows = cluster_count.max(1).div_ceil(width);
    ([width, rows, 1], width)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullStage {
    #[default]
    Idle,
    LightBufferBuilt,
    GridBuilt,
    Culled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ClusterMetrics {
    pub total_lights: u32,
    pub uploaded_lights: u32,
    pub truncated_lights: u32,
    pub grid_dims: [u32; 3],
    pub cluster_count: u32,
    pub index_capacity: u64,
    pub grid_rebuilt: bool,
}

impl ClusterMetrics {
    pub fn skipped_lights(&self) -> u32 {
        self.total_lights.saturating_sub(self.uploaded_lights)
    }
}

pub(crate) fn cluster_flat_index(x: u32, y: u32, z: u32, grid_x: u32, grid_y: u32) -> usize {
    (z as usize * grid_x as usize * grid_y as usize) + (y as usize * grid_x as usize) + x as usize
}

pub(crate) fn quantize_matrix(mat: Mat4) -> [i32; 16] {
    let mut key = [0i32; 16];
    let cols = mat.to_cols_array();
    for (dst, value) in key.iter_mut().zip(cols.iter()) {
        *dst = (value / LIGHT_CLUSTER_CACHE_QUANTIZE).round() as i32;
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_kernel_layouts() {
        assert_eq!(GPU_LIGHT_SOURCE_SIZE, 64);
        assert_eq!(CLUSTER_AABB_SIZE, 32);
        assert_eq!(LIGHT_GRID_ENTRY_SIZE, 8);
        assert_eq!(std::mem::size_of::<ClusterBoundsParams>() % 16, 0);
        assert_eq!(std::mem::size_of::<LightCullingParams>() % 16, 0);
    }

    #[test]
    fn dims_round_partial_tiles_up() {
        let dims = ClusterDims::for_screen(PhysicalSize::new(1920, 1080), &ClusterConfig::default());
        assert_eq!(dims.as_array(), [60, 34, 16]);
        assert_eq!(dims.count(), 60 * 34 * 16);
        assert_eq!(bounds_dispatch_groups(dims), [8, 5, 4]);
    }

    #[test]
    fn flat_index_round_trips_through_coords() {
        let dims = ClusterDims { x: 5, y: 3, z: 4 };
        let index = dims.flat_index(4, 2, 3);
        assert_eq!(dims.coords(index), UVec3::new(4, 2, 3));
    }

    #[test]
    fn culling_dispatch_folds_large_grids() {
        assert_eq!(culling_dispatch_groups(100), ([100, 1, 1], 100));
        let (groups, width) = culling_dispatch_groups(130_000);
        assert_eq!(width, MAX_DISPATCH_DIMENSION);
        assert_eq!(groups, [MAX_DISPATCH_DIMENSION, 2, 1]);
        assert!(groups[0] as u64 * groups[1] as u64 >= 130_000);
    }

    #[test]
    fn quantized_keys_ignore_tiny_jitter() {
        let base = Mat4::perspective_rh_gl(1.0, 1.5, 0.1, 100.0);
        let jittered = base * Mat4::from_scale(glam::Vec3::splat(1.0 + 1e-7));
        assert_eq!(quantize_matrix(base), quantize_matrix(jittered));
    }
}
