use anyhow::Result;
use rayon::prelude::*;
use winit::dpi::PhysicalSize;

use super::{
    bounds_dispatch_groups, cluster_aabb, quantize_matrix, ClusterAabb, ClusterBoundsParams, ClusterDims,
    CLUSTER_AABB_SIZE, CLUSTER_BOUNDS_WORKGROUP,
};
use crate::backend::{ensure_buffer, BufferHandle, RenderContext};
use crate::camera::CullingParameters;
use crate::commands::{CommandList, KernelUniforms};
use crate::config::ClusterConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GridKey {
    pixel_size: PhysicalSize<u32>,
    near_bits: u32,
    far_bits: u32,
    projection: [i32; 16],
}

impl GridKey {
    fn new(params: &CullingParameters) -> Self {
        Self {
            pixel_size: params.pixel_size,
            near_bits: params.near.to_bits(),
            far_bits: params.far.to_bits(),
            projection: quantize_matrix(params.projection),
        }
    }
}

/// Grid state for the current frame, consumed by the light culler.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterGrid {
    pub dims: ClusterDims,
    pub bounds: BufferHandle,
    pub pixel_size: PhysicalSize<u32>,
    pub near: f32,
    pub far: f32,
    pub tile_size: u32,
    pub rebuilt: bool,
}

impl ClusterGrid {
    pub fn cluster_count(&self) -> u32 {
        self.dims.count()
    }

    /// Depth extent of one slice, rounded up to whole units.
    pub fn slice_depth(&self) -> f32 {
        ((self.far - self.near) / self.dims.z.max(1) as f32).ceil()
    }
}

/// Owns the cluster-bounds buffer and re-dispatches the bounds kernel only when the
/// screen size, clip planes or projection change.
#[derive(Debug, Default)]
pub struct ClusterGridBuilder {
    config: ClusterConfig,
    key: Option<GridKey>,
    dims: ClusterDims,
    bounds: Option<BufferHandle>,
}

impl ClusterGridBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn dims(&self) -> ClusterDims {
        self.dims
    }

    pub fn bounds_buffer(&self) -> Option<BufferHandle> {
        self.bounds
    }

    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn prepare(
        &mut self,
        ctx: &mut dyn RenderContext,
        params: &CullingParameters,
        commands: &mut CommandList,
    ) -> Result<ClusterGrid> {
        let tile = self.config.tile_pixels();
        let dims = ClusterDims::for_screen(params.pixel_size, &self.config);
        let required = dims.count() as u64 * CLUSTER_AABB_SIZE;
        let (bounds, recreated) = ensure_buffer(ctx, &mut self.bounds, "Cluster Bounds", required)?;
        if recreated {
            self.key = None;
        }

        let key = GridKey::new(params);
        let rebuilt = self.key != Some(key);
        if rebuilt {
            log::debug!(
                "Rebuilding cluster grid {}x{}x{} for camera {:?}",
                dims.x,
                dims.y,
                dims.z,
                params.camera
            );
            let uniforms = ClusterBoundsParams {
                inverse_projection: params.projection.inverse().to_cols_array_2d(),
                screen_size: [
                    params.pixel_size.width as f32,
                    params.pixel_size.height as f32,
                    1.0 / params.pixel_size.width.max(1) as f32,
                    1.0 / params.pixel_size.height.max(1) as f32,
                ],
                cluster_counts: [dims.x, dims.y, dims.z, dims.count()],
                cluster_size: [tile, tile, 0, 0],
                near_far: [params.near, params.far, 0.0, 0.0],
            };
            commands.dispatch(KernelUniforms::ClusterBounds(uniforms), &[bounds], bounds_dispatch_groups(dims));
            self.key = Some(key);
        }
        self.dims = dims;

        Ok(ClusterGrid {
            dims,
            bounds,
            pixel_size: params.pixel_size,
            near: params.near,
            far: params.far,
            tile_size: tile,
            rebuilt,
        })
    }

    pub fn release(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        if let Some(handle) = self.bounds.take() {
            ctx.release_buffer(handle)?;
        }
        self.key = None;
        Ok(())
    }
}

/// CPU execution of the bounds kernel. Clusters outside the dispatched groups are left untouched.
pub fn compute_cluster_bounds(params: &ClusterBoundsParams, groups: [u32; 3], out: &mut [ClusterAabb]) {
    let dims = params.dims();
    let dims = ClusterDims { x: dims.x, y: dims.y, z: dims.z };
    let covered = [
        groups[0] * CLUSTER_BOUNDS_WORKGROUP[0],
        groups[1] * CLUSTER_BOUNDS_WORKGROUP[1],
        groups[2] * CLUSTER_BOUNDS_WORKGROUP[2],
    ];
    out.par_iter_mut().enumerate().for_each(|(index, record)| {
        let coords = dims.coords(index);
        if coords.x < covered[0] && coords.y < covered[1] && coords.z < covered[2] {
            *record = cluster_aabb(coords.x, coords.y, coords.z, params);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_dispatch_leaves_uncovered_clusters() {
        let projection = glam::Mat4::perspective_rh_gl(1.0, 1.0, 0.5, 50.0);
        let params = ClusterBoundsParams {
            inverse_projection: projection.inverse().to_cols_array_2d(),
            screen_size: [320.0, 32.0, 1.0 / 320.0, 1.0 / 32.0],
            cluster_counts: [10, 1, 1, 10],
            cluster_size: [32, 32, 0, 0],
            near_far: [0.5, 50.0, 0.0, 0.0],
        };
        let mut out = vec![ClusterAabb::default(); 10];
        compute_cluster_bounds(&params, [1, 1, 1], &mut out);
        assert_ne!(out[7], ClusterAabb::default());
        assert_eq!(out[8], ClusterAabb::default());
        compute_cluster_bounds(&params, [2, 1, 1], &mut out);
        assert_ne!(out[9], ClusterAabb::default());
    }
}
