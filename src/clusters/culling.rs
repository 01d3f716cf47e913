use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use glam::{Mat4, Vec4};
use rayon::prelude::*;

use super::{
    culling_dispatch_groups, light_intersects_cluster, ClusterAabb, ClusterGrid, ClusterMetrics, CullStage,
    GpuLightSource, LightCullingParams, LightGridEntry, GPU_LIGHT_SOURCE_SIZE, INDEX_ENTRY_SIZE,
    LIGHT_GRID_ENTRY_SIZE, MAX_LIGHTS_PER_CLUSTER_SCRATCH,
};
use crate::backend::{ensure_buffer, BufferHandle, RenderContext};
use crate::commands::{CommandList, KernelUniforms};
use crate::config::ClusterConfig;
use crate::error::LightingError;
use crate::globals::ShaderProperty;
use crate::scene::{LightKind, VisibleLight};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexReservation {
    pub offset: u32,
    pub count: u32,
}

/// Capacity-bounded light index list shared by every culling invocation.
///
/// Slots are handed out by a single atomic counter. The counter keeps advancing past
/// capacity so no reservation is lost, but only in-bounds slots are ever written.
#[derive(Debug)]
pub struct LightIndexList {
    counter: AtomicU32,
    entries: Vec<AtomicU32>,
}

impl LightIndexList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { counter: AtomicU32::new(0), entries: (0..capacity).map(|_| AtomicU32::new(0)).collect() }
    }

    /// Resumes a list from raw buffer contents, as a kernel sees the counter and index buffers.
    pub fn from_parts(counter: u32, entries: Vec<u32>) -> Self {
        Self { counter: AtomicU32::new(counter), entries: entries.into_iter().map(AtomicU32::new).collect() }
    }

    pub fn into_parts(self) -> (u32, Vec<u32>) {
        let Self { counter, entries } = self;
        (counter.into_inner(), entries.into_iter().map(AtomicU32::into_inner).collect())
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Total slots requested so far, including dropped ones.
    pub fn requested(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Number of slots that hold a written index.
    pub fn len(&self) -> usize {
        (self.requested() as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves `requested` contiguous slots, clamped to what is left of the capacity.
    pub fn reserve(&self, requested: u32) -> IndexReservation {
        let offset = self.counter.fetch_add(requested, Ordering::AcqRel);
        let capacity = self.capacity() as u64;
        let available = capacity.saturating_sub(offset as u64);
        IndexReservation {
            offset: (offset as u64).min(capacity) as u32,
            count: (requested as u64).min(available) as u32,
        }
    }

    #[cfg(test)]
    pub(crate) fn append(&self, light_index: u32) -> bool {
        let reservation = self.reserve(1);
        if reservation.count == 0 {
            return false;
        }
        self.write(reservation.offset, light_index);
        true
    }

    fn write(&self, slot: u32, light_index: u32) {
        if let Some(entry) = self.entries.get(slot as usize) {
            entry.store(light_index, Ordering::Relaxed);
        }
    }

    pub fn get(&self, slot: usize) -> Option<u32> {
        self.entries.get(slot).map(|entry| entry.load(Ordering::Relaxed))
    }

    pub fn into_words(self) -> Vec<u32> {
        self.into_parts().1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CullingStats {
    pub assignments: u64,
    pub dropped: u64,
    pub saturated_clusters: u32,
}

/// CPU execution of the culling kernel: every cluster gathers its matching lights, then
/// reserves one contiguous range of the index list.
pub fn cull_lights(
    params: &LightCullingParams,
    groups: [u32; 3],
    lights: &[GpuLightSource],
    clusters: &[ClusterAabb],
    list: &LightIndexList,
) -> (Vec<LightGridEntry>, CullingStats) {
    let view = Mat4::from_cols_array_2d(&params.view);
    let light_count = (params.light_count() as usize).min(lights.len());
    let cluster_count = (params.cluster_count() as usize).min(clusters.len());
    let width = params.dispatch_width() as usize;
    let covered = groups[0] as usize * groups[1] as usize;
    let scratch_cap = MAX_LIGHTS_PER_CLUSTER_SCRATCH as usize;

    let results: Vec<(LightGridEntry, u32, bool)> = (0..cluster_count)
        .into_par_iter()
        .map_init(
            || Vec::with_capacity(64),
            |found: &mut Vec<u32>, cluster| {
                if cluster % width >= groups[0] as usize || cluster >= covered {
                    return (LightGridEntry::default(), 0, false);
                }
                found.clear();
                let aabb = &clusters[cluster];
                let mut saturated = false;
                for (index, light) in lights[..light_count].iter().enumerate() {
                    if !light_intersects_cluster(light, view, aabb) {
                        continue;
                    }
                    if found.len() == scratch_cap {
                        saturated = true;
                        break;
                    }
                    found.push(index as u32);
                }
                let reservation = list.reserve(found.len() as u32);
                for (slot, light_index) in found.iter().take(reservation.count as usize).enumerate() {
                    list.write(reservation.offset + slot as u32, *light_index);
                }
                let dropped = found.len() as u32 - reservation.count;
                (LightGridEntry { offset: reservation.offset, count: reservation.count }, dropped, saturated)
            },
        )
        .collect();

    let mut stats = CullingStats::default();
    let mut grid = Vec::with_capacity(results.len());
    for (entry, dropped, saturated) in results {
        stats.assignments += entry.count as u64;
        stats.dropped += dropped as u64;
        stats.saturated_clusters += saturated as u32;
        grid.push(entry);
    }
    (grid, stats)
}

fn gpu_light(light: &VisibleLight) -> GpuLightSource {
    let position = light.position();
    let (direction, angle) = match light.kind {
        LightKind::Point => (Vec4::ZERO, 0.0),
        LightKind::Directional => (light.local_to_world.z_axis, 0.0),
        LightKind::Spot => (light.local_to_world.z_axis, light.spot_angle),
    };
    GpuLightSource {
        position_range: [position.x, position.y, position.z, light.range],
        direction_angle: [direction.x, direction.y, direction.z, angle],
        color: light.color.to_array(),
        kind: [light.kind.gpu_type(), 0, 0, 0],
    }
}

/// Drives the per-frame culling stages for one camera:
/// `Idle -> LightBufferBuilt -> GridBuilt -> Culled -> Idle`.
#[derive(Debug, Default)]
pub struct ClusterLightCuller {
    config: ClusterConfig,
    stage: CullStage,
    lights: Option<BufferHandle>,
    counter: Option<BufferHandle>,
    index_list: Option<BufferHandle>,
    grid: Option<BufferHandle>,
    light_count: u32,
    staging: Vec<GpuLightSource>,
    metrics: ClusterMetrics,
}

impl ClusterLightCuller {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn stage(&self) -> CullStage {
        self.stage
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    pub fn light_count(&self) -> u32 {
        self.light_count
    }

    pub fn index_list_buffer(&self) -> Option<BufferHandle> {
        self.index_list
    }

    pub fn grid_buffer(&self) -> Option<BufferHandle> {
        self.grid
    }

    pub fn light_buffer(&self) -> Option<BufferHandle> {
        self.lights
    }

    /// Drops back to `Idle` after a camera aborted mid-frame.
    pub fn reset(&mut self) {
        self.stage = CullStage::Idle;
    }

    fn expect_stage(&self, expected: CullStage) -> Result<(), LightingError> {
        if self.stage != expected {
            return Err(LightingError::InvalidCullStage { expected, found: self.stage });
        }
        Ok(())
    }

    /// Uploads every enabled visible light, up to the configured maximum.
    pub fn build_light_buffer(&mut self, ctx: &mut dyn RenderContext, lights: &[VisibleLight]) -> Result<()> {
        self.expect_stage(CullStage::Idle)?;
        let max_lights = self.config.max_lights as usize;
        let previous_truncated = self.metrics.truncated_lights;

        self.staging.clear();
        let mut total = 0u32;
        let mut truncated = 0u32;
        for light in lights.iter().filter(|light| light.enabled) {
            total += 1;
            if self.staging.len() >= max_lights {
                truncated += 1;
                continue;
            }
            self.staging.push(gpu_light(light));
        }
        if truncated > 0 && previous_truncated == 0 {
            log::warn!(
                "{truncated} light(s) exceeded the clustered lighting budget (max {max_lights}). Extra lights will be ignored."
            );
        }

        let size = max_lights.max(1) as u64 * GPU_LIGHT_SOURCE_SIZE;
        let (buffer, _) = ensure_buffer(ctx, &mut self.lights, "Cluster Lights", size)?;
        if !self.staging.is_empty() {
            ctx.write_buffer(buffer, 0, bytemuck::cast_slice(&self.staging))?;
        }

        self.light_count = self.staging.len() as u32;
        self.metrics.total_lights = total;
        self.metrics.uploaded_lights = self.light_count;
        self.metrics.truncated_lights = truncated;
        self.stage = CullStage::LightBufferBuilt;
        Ok(())
    }

    pub fn attach_grid(&mut self, grid: &ClusterGrid) -> Result<()> {
        self.expect_stage(CullStage::LightBufferBuilt)?;
        self.metrics.grid_dims = grid.dims.as_array();
        self.metrics.cluster_count = grid.cluster_count();
        self.metrics.grid_rebuilt = grid.rebuilt;
        self.stage = CullStage::GridBuilt;
        Ok(())
    }

    /// Sizes the output buffers for the grid and records the culling dispatch behind a
    /// barrier on the cluster bounds.
    pub fn cull(
        &mut self,
        ctx: &mut dyn RenderContext,
        grid: &ClusterGrid,
        view: Mat4,
        commands: &mut CommandList,
    ) -> Result<()> {
        self.expect_stage(CullStage::GridBuilt)?;
        let lights = self.lights.ok_or(LightingError::InvalidCullStage {
            expected: CullStage::LightBufferBuilt,
            found: self.stage,
        })?;
        let cluster_count = grid.cluster_count();
        let per_cluster = self.config.index_entries_per_cluster;
        let capacity = cluster_count as u64 * per_cluster as u64;

        let (counter, _) = ensure_buffer(ctx, &mut self.counter, "Cluster Light Index Counter", INDEX_ENTRY_SIZE)?;
        ctx.write_buffer(counter, 0, bytemuck::bytes_of(&0u32))?;
        let (index_list, _) = ensure_buffer(
            ctx,
            &mut self.index_list,
            "Cluster Light Index List",
            capacity.max(1) * INDEX_ENTRY_SIZE,
        )?;
        let (light_grid, _) =
            ensure_buffer(ctx, &mut self.grid, "Cluster Light Grid", cluster_count as u64 * LIGHT_GRID_ENTRY_SIZE)?;
        self.metrics.index_capacity = capacity;

        let (groups, width) = culling_dispatch_groups(cluster_count);
        let uniforms = LightCullingParams {
            view: view.to_cols_array_2d(),
            counts: [self.light_count, cluster_count, per_cluster, width],
        };
        commands.compute_barrier();
        commands.dispatch(
            KernelUniforms::LightCulling(uniforms),
            &[lights, grid.bounds, counter, index_list, light_grid],
            groups,
        );
        self.stage = CullStage::Culled;
        Ok(())
    }

    /// Publishes the culling outputs and cluster layout as shader globals.
    pub fn publish(&mut self, grid: &ClusterGrid, commands: &mut CommandList) -> Result<()> {
        self.expect_stage(CullStage::Culled)?;
        let (Some(lights), Some(index_list), Some(light_grid)) = (self.lights, self.index_list, self.grid) else {
            return Err(LightingError::InvalidCullStage { expected: CullStage::Culled, found: self.stage }.into());
        };
        let tile = grid.tile_size as f32;
        let width = grid.pixel_size.width.max(1) as f32;
        let height = grid.pixel_size.height.max(1) as f32;
        commands.set_global_buffer(ShaderProperty::ClusterLights, lights);
        commands.set_global_buffer(ShaderProperty::ClusterLightIndexList, index_list);
        commands.set_global_buffer(ShaderProperty::ClusterLightGrid, light_grid);
        commands.set_global_vector(ShaderProperty::ClusterTileSize, Vec4::new(tile, tile, 0.0, 0.0));
        commands.set_global_vector(
            ShaderProperty::ClusterCount,
            Vec4::new(grid.dims.x as f32, grid.dims.y as f32, grid.dims.z as f32, 0.0),
        );
        commands.set_global_vector(ShaderProperty::ClusterCellSize, Vec4::new(tile, tile, grid.slice_depth(), 0.0));
        commands.set_global_vector(
            ShaderProperty::ClusterScreenSize,
            Vec4::new(width, height, 1.0 / width, 1.0 / height),
        );
        self.stage = CullStage::Idle;
        Ok(())
    }

    pub fn release(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        for slot in [&mut self.lights, &mut self.counter, &mut self.index_list, &mut self.grid] {
            if let Some(handle) = slot.take() {
                ctx.release_buffer(handle)?;
            }
        }
        self.stage = CullStage::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn append_stops_exactly_at_capacity() {
        let list = LightIndexList::with_capacity(16);
        let written = (0..17).filter(|i| list.append(*i)).count();
        assert_eq!(written, 16);
        assert_eq!(list.len(), 16);
        assert_eq!(list.requested(), 17);
        assert_eq!(list.get(15), Some(15));
    }

    #[test]
    fn reservations_clamp_to_remaining_capacity() {
        let list = LightIndexList::with_capacity(10);
        assert_eq!(list.reserve(6), IndexReservation { offset: 0, count: 6 });
        assert_eq!(list.reserve(6), IndexReservation { offset: 6, count: 4 });
        assert_eq!(list.reserve(3), IndexReservation { offset: 10, count: 0 });
    }

    #[test]
    fn concurrent_appends_never_share_a_slot() {
        let list = LightIndexList::with_capacity(4096);
        (0..4096u32).into_par_iter().for_each(|i| {
            assert!(list.append(i));
        });
        let written: BTreeSet<u32> = list.into_words().into_iter().collect();
        assert_eq!(written.len(), 4096);
    }

    #[test]
    fn culling_records_contiguous_ranges() {
        let lights: Vec<GpuLightSource> = (0..3)
            .map(|i| GpuLightSource {
                position_range: [i as f32 * 10.0, 0.0, -5.0, 1.0],
                kind: [LightKind::Point.gpu_type(), 0, 0, 0],
                ..Default::default()
            })
            .collect();
        let clusters = vec![
            ClusterAabb { min: [-1.0, -1.0, -6.0, 1.0], max: [11.0, 1.0, -4.0, 1.0] },
            ClusterAabb { min: [19.0, -1.0, -6.0, 1.0], max: [21.0, 1.0, -4.0, 1.0] },
            ClusterAabb { min: [100.0, -1.0, -6.0, 1.0], max: [101.0, 1.0, -4.0, 1.0] },
        ];
        let params = LightCullingParams { view: Mat4::IDENTITY.to_cols_array_2d(), counts: [3, 3, 4, 3] };
        let list = LightIndexList::with_capacity(12);
        let (grid, stats) = cull_lights(&params, [3, 1, 1], &lights, &clusters, &list);
        assert_eq!(grid[0].count, 2);
        assert_eq!(grid[1].count, 1);
        assert_eq!(grid[2].count, 0);
        assert_eq!(stats.assignments, 3);
        assert_eq!(stats.dropped, 0);
        let words = list.into_words();
        let first: BTreeSet<u32> =
            words[grid[0].offset as usize..(grid[0].offset + grid[0].count) as usize].iter().copied().collect();
        assert_eq!(first, BTreeSet::from([0, 1]));
        assert_eq!(words[grid[1].offset as usize], 2);
    }

    #[test]
    fn stages_must_run_in_order() {
        let mut culler = ClusterLightCuller::new(ClusterConfig::default());
        let grid = ClusterGrid {
            dims: crate::clusters::ClusterDims { x: 1, y: 1, z: 1 },
            bounds: BufferHandle(0),
            pixel_size: winit::dpi::PhysicalSize::new(32, 32),
            near: 0.1,
            far: 10.0,
            tile_size: 32,
            rebuilt: true,
        };
        let err = culler.attach_grid(&grid).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightingError>(),
            Some(LightingError::InvalidCullStage { expected: CullStage::LightBufferBuilt, found: CullStage::Idle })
        ));
    }
}
