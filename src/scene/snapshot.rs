use glam::{Mat4, Vec2, Vec3};

use super::{
    Aabb, CullingSource, DirectionalShadowRequest, LightKind, SceneQuery, ShadowFit, ShadowSplitData, VisibleLight,
};
use crate::camera::{point_at_view_depth, sphere_in_frustum, unproject, CullingParameters};

const MIN_SLICE_DEPTH: f32 = 0.01;
const RADIUS_ROUNDING: f32 = 16.0;

/// A plain list of lights and shadow casters standing in for a live scene.
#[derive(Debug, Clone, Default)]
pub struct SceneSnapshot {
    lights: Vec<VisibleLight>,
    casters: Vec<Aabb>,
}

impl SceneSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_light(&mut self, light: VisibleLight) -> &mut Self {
        self.lights.push(light);
        self
    }

    pub fn push_caster(&mut self, bounds: Aabb) -> &mut Self {
        self.casters.push(bounds);
        self
    }

    pub fn lights(&self) -> &[VisibleLight] {
        &self.lights
    }

    pub fn lights_mut(&mut self) -> &mut Vec<VisibleLight> {
        &mut self.lights
    }

    pub fn casters(&self) -> &[Aabb] {
        &self.casters
    }
}

impl CullingSource for SceneSnapshot {
    type Results = CulledScene;

    fn cull(&mut self, params: &CullingParameters) -> CulledScene {
        let lights = self
            .lights
            .iter()
            .filter(|light| light.enabled)
            .filter(|light| match light.kind {
                LightKind::Directional => true,
                LightKind::Point | LightKind::Spot => {
                    sphere_in_frustum(light.position(), light.range.max(0.0), &params.frustum_planes)
                }
            })
            .cloned()
            .collect();
        CulledScene::new(*params, lights, self.casters.clone())
    }
}

/// Culling results for one camera, answering shadow queries against the snapshot's casters.
#[derive(Debug, Clone)]
pub struct CulledScene {
    params: CullingParameters,
    lights: Vec<VisibleLight>,
    casters: Vec<Aabb>,
    light_index_map: Option<Vec<i32>>,
}

impl CulledScene {
    pub fn new(params: CullingParameters, lights: Vec<VisibleLight>, casters: Vec<Aabb>) -> Self {
        Self { params, lights, casters, light_index_map: None }
    }

    pub fn params(&self) -> &CullingParameters {
        &self.params
    }

    /// The last index map handed over by the forward light packer, if any.
    pub fn light_index_map(&self) -> Option<&[i32]> {
        self.light_index_map.as_deref()
    }

    fn slice_corners(&self, near_depth: f32, far_depth: f32) -> [Vec3; 8] {
        let inverse_projection = self.params.projection.inverse();
        let inverse_view = self.params.view.inverse();
        let mut corners = [Vec3::ZERO; 8];
        let mut idx = 0;
        for ndc in [Vec2::new(-1.0, -1.0), Vec2::new(1.0, -1.0), Vec2::new(-1.0, 1.0), Vec2::new(1.0, 1.0)] {
            let a = unproject(inverse_projection, ndc.extend(-1.0));
            let b = unproject(inverse_projection, ndc.extend(1.0));
            for depth in [near_depth, far_depth] {
                corners[idx] = inverse_view.transform_point3(point_at_view_depth(a, b, depth));
                idx += 1;
            }
        }
        corners
    }
}

/// Cumulative split boundaries as fractions of the shadow distance, `count + 1` entries.
pub(crate) fn cascade_boundaries(ratios: Vec3, count: u32) -> Vec<f32> {
    let inner: &[f32] = match count {
        0 | 1 => &[],
        2 => &[ratios.x],
        3 => &[ratios.x, ratios.y],
        _ => &[ratios.x, ratios.y, ratios.z],
    };
    let mut bounds = Vec::with_capacity(inner.len() + 2);
    bounds.push(0.0);
    let mut running = 0.0f32;
    for ratio in inner {
        running = running.max(ratio.clamp(0.0, 1.0));
        bounds.push(running);
    }
    bounds.push(1.0);
    bounds
}

fn up_for(direction: Vec3) -> Vec3 {
    if direction.y.abs() > 0.95 {
        Vec3::X
    } else {
        Vec3::Y
    }
}

impl SceneQuery for CulledScene {
    fn visible_lights(&self) -> &[VisibleLight] {
        &self.lights
    }

    fn shadow_caster_bounds(&self, light_index: usize) -> Option<Aabb> {
        let light = self.lights.get(light_index)?;
        let position = light.position();
        self.casters
            .iter()
            .filter(|caster| match light.kind {
                LightKind::Directional => true,
                LightKind::Point | LightKind::Spot => caster.intersects_sphere(position, light.range),
            })
            .fold(None, |acc: Option<Aabb>, caster| Some(acc.map_or(*caster, |bounds| bounds.union(caster))))
    }

    fn compute_directional_shadow(&self, request: &DirectionalShadowRequest) -> Option<ShadowFit> {
        let light = self.lights.get(request.light_index)?;
        if light.kind != LightKind::Directional
            || request.split_count == 0
            || request.split_index >= request.split_count
        {
            return None;
        }
        let direction = light.forward();
        if direction == Vec3::ZERO {
            return None;
        }

        let bounds = cascade_boundaries(request.split_ratios, request.split_count);
        let split = request.split_index as usize;
        let distance = self.params.shadow_distance;
        let near_depth = (bounds[split] * distance).max(self.params.near);
        let far_depth = (bounds[split + 1] * distance).max(near_depth + MIN_SLICE_DEPTH);
        let corners = self.slice_corners(near_depth, far_depth);

        let mut center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
        let mut radius = corners.iter().map(|corner| corner.distance(center)).fold(0.0f32, f32::max);
        radius = (radius * RADIUS_ROUNDING).ceil() / RADIUS_ROUNDING;
        if !radius.is_finite() || radius <= 0.0 {
            return None;
        }

        // Snap the center to whole shadow texels so the cascade does not shimmer as the camera moves.
        let up = up_for(direction);
        let light_rotation = Mat4::look_to_rh(Vec3::ZERO, direction, up);
        let texel = 2.0 * radius / request.tile_size.max(1) as f32;
        let mut light_space = light_rotation.transform_point3(center);
        light_space.x = (light_space.x / texel).floor() * texel;
        light_space.y = (light_space.y / texel).floor() * texel;
        center = light_rotation.inverse().transform_point3(light_space);

        let caster_reach = self
            .casters
            .iter()
            .flat_map(|caster| caster.corners())
            .map(|corner| (corner - center).dot(-direction))
            .fold(radius, f32::max);
        let back = caster_reach + request.near_plane_bias.max(0.0);
        let eye = center - direction * back;
        let view = Mat4::look_at_rh(eye, center, up);
        let projection = Mat4::orthographic_rh_gl(-radius, radius, -radius, radius, 0.0, back + radius);
        Some(ShadowFit { view, projection, split: ShadowSplitData { culling_sphere: center.extend(radius) } })
    }

    fn compute_spot_shadow(&self, light_index: usize) -> Option<ShadowFit> {
        let light = self.lights.get(light_index)?;
        if light.kind != LightKind::Spot {
            return None;
        }
        let forward = light.forward();
        if forward == Vec3::ZERO {
            return None;
        }
        let fov = light.spot_angle.to_radians().clamp(0.01, std::f32::consts::PI - 0.01);
        let near = light.shadow_near_plane.max(0.01);
        let far = light.range.max(near + MIN_SLICE_DEPTH);
        let position = light.position();
        let view = Mat4::look_to_rh(position, forward, up_for(forward));
        let projection = Mat4::perspective_rh_gl(fov, 1.0, near, far);
        Some(ShadowFit { view, projection, split: ShadowSplitData { culling_sphere: position.extend(far) } })
    }

    fn set_light_index_map(&mut self, map: Vec<i32>) {
        self.light_index_map = Some(map);
    }
}
