use glam::{Mat4, Vec2, Vec3, Vec4};

use super::{ClusterAabb, ClusterBoundsParams, GpuLightSource};
use crate::camera::{point_at_view_depth, unproject};
use crate::scene::LightKind;

const NDC_NEAR_SAMPLE: f32 = 0.25;
const NDC_FAR_SAMPLE: f32 = 0.75;

/// View-space bounds of cluster `(x, y, z)`. Screen y grows downward and depth slices
/// are linear between the near and far planes.
pub fn cluster_aabb(x: u32, y: u32, z: u32, params: &ClusterBoundsParams) -> ClusterAabb {
    let inverse_projection = Mat4::from_cols_array_2d(&params.inverse_projection);
    let [width, height, _, _] = params.screen_size;
    let tile = Vec2::new(params.cluster_size[0] as f32, params.cluster_size[1] as f32);
    let slices = params.cluster_counts[2].max(1) as f32;
    let [near, far, _, _] = params.near_far;

    let min_px = Vec2::new(x as f32, y as f32) * tile;
    let max_px = min_px + tile;
    let slice_depth = (far - near) / slices;
    let depth_near = near + slice_depth * z as f32;
    let depth_far = depth_near + slice_depth;

    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for px in [Vec2::new(min_px.x, min_px.y), Vec2::new(max_px.x, min_px.y), Vec2::new(min_px.x, max_px.y), max_px] {
        let ndc = Vec2::new(px.x / width.max(1.0) * 2.0 - 1.0, 1.0 - px.y / height.max(1.0) * 2.0);
        let a = unproject(inverse_projection, ndc.extend(NDC_NEAR_SAMPLE));
        let b = unproject(inverse_projection, ndc.extend(NDC_FAR_SAMPLE));
        for depth in [depth_near, depth_far] {
            let point = point_at_view_depth(a, b, depth);
            min = min.min(point);
            max = max.max(point);
        }
    }
    ClusterAabb { min: min.extend(1.0).to_array(), max: max.extend(1.0).to_array() }
}

pub fn sphere_intersects_aabb(center: Vec3, radius: f32, aabb: &ClusterAabb) -> bool {
    let min = Vec4::from_array(aabb.min).truncate();
    let max = Vec4::from_array(aabb.max).truncate();
    let closest = center.clamp(min, max);
    closest.distance_squared(center) <= radius * radius
}

/// Tightest sphere around a cone with apex `origin`, unit axis `direction`, `range` and
/// half-angle `half_angle` (radians).
pub fn cone_bounding_sphere(origin: Vec3, direction: Vec3, range: f32, half_angle: f32) -> (Vec3, f32) {
    let cos_angle = half_angle.cos();
    if half_angle > std::f32::consts::FRAC_PI_4 {
        (origin + direction * (cos_angle * range), half_angle.sin() * range)
    } else {
        let radius = range / (2.0 * cos_angle.max(f32::EPSILON));
        (origin + direction * radius, radius)
    }
}

fn cone_culls_sphere(
    origin: Vec3,
    direction: Vec3,
    range: f32,
    half_angle: f32,
    center: Vec3,
    radius: f32,
) -> bool {
    let v = center - origin;
    let length_sq = v.length_squared();
    let along = v.dot(direction);
    let closest = half_angle.cos() * (length_sq - along * along).max(0.0).sqrt() - along * half_angle.sin();
    let angle_cull = closest > radius;
    let front_cull = along > radius + range;
    let back_cull = along < -radius;
    angle_cull || front_cull || back_cull
}

/// Whether `light`'s influence volume touches a cluster; `view` maps world to view space.
pub fn light_intersects_cluster(light: &GpuLightSource, view: Mat4, aabb: &ClusterAabb) -> bool {
    let kind = light.kind[0];
    if kind == LightKind::Directional.gpu_type() {
        return true;
    }
    let [px, py, pz, range] = light.position_range;
    let position = view.transform_point3(Vec3::new(px, py, pz));
    if kind == LightKind::Point.gpu_type() {
        return sphere_intersects_aabb(position, range, aabb);
    }

    let [dx, dy, dz, angle] = light.direction_angle;
    let direction = view.transform_vector3(Vec3::new(dx, dy, dz)).normalize_or_zero();
    let half_angle = (angle * 0.5).to_radians();
    let (center, radius) = cone_bounding_sphere(position, direction, range, half_angle);
    if !sphere_intersects_aabb(center, radius, aabb) {
        return false;
    }
    let min = Vec4::from_array(aabb.min).truncate();
    let max = Vec4::from_array(aabb.max).truncate();
    let aabb_center = (min + max) * 0.5;
    let aabb_radius = (max - min).length() * 0.5;
    !cone_culls_sphere(position, direction, range, half_angle, aabb_center, aabb_radius)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ClusterBoundsParams {
        let projection = Mat4::perspective_rh_gl(60.0_f32.to_radians(), 2.0, 1.0, 101.0);
        ClusterBoundsParams {
            inverse_projection: projection.inverse().to_cols_array_2d(),
            screen_size: [128.0, 64.0, 1.0 / 128.0, 1.0 / 64.0],
            cluster_counts: [4, 2, 4, 32],
            cluster_size: [32, 32, 0, 0],
            near_far: [1.0, 101.0, 0.0, 0.0],
        }
    }

    fn aabb(min: Vec3, max: Vec3) -> ClusterAabb {
        ClusterAabb { min: min.extend(1.0).to_array(), max: max.extend(1.0).to_array() }
    }

    #[test]
    fn slices_are_linear_in_view_depth() {
        let params = params();
        let first = cluster_aabb(0, 0, 0, &params);
        let last = cluster_aabb(3, 1, 3, &params);
        assert!((first.max[2] + 1.0).abs() < 1e-3);
        assert!((first.min[2] + 26.0).abs() < 1e-3);
        assert!((last.min[2] + 101.0).abs() < 1e-2);
        assert!((last.max[2] + 76.0).abs() < 1e-2);
    }

    #[test]
    fn top_left_cluster_is_up_and_left() {
        let params = params();
        let top_left = cluster_aabb(0, 0, 1, &params);
        assert!(top_left.max[0] <= 1e-4);
        assert!(top_left.min[1] >= -1e-4);
        let bottom_right = cluster_aabb(3, 1, 1, &params);
        assert!(bottom_right.min[0] >= -1e-4);
        assert!(bottom_right.max[1] <= 1e-4);
    }

    #[test]
    fn point_light_touches_only_nearby_boxes() {
        let light = GpuLightSource {
            position_range: [0.0, 0.0, -5.0, 1.0],
            kind: [LightKind::Point.gpu_type(), 0, 0, 0],
            ..Default::default()
        };
        let near_box = aabb(Vec3::new(-1.0, -1.0, -6.0), Vec3::new(1.0, 1.0, -4.5));
        let far_box = aabb(Vec3::new(-1.0, -1.0, -20.0), Vec3::new(1.0, 1.0, -10.0));
        assert!(light_intersects_cluster(&light, Mat4::IDENTITY, &near_box));
        assert!(!light_intersects_cluster(&light, Mat4::IDENTITY, &far_box));
    }

    #[test]
    fn spot_light_ignores_boxes_behind_it() {
        let light = GpuLightSource {
            position_range: [0.0, 0.0, -5.0, 10.0],
            direction_angle: [0.0, 0.0, -1.0, 30.0],
            kind: [LightKind::Spot.gpu_type(), 0, 0, 0],
            ..Default::default()
        };
        let ahead = aabb(Vec3::new(-0.5, -0.5, -10.0), Vec3::new(0.5, 0.5, -9.0));
        let behind = aabb(Vec3::new(-0.5, -0.5, -2.0), Vec3::new(0.5, 0.5, -1.0));
        let beside = aabb(Vec3::new(6.0, -0.5, -7.0), Vec3::new(7.0, 0.5, -6.0));
        assert!(light_intersects_cluster(&light, Mat4::IDENTITY, &ahead));
        assert!(!light_intersects_cluster(&light, Mat4::IDENTITY, &behind));
        assert!(!light_intersects_cluster(&light, Mat4::IDENTITY, &beside));
    }

    #[test]
    fn directional_lights_reach_every_cluster() {
        let light = GpuLightSource { kind: [LightKind::Directional.gpu_type(), 0, 0, 0], ..Default::default() };
        let anywhere = aabb(Vec3::splat(-1000.0), Vec3::splat(-999.0));
        assert!(light_intersects_cluster(&light, Mat4::IDENTITY, &anywhere));
    }
}
