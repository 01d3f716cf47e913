//! Interface to the engine's scene: the visible-light set of a camera and the
//! shadow queries the lighting passes issue against it.

mod snapshot;

use glam::{Mat4, Vec3, Vec4};

use crate::camera::CullingParameters;

pub use snapshot::{CulledScene, SceneSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

impl LightKind {
    /// Encoding shared with the culling kernel's light buffer.
    pub const fn gpu_type(self) -> u32 {
        match self {
            LightKind::Spot => 0,
            LightKind::Directional => 1,
            LightKind::Point => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightShadows {
    #[default]
    None,
    Hard,
    Soft,
}

/// One entry of a camera's visible-light list. Immutable for the frame.
///
/// The light emits along the +Z column of `local_to_world`; the fourth column is its
/// world position.
#[derive(Debug, Clone)]
pub struct VisibleLight {
    pub kind: LightKind,
    pub color: Vec4,
    pub local_to_world: Mat4,
    pub range: f32,
    /// Full cone angle in degrees.
    pub spot_angle: f32,
    pub shadows: LightShadows,
    pub shadow_strength: f32,
    pub shadow_bias: f32,
    pub shadow_near_plane: f32,
    pub enabled: bool,
}

impl VisibleLight {
    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self::new(LightKind::Directional, basis_from_forward(Vec3::ZERO, direction), color)
    }

    pub fn point(position: Vec3, color: Vec3, range: f32) -> Self {
        let mut light = Self::new(LightKind::Point, Mat4::from_translation(position), color);
        light.range = range;
        light
    }

    pub fn spot(position: Vec3, direction: Vec3, color: Vec3, range: f32, spot_angle: f32) -> Self {
        let mut light = Self::new(LightKind::Spot, basis_from_forward(position, direction), color);
        light.range = range;
        light.spot_angle = spot_angle;
        light
    }

    fn new(kind: LightKind, local_to_world: Mat4, color: Vec3) -> Self {
        Self {
            kind,
            color: color.extend(1.0),
            local_to_world,
            range: 10.0,
            spot_angle: 30.0,
            shadows: LightShadows::None,
            shadow_strength: 1.0,
            shadow_bias: 0.05,
            shadow_near_plane: 0.2,
            enabled: true,
        }
    }

    pub fn with_shadows(mut self, shadows: LightShadows, strength: f32) -> Self {
        self.shadows = shadows;
        self.shadow_strength = strength.clamp(0.0, 1.0);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.local_to_world.w_axis.truncate()
    }

    pub fn forward(&self) -> Vec3 {
        self.local_to_world.z_axis.truncate().normalize_or_zero()
    }

    pub fn casts_shadows(&self) -> bool {
        self.shadows != LightShadows::None
    }
}

fn basis_from_forward(position: Vec3, forward: Vec3) -> Mat4 {
    let z = forward.try_normalize().unwrap_or(Vec3::NEG_Y);
    let reference = if z.y.abs() > 0.95 { Vec3::X } else { Vec3::Y };
    let x = reference.cross(z).normalize();
    let y = z.cross(x);
    Mat4::from_cols(x.extend(0.0), y.extend(0.0), z.extend(0.0), position.extend(1.0))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min: min.min(max), max: min.max(max) }
    }

    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self::new(center - extents, center + extents)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        let closest = center.clamp(self.min, self.max);
        closest.distance_squared(center) <= radius * radius
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }
}

/// Culling volume returned alongside a shadow projection. The sphere radius is
/// stored unsquared, as the scene produces it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShadowSplitData {
    pub culling_sphere: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowFit {
    pub view: Mat4,
    pub projection: Mat4,
    pub split: ShadowSplitData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalShadowRequest {
    pub light_index: usize,
    pub split_index: u32,
    pub split_count: u32,
    pub split_ratios: Vec3,
    pub tile_size: u32,
    pub near_plane_bias: f32,
}

/// Culling results of one camera as seen by the lighting passes.
pub trait SceneQuery {
    fn visible_lights(&self) -> &[VisibleLight];

    /// Bounds of everything that casts into the light's shadow, `None` when nothing does.
    fn shadow_caster_bounds(&self, light_index: usize) -> Option<Aabb>;

    fn compute_directional_shadow(&self, request: &DirectionalShadowRequest) -> Option<ShadowFit>;

    fn compute_spot_shadow(&self, light_index: usize) -> Option<ShadowFit>;

    /// Remaps visibility indices for per-object light lists; `-1` hides a light.
    fn set_light_index_map(&mut self, map: Vec<i32>);
}

/// Produces culling results for a camera.
pub trait CullingSource {
    type Results: SceneQuery;

    fn cull(&mut self, params: &CullingParameters) -> Self::Results;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_basis_points_forward() {
        let light = VisibleLight::directional(Vec3::new(0.0, -1.0, 1.0), Vec3::ONE);
        let forward = light.forward();
        assert!((forward - Vec3::new(0.0, -1.0, 1.0).normalize()).length() < 1e-5);
        assert_eq!(light.position(), Vec3::ZERO);
    }

    #[test]
    fn aabb_sphere_intersection() {
        let aabb = Aabb::from_center_extents(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.intersects_sphere(Vec3::new(2.0, 0.0, 0.0), 1.01));
        assert!(!aabb.intersects_sphere(Vec3::new(2.0, 2.0, 0.0), 1.2));
    }
}
