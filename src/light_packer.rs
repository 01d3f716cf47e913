//! Packs the visible-light set into the fixed-size vector arrays the shaders read.
//!
//! Layout per slot:
//! - color: linear RGBA.
//! - direction or position: directional lights store the negated forward axis
//!   (surface toward light, `w = 0`), point and spot lights the world position.
//! - attenuation: `x = 1 / max(range², 1e-5)`, `z`/`w` the spot cone reciprocal and
//!   bias, `w = 1` for lights without a cone.
//! - spot direction: negated forward axis for spot lights.

use glam::{Vec2, Vec4};

use crate::scene::{LightKind, VisibleLight};

pub const MAX_PER_OBJECT_LIGHTS: usize = 8;

const RANGE_EPSILON: f32 = 0.00001;
const INNER_TO_OUTER_TAN: f32 = 46.0 / 64.0;
const MIN_ANGLE_RANGE: f32 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub struct PackedLights {
    pub colors: Vec<Vec4>,
    pub directions_or_positions: Vec<Vec4>,
    pub attenuations: Vec<Vec4>,
    pub spot_directions: Vec<Vec4>,
    packed: usize,
}

impl PackedLights {
    pub fn zeroed(capacity: usize) -> Self {
        Self {
            colors: vec![Vec4::ZERO; capacity],
            directions_or_positions: vec![Vec4::ZERO; capacity],
            attenuations: vec![Vec4::ZERO; capacity],
            spot_directions: vec![Vec4::ZERO; capacity],
            packed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.colors.len()
    }

    /// Number of slots written by the last pack.
    pub fn len(&self) -> usize {
        self.packed
    }

    pub fn is_empty(&self) -> bool {
        self.packed == 0
    }

    pub fn clear(&mut self) {
        for array in [
            &mut self.colors,
            &mut self.directions_or_positions,
            &mut self.attenuations,
            &mut self.spot_directions,
        ] {
            array.iter_mut().for_each(|slot| *slot = Vec4::ZERO);
        }
        self.packed = 0;
    }
}

pub fn range_attenuation(range: f32) -> f32 {
    1.0 / (range * range).max(RANGE_EPSILON)
}

/// Cone falloff terms `(reciprocal, bias)` for a full spot angle in degrees, so that
/// `saturate(dot * reciprocal + bias)` fades from the inner to the outer cone.
pub fn spot_attenuation(spot_angle_degrees: f32) -> Vec2 {
    let outer_rad = (0.5 * spot_angle_degrees).to_radians();
    let outer_cos = outer_rad.cos();
    let outer_tan = outer_rad.tan();
    let inner_cos = (INNER_TO_OUTER_TAN * outer_tan).atan().cos();
    let angle_range = (inner_cos - outer_cos).max(MIN_ANGLE_RANGE);
    let reciprocal = 1.0 / angle_range;
    Vec2::new(reciprocal, -outer_cos * reciprocal)
}

/// Surface-to-light direction of a light: its negated forward axis.
pub fn toward_light(light: &VisibleLight) -> Vec4 {
    (-light.local_to_world.z_axis.truncate()).extend(0.0)
}

pub struct LightPacker {
    capacity: usize,
}

impl LightPacker {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes the first `capacity` lights into `out`; slots past them keep whatever the
    /// caller left there, so callers clear first. Returns the number of packed lights.
    pub fn pack(&self, lights: &[VisibleLight], out: &mut PackedLights) -> usize {
        let count = lights.len().min(self.capacity).min(out.capacity());
        for (slot, light) in lights.iter().take(count).enumerate() {
            out.colors[slot] = light.color;
            let mut attenuation = Vec4::new(0.0, 0.0, 0.0, 1.0);
            match light.kind {
                LightKind::Directional => {
                    out.directions_or_positions[slot] = toward_light(light);
                }
                LightKind::Point | LightKind::Spot => {
                    out.directions_or_positions[slot] = light.local_to_world.w_axis;
                    attenuation.x = range_attenuation(light.range);
                    if light.kind == LightKind::Spot {
                        out.spot_directions[slot] = toward_light(light);
                        let cone = spot_attenuation(light.spot_angle);
                        attenuation.z = cone.x;
                        attenuation.w = cone.y;
                    }
                }
            }
            out.attenuations[slot] = attenuation;
        }
        out.packed = count;
        count
    }
}

/// Index map handed back to the scene when more lights are visible than the per-object
/// path can shade: lights past `capacity` and a cascaded main light are hidden with `-1`.
/// `None` while every visible light fits.
pub fn light_index_map(visible: usize, capacity: usize, main_light_cascaded: bool) -> Option<Vec<i32>> {
    if visible <= capacity {
        return None;
    }
    let mut map: Vec<i32> = (0..visible as i32).collect();
    if main_light_cascaded {
        map[0] = -1;
    }
    map.iter_mut().skip(capacity).for_each(|index| *index = -1);
    Some(map)
}
