use glam::{Mat4, Vec3, Vec4};
use winit::dpi::PhysicalSize;

use crate::error::LightingError;

const DEFAULT_UP: Vec3 = Vec3::Y;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective { fov_y_radians: f32 },
    Orthographic { half_height: f32 },
}

/// Per-camera view state handed to the lighting pipeline each frame.
#[derive(Debug, Clone)]
pub struct Camera {
    pub id: CameraId,
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
    pub pixel_size: PhysicalSize<u32>,
}

/// Everything derived from a camera that culling and light binning need.
#[derive(Debug, Clone, Copy)]
pub struct CullingParameters {
    pub camera: CameraId,
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
    pub pixel_size: PhysicalSize<u32>,
    pub shadow_distance: f32,
    pub frustum_planes: [Vec4; 6],
}

impl Camera {
    pub fn new(
        id: CameraId,
        position: Vec3,
        target: Vec3,
        fov_y_radians: f32,
        near: f32,
        far: f32,
        pixel_size: PhysicalSize<u32>,
    ) -> Self {
        Self {
            id,
            position,
            target,
            up: DEFAULT_UP,
            projection: Projection::Perspective { fov_y_radians },
            near,
            far,
            pixel_size,
        }
    }

    pub fn orthographic(
        id: CameraId,
        position: Vec3,
        target: Vec3,
        half_height: f32,
        near: f32,
        far: f32,
        pixel_size: PhysicalSize<u32>,
    ) -> Self {
        Self {
            id,
            position,
            target,
            up: DEFAULT_UP,
            projection: Projection::Orthographic { half_height },
            near,
            far,
            pixel_size,
        }
    }

    pub fn aspect(&self) -> f32 {
        if self.pixel_size.height > 0 {
            self.pixel_size.width as f32 / self.pixel_size.height as f32
        } else {
            1.0
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        let aspect = self.aspect().max(0.0001);
        match self.projection {
            Projection::Perspective { fov_y_radians } => {
                Mat4::perspective_rh_gl(fov_y_radians, aspect, self.near, self.far)
            }
            Projection::Orthographic { half_height } => {
                let half_width = half_height * aspect;
                Mat4::orthographic_rh_gl(-half_width, half_width, -half_height, half_height, self.near, self.far)
            }
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Derives the culling parameters, rejecting camera states that cannot produce a frustum.
    pub fn culling_parameters(&self, shadow_distance: f32) -> Result<CullingParameters, LightingError> {
        let degenerate = |reason| LightingError::DegenerateCamera { camera: self.id, reason };
        if self.pixel_size.width == 0 || self.pixel_size.height == 0 {
            return Err(degenerate("zero-sized viewport"));
        }
        if !self.near.is_finite() || !self.far.is_finite() || self.far <= self.near {
            return Err(degenerate("far plane must lie beyond the near plane"));
        }
        match self.projection {
            Projection::Perspective { fov_y_radians } => {
                if self.near <= 0.0 {
                    return Err(degenerate("perspective near plane must be positive"));
                }
                if !fov_y_radians.is_finite() || fov_y_radians <= 0.0 || fov_y_radians >= std::f32::consts::PI {
                    return Err(degenerate("field of view outside (0, pi)"));
                }
            }
            Projection::Orthographic { half_height } => {
                if !half_height.is_finite() || half_height <= 0.0 {
                    return Err(degenerate("orthographic size must be positive"));
                }
            }
        }
        if (self.target - self.position).length_squared() < 1e-12
            || (self.target - self.position).cross(self.up).length_squared() < 1e-12
        {
            return Err(degenerate("view direction is zero or parallel to up"));
        }
        let view = self.view_matrix();
        let projection = self.projection_matrix();
        if !view.is_finite() || !projection.is_finite() {
            return Err(degenerate("non-finite view or projection matrix"));
        }
        Ok(CullingParameters {
            camera: self.id,
            view,
            projection,
            near: self.near,
            far: self.far,
            pixel_size: self.pixel_size,
            shadow_distance: shadow_distance.min(self.far).max(0.0),
            frustum_planes: extract_frustum_planes(projection * view),
        })
    }
}

/// Gribb-Hartmann plane extraction; planes point inward and are normalized.
pub fn extract_frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let row0 = view_proj.row(0);
    let row1 = view_proj.row(1);
    let row2 = view_proj.row(2);
    let row3 = view_proj.row(3);
    let mut planes = [row3 + row0, row3 - row0, row3 + row1, row3 - row1, row3 + row2, row3 - row2];
    for plane in planes.iter_mut() {
        let length = plane.truncate().length();
        if length > f32::EPSILON {
            *plane /= length;
        }
    }
    planes
}

pub fn sphere_in_frustum(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    planes.iter().all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
}

/// Maps an NDC point back into view space through an inverse projection.
pub fn unproject(inverse_projection: Mat4, ndc: Vec3) -> Vec3 {
    let view = inverse_projection * ndc.extend(1.0);
    if view.w.abs() > f32::EPSILON {
        view.truncate() / view.w
    } else {
        view.truncate()
    }
}

/// Intersects the view-space line through `a` and `b` with the plane `z = -depth`.
pub fn point_at_view_depth(a: Vec3, b: Vec3, depth: f32) -> Vec3 {
    let dz = b.z - a.z;
    if dz.abs() <= f32::EPSILON {
        return Vec3::new(a.x, a.y, -depth);
    }
    let t = (-depth - a.z) / dz;
    a + (b - a) * t
}
