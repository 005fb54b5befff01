use glam::{Mat3, Mat4, Quat, Vec3, Vec4};

pub const FOV_DEGREES: f32 = 60.0;
pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 100.0;
const MIN_DISTANCE_EXP: i32 = -4800;
const MAX_DISTANCE_EXP: i32 = 1600;

/// Orbit camera looking at the origin from `distance()` along +z.
#[derive(Clone, Debug, PartialEq)]
pub struct Camera {
    rotation: Quat,
    distance_exp: i32,
    viewport: (u32, u32),
}

impl Camera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            rotation: Quat::IDENTITY,
            distance_exp: 0,
            viewport: (width.max(1), height.max(1)),
        }
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width.max(1), height.max(1));
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation.normalize();
    }

    /// Apply `delta` on top of the current rotation, as a trackball drag does.
    pub fn rotate(&mut self, delta: Quat) {
        self.rotation = (delta * self.rotation).normalize();
    }

    /// Mouse wheel input; positive deltas move the camera away.
    pub fn scroll(&mut self, delta: i32) {
        self.distance_exp = self
            .distance_exp
            .saturating_add(delta)
            .clamp(MIN_DISTANCE_EXP, MAX_DISTANCE_EXP);
    }

    pub fn distance_exp(&self) -> i32 {
        self.distance_exp
    }

    pub fn distance(&self) -> f32 {
        4.0 * (self.distance_exp as f32 / 600.0).exp()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.viewport.0 as f32 / self.viewport.1 as f32
    }

    pub fn focal_length(&self) -> f32 {
        1.0 / (FOV_DEGREES.to_radians() / 2.0).tan()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, 0.0, -self.distance())) * Mat4::from_quat(self.rotation)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(
            FOV_DEGREES.to_radians(),
            self.aspect_ratio(),
            NEAR_PLANE,
            FAR_PLANE,
        )
    }

    pub fn model_view_projection(&self, model: Mat4) -> Mat4 {
        self.projection_matrix() * self.view_matrix() * model
    }

    pub fn normal_matrix(&self, model: Mat4) -> Mat3 {
        Mat3::from_mat4(self.view_matrix() * model).inverse().transpose()
    }

    /// Eye position in world space.
    pub fn ray_origin(&self) -> Vec3 {
        self.view_matrix().inverse().transform_point3(Vec3::ZERO)
    }

    /// Map a viewport pixel and its depth-buffer value (`0` near, `1` far)
    /// back to normalised model space, where the volume spans `[0, 1]^3`.
    ///
    /// Returns `None` when the transform is singular.
    pub fn unproject(&self, screen_x: f32, screen_y: f32, depth: f32, model: Mat4) -> Option<Vec3> {
        let mvp = self.model_view_projection(model);
        let determinant = mvp.determinant();
        if determinant == 0.0 || !determinant.is_finite() {
            return None;
        }
        let (width, height) = self.viewport;
        let ndc = Vec4::new(
            2.0 * screen_x / width as f32 - 1.0,
            1.0 - 2.0 * screen_y / height as f32,
            depth,
            1.0,
        );
        let object = mvp.inverse() * ndc;
        if object.w == 0.0 {
            return None;
        }
        let position = object.truncate() / object.w;
        Some(Vec3::splat(0.5) + position / 2.0)
    }
}

/// Physical bounding box of the active volume.
///
/// The renderer draws a two-unit cube; `model_matrix` scales it so that the
/// longest physical side is one unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeGeometry {
    size: Vec3,
    spacing: Vec3,
    origin: Vec3,
}

/// Spacing used for pyramid volumes, which carry no physical calibration.
pub const PYRAMID_SPACING: f32 = 0.5;

impl VolumeGeometry {
    pub fn new(size: Vec3, spacing: Vec3, origin: Vec3) -> Self {
        Self {
            size,
            spacing,
            origin,
        }
    }

    /// Geometry of a pyramid buffer of `(width, height, depth)` texels.
    pub fn pyramid((width, height, depth): (u32, u32, u32)) -> Self {
        Self::new(
            Vec3::new(width as f32, height as f32, depth as f32),
            Vec3::splat(PYRAMID_SPACING),
            Vec3::ZERO,
        )
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn spacing(&self) -> Vec3 {
        self.spacing
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Longest physical side.
    pub fn scale_factor(&self) -> f32 {
        (self.size * self.spacing).max_element()
    }

    /// Physical extent normalised so that the longest side is 1.
    pub fn extent(&self) -> Vec3 {
        let scale = self.scale_factor();
        if scale <= 0.0 {
            return Vec3::ZERO;
        }
        self.size * self.spacing / scale
    }

    fn shift(&self, shift: bool) -> Vec3 {
        let scale = self.scale_factor();
        if shift && scale > 0.0 {
            self.origin / scale
        } else {
            Vec3::ZERO
        }
    }

    pub fn model_matrix(&self, shift: bool) -> Mat4 {
        Mat4::from_translation(-self.shift(shift)) * Mat4::from_scale(0.5 * self.extent())
    }

    /// Intercepts of the upper bounding planes on each axis.
    pub fn top(&self, shift: bool) -> Vec3 {
        self.extent() / 2.0 - self.shift(shift)
    }

    /// Intercepts of the lower bounding planes on each axis.
    pub fn bottom(&self, shift: bool) -> Vec3 {
        -self.extent() / 2.0 - self.shift(shift)
    }
}
