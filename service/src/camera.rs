//! The camera that the render thread looks through.
//!
//! The pose is kept as an orbit around the focal point: an orientation, a distance and the focal
//! point itself. The position is derived from those.

use crate::clip::{self, Bounds, CameraPose};
use glam::{DQuat, DVec3, EulerRot};

pub const DEFAULT_FOV: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct Camera {
    focal_point: DVec3,
    orientation: DQuat,
    distance: f64,
    /// The distance chosen by the last `reset`. Zoom factors are relative to it.
    fitted_distance: f64,
    fov: f64,
    aspect: f64,
    near: f64,
    far: f64,
}

impl Camera {
    /// Creates a camera that looks down the -Z axis and frames the given box.
    pub fn new(bounds: &Bounds, aspect: f64) -> Self {
        let mut camera = Self {
            focal_point: DVec3::ZERO,
            orientation: DQuat::IDENTITY,
            distance: 1.0,
            fitted_distance: 1.0,
            fov: DEFAULT_FOV,
            aspect,
            near: 0.1,
            far: 10.0,
        };
        camera.reset(bounds, true);
        camera
    }

    pub fn pose(&self) -> CameraPose {
        CameraPose {
            position: self.position(),
            focal_point: self.focal_point,
            fov: self.fov,
            aspect: self.aspect,
            near: self.near,
            far: self.far,
        }
    }

    pub fn position(&self) -> DVec3 {
        self.focal_point + self.view_plane_normal() * self.distance
    }

    pub fn focal_point(&self) -> DVec3 {
        self.focal_point
    }

    pub fn view_up(&self) -> DVec3 {
        self.orientation * DVec3::Y
    }

    pub fn view_plane_normal(&self) -> DVec3 {
        self.orientation * DVec3::Z
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn clipping_range(&self) -> (f64, f64) {
        (self.near, self.far)
    }

    pub fn set_aspect(&mut self, aspect: f64) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    /// Moves the focal point, keeping the orientation and the distance.
    pub fn aim(&mut self, focal_point: DVec3) {
        self.focal_point = focal_point;
    }

    /// Orbits the camera around the focal point. Angles are in degrees and are absolute, i.e.
    /// `orbit(0, 0, 0)` restores the default orientation.
    pub fn orbit(&mut self, x: f64, y: f64, z: f64) {
        self.orientation = DQuat::from_euler(
            EulerRot::XYZ,
            x.to_radians(),
            y.to_radians(),
            z.to_radians(),
        );
    }

    /// Sets the distance to `fitted / factor`. The caller guarantees `factor > 0`.
    pub fn zoom(&mut self, factor: f64) {
        self.distance = self.fitted_distance / factor;
    }

    /// Shifts both the camera and the focal point within the view plane. The offsets are given
    /// in units of the visible height at the focal distance.
    pub fn pan(&mut self, dx: f64, dy: f64) {
        let height = 2.0 * self.distance * (self.fov.to_radians() / 2.0).tan();
        let right = self.orientation * DVec3::X;
        self.focal_point += (right * dx + self.view_up() * dy) * height;
    }

    /// Fits the box into the view.
    ///
    /// The distance is chosen so that the projected box fits both the horizontal and the vertical
    /// field of view, whichever is tighter for the current window aspect. With `all` the
    /// orientation is restored as well.
    pub fn reset(&mut self, bounds: &Bounds, all: bool) {
        if all {
            self.orientation = DQuat::IDENTITY;
        }
        self.focal_point = bounds.center();

        let size = bounds.size();
        let right = self.orientation * DVec3::X;
        let up = self.view_up();
        let normal = self.view_plane_normal();
        let width = right.abs().dot(size);
        let height = up.abs().dot(size);
        let depth = normal.abs().dot(size);

        let half_fov_v = (self.fov.to_radians() / 2.0).tan();
        let scene_aspect = if height > 0.0 {
            width / height
        } else {
            f64::INFINITY
        };
        let fitted = if scene_aspect > self.aspect {
            // Horizontal field of view is the limiting one.
            let half_fov_h = half_fov_v * self.aspect;
            (width / 2.0) / half_fov_h
        } else {
            (height / 2.0) / half_fov_v
        };
        let mut distance = fitted + depth / 2.0;
        if !distance.is_finite() || distance <= 0.0 {
            distance = 1.0;
        }

        self.fitted_distance = distance;
        self.distance = distance;
        self.reset_clipping_range(bounds);
    }

    pub fn reset_clipping_range(&mut self, bounds: &Bounds) {
        let range = clip::compute_near_far(&self.pose(), bounds);
        self.near = range.near;
        self.far = range.far;
    }
}
