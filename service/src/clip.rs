//! Near/far clipping planes derived from the scene bounding box.
//!
//! The range is recomputed every time either the camera moves or the set of visible objects
//! changes, so it has to stay valid for any box and any camera placement, including a camera
//! that sits inside the scene and boxes that are flat along some axis.

use glam::DVec3;

/// Fraction by which the nearest corner distance is pulled towards the camera.
const NEAR_SHRINK: f64 = 0.99;
/// Fraction by which the farthest corner distance is pushed away from the camera.
const FAR_GROW: f64 = 1.01;
/// Extra slack on both ends, relative to the depth of the box.
const DEPTH_SLACK: f64 = 0.5;
/// Used when the padded range collapsed.
const DEGENERATE_NEAR: f64 = 0.01;
/// The smallest allowed `near / far` ratio. Anything smaller wastes the depth buffer.
const MIN_NEAR_RATIO: f64 = 0.001;
/// Depth used when the whole box lies behind the camera and nothing is visible.
const FALLBACK_FAR: f64 = 1.0;

/// An axis aligned box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: DVec3,
    pub max: DVec3,
}

impl Bounds {
    /// Creates a box spanning both points, regardless of their order.
    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// The box used while the scene has nothing visible in it.
    pub fn unit() -> Self {
        Self::new(DVec3::splat(-0.5), DVec3::splat(0.5))
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn corners(&self) -> [DVec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            DVec3::new(lo.x, lo.y, lo.z),
            DVec3::new(hi.x, lo.y, lo.z),
            DVec3::new(lo.x, hi.y, lo.z),
            DVec3::new(hi.x, hi.y, lo.z),
            DVec3::new(lo.x, lo.y, hi.z),
            DVec3::new(hi.x, lo.y, hi.z),
            DVec3::new(lo.x, hi.y, hi.z),
            DVec3::new(hi.x, hi.y, hi.z),
        ]
    }
}

/// What the calculator needs to know about the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: DVec3,
    pub focal_point: DVec3,
    /// Vertical field of view, in degrees.
    pub fov: f64,
    /// Viewport width divided by its height.
    pub aspect: f64,
    pub near: f64,
    pub far: f64,
}

impl CameraPose {
    /// Unit vector pointing from the focal point to the camera.
    ///
    /// A camera sitting exactly on its focal point has no defined direction, in that case the
    /// default +Z axis is used.
    pub fn view_plane_normal(&self) -> DVec3 {
        (self.position - self.focal_point)
            .try_normalize()
            .unwrap_or(DVec3::Z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippingRange {
    pub near: f64,
    pub far: f64,
}

/// Returns the signed distances of the closest and the farthest box corner, measured along the
/// viewing direction from the plane through the camera. Corners behind the camera are negative.
pub fn depth_extent(pose: &CameraPose, bounds: &Bounds) -> (f64, f64) {
    // The plane passes through the camera and faces the scene.
    let normal = -pose.view_plane_normal();
    let d = -normal.dot(pose.position);

    let mut near = f64::INFINITY;
    let mut far = f64::NEG_INFINITY;
    for corner in bounds.corners().iter() {
        let dist = normal.dot(*corner) + d;
        near = near.min(dist);
        far = far.max(dist);
    }
    (near, far)
}

/// Computes clipping planes that enclose the whole box with some slack.
///
/// The result always satisfies `0 <= near < far` and `near >= 0.001 * far`.
pub fn compute_near_far(pose: &CameraPose, bounds: &Bounds) -> ClippingRange {
    let (mut near, mut far) = depth_extent(pose, bounds);
    if near.is_nan() || far.is_nan() {
        near = 0.0;
        far = FALLBACK_FAR;
    }

    // Huge boxes overflow the distances. Keep everything within the finite range.
    near = near.max(0.0).min(f64::MAX);
    far = far.min(f64::MAX);
    if far <= 0.0 {
        far = FALLBACK_FAR;
    }

    let depth = far - near;
    let mut near = NEAR_SHRINK * near - DEPTH_SLACK * depth;
    let far = (FAR_GROW * far + DEPTH_SLACK * depth).min(f64::MAX);

    if near >= far {
        near = DEGENERATE_NEAR * far;
    }
    if near < MIN_NEAR_RATIO * far {
        near = MIN_NEAR_RATIO * far;
    }

    ClippingRange { near, far }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(position: DVec3, focal_point: DVec3) -> CameraPose {
        CameraPose {
            position,
            focal_point,
            fov: 30.0,
            aspect: 1.0,
            near: 0.1,
            far: 100.0,
        }
    }

    fn assert_valid(range: ClippingRange) {
        assert!(range.near >= 0.0, "negative near: {:?}", range);
        assert!(range.far.is_finite(), "infinite far: {:?}", range);
        assert!(range.near < range.far, "near >= far: {:?}", range);
        assert!(range.near >= MIN_NEAR_RATIO * range.far, "bad ratio: {:?}", range);
    }

    #[test]
    fn cube_in_front_of_camera() {
        let bounds = Bounds::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        let pose = pose_at(DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO);

        let (near, far) = depth_extent(&pose, &bounds);
        assert!((near - 4.0).abs() < 1e-12);
        assert!((far - 6.0).abs() < 1e-12);

        let range = compute_near_far(&pose, &bounds);
        assert!((range.near - 2.96).abs() < 1e-9);
        assert!((range.far - 7.06).abs() < 1e-9);
        assert_valid(range);
    }

    #[test]
    fn camera_inside_box() {
        let bounds = Bounds::new(DVec3::splat(-10.0), DVec3::splat(10.0));
        let pose = pose_at(DVec3::new(1.0, 2.0, 3.0), DVec3::ZERO);
        let (near, _) = depth_extent(&pose, &bounds);
        assert!(near < 0.0);
        assert_valid(compute_near_far(&pose, &bounds));
    }

    #[test]
    fn single_point() {
        let bounds = Bounds::new(DVec3::ONE, DVec3::ONE);
        let pose = pose_at(DVec3::new(1.0, 1.0, 3.0), DVec3::ONE);
        let range = compute_near_far(&pose, &bounds);
        assert_valid(range);
        assert!(range.near <= 2.0 && range.far >= 2.0);
    }

    #[test]
    fn camera_on_its_focal_point() {
        let bounds = Bounds::unit();
        let pose = pose_at(DVec3::ZERO, DVec3::ZERO);
        assert_eq!(pose.view_plane_normal(), DVec3::Z);
        assert_valid(compute_near_far(&pose, &bounds));
    }

    #[test]
    fn box_behind_camera() {
        let bounds = Bounds::new(DVec3::new(-1.0, -1.0, 10.0), DVec3::new(1.0, 1.0, 12.0));
        let pose = pose_at(DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO);
        let (_, far) = depth_extent(&pose, &bounds);
        assert!(far < 0.0);
        assert_valid(compute_near_far(&pose, &bounds));
    }

    #[test]
    fn huge_box_stays_finite() {
        let bounds = Bounds::new(DVec3::splat(-1.5e308), DVec3::splat(1.5e308));
        let pose = pose_at(DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO);
        let range = compute_near_far(&pose, &bounds);
        assert_valid(range);
        assert_eq!(range.far, f64::MAX);
    }

    #[test]
    fn valid_for_flat_boxes_and_any_camera() {
        let boxes = [
            Bounds::new(DVec3::splat(-1.0), DVec3::splat(1.0)),
            Bounds::new(DVec3::new(-1.0, -1.0, 0.0), DVec3::new(1.0, 1.0, 0.0)),
            Bounds::new(DVec3::new(0.0, -3.0, -3.0), DVec3::new(0.0, 3.0, 3.0)),
            Bounds::new(DVec3::new(-1e4, -1e-3, 0.0), DVec3::new(1e4, 1e-3, 2.0)),
            Bounds::new(DVec3::new(2.0, 2.0, 2.0), DVec3::new(2.0, 2.0, 2.0)),
            Bounds::new(DVec3::splat(-1.5e308), DVec3::splat(1.5e308)),
            Bounds::new(DVec3::new(-f64::MAX, 0.0, 0.0), DVec3::new(f64::MAX, 1.0, 1.0)),
        ];
        let steps = [-20.0, -1.5, -0.25, 0.0, 0.5, 3.0, 40.0];
        for bounds in boxes.iter() {
            for &x in steps.iter() {
                for &y in steps.iter() {
                    for &z in steps.iter() {
                        let pose = pose_at(DVec3::new(x, y, z), bounds.center());
                        assert_valid(compute_near_far(&pose, bounds));
                        let pose = pose_at(DVec3::new(x, y, z), DVec3::new(7.0, -2.0, 1.0));
                        assert_valid(compute_near_far(&pose, bounds));
                    }
                }
            }
        }
    }
}
