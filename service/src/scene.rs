//! The state that commands mutate and the renderer reads.
//!
//! The objects that make up a real scene live elsewhere; here the scene is reduced to what the
//! pipeline needs from it: the bounding box of whatever is visible, the camera and the frame
//! geometry.

use crate::camera::Camera;
use crate::clip::Bounds;

pub struct Scene {
    camera: Camera,
    bounds: Option<Bounds>,
    width: u32,
    height: u32,
    background: [f32; 3],
    last_payload: Option<Vec<u8>>,
    /// Bumped on every change, so a renderer can tell that there is nothing new to draw.
    revision: u64,
}

impl Scene {
    pub fn new(width: u32, height: u32) -> Self {
        let camera = Camera::new(&Bounds::unit(), aspect(width, height));
        Self {
            camera,
            bounds: None,
            width,
            height,
            background: [0.0, 0.0, 0.0],
            last_payload: None,
            revision: 0,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Applies `f` to the camera and brings the clipping range up to date with the new pose.
    pub fn update_camera<F: FnOnce(&mut Camera)>(&mut self, f: F) {
        f(&mut self.camera);
        let bounds = self.bounds();
        self.camera.reset_clipping_range(&bounds);
        self.touch();
    }

    /// The box around everything visible. An empty scene reports the unit box.
    pub fn bounds(&self) -> Bounds {
        self.bounds.unwrap_or_else(Bounds::unit)
    }

    /// Replaces the bounding box. `None` means that nothing is visible, and so does a box with
    /// non-finite corners.
    pub fn set_bounds(&mut self, bounds: Option<Bounds>) {
        self.bounds = bounds.filter(Bounds::is_finite);
        let bounds = self.bounds();
        self.camera.reset_clipping_range(&bounds);
        self.touch();
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.camera.set_aspect(aspect(width, height));
        self.touch();
    }

    pub fn background(&self) -> [f32; 3] {
        self.background
    }

    pub fn set_background(&mut self, rgb: [f32; 3]) {
        self.background = rgb;
        self.touch();
    }

    pub fn last_payload(&self) -> Option<&[u8]> {
        self.last_payload.as_deref()
    }

    pub fn set_payload(&mut self, data: Vec<u8>) {
        self.last_payload = Some(data);
        self.touch();
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Called right before a frame is produced.
    pub fn prepare_frame(&mut self) {
        let bounds = self.bounds();
        self.camera.reset_clipping_range(&bounds);
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

fn aspect(width: u32, height: u32) -> f64 {
    if height == 0 {
        1.0
    } else {
        f64::from(width) / f64::from(height)
    }
}
