use crate::scene::Scene;
use anyhow::{ensure, Result};

/// A rendered image, ready to be sent to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub trait Renderer {
    /// Produces a frame of the scene, or `None` if the last frame is still accurate.
    fn render(&mut self, scene: &Scene) -> Result<Option<Frame>>;
}

/// Fills the frame with the background colour and encodes it as a binary PPM.
///
/// Stands in for a GPU renderer: it honours the frame geometry and skips scenes that did not
/// change since the previous frame.
#[derive(Default)]
pub struct FlatRenderer {
    last_revision: Option<u64>,
}

impl FlatRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Renderer for FlatRenderer {
    fn render(&mut self, scene: &Scene) -> Result<Option<Frame>> {
        if self.last_revision == Some(scene.revision()) {
            return Ok(None);
        }
        let (width, height) = scene.size();
        ensure!(width > 0 && height > 0, "empty frame {}x{}", width, height);

        let mut pixel = [0u8; 3];
        for (out, &c) in pixel.iter_mut().zip(scene.background().iter()) {
            *out = (c.max(0.0).min(1.0) * 255.0).round() as u8;
        }

        let header = format!("P6\n{} {}\n255\n", width, height);
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(header.len() + pixels * 3);
        data.extend_from_slice(header.as_bytes());
        for _ in 0..pixels {
            data.extend_from_slice(&pixel);
        }

        self.last_revision = Some(scene.revision());
        Ok(Some(Frame {
            width,
            height,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ppm_with_background() {
        let mut scene = Scene::new(2, 1);
        scene.set_background([1.0, 0.0, 0.5]);
        let frame = FlatRenderer::new().render(&scene).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (2, 1));
        let mut expected = b"P6\n2 1\n255\n".to_vec();
        expected.extend_from_slice(&[255, 0, 128, 255, 0, 128]);
        assert_eq!(frame.data, expected);
    }

    #[test]
    fn unchanged_scene_is_not_rendered_again() {
        let mut scene = Scene::new(4, 4);
        let mut renderer = FlatRenderer::new();
        assert!(renderer.render(&scene).unwrap().is_some());
        assert!(renderer.render(&scene).unwrap().is_none());
        scene.resize(8, 8);
        let frame = renderer.render(&scene).unwrap().unwrap();
        assert_eq!(frame.width, 8);
    }
}
