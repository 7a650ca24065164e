//! Render targets the resolve pass writes into.

use std::path::Path;

use crate::color::Color;
use crate::kbuffer::FAR_DEPTH;

/// How a target is accessed while bound as an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl ImageAccess {
    pub fn can_write(self) -> bool {
        !matches!(self, ImageAccess::ReadOnly)
    }
}

/// Row-major color pixels of a target bound as an image.
pub struct ImageBinding<'a> {
    pub width: u32,
    pub height: u32,
    pub access: ImageAccess,
    pixels: &'a mut [Color],
}

impl ImageBinding<'_> {
    pub fn pixels(&self) -> &[Color] {
        self.pixels
    }

    /// `None` for read-only bindings.
    pub fn pixels_mut(&mut self) -> Option<&mut [Color]> {
        self.access.can_write().then_some(&mut *self.pixels)
    }
}

pub trait RenderTarget {
    fn size(&self) -> (u32, u32);

    /// Makes this the active target for subsequent passes.
    fn bind(&mut self);

    fn unbind(&mut self);

    /// Clears color to `color` and depth to the far plane.
    fn clear(&mut self, color: Color);

    fn resize(&mut self, width: u32, height: u32);

    fn bind_as_image(&mut self, access: ImageAccess) -> ImageBinding<'_>;
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("failed to encode image: {0}")]
    Image(#[from] image::ImageError),
}

/// CPU image target with a color and a depth plane.
#[derive(Clone, Debug)]
pub struct ImageTarget {
    width: u32,
    height: u32,
    color: Vec<Color>,
    depth: Vec<f32>,
    bound: bool,
}

impl ImageTarget {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            color: vec![Color::TRANSPARENT; pixels],
            depth: vec![FAR_DEPTH; pixels],
            bound: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        (x < self.width && y < self.height)
            .then(|| self.color[y as usize * self.width as usize + x as usize])
    }

    pub fn pixels(&self) -> &[Color] {
        &self.color
    }

    pub fn depth(&self, x: u32, y: u32) -> Option<f32> {
        (x < self.width && y < self.height)
            .then(|| self.depth[y as usize * self.width as usize + x as usize])
    }

    /// 8-bit copy of the color plane.
    pub fn to_rgba8(&self) -> image::RgbaImage {
        let bytes = self.color.iter().flat_map(|c| c.to_rgba8()).collect();
        image::RgbaImage::from_raw(self.width, self.height, bytes)
            .unwrap_or_else(|| image::RgbaImage::new(self.width, self.height))
    }

    /// Writes the color plane as a PNG.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        self.to_rgba8()
            .save_with_format(path.as_ref(), image::ImageFormat::Png)?;
        log::info!("saved {}x{} snapshot to {}", self.width, self.height, path.as_ref().display());
        Ok(())
    }
}

impl RenderTarget for ImageTarget {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn bind(&mut self) {
        self.bound = true;
    }

    fn unbind(&mut self) {
        self.bound = false;
    }

    fn clear(&mut self, color: Color) {
        self.color.fill(color);
        self.depth.fill(FAR_DEPTH);
    }

    fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        let bound = self.bound;
        *self = Self::new(width, height);
        self.bound = bound;
    }

    fn bind_as_image(&mut self, access: ImageAccess) -> ImageBinding<'_> {
        ImageBinding {
            width: self.width,
            height: self.height,
            access,
            pixels: &mut self.color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_sets_color_and_far_depth() {
        let mut target = ImageTarget::new(2, 2);
        target.clear(Color::RED);
        assert_eq!(target.pixel(1, 1), Some(Color::RED));
        assert_eq!(target.depth(0, 1), Some(FAR_DEPTH));
        assert_eq!(target.pixel(2, 0), None);
    }

    #[test]
    fn read_only_binding_refuses_writes() {
        let mut target = ImageTarget::new(1, 1);
        assert!(target.bind_as_image(ImageAccess::ReadOnly).pixels_mut().is_none());
        assert!(target.bind_as_image(ImageAccess::WriteOnly).pixels_mut().is_some());
    }

    #[test]
    fn rgba8_export_matches_size() {
        let mut target = ImageTarget::new(3, 2);
        target.clear(Color::WHITE);
        let image = target.to_rgba8();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [255, 255, 255, 255]);
    }
}
