use glam::{Mat4, Vec3};

/// Pixel rectangle of the render target a camera draws into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Viewport covering a whole `width` x `height` target.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }

    /// Pixel range `(x0, y0, x1, y1)` (exclusive end) inside a target.
    pub fn clamp_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x0 = self.x.min(width);
        let y0 = self.y.min(height);
        let x1 = self.x.saturating_add(self.width).min(width);
        let y1 = self.y.saturating_add(self.height).min(height);
        (x0, y0, x1, y1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// Vertical field of view in radians.
    Perspective { fov_y: f32 },
    /// Height of the view volume in world units; width follows the aspect.
    Orthographic { height: f32 },
}

/// Uniform block consumed by the store pass shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub viewport: [f32; 4],
}

/// Right-handed camera with a `[0, 1]` depth range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
    pub viewport: Viewport,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            projection: Projection::Perspective {
                fov_y: 60f32.to_radians(),
            },
            near: 0.1,
            far: 100.0,
            viewport: Viewport::full(800, 600),
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn perspective(mut self, fov_y_degrees: f32) -> Self {
        self.projection = Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
        };
        self
    }

    pub fn orthographic(mut self, height: f32) -> Self {
        self.projection = Projection::Orthographic { height };
        self
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn looking_at(mut self, target: Vec3) -> Self {
        self.forward = (target - self.position).normalize_or(Vec3::NEG_Z);
        self
    }

    pub fn clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        let aspect = self.viewport.aspect();
        match self.projection {
            Projection::Perspective { fov_y } => {
                Mat4::perspective_rh(fov_y, aspect, self.near, self.far)
            }
            Projection::Orthographic { height } => {
                let hh = height * 0.5;
                let hw = hh * aspect;
                Mat4::orthographic_rh(-hw, hw, -hh, hh, self.near, self.far)
            }
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Matrices and viewport packed for upload.
    pub fn uniforms(&self) -> CameraUniforms {
        let view = self.view_matrix();
        let proj = self.projection_matrix();
        let vp = self.viewport;
        CameraUniforms {
            view_proj: (proj * view).to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
            position: self.position.extend(1.0).to_array(),
            viewport: [
                vp.x as f32,
                vp.y as f32,
                vp.width as f32,
                vp.height as f32,
            ],
        }
    }
}
