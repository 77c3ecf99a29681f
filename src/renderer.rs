use glam::{Mat4, Vec3, Vec4};

pub mod shadow_atlas;
pub mod shadow_camera;
pub mod shadow_cull;
pub mod shadow_frame;
pub mod shadow_pass;
pub mod vsm_blur;

pub use shadow_atlas::{ShadowAtlas, SplitPolicy};
pub use shadow_frame::{ShadowFrameMetrics, ShadowFrameParams, ShadowFramePass};

pub const SHADOW_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
pub const SHADOW_MOMENTS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const COOKIE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub const MIN_ATLAS_RESOLUTION: u32 = 256;
pub const MAX_ATLAS_RESOLUTION: u32 = 8192;

/// Axis-aligned sub-rectangle of a unit-square texture, in [0,1] coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct NormalizedRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl NormalizedRect {
    pub const UNIT: NormalizedRect = NormalizedRect { x: 0.0, y: 0.0, w: 1.0, h: 1.0 };

    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Shrinks the rect by `fraction` of its own width/height on every side.
    pub fn inset_fraction(&self, fraction: f32) -> NormalizedRect {
        let dx = self.w * fraction;
        let dy = self.h * fraction;
        NormalizedRect {
            x: self.x + dx,
            y: self.y + dy,
            w: (self.w - 2.0 * dx).max(0.0),
            h: (self.h - 2.0 * dy).max(0.0),
        }
    }

    /// Shrinks the rect by a fixed number of texels on every side.
    pub fn inset_texels(&self, texels: f32, resolution: u32) -> NormalizedRect {
        if resolution == 0 || self.w <= 0.0 {
            return *self;
        }
        let fraction = (texels / resolution as f32 / self.w).min(0.5);
        self.inset_fraction(fraction)
    }

    /// Converts to pixel coordinates inside a `resolution`-sized texture.
    pub fn to_texels(&self, resolution: u32) -> (u32, u32, u32, u32) {
        let res = resolution as f32;
        (
            (self.x * res).floor() as u32,
            (self.y * res).floor() as u32,
            (self.w * res).floor() as u32,
            (self.h * res).floor() as u32,
        )
    }
}

/// Extracts the six clip planes of a view-projection matrix (left, right,
/// bottom, top, near, far), each as (normal, distance) with unnormalized length.
pub fn extract_frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let rows = view_proj.transpose();
    let x = rows.x_axis;
    let y = rows.y_axis;
    let z = rows.z_axis;
    let w = rows.w_axis;
    [w + x, w - x, w + y, w - y, w + z, w - z]
}

pub fn sphere_in_frustum(center: Vec3, radius: f32, planes: &[Vec4; 6]) -> bool {
    let p = center.extend(1.0);
    for plane in planes {
        let normal_len = plane.truncate().length();
        if normal_len <= f32::EPSILON {
            continue;
        }
        if plane.dot(p) / normal_len < -radius {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_in_frustum_accepts_origin_for_centered_camera() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh_gl(60f32.to_radians(), 1.0, 0.1, 100.0);
        let planes = extract_frustum_planes(proj * view);
        assert!(sphere_in_frustum(Vec3::ZERO, 0.5, &planes));
        assert!(!sphere_in_frustum(Vec3::new(200.0, 0.0, 0.0), 0.5, &planes));
    }

    #[test]
    fn inset_fraction_keeps_rect_centered() {
        let rect = NormalizedRect::new(0.5, 0.0, 0.5, 0.5);
        let inset = rect.inset_fraction(0.01);
        assert!(inset.x > rect.x && inset.y > rect.y);
        assert!((inset.x + inset.w) < (rect.x + rect.w) + 1.0e-6);
        assert!((rect.x + rect.w * 0.5 - (inset.x + inset.w * 0.5)).abs() < 1.0e-6);
    }
}
