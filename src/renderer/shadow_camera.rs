use glam::{Mat4, Vec3};

use crate::lights::{FaceRenderData, Light, LightKind, LightRenderData};
use crate::renderer::NormalizedRect;

/// Anti-bleed inset for single-face (spot) viewports, as a fraction of the
/// slot dimension per side. Normalized, so independent of atlas resolution.
pub const SPOT_VIEWPORT_MARGIN: f32 = 0.01;

const MIN_SHADOW_NEAR: f32 = 0.05;

/// Cube faces packed into a slot as a 3×2 grid: +X -X +Y on the top row,
/// -Y +Z -Z on the bottom. Offsets are in fractions of the slot rect.
const CUBE_FACE_OFFSETS: [[f32; 2]; 6] = [
    [0.0, 0.0],
    [1.0 / 3.0, 0.0],
    [2.0 / 3.0, 0.0],
    [0.0, 0.5],
    [1.0 / 3.0, 0.5],
    [2.0 / 3.0, 0.5],
];

const CUBE_FACE_DIRECTIONS: [Vec3; 6] = [
    Vec3::X,
    Vec3::NEG_X,
    Vec3::Y,
    Vec3::NEG_Y,
    Vec3::Z,
    Vec3::NEG_Z,
];

const CUBE_FACE_UPS: [Vec3; 6] = [
    Vec3::NEG_Y,
    Vec3::NEG_Y,
    Vec3::Z,
    Vec3::NEG_Z,
    Vec3::NEG_Y,
    Vec3::NEG_Y,
];

type FaceBuildFn = fn(&Light, NormalizedRect, usize) -> FaceRenderData;

struct FaceSetup {
    count: usize,
    build: FaceBuildFn,
}

/// Per-kind dispatch table. Directional lights are serviced by the cascade
/// path and contribute zero faces here.
fn face_setup(kind: LightKind) -> FaceSetup {
    match kind {
        LightKind::Spot => FaceSetup { count: 1, build: build_spot_face },
        LightKind::Omni => FaceSetup { count: 6, build: build_omni_face },
        LightKind::Directional => FaceSetup { count: 0, build: build_spot_face },
    }
}

/// Computes viewport/scissor/camera/shadow-matrix for every face of the
/// light's assigned slot and stores them in its render data. Pure geometry:
/// a degenerate slot simply produces zero-area viewports.
pub fn setup_light_faces(light: &mut Light, slot: NormalizedRect) {
    let setup = face_setup(light.kind);
    let mut faces = std::mem::take(&mut light.render_data).unwrap_or_default().faces;
    faces.clear();
    for face in 0..setup.count {
        faces.push((setup.build)(light, slot, face));
    }
    light.render_data = Some(LightRenderData { faces });
}

pub fn spot_viewport(slot: NormalizedRect) -> NormalizedRect {
    slot.inset_fraction(SPOT_VIEWPORT_MARGIN)
}

/// One cell of the 3×2 cube-face grid. No inset: sibling faces of the same
/// light may share edges, but never with another light's content.
pub fn cube_face_viewport(slot: NormalizedRect, face: usize) -> NormalizedRect {
    let offset = CUBE_FACE_OFFSETS[face.min(5)];
    NormalizedRect::new(
        slot.x + offset[0] * slot.w,
        slot.y + offset[1] * slot.h,
        slot.w / 3.0,
        slot.h / 2.0,
    )
}

/// Maps world space into the viewport's normalized atlas sampling space
/// (texture v runs downward).
pub fn shadow_matrix(viewport: NormalizedRect, view_proj: Mat4) -> Mat4 {
    let remap = Mat4::from_translation(Vec3::new(viewport.x, viewport.y, 0.0))
        * Mat4::from_scale(Vec3::new(viewport.w, viewport.h, 1.0))
        * Mat4::from_translation(Vec3::new(0.5, 0.5, 0.0))
        * Mat4::from_scale(Vec3::new(0.5, -0.5, 1.0));
    remap * view_proj
}

fn shadow_clip_range(range: f32) -> (f32, f32) {
    let far = range.max(MIN_SHADOW_NEAR * 2.0);
    (MIN_SHADOW_NEAR.min(far * 0.5), far)
}

fn build_spot_face(light: &Light, slot: NormalizedRect, _face: usize) -> FaceRenderData {
    let mut direction = light.direction.normalize_or_zero();
    if direction.length_squared() < 1.0e-6 {
        direction = Vec3::NEG_Z;
    }
    let mut up = Vec3::Y;
    if direction.dot(up).abs() > 0.99 {
        up = Vec3::X;
    }
    let (near, far) = shadow_clip_range(light.range);
    let fov = (light.outer_angle * 2.0).clamp(0.01, std::f32::consts::PI - 0.01);
    let view = Mat4::look_at_rh(light.position, light.position + direction, up);
    let projection = Mat4::perspective_rh(fov, 1.0, near, far);
    let viewport = spot_viewport(slot);
    FaceRenderData {
        view,
        projection,
        viewport,
        scissor: viewport,
        shadow_matrix: shadow_matrix(viewport, projection * view),
    }
}

fn build_omni_face(light: &Light, slot: NormalizedRect, face: usize) -> FaceRenderData {
    let face = face.min(5);
    let (near, far) = shadow_clip_range(light.range);
    let view = Mat4::look_at_rh(
        light.position,
        light.position + CUBE_FACE_DIRECTIONS[face],
        CUBE_FACE_UPS[face],
    );
    let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far);
    let viewport = cube_face_viewport(slot, face);
    FaceRenderData {
        view,
        projection,
        viewport,
        scissor: viewport,
        shadow_matrix: shadow_matrix(viewport, projection * view),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn cube_faces_tile_slot_in_3x2_grid_without_inset() {
        let slot = NormalizedRect::new(0.5, 0.0, 0.5, 0.5);
        let faces: Vec<_> = (0..6).map(|f| cube_face_viewport(slot, f)).collect();
        let total: f32 = faces.iter().map(|r| r.area()).sum();
        assert!((total - slot.area()).abs() < 1.0e-5);
        for (i, a) in faces.iter().enumerate() {
            assert!(a.x >= slot.x - 1.0e-6 && a.y >= slot.y - 1.0e-6);
            assert!(a.x + a.w <= slot.x + slot.w + 1.0e-5);
            assert!(a.y + a.h <= slot.y + slot.h + 1.0e-5);
            for b in faces.iter().skip(i + 1) {
                let overlap_x = (a.x + a.w).min(b.x + b.w) - a.x.max(b.x);
                let overlap_y = (a.y + a.h).min(b.y + b.h) - a.y.max(b.y);
                assert!(overlap_x <= 1.0e-5 || overlap_y <= 1.0e-5);
            }
        }
    }

    #[test]
    fn spot_viewport_is_inset_inside_slot() {
        let slot = NormalizedRect::new(0.0, 0.5, 0.5, 0.5);
        let viewport = spot_viewport(slot);
        assert!(viewport.x > slot.x && viewport.y > slot.y);
        assert!(viewport.w < slot.w && viewport.h < slot.h);
    }

    #[test]
    fn spot_light_gets_one_face_and_omni_six() {
        let slot = NormalizedRect::UNIT;
        let mut spot = Light::new(LightKind::Spot);
        setup_light_faces(&mut spot, slot);
        assert_eq!(spot.render_data.as_ref().unwrap().faces.len(), 1);
        let mut omni = Light::new(LightKind::Omni);
        setup_light_faces(&mut omni, slot);
        assert_eq!(omni.render_data.as_ref().unwrap().faces.len(), 6);
    }

    #[test]
    fn shadow_matrix_lands_frustum_center_inside_viewport() {
        let mut light = Light::new(LightKind::Spot);
        light.position = Vec3::new(0.0, 2.0, 0.0);
        light.direction = Vec3::NEG_Y;
        light.range = 10.0;
        let slot = NormalizedRect::new(0.5, 0.5, 0.5, 0.5);
        setup_light_faces(&mut light, slot);
        let face = light.render_data.as_ref().unwrap().faces[0];
        // A point straight down the light axis projects to the viewport center.
        let clip = face.shadow_matrix * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let uv = clip / clip.w;
        assert!((uv.x - (face.viewport.x + face.viewport.w * 0.5)).abs() < 1.0e-4);
        assert!((uv.y - (face.viewport.y + face.viewport.h * 0.5)).abs() < 1.0e-4);
    }

    #[test]
    fn zero_area_slot_degenerates_without_panicking() {
        let mut light = Light::new(LightKind::Spot);
        setup_light_faces(&mut light, NormalizedRect::new(0.25, 0.25, 0.0, 0.0));
        let face = light.render_data.as_ref().unwrap().faces[0];
        assert_eq!(face.viewport.area(), 0.0);
    }
}
