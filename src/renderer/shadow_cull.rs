use smallvec::SmallVec;

use crate::lights::{FaceRenderData, Light};
use crate::renderer::{extract_frustum_planes, sphere_in_frustum};
use crate::scene::{InstanceFlags, InstanceHandle, LayerComposition, MeshInstance};

/// Reused across faces/frames to keep gathering allocation-free in steady
/// state.
#[derive(Default)]
pub struct ShadowCullScratch {
    seen_layers: SmallVec<[u32; 8]>,
    candidates: Vec<InstanceHandle>,
}

/// Collects caster candidates for a light: the explicit list when present,
/// otherwise every shadow-caster list of the light's layers. A layer id that
/// appears twice in the composition (opaque + transparent halves) is only
/// scanned once.
pub fn gather_casters<'a>(
    light: &Light,
    composition: &LayerComposition,
    scratch: &'a mut ShadowCullScratch,
) -> &'a [InstanceHandle] {
    scratch.candidates.clear();
    if let Some(explicit) = &light.explicit_casters {
        scratch.candidates.extend_from_slice(explicit);
        return &scratch.candidates;
    }
    scratch.seen_layers.clear();
    for layer in &composition.layers {
        if !light.layers.contains(&layer.id) {
            continue;
        }
        if scratch.seen_layers.contains(&layer.id) {
            continue;
        }
        scratch.seen_layers.push(layer.id);
        scratch.candidates.extend_from_slice(&layer.shadow_casters);
    }
    &scratch.candidates
}

/// Frustum-culls candidates against one shadow camera face, marks survivors
/// visible-this-frame, and orders them by shader sort key (stable), not depth.
pub fn cull_casters(
    face: &FaceRenderData,
    instances: &mut [MeshInstance],
    candidates: &[InstanceHandle],
) -> Vec<InstanceHandle> {
    let planes = extract_frustum_planes(face.projection * face.view);
    let mut visible = Vec::with_capacity(candidates.len());
    for &handle in candidates {
        let Some(instance) = instances.get_mut(handle) else { continue };
        if !instance.flags.contains(InstanceFlags::CASTS_SHADOWS) {
            continue;
        }
        let include = !instance.flags.contains(InstanceFlags::SHADOW_CULLING)
            || sphere_in_frustum(instance.bounds.center, instance.bounds.radius, &planes);
        if include {
            instance.visible_this_frame = true;
            visible.push(handle);
        }
    }
    visible.sort_by_key(|&handle| instances[handle].sort_key);
    visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::{Light, LightKind};
    use crate::mesh::MeshHandle;
    use crate::renderer::shadow_camera::setup_light_faces;
    use crate::renderer::NormalizedRect;
    use crate::scene::{BoundingSphere, RenderLayer};
    use glam::{Mat4, Vec3};

    fn caster(center: Vec3, sort_key: u32) -> MeshInstance {
        let mut instance =
            MeshInstance::new(MeshHandle(0), Mat4::IDENTITY, BoundingSphere::new(center, 0.5))
                .shadow_caster();
        instance.sort_key = sort_key;
        instance.material = Some("default".to_string());
        instance
    }

    fn spot_face(position: Vec3, direction: Vec3) -> FaceRenderData {
        let mut light = Light::new(LightKind::Spot);
        light.position = position;
        light.direction = direction;
        light.range = 50.0;
        setup_light_faces(&mut light, NormalizedRect::UNIT);
        light.render_data.unwrap().faces[0]
    }

    #[test]
    fn duplicate_layers_are_scanned_once() {
        let mut light = Light::new(LightKind::Spot);
        light.layers.push(3);
        let composition = LayerComposition {
            layers: vec![
                RenderLayer { id: 3, shadow_casters: vec![0, 1] },
                RenderLayer { id: 3, shadow_casters: vec![0, 1] },
                RenderLayer { id: 7, shadow_casters: vec![2] },
            ],
        };
        let mut scratch = ShadowCullScratch::default();
        let candidates = gather_casters(&light, &composition, &mut scratch);
        assert_eq!(candidates, &[0, 1]);
    }

    #[test]
    fn explicit_caster_list_bypasses_layers() {
        let mut light = Light::new(LightKind::Spot);
        light.layers.push(3);
        light.explicit_casters = Some(vec![9, 4]);
        let composition =
            LayerComposition { layers: vec![RenderLayer { id: 3, shadow_casters: vec![0] }] };
        let mut scratch = ShadowCullScratch::default();
        assert_eq!(gather_casters(&light, &composition, &mut scratch), &[9, 4]);
    }

    #[test]
    fn culling_keeps_in_frustum_and_marks_visible() {
        let face = spot_face(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z);
        let mut instances = vec![
            caster(Vec3::ZERO, 0),              // in front of the light
            caster(Vec3::new(0.0, 0.0, 50.0), 0), // behind the light
        ];
        let visible = cull_casters(&face, &mut instances, &[0, 1]);
        assert_eq!(visible, vec![0]);
        assert!(instances[0].visible_this_frame);
        assert!(!instances[1].visible_this_frame);
    }

    #[test]
    fn disabled_culling_always_includes_instance() {
        let face = spot_face(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z);
        let mut far_away = caster(Vec3::new(0.0, 0.0, 500.0), 0);
        far_away.flags.remove(InstanceFlags::SHADOW_CULLING);
        let mut instances = vec![far_away];
        assert_eq!(cull_casters(&face, &mut instances, &[0]), vec![0]);
    }

    #[test]
    fn non_casters_are_skipped() {
        let face = spot_face(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z);
        let mut plain = caster(Vec3::ZERO, 0);
        plain.flags.remove(InstanceFlags::CASTS_SHADOWS);
        let mut instances = vec![plain];
        assert!(cull_casters(&face, &mut instances, &[0]).is_empty());
    }

    #[test]
    fn draw_list_is_ordered_by_sort_key_not_depth() {
        let face = spot_face(Vec3::new(0.0, 0.0, 10.0), Vec3::NEG_Z);
        let mut instances = vec![
            caster(Vec3::new(0.0, 0.0, 8.0), 5),
            caster(Vec3::new(0.0, 0.0, 0.0), 1),
            caster(Vec3::new(0.0, 0.0, 4.0), 3),
        ];
        let visible = cull_casters(&face, &mut instances, &[0, 1, 2]);
        assert_eq!(visible, vec![1, 2, 0]);
    }
}
