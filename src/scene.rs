use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::mesh::MeshHandle;

/// Index into [`Scene::instances`].
pub type InstanceHandle = usize;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius: radius.max(0.0) }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InstanceFlags: u32 {
        const CASTS_SHADOWS = 1 << 0;
        /// When cleared, the instance bypasses the shadow frustum test and is
        /// always included in the caster list.
        const SHADOW_CULLING = 1 << 1;
    }
}

impl Default for InstanceFlags {
    fn default() -> Self {
        InstanceFlags::SHADOW_CULLING
    }
}

#[derive(Clone, Debug)]
pub struct MeshInstance {
    pub mesh: MeshHandle,
    pub transform: Mat4,
    /// World-space bounds, kept current by whoever owns the transform.
    pub bounds: BoundingSphere,
    pub flags: InstanceFlags,
    /// Resolved material key; instances without one cannot be drawn.
    pub material: Option<String>,
    /// Stable shader/material sort key used to order shadow draws and keep
    /// GPU state changes down. Not a depth key.
    pub sort_key: u32,
    pub visible_this_frame: bool,
}

impl MeshInstance {
    pub fn new(mesh: MeshHandle, transform: Mat4, bounds: BoundingSphere) -> Self {
        Self {
            mesh,
            transform,
            bounds,
            flags: InstanceFlags::default(),
            material: None,
            sort_key: 0,
            visible_this_frame: false,
        }
    }

    pub fn shadow_caster(mut self) -> Self {
        self.flags |= InstanceFlags::CASTS_SHADOWS;
        self
    }

    pub fn with_material(mut self, key: impl Into<String>, sort_key: u32) -> Self {
        self.material = Some(key.into());
        self.sort_key = sort_key;
        self
    }
}

/// One rendering layer's shadow casters. The same layer id may appear twice
/// in a composition (opaque and transparent halves); the culler deduplicates
/// by id when gathering.
#[derive(Clone, Debug)]
pub struct RenderLayer {
    pub id: u32,
    pub shadow_casters: Vec<InstanceHandle>,
}

#[derive(Clone, Debug, Default)]
pub struct LayerComposition {
    pub layers: Vec<RenderLayer>,
}

#[derive(Default)]
pub struct Scene {
    pub instances: Vec<MeshInstance>,
    pub composition: LayerComposition,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> InstanceHandle {
        self.instances.push(instance);
        self.instances.len() - 1
    }

    pub fn reset_visibility(&mut self) {
        for instance in &mut self.instances {
            instance.visible_this_frame = false;
        }
    }
}
