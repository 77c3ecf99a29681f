use glam::{Mat4, Vec3};
use smallvec::SmallVec;

use crate::renderer::NormalizedRect;
use crate::scene::InstanceHandle;

/// Stable index into a [`LightTable`]. Slots reference lights through this id
/// rather than a borrow, so a light can disappear without notifying the atlas;
/// staleness is resolved by equality check on the next update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LightId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightKind {
    Spot,
    Omni,
    /// Serviced by the camera-bound cascade path, never by the atlas.
    Directional,
}

impl LightKind {
    pub fn face_count(self) -> usize {
        match self {
            LightKind::Spot => 1,
            LightKind::Omni => 6,
            LightKind::Directional => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowFilter {
    /// Hardware depth-comparison sampling; depth-only shadow rendering.
    Pcf,
    /// Variance shadow map; depth moments encoded into a color target.
    Vsm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowUpdateMode {
    EveryFrame,
    /// Render once, then keep the atlas content until the slot moves.
    Once,
    Never,
}

/// Per-face shadow render output: camera, atlas viewport/scissor, and the
/// matrix shading uses to sample this face's atlas region.
#[derive(Clone, Copy, Debug)]
pub struct FaceRenderData {
    pub view: Mat4,
    pub projection: Mat4,
    pub viewport: NormalizedRect,
    pub scissor: NormalizedRect,
    pub shadow_matrix: Mat4,
}

impl Default for FaceRenderData {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            viewport: NormalizedRect::default(),
            scissor: NormalizedRect::default(),
            shadow_matrix: Mat4::IDENTITY,
        }
    }
}

/// Lazily created on the first frame a light renders shadows; mutated every
/// rendered frame and kept for the light's lifetime.
#[derive(Clone, Debug, Default)]
pub struct LightRenderData {
    pub faces: SmallVec<[FaceRenderData; 6]>,
}

#[derive(Clone, Debug)]
pub struct Light {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    /// Half-angle of the spot cone, radians.
    pub outer_angle: f32,
    pub cast_shadows: bool,
    pub cookie: bool,
    pub visible_this_frame: bool,
    /// Estimated on-screen size; the only priority signal the allocator uses.
    pub screen_size: f32,
    pub shadow_bias: f32,
    pub shadow_filter: ShadowFilter,
    pub vsm_blur_size: u32,
    pub shadow_update_mode: ShadowUpdateMode,
    /// Latch for [`ShadowUpdateMode::Once`].
    pub shadow_rendered: bool,
    /// Rendering layers scanned for shadow casters.
    pub layers: SmallVec<[u32; 4]>,
    /// When set, casters come from this list instead of the layer scan.
    pub explicit_casters: Option<Vec<InstanceHandle>>,

    // Atlas slot cache, confirmed or invalidated by ShadowAtlas::update.
    pub atlas_slot_index: Option<usize>,
    pub atlas_slot_size: u32,
    pub atlas_version: u32,
    /// True while the light holds a slot this frame.
    pub atlas_viewport_allocated: bool,
    /// True when this frame gave the light a different slot; forces re-render.
    pub atlas_slot_updated: bool,

    pub render_data: Option<LightRenderData>,
}

impl Light {
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            range: 10.0,
            outer_angle: 45f32.to_radians(),
            cast_shadows: false,
            cookie: false,
            visible_this_frame: false,
            screen_size: 0.0,
            shadow_bias: 0.0005,
            shadow_filter: ShadowFilter::Pcf,
            vsm_blur_size: 1,
            shadow_update_mode: ShadowUpdateMode::EveryFrame,
            shadow_rendered: false,
            layers: SmallVec::new(),
            explicit_casters: None,
            atlas_slot_index: None,
            atlas_slot_size: 0,
            atlas_version: 0,
            atlas_viewport_allocated: false,
            atlas_slot_updated: false,
            render_data: None,
        }
    }

    /// Whether the light wants an atlas slot. Update mode is deliberately not
    /// consulted: a `Once`/`Never` light keeps its slot so stale content stays
    /// sampleable even on frames it does not draw.
    pub fn needs_shadow(&self) -> bool {
        self.cast_shadows
    }

    pub fn needs_cookie(&self) -> bool {
        self.cookie
    }

    /// Whether shadow content should actually be drawn this frame. A light
    /// that keeps its slot and already rendered under `Once` skips drawing;
    /// stale atlas content persists.
    pub fn needs_shadow_rendering(&self) -> bool {
        if !self.cast_shadows {
            return false;
        }
        match self.shadow_update_mode {
            ShadowUpdateMode::EveryFrame => true,
            ShadowUpdateMode::Once => !self.shadow_rendered || self.atlas_slot_updated,
            ShadowUpdateMode::Never => false,
        }
    }

    pub fn uses_vsm(&self) -> bool {
        self.shadow_filter == ShadowFilter::Vsm
    }
}

/// Arena of lights addressed by [`LightId`]. Removal leaves a hole so ids of
/// surviving lights stay valid.
#[derive(Default)]
pub struct LightTable {
    entries: Vec<Option<Light>>,
}

impl LightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, light: Light) -> LightId {
        if let Some(index) = self.entries.iter().position(Option::is_none) {
            self.entries[index] = Some(light);
            return LightId(index as u32);
        }
        self.entries.push(Some(light));
        LightId((self.entries.len() - 1) as u32)
    }

    pub fn remove(&mut self, id: LightId) -> Option<Light> {
        self.entries.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub fn get(&self, id: LightId) -> Option<&Light> {
        self.entries.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: LightId) -> Option<&mut Light> {
        self.entries.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (LightId, &Light)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|light| (LightId(index as u32), light)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LightId, &mut Light)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_mut().map(|light| (LightId(index as u32), light)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_table_reuses_holes() {
        let mut table = LightTable::new();
        let a = table.add(Light::new(LightKind::Spot));
        let b = table.add(Light::new(LightKind::Omni));
        table.remove(a);
        let c = table.add(Light::new(LightKind::Spot));
        assert_eq!(a, c);
        assert_ne!(b, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn update_mode_once_latches_until_slot_moves() {
        let mut light = Light::new(LightKind::Spot);
        light.cast_shadows = true;
        light.shadow_update_mode = ShadowUpdateMode::Once;
        assert!(light.needs_shadow_rendering());
        light.shadow_rendered = true;
        assert!(!light.needs_shadow_rendering());
        light.atlas_slot_updated = true;
        assert!(light.needs_shadow_rendering());
    }

    #[test]
    fn never_mode_still_wants_a_slot_but_never_draws() {
        let mut light = Light::new(LightKind::Omni);
        light.cast_shadows = true;
        light.shadow_update_mode = ShadowUpdateMode::Never;
        assert!(light.needs_shadow());
        assert!(!light.needs_shadow_rendering());
    }
}
