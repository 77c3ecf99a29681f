use anyhow::{ensure, Result};

use crate::config::LightingParams;
use crate::lights::{LightId, LightKind, LightTable};
use crate::renderer::{
    NormalizedRect, COOKIE_FORMAT, MAX_ATLAS_RESOLUTION, MIN_ATLAS_RESOLUTION, SHADOW_DEPTH_FORMAT,
    SHADOW_MOMENTS_FORMAT,
};

use super::shadow_camera;

const MIN_COOKIE_RESOLUTION: u32 = 64;
const MAX_COOKIE_RESOLUTION: u32 = 4096;

/// Recursive quad-grid subdivision: the first element is the top-level N×N
/// grid; each following element refines the next top-level cell (discovery
/// order) into an n×n sub-grid. `[2, 1, 1, 1, 3]` keeps three quadrants whole
/// and splits the fourth into nine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitPolicy(Vec<u32>);

impl SplitPolicy {
    pub fn new(values: Vec<u32>) -> Self {
        Self(values.into_iter().map(|v| v.max(1)).collect())
    }

    /// Smallest N with N² slots for `light_count` lights.
    pub fn automatic(light_count: usize) -> Self {
        let n = (light_count.max(1) as f32).sqrt().ceil() as u32;
        Self(vec![n.max(1)])
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Slot {
    pub rect: NormalizedRect,
    pub size_texels: u32,
    pub used: bool,
    /// Weak back-reference: the light that last held this slot. Checked by
    /// equality, never dereferenced directly, so a vanished light is harmless.
    pub owner: Option<LightId>,
}

pub struct AtlasTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AtlasUpdateStats {
    pub collected: u32,
    pub assigned: u32,
    pub reassigned: u32,
    pub starved: u32,
}

/// Owns the shadow and cookie atlas textures plus the slot grid, and assigns
/// slots to lights by descending screen-size priority with stable reuse.
#[derive(Default)]
pub struct ShadowAtlas {
    version: u32,
    shadow_resolution: u32,
    cookie_resolution: u32,
    split: SplitPolicy,
    slots: Vec<Slot>,
    shadow_depth: Option<AtlasTexture>,
    shadow_moments: Option<AtlasTexture>,
    cookie: Option<AtlasTexture>,
}

impl ShadowAtlas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn shadow_resolution(&self) -> u32 {
        self.shadow_resolution
    }

    pub fn cookie_resolution(&self) -> u32 {
        self.cookie_resolution
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot_rect(&self, index: usize) -> Option<NormalizedRect> {
        self.slots.get(index).map(|slot| slot.rect)
    }

    fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    fn texel_base(&self) -> u32 {
        if self.shadow_resolution > 0 {
            self.shadow_resolution
        } else {
            self.cookie_resolution
        }
    }

    /// Recreates the shadow atlas when the requested size differs. Bumping the
    /// version here is what invalidates every light's cached slot.
    pub fn allocate_shadow_texture(&mut self, resolution: u32) {
        let resolution = resolution.clamp(MIN_ATLAS_RESOLUTION, MAX_ATLAS_RESOLUTION);
        if self.shadow_resolution == resolution {
            return;
        }
        self.shadow_resolution = resolution;
        self.shadow_depth = None;
        self.shadow_moments = None;
        self.refresh_slot_sizes();
        self.bump_version();
    }

    /// Resizes the cookie render target; bumps the version on change.
    pub fn allocate_cookie_texture(&mut self, resolution: u32) {
        let resolution = resolution.clamp(MIN_COOKIE_RESOLUTION, MAX_COOKIE_RESOLUTION);
        if self.cookie_resolution == resolution {
            return;
        }
        self.cookie_resolution = resolution;
        self.cookie = None;
        if self.shadow_resolution == 0 {
            self.refresh_slot_sizes();
        }
        self.bump_version();
    }

    fn refresh_slot_sizes(&mut self) {
        let base = self.texel_base();
        for slot in &mut self.slots {
            slot.size_texels = (slot.rect.w * base as f32).floor() as u32;
        }
    }

    /// Rebuilds the slot grid when the split policy changes element-wise.
    /// Slots end up sorted descending by size, ties keeping discovery order;
    /// the fill pass depends on that ordering.
    pub fn regenerate_slots(&mut self, split: &SplitPolicy) {
        if self.split == *split && !self.slots.is_empty() {
            return;
        }
        self.split = split.clone();
        self.slots.clear();

        let values = self.split.values();
        let base = values.first().copied().unwrap_or(1).max(1);
        let cell = 1.0 / base as f32;
        let texel_base = self.texel_base() as f32;
        let mut top_cell = 0usize;
        for y in 0..base {
            for x in 0..base {
                let sub = values.get(1 + top_cell).copied().unwrap_or(1).max(1);
                top_cell += 1;
                let sub_cell = cell / sub as f32;
                for sy in 0..sub {
                    for sx in 0..sub {
                        let rect = NormalizedRect::new(
                            x as f32 * cell + sx as f32 * sub_cell,
                            y as f32 * cell + sy as f32 * sub_cell,
                            sub_cell,
                            sub_cell,
                        );
                        self.slots.push(Slot {
                            rect,
                            size_texels: (rect.w * texel_base).floor() as u32,
                            used: false,
                            owner: None,
                        });
                    }
                }
            }
        }
        self.slots.sort_by(|a, b| b.size_texels.cmp(&a.size_texels));
        self.bump_version();
    }

    /// Filters to visible local lights that need a shadow or cookie this
    /// frame, sorted descending by screen-size estimate. Allocates the atlas
    /// textures as a side effect when any collected light needs them.
    pub fn collect_lights(&mut self, lights: &LightTable, params: &LightingParams) -> Vec<LightId> {
        let mut needs_shadow_atlas = false;
        let mut needs_cookie_atlas = false;
        let mut collected = Vec::new();
        for (id, light) in lights.iter() {
            if light.kind == LightKind::Directional || !light.visible_this_frame {
                continue;
            }
            let shadow = params.shadows_enabled && light.needs_shadow();
            let cookie = params.cookies_enabled && light.needs_cookie();
            if shadow || cookie {
                needs_shadow_atlas |= shadow;
                needs_cookie_atlas |= cookie;
                collected.push(id);
            }
        }
        collected.sort_by(|a, b| {
            let sa = lights.get(*a).map(|l| l.screen_size).unwrap_or(0.0);
            let sb = lights.get(*b).map(|l| l.screen_size).unwrap_or(0.0);
            sb.total_cmp(&sa)
        });
        if needs_shadow_atlas {
            self.allocate_shadow_texture(params.shadow_atlas_resolution);
        }
        if needs_cookie_atlas {
            self.allocate_cookie_texture(params.cookie_atlas_resolution);
        }
        collected
    }

    /// Frame entry point: collect, regenerate, then assign slots in two
    /// passes — a stability pass that re-confirms unchanged assignments
    /// without forcing a re-render, and a fill pass that hands remaining
    /// lights the largest unused slots. Lights past the slot count are
    /// silently starved.
    pub fn update(&mut self, lights: &mut LightTable, params: &LightingParams) -> AtlasUpdateStats {
        let collected = self.collect_lights(lights, params);
        let mut stats = AtlasUpdateStats { collected: collected.len() as u32, ..Default::default() };

        // Every light drops its claim up front; lights that fell out of the
        // collection this frame must not keep rendering into a slot that may
        // now belong to someone else.
        for (_, light) in lights.iter_mut() {
            light.atlas_viewport_allocated = false;
            light.atlas_slot_updated = false;
        }
        if collected.is_empty() {
            return stats;
        }

        // An empty explicit list carries no layout; treat it like an absent one.
        let split = match params.atlas_split.as_deref() {
            Some(values) if !values.is_empty() => SplitPolicy::new(values.to_vec()),
            _ => SplitPolicy::automatic(collected.len()),
        };
        self.regenerate_slots(&split);

        for slot in &mut self.slots {
            slot.used = false;
        }

        let take = collected.len().min(self.slots.len());
        stats.starved = (collected.len() - take) as u32;

        // Stability pass: a cached assignment survives only if the version,
        // slot size, and recorded owner all still match.
        for &id in collected.iter().take(take) {
            let Some(light) = lights.get_mut(id) else { continue };
            if light.atlas_version != self.version {
                continue;
            }
            let Some(index) = light.atlas_slot_index else { continue };
            let Some(slot) = self.slots.get_mut(index) else { continue };
            if slot.used || slot.owner != Some(id) || slot.size_texels != light.atlas_slot_size {
                continue;
            }
            slot.used = true;
            light.atlas_viewport_allocated = true;
        }

        // Fill pass: priority order walks the fixed descending-size slot
        // order, so the biggest on-screen light gets the biggest free slot.
        let mut cursor = 0usize;
        for &id in collected.iter().take(take) {
            let Some(light) = lights.get_mut(id) else { continue };
            if light.atlas_viewport_allocated {
                continue;
            }
            while cursor < self.slots.len() && self.slots[cursor].used {
                cursor += 1;
            }
            let Some(slot) = self.slots.get_mut(cursor) else { break };
            slot.used = true;
            slot.owner = Some(id);
            light.atlas_slot_index = Some(cursor);
            light.atlas_slot_size = slot.size_texels;
            light.atlas_version = self.version;
            light.atlas_viewport_allocated = true;
            light.atlas_slot_updated = true;
            stats.reassigned += 1;
        }

        // Viewport/scissor and camera setup for everything that holds a slot.
        for &id in collected.iter().take(take) {
            let rect = match lights.get(id) {
                Some(light) if light.atlas_viewport_allocated => {
                    match light.atlas_slot_index.and_then(|index| self.slot_rect(index)) {
                        Some(rect) => rect,
                        None => continue,
                    }
                }
                _ => continue,
            };
            if let Some(light) = lights.get_mut(id) {
                shadow_camera::setup_light_faces(light, rect);
                stats.assigned += 1;
            }
        }

        stats
    }

    /// Realizes the GPU textures for the current allocator state. Separate
    /// from [`update`](Self::update) so the allocator itself stays free of
    /// device handles.
    pub fn ensure_textures(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.shadow_resolution > 0 && self.shadow_depth.is_none() {
            ensure!(
                self.shadow_resolution >= MIN_ATLAS_RESOLUTION,
                "Shadow atlas resolution {} below minimum",
                self.shadow_resolution
            );
            self.shadow_depth = Some(create_atlas_texture(
                device,
                "Shadow Atlas Depth",
                self.shadow_resolution,
                SHADOW_DEPTH_FORMAT,
            ));
            self.shadow_moments = Some(create_atlas_texture(
                device,
                "Shadow Atlas Moments",
                self.shadow_resolution,
                SHADOW_MOMENTS_FORMAT,
            ));
        }
        if self.cookie_resolution > 0 && self.cookie.is_none() {
            self.cookie = Some(create_atlas_texture(
                device,
                "Cookie Atlas",
                self.cookie_resolution,
                COOKIE_FORMAT,
            ));
        }
        Ok(())
    }

    pub fn shadow_depth_view(&self) -> Option<&wgpu::TextureView> {
        self.shadow_depth.as_ref().map(|t| &t.view)
    }

    pub fn shadow_moments_view(&self) -> Option<&wgpu::TextureView> {
        self.shadow_moments.as_ref().map(|t| &t.view)
    }

    pub fn cookie_view(&self) -> Option<&wgpu::TextureView> {
        self.cookie.as_ref().map(|t| &t.view)
    }
}

fn create_atlas_texture(
    device: &wgpu::Device,
    label: &str,
    resolution: u32,
    format: wgpu::TextureFormat,
) -> AtlasTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: resolution, height: resolution, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    AtlasTexture { texture, view }
}
