use anyhow::Result;
use smallvec::SmallVec;

use crate::config::LightingParams;
use crate::lights::{Light, LightId, LightTable};
use crate::mesh::{MeshHandle, MeshRegistry};
use crate::renderer::shadow_atlas::ShadowAtlas;
use crate::renderer::shadow_cull::{cull_casters, gather_casters, ShadowCullScratch};
use crate::renderer::shadow_pass::{ShadowPassExecutor, ShadowVariantKey};
use crate::renderer::vsm_blur::{wants_blur, VsmBlurParams, VsmBlurPass};
use crate::renderer::NormalizedRect;
use crate::scene::Scene;

/// Per-frame shadow statistics, reset each [`ShadowFramePass::prepare`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ShadowFrameMetrics {
    pub lights_collected: u32,
    pub lights_assigned: u32,
    pub lights_reassigned: u32,
    pub lights_starved: u32,
    pub faces_rendered: u32,
    pub casters_drawn: u32,
    pub blur_passes: u32,
}

pub struct ShadowFrameParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub lights: &'a mut LightTable,
    pub scene: &'a mut Scene,
    pub meshes: &'a MeshRegistry,
    pub params: &'a LightingParams,
}

struct DrawPlan {
    mesh: MeshHandle,
    model: glam::Mat4,
    draw_uniform: u32,
}

struct FacePlan {
    light_id: LightId,
    variant: ShadowVariantKey,
    face_index: usize,
    face_uniform: u32,
    viewport: NormalizedRect,
    scissor: NormalizedRect,
    /// Region wiped before drawing. For spot faces this is the whole slot,
    /// margin ring included, so no previous occupant's content survives.
    clear: NormalizedRect,
    draws: Vec<DrawPlan>,
}

fn face_clear_rect(
    slot: Option<NormalizedRect>,
    face_count: usize,
    viewport: NormalizedRect,
) -> NormalizedRect {
    if face_count == 1 {
        slot.unwrap_or(viewport)
    } else {
        viewport
    }
}

struct BlurRequest {
    light_id: LightId,
    kernel_size: u32,
    viewports: SmallVec<[NormalizedRect; 6]>,
}

fn should_render(light: &Light) -> bool {
    light.atlas_viewport_allocated && light.needs_shadow_rendering()
}

/// Runs the whole shadow frame in fixed order: slot assignment, camera
/// setup, caster culling, atlas rendering, variance blur.
pub struct ShadowFramePass {
    pub atlas: ShadowAtlas,
    executor: ShadowPassExecutor,
    blur: VsmBlurPass,
    cull_scratch: ShadowCullScratch,
    cleared_version: Option<u32>,
    metrics: ShadowFrameMetrics,
}

impl Default for ShadowFramePass {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowFramePass {
    pub fn new() -> Self {
        Self {
            atlas: ShadowAtlas::new(),
            executor: ShadowPassExecutor::new(),
            blur: VsmBlurPass::new(),
            cull_scratch: ShadowCullScratch::default(),
            cleared_version: None,
            metrics: ShadowFrameMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &ShadowFrameMetrics {
        &self.metrics
    }

    pub fn prepare(&mut self, params: ShadowFrameParams<'_>) -> Result<ShadowFrameMetrics> {
        self.blur.begin_frame();
        let stats = self.atlas.update(params.lights, params.params);
        let mut metrics = ShadowFrameMetrics {
            lights_collected: stats.collected,
            lights_assigned: stats.assigned,
            lights_reassigned: stats.reassigned,
            lights_starved: stats.starved,
            ..Default::default()
        };
        if stats.assigned == 0 {
            self.metrics = metrics;
            return Ok(metrics);
        }

        self.atlas.ensure_textures(params.device)?;
        self.executor.ensure_resources(params.device)?;

        // Planning: gather and cull on the CPU, warming pipeline variants,
        // before any buffer is touched.
        let render_ids: Vec<LightId> = params
            .lights
            .iter()
            .filter(|(_, light)| should_render(light))
            .map(|(id, _)| id)
            .collect();

        let mut face_plans: Vec<FacePlan> = Vec::new();
        let mut blur_requests: Vec<BlurRequest> = Vec::new();
        let mut rendered: Vec<LightId> = Vec::new();
        let mut face_cursor = 0u32;
        let mut draw_cursor = 0u32;
        for id in render_ids {
            let Some(light) = params.lights.get(id) else { continue };
            let variant = ShadowVariantKey::for_light(light);
            let Some(render_data) = light.render_data.clone() else { continue };
            let blur_wanted = wants_blur(light);
            let kernel_size = light.vsm_blur_size;
            if self.executor.pipeline(params.device, variant).is_none() {
                continue;
            }
            let Some(light) = params.lights.get(id) else { continue };
            let slot_rect = light.atlas_slot_index.and_then(|index| self.atlas.slot_rect(index));
            let candidates = gather_casters(light, &params.scene.composition, &mut self.cull_scratch);
            let mut viewports: SmallVec<[NormalizedRect; 6]> = SmallVec::new();
            for (face_index, face) in render_data.faces.iter().enumerate() {
                let visible = cull_casters(face, &mut params.scene.instances, candidates);
                let mut draws = Vec::with_capacity(visible.len());
                for handle in visible {
                    let instance = &params.scene.instances[handle];
                    if instance.material.is_none() {
                        continue;
                    }
                    draws.push(DrawPlan {
                        mesh: instance.mesh,
                        model: instance.transform,
                        draw_uniform: draw_cursor,
                    });
                    draw_cursor += 1;
                }
                viewports.push(face.viewport);
                face_plans.push(FacePlan {
                    light_id: id,
                    variant,
                    face_index,
                    face_uniform: face_cursor,
                    viewport: face.viewport,
                    scissor: face.scissor,
                    clear: face_clear_rect(slot_rect, render_data.faces.len(), face.viewport),
                    draws,
                });
                face_cursor += 1;
            }
            if blur_wanted {
                blur_requests.push(BlurRequest { light_id: id, kernel_size, viewports });
            }
            rendered.push(id);
        }

        self.executor.ensure_capacity(params.device, face_cursor.max(1), draw_cursor.max(1));
        for plan in &face_plans {
            let Some(light) = params.lights.get(plan.light_id) else { continue };
            let Some(render_data) = light.render_data.as_ref() else { continue };
            let Some(face) = render_data.faces.get(plan.face_index) else { continue };
            self.executor.write_face_uniform(
                params.queue,
                plan.face_uniform,
                light,
                face.projection * face.view,
            );
            for draw in &plan.draws {
                self.executor.write_draw_uniform(params.queue, draw.draw_uniform, draw.model);
            }
        }

        let resolution = self.atlas.shadow_resolution();
        let clear_attachments = self.cleared_version != Some(self.atlas.version());
        self.cleared_version = Some(self.atlas.version());
        self.record_atlas_passes(
            params.encoder,
            params.meshes,
            &face_plans,
            resolution,
            params.params.clustered,
            clear_attachments,
            &mut metrics,
        );

        for request in &blur_requests {
            let Some(moments_view) = self.atlas.shadow_moments_view() else { break };
            self.blur.blur(VsmBlurParams {
                device: params.device,
                queue: params.queue,
                encoder: params.encoder,
                moments_view,
                resolution,
                light_id: request.light_id,
                kernel_size: request.kernel_size,
                faces: &request.viewports,
            })?;
        }
        metrics.blur_passes = self.blur.passes_run();

        for id in rendered {
            if let Some(light) = params.lights.get_mut(id) {
                light.shadow_rendered = true;
            }
        }

        self.metrics = metrics;
        Ok(metrics)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_atlas_passes(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        meshes: &MeshRegistry,
        face_plans: &[FacePlan],
        resolution: u32,
        clustered: bool,
        clear_attachments: bool,
        metrics: &mut ShadowFrameMetrics,
    ) {
        let (Some(depth_view), Some(moments_view)) =
            (self.atlas.shadow_depth_view(), self.atlas.shadow_moments_view())
        else {
            return;
        };
        if face_plans.is_empty() {
            return;
        }
        if clustered {
            // One shared pass; viewport and scissor switch per face inside it.
            let mut rpass = begin_atlas_pass(
                encoder,
                "Shadow Atlas Pass",
                depth_view,
                moments_view,
                clear_attachments,
            );
            for plan in face_plans {
                self.record_face(&mut rpass, plan, meshes, resolution, metrics);
            }
        } else {
            for (index, plan) in face_plans.iter().enumerate() {
                let mut rpass = begin_atlas_pass(
                    encoder,
                    "Shadow Face Pass",
                    depth_view,
                    moments_view,
                    clear_attachments && index == 0,
                );
                self.record_face(&mut rpass, plan, meshes, resolution, metrics);
            }
        }
    }

    fn record_face(
        &self,
        rpass: &mut wgpu::RenderPass<'_>,
        plan: &FacePlan,
        meshes: &MeshRegistry,
        resolution: u32,
        metrics: &mut ShadowFrameMetrics,
    ) {
        let (sx, sy, sw, sh) = plan.scissor.to_texels(resolution);
        if sw == 0 || sh == 0 {
            return;
        }
        let res = resolution as f32;
        if let Some(clear) = self.executor.clear_pipeline() {
            let (cx, cy, cw, ch) = plan.clear.to_texels(resolution);
            if cw > 0 && ch > 0 {
                rpass.set_viewport(
                    plan.clear.x * res,
                    plan.clear.y * res,
                    plan.clear.w * res,
                    plan.clear.h * res,
                    0.0,
                    1.0,
                );
                rpass.set_scissor_rect(cx, cy, cw, ch);
                rpass.set_pipeline(clear);
                rpass.draw(0..3, 0..1);
            }
        }
        rpass.set_viewport(
            plan.viewport.x * res,
            plan.viewport.y * res,
            plan.viewport.w * res,
            plan.viewport.h * res,
            0.0,
            1.0,
        );
        rpass.set_scissor_rect(sx, sy, sw, sh);
        let Some(pipeline) = self.executor.variant_pipeline(plan.variant) else { return };
        let Some(bind_group) = self.executor.bind_group() else { return };
        rpass.set_pipeline(pipeline);
        for draw in &plan.draws {
            let Some(mesh) = meshes.get(draw.mesh) else { continue };
            rpass.set_bind_group(
                0,
                bind_group,
                &[
                    ShadowPassExecutor::face_offset(plan.face_uniform),
                    ShadowPassExecutor::draw_offset(draw.draw_uniform),
                ],
            );
            rpass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            rpass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            rpass.draw_indexed(0..mesh.index_count, 0, 0..1);
            metrics.casters_drawn += 1;
        }
        metrics.faces_rendered += 1;
    }
}

fn begin_atlas_pass<'a>(
    encoder: &'a mut wgpu::CommandEncoder,
    label: &str,
    depth_view: &wgpu::TextureView,
    moments_view: &wgpu::TextureView,
    clear: bool,
) -> wgpu::RenderPass<'a> {
    let depth_load =
        if clear { wgpu::LoadOp::Clear(1.0) } else { wgpu::LoadOp::Load };
    let color_load =
        if clear { wgpu::LoadOp::Clear(wgpu::Color::WHITE) } else { wgpu::LoadOp::Load };
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: moments_view,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations { load: color_load, store: wgpu::StoreOp::Store },
        })],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view: depth_view,
            depth_ops: Some(wgpu::Operations { load: depth_load, store: wgpu::StoreOp::Store }),
            stencil_ops: None,
        }),
        timestamp_writes: None,
        occlusion_query_set: None,
    })
}
