use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::lights::{Light, LightKind, ShadowFilter};
use crate::mesh::MeshVertex;
use crate::renderer::{SHADOW_DEPTH_FORMAT, SHADOW_MOMENTS_FORMAT};

/// Dynamic-offset stride for both uniform rings. Matches the minimum
/// guaranteed `min_uniform_buffer_offset_alignment`.
pub const UNIFORM_STRIDE: u32 = 256;

const INITIAL_FACE_CAPACITY: u32 = 16;
const INITIAL_DRAW_CAPACITY: u32 = 64;

/// Key into the lazily built pipeline cache. One pipeline per light kind and
/// shadow filter pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShadowVariantKey {
    pub kind: LightKind,
    pub filter: ShadowFilter,
}

impl ShadowVariantKey {
    pub fn for_light(light: &Light) -> Self {
        Self { kind: light.kind, filter: light.shadow_filter }
    }
}

struct VariantEntryPoints {
    vertex: &'static str,
    fragment: &'static str,
    /// PCF samples the depth attachment through a comparison sampler, so the
    /// moments target stays bound but write-disabled.
    moments_writes: wgpu::ColorWrites,
}

/// Entry-point table for the shadow shader. `None` means the combination has
/// no atlas-rendered variant at all.
fn variant_entry_points(key: ShadowVariantKey) -> Option<VariantEntryPoints> {
    let fragment = match key.filter {
        ShadowFilter::Pcf => "fs_depth",
        ShadowFilter::Vsm => "fs_moments",
    };
    let moments_writes = match key.filter {
        ShadowFilter::Pcf => wgpu::ColorWrites::empty(),
        ShadowFilter::Vsm => wgpu::ColorWrites::ALL,
    };
    match key.kind {
        LightKind::Spot | LightKind::Omni => {
            Some(VariantEntryPoints { vertex: "vs_main", fragment, moments_writes })
        }
        LightKind::Directional => None,
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FaceUniform {
    view_proj: [[f32; 4]; 4],
    light_position: [f32; 3],
    range: f32,
    bias: f32,
    _padding: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniform {
    model: [[f32; 4]; 4],
}

/// Records shadow draws into the atlas. Pipelines and uniform rings are
/// created lazily; per-face and per-draw data bind through dynamic offsets so
/// nothing is rewritten while a render pass holds the buffers.
pub struct ShadowPassExecutor {
    shader: Option<wgpu::ShaderModule>,
    bind_group_layout: Option<Arc<wgpu::BindGroupLayout>>,
    pipeline_layout: Option<wgpu::PipelineLayout>,
    variants: HashMap<ShadowVariantKey, wgpu::RenderPipeline>,
    failed_variants: HashSet<ShadowVariantKey>,
    clear_pipeline: Option<wgpu::RenderPipeline>,
    face_buffer: Option<wgpu::Buffer>,
    face_capacity: u32,
    draw_buffer: Option<wgpu::Buffer>,
    draw_capacity: u32,
    bind_group: Option<wgpu::BindGroup>,
}

impl Default for ShadowPassExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowPassExecutor {
    pub fn new() -> Self {
        Self {
            shader: None,
            bind_group_layout: None,
            pipeline_layout: None,
            variants: HashMap::new(),
            failed_variants: HashSet::new(),
            clear_pipeline: None,
            face_buffer: None,
            face_capacity: 0,
            draw_buffer: None,
            draw_capacity: 0,
            bind_group: None,
        }
    }

    pub fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.shader.is_none() {
            self.shader = Some(device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Shadow Atlas Shader"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../../assets/shaders/shadow_atlas.wgsl").into(),
                ),
            }));
        }
        if self.bind_group_layout.is_none() {
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shadow Pass Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: true,
                            min_binding_size: NonZeroU64::new(
                                std::mem::size_of::<FaceUniform>() as u64
                            ),
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::VERTEX,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: true,
                            min_binding_size: NonZeroU64::new(
                                std::mem::size_of::<DrawUniform>() as u64
                            ),
                        },
                        count: None,
                    },
                ],
            });
            self.bind_group_layout = Some(Arc::new(layout));
        }
        if self.pipeline_layout.is_none() {
            let bind_group_layout = self
                .bind_group_layout
                .as_ref()
                .context("shadow bind group layout missing")?;
            self.pipeline_layout =
                Some(device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Shadow Pass Pipeline Layout"),
                    bind_group_layouts: &[bind_group_layout],
                    push_constant_ranges: &[],
                }));
        }
        if self.clear_pipeline.is_none() {
            let shader = self.shader.as_ref().context("shadow shader not created")?;
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Shadow Clear Pipeline Layout"),
                bind_group_layouts: &[],
                push_constant_ranges: &[],
            });
            // Scissored region reset: load ops clear the whole attachment, so
            // a slot is wiped by drawing far depth and max moments instead.
            self.clear_pipeline =
                Some(device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("Shadow Region Clear Pipeline"),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: shader,
                        entry_point: Some("vs_clear"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &[],
                    },
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: SHADOW_DEPTH_FORMAT,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::Always,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: shader,
                        entry_point: Some("fs_clear"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: SHADOW_MOMENTS_FORMAT,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    multiview: None,
                    cache: None,
                }));
        }
        Ok(())
    }

    pub fn clear_pipeline(&self) -> Option<&wgpu::RenderPipeline> {
        self.clear_pipeline.as_ref()
    }

    /// Cached-only lookup for use while a render pass is being recorded.
    /// [`pipeline`](Self::pipeline) must have warmed the variant beforehand.
    pub fn variant_pipeline(&self, key: ShadowVariantKey) -> Option<&wgpu::RenderPipeline> {
        self.variants.get(&key)
    }

    /// Grows the uniform rings to hold at least `faces`/`draws` entries and
    /// rebuilds the bind group when either buffer is recreated. Must run
    /// before the render pass opens.
    pub fn ensure_capacity(&mut self, device: &wgpu::Device, faces: u32, draws: u32) {
        let mut rebuilt = false;
        if faces > self.face_capacity || self.face_buffer.is_none() {
            self.face_capacity = faces.next_power_of_two().max(INITIAL_FACE_CAPACITY);
            self.face_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shadow Face Uniforms"),
                size: self.face_capacity as u64 * UNIFORM_STRIDE as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            rebuilt = true;
        }
        if draws > self.draw_capacity || self.draw_buffer.is_none() {
            self.draw_capacity = draws.next_power_of_two().max(INITIAL_DRAW_CAPACITY);
            self.draw_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shadow Draw Uniforms"),
                size: self.draw_capacity as u64 * UNIFORM_STRIDE as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            rebuilt = true;
        }
        if rebuilt {
            self.bind_group = None;
        }
        if self.bind_group.is_none() {
            let (Some(layout), Some(face_buffer), Some(draw_buffer)) =
                (self.bind_group_layout.as_ref(), self.face_buffer.as_ref(), self.draw_buffer.as_ref())
            else {
                return;
            };
            self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Shadow Pass Bind Group"),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: face_buffer,
                            offset: 0,
                            size: NonZeroU64::new(std::mem::size_of::<FaceUniform>() as u64),
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: draw_buffer,
                            offset: 0,
                            size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                        }),
                    },
                ],
            }));
        }
    }

    /// Uploads one face's camera data. Omni faces get zero depth bias; their
    /// cube sampling already keeps neighbours from leaking.
    pub fn write_face_uniform(
        &self,
        queue: &wgpu::Queue,
        index: u32,
        light: &Light,
        view_proj: glam::Mat4,
    ) {
        let Some(buffer) = self.face_buffer.as_ref() else { return };
        let bias = match light.kind {
            LightKind::Omni => 0.0,
            _ => light.shadow_bias,
        };
        let uniform = FaceUniform {
            view_proj: view_proj.to_cols_array_2d(),
            light_position: light.position.to_array(),
            range: light.range,
            bias,
            _padding: [0.0; 3],
        };
        queue.write_buffer(
            buffer,
            index as u64 * UNIFORM_STRIDE as u64,
            bytemuck::bytes_of(&uniform),
        );
    }

    pub fn write_draw_uniform(&self, queue: &wgpu::Queue, index: u32, model: glam::Mat4) {
        let Some(buffer) = self.draw_buffer.as_ref() else { return };
        let uniform = DrawUniform { model: model.to_cols_array_2d() };
        queue.write_buffer(
            buffer,
            index as u64 * UNIFORM_STRIDE as u64,
            bytemuck::bytes_of(&uniform),
        );
    }

    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.bind_group.as_ref()
    }

    pub fn face_offset(index: u32) -> u32 {
        index * UNIFORM_STRIDE
    }

    pub fn draw_offset(index: u32) -> u32 {
        index * UNIFORM_STRIDE
    }

    /// Returns the pipeline for a variant, building it on first use. A
    /// variant that cannot be built is reported once and skipped from then
    /// on; the frame keeps going without those casters.
    pub fn pipeline(
        &mut self,
        device: &wgpu::Device,
        key: ShadowVariantKey,
    ) -> Option<&wgpu::RenderPipeline> {
        if self.failed_variants.contains(&key) {
            return None;
        }
        if !self.variants.contains_key(&key) {
            match self.build_variant(device, key) {
                Ok(pipeline) => {
                    self.variants.insert(key, pipeline);
                }
                Err(err) => {
                    eprintln!("[shadow] Failed to build shadow variant {key:?}: {err:#}");
                    self.failed_variants.insert(key);
                    return None;
                }
            }
        }
        self.variants.get(&key)
    }

    fn build_variant(
        &self,
        device: &wgpu::Device,
        key: ShadowVariantKey,
    ) -> Result<wgpu::RenderPipeline> {
        let entry_points = variant_entry_points(key)
            .ok_or_else(|| anyhow!("no atlas shadow variant for {:?} lights", key.kind))?;
        let shader = self.shader.as_ref().context("shadow shader not created")?;
        let layout = self.pipeline_layout.as_ref().context("shadow pipeline layout not created")?;
        Ok(device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Shadow Variant Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some(entry_points.vertex),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[MeshVertex::layout()],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: SHADOW_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some(entry_points.fragment),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: SHADOW_MOMENTS_FORMAT,
                    blend: None,
                    write_mask: entry_points.moments_writes,
                })],
            }),
            multiview: None,
            cache: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_fit_inside_the_dynamic_stride() {
        assert!(std::mem::size_of::<FaceUniform>() <= UNIFORM_STRIDE as usize);
        assert!(std::mem::size_of::<DrawUniform>() <= UNIFORM_STRIDE as usize);
        assert_eq!(ShadowPassExecutor::face_offset(3), 768);
    }

    #[test]
    fn pcf_variant_disables_moments_writes() {
        let key = ShadowVariantKey { kind: LightKind::Spot, filter: ShadowFilter::Pcf };
        let entry_points = variant_entry_points(key).unwrap();
        assert_eq!(entry_points.fragment, "fs_depth");
        assert_eq!(entry_points.moments_writes, wgpu::ColorWrites::empty());
        let vsm = ShadowVariantKey { kind: LightKind::Omni, filter: ShadowFilter::Vsm };
        let entry_points = variant_entry_points(vsm).unwrap();
        assert_eq!(entry_points.fragment, "fs_moments");
        assert_eq!(entry_points.moments_writes, wgpu::ColorWrites::ALL);
    }

    #[test]
    fn directional_lights_have_no_atlas_variant() {
        let key = ShadowVariantKey { kind: LightKind::Directional, filter: ShadowFilter::Pcf };
        assert!(variant_entry_points(key).is_none());
    }
}
