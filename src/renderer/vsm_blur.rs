use std::collections::HashMap;
use std::num::NonZeroU64;

use anyhow::{Context, Result};
use smallvec::SmallVec;

use crate::lights::{Light, LightId};
use crate::renderer::{NormalizedRect, SHADOW_MOMENTS_FORMAT};

use super::shadow_pass::UNIFORM_STRIDE;

/// Weight table capacity in the blur uniform; kernel sizes clamp to this.
pub const MAX_BLUR_KERNEL: u32 = 32;

pub fn wants_blur(light: &Light) -> bool {
    light.uses_vsm() && light.vsm_blur_size > 1
}

/// Normalized Gaussian kernel for `size` taps. Size 1 is the identity kernel.
pub fn gaussian_weights(size: u32) -> Vec<f32> {
    let size = size.clamp(1, MAX_BLUR_KERNEL);
    if size == 1 {
        return vec![1.0];
    }
    let sigma = size as f32 / 3.0;
    let half = (size as f32 - 1.0) * 0.5;
    let mut weights: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - half;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= total;
    }
    weights
}

/// Recycles blur scratch targets across lights and frames. A target is
/// checked out for exactly one light at a time and returned the same frame.
pub struct BlurTargetCache<T> {
    free: Vec<T>,
    in_flight: SmallVec<[LightId; 4]>,
}

impl<T> Default for BlurTargetCache<T> {
    fn default() -> Self {
        Self { free: Vec::new(), in_flight: SmallVec::new() }
    }
}

impl<T> BlurTargetCache<T> {
    pub fn checkout(&mut self, light: LightId, create: impl FnOnce() -> T) -> T {
        debug_assert!(!self.in_flight.contains(&light));
        self.in_flight.push(light);
        self.free.pop().unwrap_or_else(create)
    }

    pub fn checkin(&mut self, light: LightId, target: T) {
        self.in_flight.retain(|id| *id != light);
        self.free.push(target);
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.in_flight.clear();
    }
}

pub struct BlurTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurUniform {
    direction: [f32; 2],
    texel: [f32; 2],
    kernel: u32,
    _padding: [u32; 3],
    weights: [[f32; 4]; 8],
}

impl BlurUniform {
    fn new(direction: [f32; 2], resolution: u32, weights: &[f32]) -> Self {
        let mut packed = [[0.0f32; 4]; 8];
        for (i, weight) in weights.iter().take(MAX_BLUR_KERNEL as usize).enumerate() {
            packed[i / 4][i % 4] = *weight;
        }
        let texel = 1.0 / resolution.max(1) as f32;
        Self {
            direction,
            texel: [texel, texel],
            kernel: weights.len().min(MAX_BLUR_KERNEL as usize) as u32,
            _padding: [0; 3],
            weights: packed,
        }
    }
}

pub struct VsmBlurParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub moments_view: &'a wgpu::TextureView,
    pub resolution: u32,
    pub light_id: LightId,
    pub kernel_size: u32,
    /// Atlas-space viewports of the light's faces, blurred one scissor region
    /// each inside a shared pair of passes.
    pub faces: &'a [NormalizedRect],
}

/// Separable two-pass Gaussian blur over a VSM light's atlas region:
/// moments → scratch horizontally, scratch → moments vertically.
pub struct VsmBlurPass {
    shader: Option<wgpu::ShaderModule>,
    bind_group_layout: Option<wgpu::BindGroupLayout>,
    pipeline: Option<wgpu::RenderPipeline>,
    sampler: Option<wgpu::Sampler>,
    uniform_buffer: Option<wgpu::Buffer>,
    uniform_capacity: u32,
    uniform_cursor: u32,
    weights: HashMap<u32, Vec<f32>>,
    targets: BlurTargetCache<BlurTarget>,
    target_resolution: u32,
    passes_run: u32,
}

impl Default for VsmBlurPass {
    fn default() -> Self {
        Self::new()
    }
}

impl VsmBlurPass {
    pub fn new() -> Self {
        Self {
            shader: None,
            bind_group_layout: None,
            pipeline: None,
            sampler: None,
            uniform_buffer: None,
            uniform_capacity: 0,
            uniform_cursor: 0,
            weights: HashMap::new(),
            targets: BlurTargetCache::default(),
            target_resolution: 0,
            passes_run: 0,
        }
    }

    /// Resets the per-frame uniform ring cursor. Call once per frame before
    /// any blur.
    pub fn begin_frame(&mut self) {
        self.uniform_cursor = 0;
        self.passes_run = 0;
    }

    /// Render passes recorded since [`begin_frame`](Self::begin_frame).
    pub fn passes_run(&self) -> u32 {
        self.passes_run
    }

    fn weights_for(&mut self, size: u32) -> &[f32] {
        self.weights.entry(size.clamp(1, MAX_BLUR_KERNEL)).or_insert_with(|| gaussian_weights(size))
    }

    pub fn ensure_resources(&mut self, device: &wgpu::Device) -> Result<()> {
        if self.shader.is_none() {
            self.shader = Some(device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("VSM Blur Shader"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("../../assets/shaders/vsm_blur.wgsl").into(),
                ),
            }));
        }
        if self.sampler.is_none() {
            self.sampler = Some(device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("VSM Blur Sampler"),
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                ..Default::default()
            }));
        }
        if self.bind_group_layout.is_none() {
            self.bind_group_layout =
                Some(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("VSM Blur Bind Group Layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: true,
                                min_binding_size: NonZeroU64::new(
                                    std::mem::size_of::<BlurUniform>() as u64,
                                ),
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                }));
        }
        if self.pipeline.is_none() {
            let shader = self.shader.as_ref().context("blur shader not created")?;
            let bind_group_layout =
                self.bind_group_layout.as_ref().context("blur bind group layout not created")?;
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("VSM Blur Pipeline Layout"),
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &[],
            });
            self.pipeline = Some(device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("VSM Blur Pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some("vs_fullscreen"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[],
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: shader,
                    entry_point: Some("fs_blur"),
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

    fn ensure_uniform_capacity(&mut self, device: &wgpu::Device, slots: u32) {
        if slots <= self.uniform_capacity && self.uniform_buffer.is_some() {
            return;
        }
        self.uniform_capacity = slots.next_power_of_two().max(8);
        self.uniform_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("VSM Blur Uniforms"),
            size: self.uniform_capacity as u64 * UNIFORM_STRIDE as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
    }

    /// Runs both blur passes for one light. Scratch targets recycle through
    /// the cache; an atlas resize invalidates them all.
    pub fn blur(&mut self, params: VsmBlurParams<'_>) -> Result<()> {
        if params.faces.is_empty() || params.kernel_size <= 1 {
            return Ok(());
        }
        self.ensure_resources(params.device)?;
        if self.target_resolution != params.resolution {
            self.targets.clear();
            self.target_resolution = params.resolution;
        }
        self.ensure_uniform_capacity(params.device, self.uniform_cursor + 2);

        let weights = self.weights_for(params.kernel_size).to_vec();
        let horizontal = BlurUniform::new([1.0, 0.0], params.resolution, &weights);
        let vertical = BlurUniform::new([0.0, 1.0], params.resolution, &weights);
        let uniform_buffer = self.uniform_buffer.as_ref().context("blur uniforms missing")?;
        let h_index = self.uniform_cursor;
        let v_index = self.uniform_cursor + 1;
        self.uniform_cursor += 2;
        params.queue.write_buffer(
            uniform_buffer,
            h_index as u64 * UNIFORM_STRIDE as u64,
            bytemuck::bytes_of(&horizontal),
        );
        params.queue.write_buffer(
            uniform_buffer,
            v_index as u64 * UNIFORM_STRIDE as u64,
            bytemuck::bytes_of(&vertical),
        );

        let resolution = params.resolution;
        let scratch = self.targets.checkout(params.light_id, || {
            create_blur_target(params.device, resolution)
        });

        let pipeline = self.pipeline.as_ref().context("blur pipeline missing")?;
        let bind_group_layout =
            self.bind_group_layout.as_ref().context("blur bind group layout missing")?;
        let sampler = self.sampler.as_ref().context("blur sampler missing")?;

        let horizontal_bind = create_blur_bind_group(
            params.device,
            bind_group_layout,
            uniform_buffer,
            params.moments_view,
            sampler,
        );
        let vertical_bind = create_blur_bind_group(
            params.device,
            bind_group_layout,
            uniform_buffer,
            &scratch.view,
            sampler,
        );

        run_blur_pass(
            params.encoder,
            "VSM Blur Horizontal",
            &scratch.view,
            wgpu::LoadOp::Clear(wgpu::Color::BLACK),
            pipeline,
            &horizontal_bind,
            h_index * UNIFORM_STRIDE,
            params.faces,
            resolution,
        );
        run_blur_pass(
            params.encoder,
            "VSM Blur Vertical",
            params.moments_view,
            wgpu::LoadOp::Load,
            pipeline,
            &vertical_bind,
            v_index * UNIFORM_STRIDE,
            params.faces,
            resolution,
        );
        self.passes_run += 2;

        self.targets.checkin(params.light_id, scratch);
        Ok(())
    }
}

fn create_blur_target(device: &wgpu::Device, resolution: u32) -> BlurTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("VSM Blur Scratch"),
        size: wgpu::Extent3d { width: resolution, height: resolution, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: SHADOW_MOMENTS_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    BlurTarget { texture, view }
}

fn create_blur_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    uniform_buffer: &wgpu::Buffer,
    source: &wgpu::TextureView,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("VSM Blur Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: uniform_buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<BlurUniform>() as u64),
                }),
            },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(source) },
            wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::Sampler(sampler) },
        ],
    })
}

#[allow(clippy::too_many_arguments)]
fn run_blur_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    target: &wgpu::TextureView,
    load: wgpu::LoadOp<wgpu::Color>,
    pipeline: &wgpu::RenderPipeline,
    bind_group: &wgpu::BindGroup,
    uniform_offset: u32,
    faces: &[NormalizedRect],
    resolution: u32,
) {
    let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: target,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations { load, store: wgpu::StoreOp::Store },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    rpass.set_pipeline(pipeline);
    rpass.set_bind_group(0, bind_group, &[uniform_offset]);
    for face in faces {
        // Stay one texel inside the face so the blur never bleeds across
        // neighbouring atlas regions.
        let inset = face.inset_texels(1.0, resolution);
        let (x, y, w, h) = inset.to_texels(resolution);
        if w == 0 || h == 0 {
            continue;
        }
        rpass.set_scissor_rect(x, y, w, h);
        rpass.draw(0..3, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_size_one_is_identity() {
        assert_eq!(gaussian_weights(1), vec![1.0]);
        assert_eq!(gaussian_weights(0), vec![1.0]);
    }

    #[test]
    fn weights_normalize_and_peak_in_the_middle() {
        let weights = gaussian_weights(9);
        assert_eq!(weights.len(), 9);
        let total: f32 = weights.iter().sum();
        assert!((total - 1.0).abs() < 1.0e-5);
        let peak = weights[4];
        assert!(weights.iter().all(|w| *w <= peak + 1.0e-6));
        assert!((weights[0] - weights[8]).abs() < 1.0e-6);
    }

    #[test]
    fn oversized_kernels_clamp_to_capacity() {
        assert_eq!(gaussian_weights(100).len(), MAX_BLUR_KERNEL as usize);
    }

    #[test]
    fn target_cache_round_trips_and_recycles() {
        let mut cache: BlurTargetCache<u32> = BlurTargetCache::default();
        let a = LightId(0);
        let b = LightId(1);
        let target = cache.checkout(a, || 7);
        assert_eq!(target, 7);
        cache.checkin(a, target);
        // The freed target is reused before the factory runs again.
        let target = cache.checkout(b, || 99);
        assert_eq!(target, 7);
        cache.checkin(b, target);
    }

    #[test]
    fn pass_counter_starts_at_zero() {
        assert_eq!(VsmBlurPass::new().passes_run(), 0);
    }

    #[test]
    fn uniform_packs_weights_into_vec4_rows() {
        let uniform = BlurUniform::new([1.0, 0.0], 1024, &gaussian_weights(5));
        assert_eq!(uniform.kernel, 5);
        assert_eq!(uniform.weights[1][0], gaussian_weights(5)[4]);
        assert!(std::mem::size_of::<BlurUniform>() <= UNIFORM_STRIDE as usize);
    }
}
