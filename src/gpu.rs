//! GPU buffer lifecycle and dispatch.
//!
//! Nodes never touch `wgpu` objects directly. During processing they acquire
//! textures from the [`TexturePool`] (an arena of generation-indexed slots)
//! and queue [`TexturePass`]es into [`RenderResources`]; a [`GpuContext`]
//! bound to the GPU thread later realizes pending textures and executes the
//! queued passes in one submission. Releasing a slot bumps its generation, so
//! a stale handle held by a consumer is an inert no-op rather than a
//! use-after-free.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use half::f16;

use crate::value::PixelFormat;

/// Opaque, non-owning reference to a pooled texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub label: String,
}

struct TextureSlot {
    generation: u32,
    desc: Option<TextureDesc>,
    texture: Option<wgpu::Texture>,
    view: Option<wgpu::TextureView>,
}

/// Arena of texture slots. The node that acquired a handle is its sole
/// releaser; everyone else holds read-only copies of the handle.
#[derive(Default)]
pub struct TexturePool {
    slots: Vec<TextureSlot>,
    free: Vec<u32>,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, desc: TextureDesc) -> TextureHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.desc = Some(desc);
            slot.texture = None;
            slot.view = None;
            return TextureHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(TextureSlot {
            generation: 0,
            desc: Some(desc),
            texture: None,
            view: None,
        });
        TextureHandle {
            index,
            generation: 0,
        }
    }

    /// Release the slot behind `handle`. A stale or already-released handle is
    /// a no-op; returns whether anything was actually freed.
    pub fn release(&mut self, handle: TextureHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.desc.is_none() {
            log::debug!("[gpu] ignoring release of stale texture handle {handle:?}");
            return false;
        }
        slot.desc = None;
        slot.texture = None;
        slot.view = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    pub fn is_live(&self, handle: TextureHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|s| s.generation == handle.generation && s.desc.is_some())
    }

    pub fn desc(&self, handle: TextureHandle) -> Option<&TextureDesc> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.desc.as_ref()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.desc.is_some()).count()
    }

    fn realize(&mut self, device: &wgpu::Device) {
        for slot in &mut self.slots {
            let Some(desc) = slot.desc.as_ref() else {
                continue;
            };
            if slot.texture.is_some() {
                continue;
            }
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width.max(1),
                    height: desc.height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format.to_wgpu(),
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            slot.view = Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
            slot.texture = Some(texture);
        }
    }

    fn texture_and_view(&self, handle: TextureHandle) -> Option<(&wgpu::Texture, &wgpu::TextureView)> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        Some((slot.texture.as_ref()?, slot.view.as_ref()?))
    }
}

/// Re-acquire `current` when its description no longer matches `desc`.
/// Returns the live handle to store back on the owning node.
pub fn ensure_texture(
    pool: &mut TexturePool,
    current: Option<TextureHandle>,
    desc: TextureDesc,
) -> TextureHandle {
    if let Some(handle) = current {
        if pool.desc(handle) == Some(&desc) {
            return handle;
        }
        pool.release(handle);
    }
    pool.acquire(desc)
}

/// One unit of deferred GPU work targeting a pooled texture.
pub struct TexturePass {
    pub label: String,
    pub target: TextureHandle,
    pub kind: PassKind,
}

pub enum PassKind {
    /// Write raw pixel bytes (tightly packed, matching the target format).
    Upload { pixels: Vec<u8> },
    /// Clear the target to a constant color.
    Fill { color: [f64; 4] },
    /// Run a fullscreen fragment shader over the target. `shader` is the
    /// fragment stage plus its `params` uniform struct; the engine prepends
    /// the shared fullscreen vertex stage and binds `inputs` in order.
    Draw {
        shader: String,
        inputs: Vec<TextureHandle>,
        uniforms: Vec<u8>,
    },
    /// Snapshot-copy another pooled texture into the target (feedback
    /// kernels read the snapshot, never the primary buffer).
    Copy { source: TextureHandle },
}

/// The texture pool plus the queued passes for the current evaluation.
/// Threaded mutably through node processing; drained by [`GpuContext::flush`].
#[derive(Default)]
pub struct RenderResources {
    pub textures: TexturePool,
    passes: Vec<TexturePass>,
}

impl RenderResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_pass(&mut self, pass: TexturePass) {
        self.passes.push(pass);
    }

    pub fn pending_passes(&self) -> usize {
        self.passes.len()
    }

    pub fn take_passes(&mut self) -> Vec<TexturePass> {
        std::mem::take(&mut self.passes)
    }
}

/// Shared fullscreen vertex stage every node fragment shader is linked with.
pub const FULLSCREEN_VS: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> VsOut {
    var out: VsOut;
    let x = f32(i32(vi) / 2) * 4.0 - 1.0;
    let y = f32(i32(vi) & 1) * 4.0 - 1.0;
    out.pos = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>((x + 1.0) * 0.5, 1.0 - (y + 1.0) * 0.5);
    return out;
}
"#;

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader_hash: u64,
    format: PixelFormat,
    input_count: usize,
}

/// Owner of the wgpu device/queue. Must only be used from the GPU-context
/// thread; everything upstream of [`GpuContext::flush`] is plain data.
pub struct GpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    sampler: wgpu::Sampler,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

impl GpuContext {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("forge.sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            device,
            queue,
            sampler,
            pipelines: HashMap::new(),
        }
    }

    /// Create a context on a headless adapter. Used by export paths and
    /// diagnostics; interactive hosts hand in their own device/queue.
    pub fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|e| anyhow!("no suitable GPU adapter: {e}"))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("material-forge"),
            ..Default::default()
        }))
        .context("failed to request GPU device")?;
        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    /// Realize pending textures and execute every queued pass, in queue
    /// order, in a single submission.
    pub fn flush(&mut self, res: &mut RenderResources) -> Result<()> {
        res.textures.realize(&self.device);

        let passes = res.take_passes();
        if passes.is_empty() {
            return Ok(());
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("forge.flush"),
            });

        for pass in &passes {
            self.run_pass(&mut encoder, &res.textures, pass)
                .with_context(|| format!("pass '{}' failed", pass.label))?;
        }

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn run_pass(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        pool: &TexturePool,
        pass: &TexturePass,
    ) -> Result<()> {
        let desc = pool
            .desc(pass.target)
            .ok_or_else(|| anyhow!("target texture was released"))?
            .clone();
        let (target_tex, target_view) = pool
            .texture_and_view(pass.target)
            .ok_or_else(|| anyhow!("target texture not realized"))?;

        match &pass.kind {
            PassKind::Upload { pixels } => {
                let bpp = desc.format.bytes_per_pixel();
                let expected = (desc.width * desc.height * bpp) as usize;
                if pixels.len() != expected {
                    bail!(
                        "upload size mismatch: got {} bytes, expected {expected}",
                        pixels.len()
                    );
                }
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: target_tex,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    pixels,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(desc.width * bpp),
                        rows_per_image: Some(desc.height),
                    },
                    wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            PassKind::Fill { color } => {
                let _rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(&pass.label),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: target_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color {
                                r: color[0],
                                g: color[1],
                                b: color[2],
                                a: color[3],
                            }),
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
            PassKind::Copy { source } => {
                let src_desc = pool
                    .desc(*source)
                    .ok_or_else(|| anyhow!("copy source was released"))?;
                if src_desc.format != desc.format
                    || src_desc.width != desc.width
                    || src_desc.height != desc.height
                {
                    bail!("copy source/target shape mismatch");
                }
                let (src_tex, _) = pool
                    .texture_and_view(*source)
                    .ok_or_else(|| anyhow!("copy source not realized"))?;
                encoder.copy_texture_to_texture(
                    src_tex.as_image_copy(),
                    target_tex.as_image_copy(),
                    wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            PassKind::Draw {
                shader,
                inputs,
                uniforms,
            } => {
                let mut views: Vec<&wgpu::TextureView> = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let (_, view) = pool
                        .texture_and_view(*input)
                        .ok_or_else(|| anyhow!("input texture not realized"))?;
                    views.push(view);
                }

                let full_source = format!("{FULLSCREEN_VS}\n{shader}");
                let key = self.ensure_pipeline(&full_source, desc.format, inputs.len())?;

                // Uniform buffers must be at least 16 bytes and 16-aligned.
                let mut uniform_bytes = uniforms.clone();
                while uniform_bytes.len() % 16 != 0 || uniform_bytes.is_empty() {
                    uniform_bytes.push(0);
                }
                let uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("forge.pass.uniforms"),
                    size: uniform_bytes.len() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                self.queue.write_buffer(&uniform_buffer, 0, &uniform_bytes);

                let pipeline = self
                    .pipelines
                    .get(&key)
                    .ok_or_else(|| anyhow!("pipeline cache lookup failed"))?;
                let layout = pipeline.get_bind_group_layout(0);
                let mut entries = vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ];
                for (i, view) in views.iter().enumerate() {
                    entries.push(wgpu::BindGroupEntry {
                        binding: 2 + i as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                }
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("forge.pass.bg"),
                    layout: &layout,
                    entries: &entries,
                });

                let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(&pass.label),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: target_view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                rpass.set_pipeline(pipeline);
                rpass.set_bind_group(0, &bind_group, &[]);
                rpass.draw(0..3, 0..1);
            }
        }
        Ok(())
    }

    fn ensure_pipeline(
        &mut self,
        source: &str,
        format: PixelFormat,
        input_count: usize,
    ) -> Result<PipelineKey> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let key = PipelineKey {
            shader_hash: hasher.finish(),
            format,
            input_count,
        };

        if !self.pipelines.contains_key(&key) {
            let module = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("forge.pass.shader"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });

            let mut layout_entries = vec![
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ];
            for i in 0..input_count {
                layout_entries.push(wgpu::BindGroupLayoutEntry {
                    binding: 2 + i as u32,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
            }
            let bgl = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("forge.pass.bgl"),
                    entries: &layout_entries,
                });
            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("forge.pass.layout"),
                        bind_group_layouts: &[&bgl],
                        push_constant_ranges: &[],
                    });

            let pipeline = self
                .device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("forge.pass.pipeline"),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &module,
                        entry_point: Some("vs_main"),
                        buffers: &[],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &module,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: format.to_wgpu(),
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });
            self.pipelines.insert(key.clone(), pipeline);
        }

        Ok(key)
    }

    /// Synchronous GPU -> CPU readback of a live buffer, decoded into an
    /// 8-bit RGBA image (16F/32F sources are tonemapped by clamp).
    pub fn read_texture(
        &self,
        res: &RenderResources,
        handle: TextureHandle,
    ) -> Result<image::RgbaImage> {
        let desc = res
            .textures
            .desc(handle)
            .ok_or_else(|| anyhow!("cannot read released texture"))?
            .clone();
        let (texture, _) = res
            .textures
            .texture_and_view(handle)
            .ok_or_else(|| anyhow!("texture not realized; flush first"))?;

        let bpp = desc.format.bytes_per_pixel();
        let unpadded = desc.width * bpp;
        let padded = unpadded.div_ceil(256) * 256;
        let size = (padded * desc.height) as u64;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("forge.readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("forge.readback.encoder"),
            });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let mut mapped_ok = false;
        for _ in 0..2000 {
            let _ = self.device.poll(wgpu::PollType::Poll);
            if let Ok(result) = rx.try_recv() {
                mapped_ok = result.is_ok();
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        if !mapped_ok {
            buffer.unmap();
            bail!("readback map_async did not complete");
        }

        let mapped = slice.get_mapped_range();
        let mut rows: Vec<u8> = Vec::with_capacity((unpadded * desc.height) as usize);
        for y in 0..desc.height {
            let start = (y * padded) as usize;
            rows.extend_from_slice(&mapped[start..start + unpadded as usize]);
        }
        drop(mapped);
        buffer.unmap();

        decode_pixels(&rows, &desc)
    }
}

fn decode_pixels(rows: &[u8], desc: &TextureDesc) -> Result<image::RgbaImage> {
    let (w, h) = (desc.width, desc.height);
    let pixel_count = (w * h) as usize;
    let mut out: Vec<u8> = Vec::with_capacity(pixel_count * 4);

    let push_rgba = |out: &mut Vec<u8>, rgba: [f32; 4]| {
        for c in rgba {
            out.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    };

    match desc.format {
        PixelFormat::Rgba8 => out.extend_from_slice(rows),
        PixelFormat::Rgba16F => {
            for px in rows.chunks_exact(8) {
                let mut rgba = [0.0f32; 4];
                for (i, pair) in px.chunks_exact(2).enumerate() {
                    rgba[i] = f16::from_le_bytes([pair[0], pair[1]]).to_f32();
                }
                push_rgba(&mut out, rgba);
            }
        }
        PixelFormat::Rgba32F => {
            for px in rows.chunks_exact(16) {
                let mut rgba = [0.0f32; 4];
                for (i, quad) in px.chunks_exact(4).enumerate() {
                    rgba[i] = f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                }
                push_rgba(&mut out, rgba);
            }
        }
        PixelFormat::Luminance16F => {
            for px in rows.chunks_exact(2) {
                let l = f16::from_le_bytes([px[0], px[1]]).to_f32();
                push_rgba(&mut out, [l, l, l, 1.0]);
            }
        }
        PixelFormat::Luminance32F => {
            for px in rows.chunks_exact(4) {
                let l = f32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                push_rgba(&mut out, [l, l, l, 1.0]);
            }
        }
    }

    image::RgbaImage::from_raw(w, h, out).ok_or_else(|| anyhow!("readback produced short buffer"))
}
