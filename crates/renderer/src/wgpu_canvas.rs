//! `wgpu` implementation of [`TileCanvas`].
//!
//! Resident tiles live in one 2D array atlas texture, one tile per slot. The
//! proxy image has its own texture. Each frame collects draw quads into a
//! storage buffer that a single instanced pipeline expands into rotated
//! screen rectangles.

use log::{debug, trace};
use model::{BYTES_PER_PIXEL, ProxyImage, RectF, TextureSlot, TilePixels};

use crate::atlas_slots::AtlasSlotAllocator;
use crate::{FrameTransform, TileCanvas, TileUploadError};

const INITIAL_QUAD_CAPACITY: usize = 64;
const QUAD_KIND_ATLAS: u32 = 0;
const QUAD_KIND_PROXY: u32 = 1;
const QUAD_KIND_PLACEHOLDER: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TileQuadGpu {
    pub target_rect: [f32; 4],
    pub source_rect: [f32; 4],
    pub layer: u32,
    pub kind: u32,
    pub padding: [u32; 2],
}

const _: () = assert!(std::mem::size_of::<TileQuadGpu>() == 48);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniformGpu {
    view_size: [f32; 2],
    rotation: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuTileCanvasConfig {
    pub tile_size: u32,
    pub atlas_layers: u32,
    pub tiles_per_row: u32,
    pub atlas_format: wgpu::TextureFormat,
    pub target_format: wgpu::TextureFormat,
}

impl Default for WgpuTileCanvasConfig {
    fn default() -> Self {
        Self {
            tile_size: model::DEFAULT_TILE_SIZE,
            atlas_layers: 4,
            tiles_per_row: 8,
            atlas_format: wgpu::TextureFormat::Rgba8UnormSrgb,
            target_format: wgpu::TextureFormat::Bgra8UnormSrgb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WgpuTileCanvasError {
    #[error("atlas needs at least one layer and one tile per row")]
    AtlasGridZero,
    #[error("tile size {0} is not a power of two")]
    TileSizeNotPowerOfTwo(u32),
    #[error("atlas of {tiles_per_row} tiles per row does not fit a u16 slot index")]
    AtlasGridTooLarge { tiles_per_row: u32 },
    #[error("atlas {edge}x{edge} with {layers} layers exceeds device limits")]
    AtlasSizeExceedsDeviceLimit { edge: u32, layers: u32 },
}

impl WgpuTileCanvasConfig {
    fn atlas_edge(&self) -> Result<u32, WgpuTileCanvasError> {
        if self.atlas_layers == 0 || self.tiles_per_row == 0 {
            return Err(WgpuTileCanvasError::AtlasGridZero);
        }
        if !self.tile_size.is_power_of_two() {
            return Err(WgpuTileCanvasError::TileSizeNotPowerOfTwo(self.tile_size));
        }
        if self
            .tiles_per_row
            .checked_mul(self.tiles_per_row)
            .is_none_or(|slots| slots > u32::from(u16::MAX) + 1)
        {
            return Err(WgpuTileCanvasError::AtlasGridTooLarge {
                tiles_per_row: self.tiles_per_row,
            });
        }
        self.tiles_per_row
            .checked_mul(self.tile_size)
            .ok_or(WgpuTileCanvasError::AtlasSizeExceedsDeviceLimit {
                edge: u32::MAX,
                layers: self.atlas_layers,
            })
    }
}

pub struct WgpuTileCanvas {
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: WgpuTileCanvasConfig,
    atlas_edge: u32,
    slots: AtlasSlotAllocator,
    atlas_texture: wgpu::Texture,
    atlas_view: wgpu::TextureView,
    proxy_texture: wgpu::Texture,
    proxy_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    frame_uniform_buffer: wgpu::Buffer,
    quad_buffer: wgpu::Buffer,
    quad_capacity: usize,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    pipeline: wgpu::RenderPipeline,
    quads: Vec<TileQuadGpu>,
    frame_uniform: FrameUniformGpu,
    submitted_quads: u32,
}

impl WgpuTileCanvas {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        config: WgpuTileCanvasConfig,
    ) -> Result<Self, WgpuTileCanvasError> {
        let atlas_edge = config.atlas_edge()?;
        let limits = device.limits();
        if atlas_edge > limits.max_texture_dimension_2d
            || config.atlas_layers > limits.max_texture_array_layers
        {
            return Err(WgpuTileCanvasError::AtlasSizeExceedsDeviceLimit {
                edge: atlas_edge,
                layers: config.atlas_layers,
            });
        }

        let atlas_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("renderer.tile_atlas"),
            size: wgpu::Extent3d {
                width: atlas_edge,
                height: atlas_edge,
                depth_or_array_layers: config.atlas_layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: config.atlas_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let atlas_view = atlas_texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("renderer.tile_atlas.view"),
            format: Some(config.atlas_format),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            usage: None,
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: Some(1),
            base_array_layer: 0,
            array_layer_count: Some(config.atlas_layers),
        });
        let (proxy_texture, proxy_view) =
            Self::create_proxy_texture(device, queue, config.atlas_format, None);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("renderer.tile_sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let frame_uniform = FrameUniformGpu {
            view_size: [1.0, 1.0],
            rotation: [1.0, 0.0],
        };
        let frame_uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("renderer.frame_uniform"),
            size: std::mem::size_of::<FrameUniformGpu>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&frame_uniform_buffer, 0, bytemuck::bytes_of(&frame_uniform));
        let quad_buffer = Self::create_quad_buffer(device, INITIAL_QUAD_CAPACITY);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("renderer.tile_quad_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let bind_group = Self::create_bind_group(
            device,
            &bind_group_layout,
            &frame_uniform_buffer,
            &quad_buffer,
            &atlas_view,
            &proxy_view,
            &sampler,
        );

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("renderer.tile_quad"),
            source: wgpu::ShaderSource::Wgsl(include_str!("tile_quad.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("renderer.tile_quad_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("renderer.tile_quad_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: config.target_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        debug!(
            "tile canvas atlas {atlas_edge}x{atlas_edge} x{} layers",
            config.atlas_layers
        );
        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            config,
            atlas_edge,
            slots: AtlasSlotAllocator::new(
                config.atlas_layers,
                config.tiles_per_row * config.tiles_per_row,
            ),
            atlas_texture,
            atlas_view,
            proxy_texture,
            proxy_view,
            sampler,
            frame_uniform_buffer,
            quad_buffer,
            quad_capacity: INITIAL_QUAD_CAPACITY,
            bind_group_layout,
            bind_group,
            pipeline,
            quads: Vec::with_capacity(INITIAL_QUAD_CAPACITY),
            frame_uniform,
            submitted_quads: 0,
        })
    }

    pub fn config(&self) -> WgpuTileCanvasConfig {
        self.config
    }

    pub fn free_slots(&self) -> usize {
        self.slots.free_count()
    }

    pub fn quad_count(&self) -> u32 {
        self.submitted_quads
    }

    /// Forgets every uploaded tile, as after a lost context. Outstanding slots
    /// stop matching and are skipped when drawn.
    pub fn invalidate(&mut self) {
        self.slots.reset();
        self.quads.clear();
        self.submitted_quads = 0;
        debug!("tile canvas invalidated");
    }

    /// Records the last finished frame into `pass`.
    pub fn encode(&self, pass: &mut wgpu::RenderPass<'_>) {
        if self.submitted_quads == 0 {
            return;
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.draw(0..6, 0..self.submitted_quads);
    }

    /// Clears `target` and draws the last finished frame into it.
    pub fn render_into(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        clear_color: wgpu::Color,
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("renderer.tile_quads"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear_color),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        self.encode(&mut pass);
    }

    fn slot_origin(&self, slot: TextureSlot) -> (u32, u32) {
        let index = u32::from(slot.index);
        let column = index % self.config.tiles_per_row;
        let row = index / self.config.tiles_per_row;
        (column * self.config.tile_size, row * self.config.tile_size)
    }

    fn push_quad(&mut self, target: RectF, source_uv: [f32; 4], layer: u32, kind: u32) {
        self.quads.push(TileQuadGpu {
            target_rect: [target.left, target.top, target.right, target.bottom],
            source_rect: source_uv,
            layer,
            kind,
            padding: [0; 2],
        });
    }

    fn ensure_quad_capacity(&mut self, required_len: usize) {
        if required_len <= self.quad_capacity {
            return;
        }
        let expanded_capacity = required_len
            .max(INITIAL_QUAD_CAPACITY)
            .checked_next_power_of_two()
            .expect("tile quad capacity overflow");
        self.quad_buffer = Self::create_quad_buffer(&self.device, expanded_capacity);
        self.quad_capacity = expanded_capacity;
        self.rebuild_bind_group();
    }

    fn rebuild_bind_group(&mut self) {
        self.bind_group = Self::create_bind_group(
            &self.device,
            &self.bind_group_layout,
            &self.frame_uniform_buffer,
            &self.quad_buffer,
            &self.atlas_view,
            &self.proxy_view,
            &self.sampler,
        );
    }

    fn create_quad_buffer(device: &wgpu::Device, capacity: usize) -> wgpu::Buffer {
        let quad_size = std::mem::size_of::<TileQuadGpu>() as u64;
        let capacity_u64 = u64::try_from(capacity).expect("tile quad capacity exceeds u64");
        let size = capacity_u64
            .checked_mul(quad_size)
            .expect("tile quad buffer size overflow");
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("renderer.tile_quads"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        frame_uniform_buffer: &wgpu::Buffer,
        quad_buffer: &wgpu::Buffer,
        atlas_view: &wgpu::TextureView,
        proxy_view: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("renderer.tile_quad_bind_group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: frame_uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: quad_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(atlas_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(proxy_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    /// A 1x1 transparent texture stands in when there is no proxy.
    fn create_proxy_texture(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        format: wgpu::TextureFormat,
        proxy: Option<&ProxyImage>,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let blank = TilePixels::zeroed(1, 1);
        let pixels = proxy.map_or(&blank, ProxyImage::pixels);
        let size = wgpu::Extent3d {
            width: pixels.width(),
            height: pixels.height(),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("renderer.proxy"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels.bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(pixels.bytes_per_row()),
                rows_per_image: Some(pixels.height()),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }
}

impl TileCanvas for WgpuTileCanvas {
    fn begin_frame(&mut self, transform: &FrameTransform) {
        self.quads.clear();
        let radians = (transform.rotation_degrees as f32).to_radians();
        self.frame_uniform = FrameUniformGpu {
            view_size: [
                transform.view_width.max(1) as f32,
                transform.view_height.max(1) as f32,
            ],
            rotation: [radians.cos(), radians.sin()],
        };
    }

    fn upload_tile(&mut self, pixels: &TilePixels) -> Result<TextureSlot, TileUploadError> {
        let tile_size = self.config.tile_size;
        if pixels.width() != tile_size || pixels.height() != tile_size {
            return Err(TileUploadError::SizeMismatch {
                width: pixels.width(),
                height: pixels.height(),
                tile_size,
            });
        }
        let slot = self.slots.allocate().ok_or(TileUploadError::AtlasFull)?;
        let (x, y) = self.slot_origin(slot);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.atlas_texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x,
                    y,
                    z: slot.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            pixels.bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(tile_size * BYTES_PER_PIXEL as u32),
                rows_per_image: Some(tile_size),
            },
            wgpu::Extent3d {
                width: tile_size,
                height: tile_size,
                depth_or_array_layers: 1,
            },
        );
        trace!("uploaded tile into slot {slot:?}");
        Ok(slot)
    }

    fn release_texture(&mut self, slot: TextureSlot) {
        if !self.slots.release(slot) {
            trace!("ignored release of stale slot {slot:?}");
        }
    }

    fn set_proxy_image(&mut self, proxy: Option<&ProxyImage>) {
        let (texture, view) =
            Self::create_proxy_texture(&self.device, &self.queue, self.config.atlas_format, proxy);
        self.proxy_texture = texture;
        self.proxy_view = view;
        self.rebuild_bind_group();
    }

    fn draw_tile(&mut self, slot: TextureSlot, source: RectF, target: RectF) {
        if !self.slots.is_current(slot) {
            trace!("skipped draw of stale slot {slot:?}");
            return;
        }
        let (x, y) = self.slot_origin(slot);
        let edge = self.atlas_edge as f32;
        let uv = [
            (x as f32 + source.left) / edge,
            (y as f32 + source.top) / edge,
            (x as f32 + source.right) / edge,
            (y as f32 + source.bottom) / edge,
        ];
        self.push_quad(target, uv, slot.layer, QUAD_KIND_ATLAS);
    }

    fn draw_proxy(&mut self, source: RectF, target: RectF) {
        let width = self.proxy_texture.width().max(1) as f32;
        let height = self.proxy_texture.height().max(1) as f32;
        let uv = [
            source.left / width,
            source.top / height,
            source.right / width,
            source.bottom / height,
        ];
        self.push_quad(target, uv, 0, QUAD_KIND_PROXY);
    }

    fn draw_placeholder(&mut self, target: RectF) {
        self.push_quad(target, [0.0; 4], 0, QUAD_KIND_PLACEHOLDER);
    }

    fn end_frame(&mut self) {
        self.ensure_quad_capacity(self.quads.len());
        if !self.quads.is_empty() {
            self.queue
                .write_buffer(&self.quad_buffer, 0, bytemuck::cast_slice(&self.quads));
        }
        self.queue.write_buffer(
            &self.frame_uniform_buffer,
            0,
            bytemuck::bytes_of(&self.frame_uniform),
        );
        self.submitted_quads =
            u32::try_from(self.quads.len()).expect("tile quad count exceeds u32");
    }
}
