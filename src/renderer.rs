use std::{borrow::Cow, collections::HashMap};

use glam::Vec3;
use thiserror::Error;
use wgpu::util::DeviceExt;

use crate::camera::{Camera, VolumeGeometry};
use crate::enums::RenderMode;
use crate::lookup_grid::LookupGrid;
use crate::region::VolumeBuffer;
use crate::transfer_function::{MAX_SEGMENTS, Thresholds};
use crate::viewer::{PendingUploads, Viewer};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{label} texture of {width}x{height}x{depth} exceeds the device limit of {limit}")]
    TextureTooLarge {
        label: &'static str,
        width: u32,
        height: u32,
        depth: u32,
        limit: u32,
    },

    #[error("No render pipeline registered for {0:?}")]
    MissingPipeline(RenderMode),

    #[error("No suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),

    #[error("GPU device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// Ray marching parameters owned by the viewer.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub step_length: f32,
    /// Isosurface threshold, normalised by the volume's intensity range.
    pub threshold: f32,
    pub background: Vec3,
    pub material_colour: Vec3,
    pub gamma: f32,
    pub lighting_enabled: bool,
    pub light_position: Vec3,
    pub render_mode: RenderMode,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            step_length: 0.01,
            threshold: 0.0,
            background: Vec3::ZERO,
            material_colour: Vec3::ONE,
            gamma: 2.2,
            lighting_enabled: false,
            light_position: Vec3::ZERO,
            render_mode: RenderMode::default(),
        }
    }
}

/// Uniform block shared by every ray marching pipeline.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RenderUniforms {
    pub view_matrix: [[f32; 4]; 4],
    pub model_view_projection: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 3],
    pub ray_origin: [f32; 4],
    pub top: [f32; 4],
    pub bottom: [f32; 4],
    pub background_colour: [f32; 4],
    pub material_colour: [f32; 4],
    pub light_position: [f32; 4],
    pub viewport_size: [f32; 2],
    pub aspect_ratio: f32,
    pub focal_length: f32,
    pub step_length: f32,
    pub threshold: f32,
    pub gamma: f32,
    pub transfer_function_threshold: f32,
    pub hsv_thresholds: [f32; 4],
    pub render_mode: u32,
    pub lighting_enabled: u32,
    _padding: [u32; 2],
}

impl RenderUniforms {
    pub fn new(
        camera: &Camera,
        geometry: &VolumeGeometry,
        settings: &RenderSettings,
        thresholds: Thresholds,
    ) -> Self {
        let model = geometry.model_matrix(false);
        let normal = camera.normal_matrix(model);
        let (width, height) = camera.viewport();
        Self {
            view_matrix: camera.view_matrix().to_cols_array_2d(),
            model_view_projection: camera.model_view_projection(model).to_cols_array_2d(),
            normal_matrix: [
                normal.x_axis.extend(0.0).to_array(),
                normal.y_axis.extend(0.0).to_array(),
                normal.z_axis.extend(0.0).to_array(),
            ],
            ray_origin: camera.ray_origin().extend(1.0).to_array(),
            top: geometry.top(false).extend(0.0).to_array(),
            bottom: geometry.bottom(false).extend(0.0).to_array(),
            background_colour: settings.background.extend(1.0).to_array(),
            material_colour: settings.material_colour.extend(1.0).to_array(),
            light_position: settings.light_position.extend(1.0).to_array(),
            viewport_size: [width as f32, height as f32],
            aspect_ratio: camera.aspect_ratio(),
            focal_length: camera.focal_length(),
            step_length: settings.step_length,
            threshold: settings.threshold,
            gamma: settings.gamma,
            transfer_function_threshold: thresholds.intensity,
            hsv_thresholds: [thresholds.hue, thresholds.saturation, thresholds.value, 0.0],
            render_mode: settings.render_mode as u32,
            lighting_enabled: settings.lighting_enabled as u32,
            _padding: [0; 2],
        }
    }
}

/// A two-unit cube, scaled to the volume by the model matrix.
const CUBE_VERTICES: [[f32; 3]; 8] = [
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
];

#[rustfmt::skip]
const CUBE_INDICES: [u16; 36] = [
    0, 1, 2, 0, 2, 3, // front
    1, 5, 6, 1, 6, 2, // right
    5, 4, 7, 5, 7, 6, // back
    4, 0, 3, 4, 3, 7, // left
    2, 6, 7, 2, 7, 3, // top
    4, 5, 1, 4, 1, 0, // bottom
];

const CUBE_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];

/// Fail with `TextureTooLarge` if `size` exceeds what `limits` allow for `dimension`.
pub fn check_texture_size(
    label: &'static str,
    dimension: wgpu::TextureDimension,
    size: wgpu::Extent3d,
    limits: &wgpu::Limits,
) -> Result<(), RenderError> {
    let (limit, largest) = match dimension {
        wgpu::TextureDimension::D1 => (limits.max_texture_dimension_1d, size.width),
        wgpu::TextureDimension::D2 => (
            limits.max_texture_dimension_2d,
            size.width.max(size.height),
        ),
        wgpu::TextureDimension::D3 => (
            limits.max_texture_dimension_3d,
            size.width.max(size.height).max(size.depth_or_array_layers),
        ),
    };
    if largest > limit {
        return Err(RenderError::TextureTooLarge {
            label,
            width: size.width,
            height: size.height,
            depth: size.depth_or_array_layers,
            limit,
        });
    }
    Ok(())
}

/// Per-pixel ray start jitter, hashed from the pixel index and `seed`.
pub fn jitter_noise(width: u32, height: u32, seed: u32) -> Vec<u8> {
    (0..width.saturating_mul(height))
        .map(|i| {
            let mut state = i
                .wrapping_mul(0x9E3779B9)
                .wrapping_add(seed.wrapping_mul(0x2545F491));
            state ^= state >> 16;
            state = state.wrapping_mul(0x45D9F3B);
            state ^= state >> 16;
            state = state.wrapping_mul(0x45D9F3B);
            state ^= state >> 16;
            (state >> 24) as u8
        })
        .collect()
}

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Request the default adapter and device.
    pub async fn request() -> Result<Self, RenderError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        log::info!("Using GPU adapter {}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Volume Renderer Device"),
                ..Default::default()
            })
            .await?;
        Ok(Self { device, queue })
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: wgpu::Extent3d,
}

impl GpuTexture {
    fn new(
        device: &wgpu::Device,
        label: &'static str,
        dimension: wgpu::TextureDimension,
        size: wgpu::Extent3d,
        format: wgpu::TextureFormat,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            size,
        }
    }

    fn write(&self, queue: &wgpu::Queue, bytes: &[u8], bytes_per_texel: u32) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_texel * self.size.width),
                rows_per_image: Some(self.size.height),
            },
            self.size,
        );
    }
}

fn extent(width: u32, height: u32, depth: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: width.max(1),
        height: height.max(1),
        depth_or_array_layers: depth.max(1),
    }
}

/// Ray marching pipelines, one per mode.
#[derive(Default)]
pub struct RenderPipelines {
    pipelines: HashMap<RenderMode, wgpu::RenderPipeline>,
}

impl RenderPipelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mode: RenderMode, pipeline: wgpu::RenderPipeline) {
        self.pipelines.insert(mode, pipeline);
    }

    pub fn get(&self, mode: RenderMode) -> Option<&wgpu::RenderPipeline> {
        self.pipelines.get(&mode)
    }

    /// Build the pipeline for `mode` from a WGSL module exposing `vs_main`
    /// and `fs_main`, bound to the renderer's layout.
    pub fn register_wgsl(
        &mut self,
        renderer: &GpuVolumeRenderer,
        mode: RenderMode,
        source: &str,
        target_format: wgpu::TextureFormat,
    ) {
        let device = &renderer.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(mode.label()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_owned())),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Ray Casting Pipeline Layout"),
            bind_group_layouts: &[&renderer.bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(mode.label()),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[GpuVolumeRenderer::vertex_layout()],
            },
            primitive: wgpu::PrimitiveState {
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });
        self.insert(mode, pipeline);
    }
}

/// GPU side of the viewer: volume and lookup textures, uniforms and the cube mesh.
pub struct GpuVolumeRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    volume: GpuTexture,
    noise: GpuTexture,
    color_lut: GpuTexture,
    location_lut: GpuTexture,
    segments: GpuTexture,
    noise_seed: u32,
    render_mode: RenderMode,
}

impl GpuVolumeRenderer {
    pub fn new(context: GpuContext, viewport: (u32, u32)) -> Self {
        let GpuContext { device, queue } = context;

        let volume = GpuTexture::new(
            &device,
            "Volume 3D Texture",
            wgpu::TextureDimension::D3,
            extent(1, 1, 1),
            wgpu::TextureFormat::Rgba8Unorm,
        );
        let noise = GpuTexture::new(
            &device,
            "Jitter Texture",
            wgpu::TextureDimension::D2,
            extent(viewport.0, viewport.1, 1),
            wgpu::TextureFormat::R8Unorm,
        );
        noise.write(&queue, &jitter_noise(noise.size.width, noise.size.height, 0), 1);
        let color_lut = Self::lookup_texture(&device, "Colour Proximity Texture", 1);
        let location_lut = Self::lookup_texture(&device, "Location Texture", 1);
        let segments = GpuTexture::new(
            &device,
            "Segment Opacity Texture",
            wgpu::TextureDimension::D1,
            extent(MAX_SEGMENTS as u32, 1, 1),
            wgpu::TextureFormat::R32Float,
        );

        // Linear filtering for the volume and lookup textures
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Volume Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let texture_entry = |binding, view_dimension, filterable| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable },
                view_dimension,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Ray Casting Bind Group Layout"),
            entries: &[
                texture_entry(0, wgpu::TextureViewDimension::D3, true),
                texture_entry(1, wgpu::TextureViewDimension::D2, true),
                texture_entry(2, wgpu::TextureViewDimension::D3, true),
                texture_entry(3, wgpu::TextureViewDimension::D3, true),
                // R32Float is only loaded, never filtered
                texture_entry(4, wgpu::TextureViewDimension::D1, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 6,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Ray Casting Uniforms"),
            contents: bytemuck::bytes_of(&<RenderUniforms as bytemuck::Zeroable>::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Vertices"),
            contents: bytemuck::cast_slice(&CUBE_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Indices"),
            contents: bytemuck::cast_slice(&CUBE_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let bind_group = create_bind_group(
            &device,
            &bind_group_layout,
            [&volume, &noise, &color_lut, &location_lut, &segments],
            &sampler,
            &uniform_buffer,
        );

        Self {
            device,
            queue,
            bind_group_layout,
            bind_group,
            sampler,
            uniform_buffer,
            vertex_buffer,
            index_buffer,
            volume,
            noise,
            color_lut,
            location_lut,
            segments,
            noise_seed: 0,
            render_mode: RenderMode::default(),
        }
    }

    fn lookup_texture(device: &wgpu::Device, label: &'static str, dim: u32) -> GpuTexture {
        GpuTexture::new(
            device,
            label,
            wgpu::TextureDimension::D3,
            extent(dim, dim, dim),
            wgpu::TextureFormat::R16Float,
        )
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    pub fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &CUBE_ATTRIBUTES,
        }
    }

    /// Upload whatever the viewer marked as pending, then refresh the uniforms.
    ///
    /// On failure the pending flags are handed back to the viewer so the next
    /// sync retries them.
    pub fn sync(&mut self, viewer: &mut Viewer, camera: &Camera) -> Result<(), RenderError> {
        let pending = viewer.take_pending();
        if let Err(err) = self.upload(viewer, pending) {
            viewer.requeue(pending);
            return Err(err);
        }

        let geometry = viewer
            .geometry()
            .unwrap_or_else(|| VolumeGeometry::pyramid((1, 1, 1)));
        let uniforms = RenderUniforms::new(
            camera,
            &geometry,
            viewer.settings(),
            viewer.transfer_functions().thresholds(),
        );
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        self.render_mode = viewer.settings().render_mode;
        Ok(())
    }

    fn upload(&mut self, viewer: &Viewer, pending: PendingUploads) -> Result<(), RenderError> {
        let mut rebind = false;
        if pending.volume {
            if let Some(buffer) = viewer.volume_buffer() {
                rebind |= self.upload_volume(buffer)?;
            }
        }
        let transfer = viewer.transfer_functions();
        if pending.color_lut {
            rebind |= Self::upload_lookup(
                &self.device,
                &self.queue,
                &mut self.color_lut,
                "Colour Proximity Texture",
                transfer.color_grid(),
            )?;
        }
        if pending.location_lut {
            rebind |= Self::upload_lookup(
                &self.device,
                &self.queue,
                &mut self.location_lut,
                "Location Texture",
                transfer.location_grid(),
            )?;
        }
        if pending.segment_opacity {
            self.segments.write(
                &self.queue,
                bytemuck::cast_slice(transfer.segment_opacities()),
                4,
            );
        }
        if rebind {
            self.bind_group = self.create_bind_group();
        }
        Ok(())
    }

    /// Returns whether the texture had to be recreated.
    fn upload_volume(&mut self, buffer: &VolumeBuffer) -> Result<bool, RenderError> {
        let start = web_time::Instant::now();
        let (width, height, depth) = buffer.size();
        let size = extent(width, height, depth);
        check_texture_size(
            "Volume",
            wgpu::TextureDimension::D3,
            size,
            &self.device.limits(),
        )?;

        let recreate = self.volume.size != size;
        if recreate {
            self.volume = GpuTexture::new(
                &self.device,
                "Volume 3D Texture",
                wgpu::TextureDimension::D3,
                size,
                wgpu::TextureFormat::Rgba8Unorm,
            );
        }
        if buffer.size_bytes() > 0 {
            self.volume.write(&self.queue, buffer.as_bytes(), 4);
        }
        log::debug!(
            "Uploaded {width}x{height}x{depth} volume in {:.2?}",
            start.elapsed()
        );
        Ok(recreate)
    }

    fn upload_lookup(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        slot: &mut GpuTexture,
        label: &'static str,
        grid: &LookupGrid,
    ) -> Result<bool, RenderError> {
        let dim = grid.dim() as u32;
        let size = extent(dim, dim, dim);
        check_texture_size(label, wgpu::TextureDimension::D3, size, &device.limits())?;

        let recreate = slot.size != size;
        if recreate {
            *slot = Self::lookup_texture(device, label, dim);
        }
        slot.write(queue, bytemuck::cast_slice(&grid.to_f16_texels()), 2);
        Ok(recreate)
    }

    /// Regenerate the jitter texture for a new viewport size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        let size = extent(width, height, 1);
        check_texture_size(
            "Jitter",
            wgpu::TextureDimension::D2,
            size,
            &self.device.limits(),
        )?;
        self.noise_seed = self.noise_seed.wrapping_add(1);
        self.noise = GpuTexture::new(
            &self.device,
            "Jitter Texture",
            wgpu::TextureDimension::D2,
            size,
            wgpu::TextureFormat::R8Unorm,
        );
        self.noise.write(
            &self.queue,
            &jitter_noise(size.width, size.height, self.noise_seed),
            1,
        );
        self.bind_group = self.create_bind_group();
        Ok(())
    }

    /// Draw the volume cube with the pipeline of the active render mode.
    pub fn paint(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        pipelines: &RenderPipelines,
    ) -> Result<(), RenderError> {
        let pipeline = pipelines
            .get(self.render_mode)
            .ok_or(RenderError::MissingPipeline(self.render_mode))?;
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..CUBE_INDICES.len() as u32, 0, 0..1);
        Ok(())
    }

    fn create_bind_group(&self) -> wgpu::BindGroup {
        create_bind_group(
            &self.device,
            &self.bind_group_layout,
            [
                &self.volume,
                &self.noise,
                &self.color_lut,
                &self.location_lut,
                &self.segments,
            ],
            &self.sampler,
            &self.uniform_buffer,
        )
    }
}

/// Bindings 0..=4 are the textures in `textures` order, then sampler and uniforms.
fn create_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    textures: [&GpuTexture; 5],
    sampler: &wgpu::Sampler,
    uniform_buffer: &wgpu::Buffer,
) -> wgpu::BindGroup {
    let mut entries: Vec<wgpu::BindGroupEntry<'_>> = textures
        .iter()
        .zip(0u32..)
        .map(|(texture, binding)| wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::TextureView(&texture.view),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: 5,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    entries.push(wgpu::BindGroupEntry {
        binding: 6,
        resource: uniform_buffer.as_entire_binding(),
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Ray Casting Bind Group"),
        layout,
        entries: &entries,
    })
}
