//! In-memory backend.
//!
//! Executes the recorded command log on the CPU: buffer and texture contents
//! live in host memory, render passes clear their attachments, and copies,
//! readbacks and mipmap generation operate on those bytes. Draws and dispatches
//! only count. This makes the whole frame model observable in tests without a
//! GPU.
//!
//! Conventions match Vulkan: Y down in the framebuffer and NDC, depth 0..1,
//! 256 byte uniform buffer alignment.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

use crate::command::{AttachmentTarget, Command, PassTarget, ReadbackSource, TextureCopyRegion};
use crate::error::{FrameOpError, RhiError};
use crate::resources::{
    BindingLayoutEntry, ComputePipelineDescriptor, GraphicsPipelineDescriptor, RenderPassFormat,
};
use crate::types::{
    BufferDescriptor, Color, Point, RenderBufferDescriptor, SamplerDescriptor, Size,
    TextureDescriptor, TextureFlags, TextureFormat, size_for_mip_level,
};

use super::{
    Backend, BackendKind, BackendStatistics, DeviceType, DriverInfo, Feature, NativeHandle,
    NativeObject, NativeTexture, ResourceLimit, SwapChainNativeDescriptor,
};

const PIPELINE_CACHE_MAGIC: &[u8; 8] = b"NULLPSO\0";

/// Parameters of the null backend.
#[derive(Debug, Clone)]
pub struct NullInitParams {
    pub frames_in_flight: u32,
    /// Features reported as unsupported.
    pub disabled_features: HashSet<Feature>,
    /// Report device loss once this many frames have ended.
    pub lose_device_after_frames: Option<u64>,
    pub ubuf_alignment: u32,
}

impl Default for NullInitParams {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            disabled_features: HashSet::new(),
            lose_device_after_frames: None,
            ubuf_alignment: 256,
        }
    }
}

impl NullInitParams {
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_disabled_feature(mut self, feature: Feature) -> Self {
        self.disabled_features.insert(feature);
        self
    }

    pub fn with_lose_device_after_frames(mut self, frames: u64) -> Self {
        self.lose_device_after_frames = Some(frames);
        self
    }

    pub fn with_ubuf_alignment(mut self, alignment: u32) -> Self {
        self.ubuf_alignment = alignment.max(1);
        self
    }
}

/// Host memory image with every layer and mip level.
#[derive(Debug)]
struct NullImage {
    format: TextureFormat,
    size: Size,
    layers: u32,
    levels: u32,
    data: Vec<Vec<u8>>,
}

impl NullImage {
    fn new(format: TextureFormat, size: Size, layers: u32, levels: u32) -> Self {
        let layers = layers.max(1);
        let levels = levels.max(1);
        let mut data = Vec::with_capacity((layers * levels) as usize);
        for _ in 0..layers {
            for level in 0..levels {
                let bytes = format.image_byte_size(size_for_mip_level(level, size));
                data.push(vec![0; bytes as usize]);
            }
        }
        Self {
            format,
            size,
            layers,
            levels,
            data,
        }
    }

    fn level_size(&self, level: u32) -> Size {
        size_for_mip_level(level, self.size)
    }

    fn subresource(&self, layer: u32, level: u32) -> Option<&Vec<u8>> {
        if layer >= self.layers || level >= self.levels {
            return None;
        }
        self.data.get((layer * self.levels + level) as usize)
    }

    fn subresource_mut(&mut self, layer: u32, level: u32) -> Option<&mut Vec<u8>> {
        if layer >= self.layers || level >= self.levels {
            return None;
        }
        self.data.get_mut((layer * self.levels + level) as usize)
    }

    /// Copy `size` pixels from `src` (rows of `src_stride` bytes) to `origin`.
    fn write(
        &mut self,
        layer: u32,
        level: u32,
        origin: Point,
        size: Size,
        src: &[u8],
        src_stride: u32,
    ) -> Result<(), RhiError> {
        let format = self.format;
        let level_size = self.level_size(level);
        let dst = self
            .subresource_mut(layer, level)
            .ok_or_else(|| RhiError::Internal(format!("no subresource {layer}/{level}")))?;
        let (bw, bh) = format.block_dimensions();
        let dst_stride = format.bytes_per_line(level_size.width) as usize;
        let row_bytes = format.bytes_per_line(size.width) as usize;
        let x_offset = ((origin.x / bw) * format.block_size()) as usize;
        let first_row = (origin.y / bh) as usize;
        for row in 0..format.line_count(size.height) as usize {
            let src_start = row * src_stride as usize;
            let dst_start = (first_row + row) * dst_stride + x_offset;
            let (Some(from), Some(to)) = (
                src.get(src_start..src_start + row_bytes),
                dst.get_mut(dst_start..dst_start + row_bytes),
            ) else {
                return Err(RhiError::Internal(format!(
                    "region {size:?} at {origin:?} is out of bounds"
                )));
            };
            to.copy_from_slice(from);
        }
        Ok(())
    }

    /// Tightly packed bytes of a region.
    fn read(&self, layer: u32, level: u32, origin: Point, size: Size) -> Option<Vec<u8>> {
        let format = self.format;
        let src = self.subresource(layer, level)?;
        let (bw, bh) = format.block_dimensions();
        let src_stride = format.bytes_per_line(self.level_size(level).width) as usize;
        let row_bytes = format.bytes_per_line(size.width) as usize;
        let x_offset = ((origin.x / bw) * format.block_size()) as usize;
        let first_row = (origin.y / bh) as usize;
        let mut out = Vec::with_capacity(row_bytes * format.line_count(size.height) as usize);
        for row in 0..format.line_count(size.height) as usize {
            let start = (first_row + row) * src_stride + x_offset;
            out.extend_from_slice(src.get(start..start + row_bytes)?);
        }
        Some(out)
    }

    fn fill(&mut self, layer: u32, level: u32, texel: &[u8]) {
        if texel.is_empty() {
            return;
        }
        if let Some(data) = self.subresource_mut(layer, level) {
            for chunk in data.chunks_mut(texel.len()) {
                chunk.copy_from_slice(&texel[..chunk.len()]);
            }
        }
    }

    /// Fill levels 1.. of every layer from level 0.
    fn generate_mips(&mut self) {
        if self.format.is_compressed() {
            return;
        }
        let bpp = self.format.block_size() as usize;
        let average = matches!(
            self.format,
            TextureFormat::Rgba8 | TextureFormat::Bgra8 | TextureFormat::R8 | TextureFormat::Rg8
        );
        for layer in 0..self.layers {
            for level in 1..self.levels {
                let src_size = self.level_size(level - 1);
                let dst_size = self.level_size(level);
                let Some(src) = self.subresource(layer, level - 1).cloned() else {
                    continue;
                };
                let texel = |x: u32, y: u32| {
                    let x = x.min(src_size.width - 1) as usize;
                    let y = y.min(src_size.height - 1) as usize;
                    let start = (y * src_size.width as usize + x) * bpp;
                    &src[start..start + bpp]
                };
                let mut dst = Vec::with_capacity(src.len() / 2);
                for y in 0..dst_size.height {
                    for x in 0..dst_size.width {
                        if average {
                            let samples = [
                                texel(x * 2, y * 2),
                                texel(x * 2 + 1, y * 2),
                                texel(x * 2, y * 2 + 1),
                                texel(x * 2 + 1, y * 2 + 1),
                            ];
                            for c in 0..bpp {
                                let sum: u32 = samples.iter().map(|s| u32::from(s[c])).sum();
                                dst.push(((sum + 2) / 4) as u8);
                            }
                        } else {
                            dst.extend_from_slice(texel(x * 2, y * 2));
                        }
                    }
                }
                if let Some(slot) = self.subresource_mut(layer, level) {
                    *slot = dst;
                }
            }
        }
    }
}

/// Bytes of one texel of `format` holding `color`.
fn clear_texel(format: TextureFormat, color: Color) -> Vec<u8> {
    let [r, g, b, a] = color.to_rgba8();
    match format {
        TextureFormat::Rgba8 => vec![r, g, b, a],
        TextureFormat::Bgra8 => vec![b, g, r, a],
        TextureFormat::R8 | TextureFormat::R8Ui => vec![r],
        TextureFormat::Rg8 => vec![r, g],
        TextureFormat::R32F => color.r.to_le_bytes().to_vec(),
        TextureFormat::Rgba32F => [color.r, color.g, color.b, color.a]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect(),
        other => vec![0; other.block_size() as usize],
    }
}

#[derive(Debug)]
struct NullTexture {
    image: NullImage,
    native: NativeTexture,
}

#[derive(Debug)]
struct NullSwapChain {
    format: TextureFormat,
    backbuffer: NullImage,
}

/// Objects without contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullObjectKind {
    Sampler,
    RenderPass,
    ShaderResourceBindings,
    GraphicsPipeline,
    ComputePipeline,
}

/// Backend that runs everything in host memory.
#[derive(Debug)]
pub struct NullBackend {
    params: NullInitParams,
    next_handle: u64,
    buffers: HashMap<NativeHandle, Vec<u8>>,
    textures: HashMap<NativeHandle, NullTexture>,
    render_buffers: HashMap<NativeHandle, NullImage>,
    swapchains: HashMap<NativeHandle, NullSwapChain>,
    objects: HashMap<NativeHandle, NullObjectKind>,
    readbacks: HashMap<u64, Vec<u8>>,
    command_buffers: Vec<NativeHandle>,
    stats: BackendStatistics,
    frames_ended: u64,
    device_lost: bool,
    last_gpu_time: f64,
    pipelines_created: u64,
}

impl NullBackend {
    pub fn new(params: NullInitParams) -> Self {
        let mut backend = Self {
            params,
            next_handle: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            render_buffers: HashMap::new(),
            swapchains: HashMap::new(),
            objects: HashMap::new(),
            readbacks: HashMap::new(),
            command_buffers: Vec::new(),
            stats: BackendStatistics::default(),
            frames_ended: 0,
            device_lost: false,
            last_gpu_time: 0.0,
            pipelines_created: 0,
        };
        for _ in 0..backend.params.frames_in_flight {
            let handle = backend.allocate();
            backend.command_buffers.push(handle);
        }
        log::debug!(
            "NullBackend: {} frames in flight, {} disabled features",
            backend.params.frames_in_flight,
            backend.params.disabled_features.len()
        );
        backend
    }

    fn allocate(&mut self) -> NativeHandle {
        let handle = NativeHandle(NonZeroU64::MIN.saturating_add(self.next_handle));
        self.next_handle += 1;
        handle
    }

    /// Number of live native objects, command buffers excluded.
    pub fn live_object_count(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.render_buffers.len()
            + self.swapchains.len()
            + self.objects.len()
    }

    fn check_device(&self) -> Result<(), RhiError> {
        if self.device_lost {
            Err(RhiError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn attachment_image(&mut self, target: AttachmentTarget) -> Option<&mut NullImage> {
        match target {
            AttachmentTarget::Texture(h) => self.textures.get_mut(&h).map(|t| &mut t.image),
            AttachmentTarget::RenderBuffer(h) => self.render_buffers.get_mut(&h),
            AttachmentTarget::SwapChain(h) => self.swapchains.get_mut(&h).map(|s| &mut s.backbuffer),
        }
    }

    fn begin_pass(
        &mut self,
        target: &PassTarget,
        clear_color: Color,
        clear_depth_stencil: crate::types::DepthStencilClearValue,
    ) {
        self.stats.render_passes += 1;
        if !target.preserve_color {
            for color in &target.colors {
                let texel = clear_texel(color.format, clear_color);
                if let Some(image) = self.attachment_image(color.target) {
                    image.fill(color.layer, color.level, &texel);
                }
            }
        }
        if !target.preserve_depth_stencil {
            if let Some(ds) = target.depth_stencil {
                if let Some(image) = self.attachment_image(ds) {
                    let depth = (clear_depth_stencil.depth.clamp(0.0, 1.0) * 16_777_215.0) as u32;
                    let texel = (depth | (clear_depth_stencil.stencil << 24)).to_le_bytes();
                    let len = image.format.block_size() as usize;
                    image.fill(0, 0, &texel[..len.min(4)]);
                }
            }
        }
    }

    fn end_pass(&mut self, target: &PassTarget) {
        for color in &target.colors {
            let Some(resolve) = color.resolve else {
                continue;
            };
            let contents = self.attachment_image(color.target).and_then(|image| {
                image
                    .subresource(color.layer, color.level)
                    .cloned()
                    .map(|data| (data, image.level_size(color.level)))
            });
            if let (Some((data, size)), Some(texture)) = (contents, self.textures.get_mut(&resolve))
            {
                let stride = texture.image.format.bytes_per_line(size.width);
                if let Err(e) = texture.image.write(0, 0, Point::default(), size, &data, stride) {
                    log::warn!("NullBackend: resolve failed: {e}");
                }
            }
        }
    }

    fn copy_texture(
        &mut self,
        destination: NativeHandle,
        source: NativeHandle,
        region: &TextureCopyRegion,
    ) -> Result<(), RhiError> {
        let data = self
            .textures
            .get(&source)
            .and_then(|t| {
                t.image.read(
                    region.source_layer,
                    region.source_level,
                    region.source_origin,
                    region.size,
                )
            })
            .ok_or_else(|| RhiError::Internal("copy source out of range".into()))?;
        let texture = self
            .textures
            .get_mut(&destination)
            .ok_or_else(|| RhiError::Internal("unknown copy destination".into()))?;
        let stride = texture.image.format.bytes_per_line(region.size.width);
        texture.image.write(
            region.destination_layer,
            region.destination_level,
            region.destination_origin,
            region.size,
            &data,
            stride,
        )
    }

    fn read_back(&self, source: ReadbackSource) -> Vec<u8> {
        match source {
            ReadbackSource::Buffer {
                buffer,
                offset,
                size,
            } => self
                .buffers
                .get(&buffer)
                .and_then(|data| data.get(offset as usize..offset as usize + size as usize))
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            ReadbackSource::Texture {
                texture,
                layer,
                level,
            } => self
                .textures
                .get(&texture)
                .and_then(|t| t.image.subresource(layer, level).cloned())
                .unwrap_or_default(),
            ReadbackSource::SwapChain(swapchain) => self
                .swapchains
                .get(&swapchain)
                .and_then(|s| s.backbuffer.subresource(0, 0).cloned())
                .unwrap_or_default(),
        }
    }

    fn execute(&mut self, commands: &[Command]) -> Result<(), RhiError> {
        let mut current_pass: Option<&PassTarget> = None;
        for command in commands {
            match command {
                Command::BeginRenderPass {
                    target,
                    clear_color,
                    clear_depth_stencil,
                } => {
                    self.begin_pass(target, *clear_color, *clear_depth_stencil);
                    current_pass = Some(target);
                }
                Command::EndRenderPass => {
                    if let Some(target) = current_pass.take() {
                        self.end_pass(target);
                    }
                }
                Command::BeginComputePass | Command::EndComputePass => {}
                Command::Barrier(transitions) => {
                    self.stats.barriers += transitions.len() as u64;
                }
                Command::WriteBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    self.write_buffer(*buffer, *offset, data)?;
                }
                Command::UploadTexture {
                    texture,
                    layer,
                    level,
                    origin,
                    size,
                    stride,
                    data,
                    ..
                } => {
                    let target = self
                        .textures
                        .get_mut(texture)
                        .ok_or_else(|| RhiError::Internal("unknown upload texture".into()))?;
                    target
                        .image
                        .write(*layer, *level, *origin, *size, data, *stride)?;
                    self.stats.bytes_uploaded += data.len() as u64;
                }
                Command::CopyTexture {
                    destination,
                    source,
                    region,
                    ..
                } => self.copy_texture(*destination, *source, region)?,
                Command::ReadBack { ticket, source } => {
                    let data = self.read_back(*source);
                    self.readbacks.insert(*ticket, data);
                }
                Command::GenerateMips { texture } => {
                    if let Some(texture) = self.textures.get_mut(texture) {
                        texture.image.generate_mips();
                    }
                }
                Command::Draw { .. } | Command::DrawIndexed { .. } => self.stats.draw_calls += 1,
                Command::Dispatch { .. } => self.stats.dispatches += 1,
                Command::SetGraphicsPipeline(_)
                | Command::SetComputePipeline(_)
                | Command::SetShaderResources { .. }
                | Command::SetVertexInput { .. }
                | Command::SetViewport(_)
                | Command::SetScissor(_)
                | Command::SetBlendConstants(_)
                | Command::SetStencilRef(_)
                | Command::DebugMarkBegin(_)
                | Command::DebugMarkEnd
                | Command::DebugMarkMsg(_)
                | Command::BeginExternal
                | Command::EndExternal => {}
            }
        }
        Ok(())
    }
}

impl Backend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn name(&self) -> &'static str {
        "Null"
    }

    fn driver_info(&self) -> DriverInfo {
        DriverInfo {
            device_name: "Null Device".to_string(),
            device_id: 0,
            vendor_id: 0,
            device_type: DeviceType::Cpu,
        }
    }

    fn frames_in_flight(&self) -> u32 {
        self.params.frames_in_flight
    }

    fn is_feature_supported(&self, feature: Feature) -> bool {
        !self.params.disabled_features.contains(&feature)
    }

    fn resource_limit(&self, limit: ResourceLimit) -> u64 {
        match limit {
            ResourceLimit::TextureSizeMin => 1,
            ResourceLimit::TextureSizeMax => 16384,
            ResourceLimit::MaxColorAttachments => 8,
            ResourceLimit::FramesInFlight | ResourceLimit::MaxAsyncReadbackFrames => {
                u64::from(self.params.frames_in_flight)
            }
            ResourceLimit::MaxThreadGroupsPerDimension => 65535,
            ResourceLimit::MaxThreadsPerThreadGroup
            | ResourceLimit::MaxThreadGroupX
            | ResourceLimit::MaxThreadGroupY => 1024,
            ResourceLimit::MaxThreadGroupZ => 64,
            ResourceLimit::TextureArraySizeMax => 2048,
            ResourceLimit::MaxUniformBufferRange => 65536,
            ResourceLimit::MaxVertexInputs | ResourceLimit::MaxVertexOutputs => 16,
        }
    }

    fn is_texture_format_supported(&self, format: TextureFormat, _flags: TextureFlags) -> bool {
        let feature = if format.is_bc() {
            Feature::TextureCompressionBc
        } else if format.is_etc2() {
            Feature::TextureCompressionEtc2
        } else if format.is_astc() {
            Feature::TextureCompressionAstc
        } else {
            return true;
        };
        self.is_feature_supported(feature)
    }

    fn ubuf_alignment(&self) -> u32 {
        self.params.ubuf_alignment
    }

    fn is_y_up_in_framebuffer(&self) -> bool {
        false
    }

    fn is_y_up_in_ndc(&self) -> bool {
        false
    }

    fn is_clip_depth_zero_to_one(&self) -> bool {
        true
    }

    fn create_buffer(&mut self, descriptor: &BufferDescriptor) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        log::trace!(
            "NullBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let handle = self.allocate();
        self.buffers
            .insert(handle, vec![0; descriptor.size as usize]);
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), RhiError> {
        let memory = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::Internal(format!("unknown buffer {}", buffer.raw())))?;
        let start = offset as usize;
        let target = memory
            .get_mut(start..start + data.len())
            .ok_or_else(|| RhiError::InvalidParameter("write past end of buffer".into()))?;
        target.copy_from_slice(data);
        self.stats.bytes_uploaded += data.len() as u64;
        Ok(())
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        if !self.is_texture_format_supported(descriptor.format, descriptor.flags) {
            return Err(RhiError::FeatureNotSupported(format!(
                "texture format {:?}",
                descriptor.format
            )));
        }
        log::trace!(
            "NullBackend: creating texture {:?} ({}x{}, {:?})",
            descriptor.label,
            descriptor.pixel_size.width,
            descriptor.pixel_size.height,
            descriptor.format
        );
        let handle = self.allocate();
        let image = NullImage::new(
            descriptor.format,
            descriptor.pixel_size,
            descriptor.layer_count(),
            descriptor.mip_level_count(),
        );
        self.textures.insert(
            handle,
            NullTexture {
                image,
                native: NativeTexture {
                    object: handle.raw(),
                    layout: 0,
                },
            },
        );
        Ok(handle)
    }

    fn import_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        native: NativeTexture,
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        let handle = self.allocate();
        let image = NullImage::new(
            descriptor.format,
            descriptor.pixel_size,
            descriptor.layer_count(),
            descriptor.mip_level_count(),
        );
        self.textures.insert(handle, NullTexture { image, native });
        Ok(handle)
    }

    fn native_texture(&self, texture: NativeHandle) -> Option<NativeTexture> {
        self.textures.get(&texture).map(|t| t.native)
    }

    fn create_render_buffer(
        &mut self,
        descriptor: &RenderBufferDescriptor,
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        let handle = self.allocate();
        self.render_buffers.insert(
            handle,
            NullImage::new(descriptor.effective_format(), descriptor.pixel_size, 1, 1),
        );
        Ok(handle)
    }

    fn create_sampler(&mut self, descriptor: &SamplerDescriptor) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        log::trace!("NullBackend: creating sampler {:?}", descriptor.label);
        let handle = self.allocate();
        self.objects.insert(handle, NullObjectKind::Sampler);
        Ok(handle)
    }

    fn create_render_pass(&mut self, _format: &RenderPassFormat) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        let handle = self.allocate();
        self.objects.insert(handle, NullObjectKind::RenderPass);
        Ok(handle)
    }

    fn create_shader_resource_bindings(
        &mut self,
        layout: &[BindingLayoutEntry],
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        log::trace!("NullBackend: creating layout with {} bindings", layout.len());
        let handle = self.allocate();
        self.objects
            .insert(handle, NullObjectKind::ShaderResourceBindings);
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        descriptor: &GraphicsPipelineDescriptor,
        render_pass: NativeHandle,
        layout: NativeHandle,
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        for (handle, expected) in [
            (render_pass, NullObjectKind::RenderPass),
            (layout, NullObjectKind::ShaderResourceBindings),
        ] {
            if self.objects.get(&handle) != Some(&expected) {
                return Err(RhiError::Internal(format!(
                    "handle {} is not a {expected:?}",
                    handle.raw()
                )));
            }
        }
        log::trace!("NullBackend: creating graphics pipeline {:?}", descriptor.label);
        let handle = self.allocate();
        self.objects.insert(handle, NullObjectKind::GraphicsPipeline);
        self.pipelines_created += 1;
        Ok(handle)
    }

    fn create_compute_pipeline(
        &mut self,
        descriptor: &ComputePipelineDescriptor,
        layout: NativeHandle,
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        if self.objects.get(&layout) != Some(&NullObjectKind::ShaderResourceBindings) {
            return Err(RhiError::Internal(format!(
                "handle {} is not a layout",
                layout.raw()
            )));
        }
        log::trace!("NullBackend: creating compute pipeline {:?}", descriptor.label);
        let handle = self.allocate();
        self.objects.insert(handle, NullObjectKind::ComputePipeline);
        self.pipelines_created += 1;
        Ok(handle)
    }

    fn create_swapchain(
        &mut self,
        descriptor: &SwapChainNativeDescriptor,
    ) -> Result<NativeHandle, RhiError> {
        self.check_device()?;
        if descriptor.pixel_size.is_empty() {
            return Err(RhiError::InvalidParameter("empty swapchain surface".into()));
        }
        let handle = self.allocate();
        self.swapchains.insert(
            handle,
            NullSwapChain {
                format: descriptor.format,
                backbuffer: NullImage::new(descriptor.format, descriptor.pixel_size, 1, 1),
            },
        );
        Ok(handle)
    }

    fn resize_swapchain(&mut self, swapchain: NativeHandle, size: Size) -> Result<(), RhiError> {
        self.check_device()?;
        let chain = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| RhiError::Internal("unknown swapchain".into()))?;
        chain.backbuffer = NullImage::new(chain.format, size, 1, 1);
        Ok(())
    }

    fn release(&mut self, object: NativeObject) {
        let removed = match object {
            NativeObject::Buffer(h) => self.buffers.remove(&h).is_some(),
            NativeObject::Texture { handle, .. } => self.textures.remove(&handle).is_some(),
            NativeObject::RenderBuffer(h) => self.render_buffers.remove(&h).is_some(),
            NativeObject::SwapChain(h) => self.swapchains.remove(&h).is_some(),
            NativeObject::Sampler(h)
            | NativeObject::RenderPass(h)
            | NativeObject::ShaderResourceBindings(h)
            | NativeObject::GraphicsPipeline(h)
            | NativeObject::ComputePipeline(h) => self.objects.remove(&h).is_some(),
        };
        if !removed {
            log::warn!("NullBackend: release of unknown object {object:?}");
        }
    }

    fn begin_frame(
        &mut self,
        slot: usize,
        swapchain: Option<NativeHandle>,
    ) -> Result<(), FrameOpError> {
        if let Some(limit) = self.params.lose_device_after_frames {
            if self.frames_ended >= limit && !self.device_lost {
                log::error!("NullBackend: simulating device loss");
                self.device_lost = true;
            }
        }
        if self.device_lost {
            return Err(FrameOpError::DeviceLost);
        }
        if slot >= self.command_buffers.len() {
            return Err(FrameOpError::Error);
        }
        if let Some(handle) = swapchain {
            match self.swapchains.get(&handle) {
                Some(chain) if chain.backbuffer.size.is_empty() => {
                    return Err(FrameOpError::SwapChainOutOfDate)
                }
                Some(_) => {}
                None => return Err(FrameOpError::Error),
            }
        }
        Ok(())
    }

    fn submit(&mut self, _slot: usize, commands: &[Command]) -> Result<(), RhiError> {
        self.check_device()?;
        self.execute(commands)?;
        self.last_gpu_time = commands.len() as f64 * 1.0e-6;
        Ok(())
    }

    fn end_frame(
        &mut self,
        _slot: usize,
        swapchain: Option<NativeHandle>,
        present: bool,
    ) -> Result<(), FrameOpError> {
        if self.device_lost {
            return Err(FrameOpError::DeviceLost);
        }
        if present {
            if let Some(handle) = swapchain {
                log::trace!("NullBackend: present swapchain {}", handle.raw());
            }
        }
        self.frames_ended += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), RhiError> {
        self.check_device()
    }

    fn take_readback(&mut self, ticket: u64) -> Option<Vec<u8>> {
        self.readbacks.remove(&ticket)
    }

    fn native_command_buffer(&self, slot: usize) -> Option<NativeHandle> {
        self.command_buffers.get(slot).copied()
    }

    fn last_completed_gpu_time(&self) -> f64 {
        self.last_gpu_time
    }

    fn pipeline_cache_data(&self) -> Vec<u8> {
        if !self.is_feature_supported(Feature::PipelineCache) {
            return Vec::new();
        }
        let mut data = PIPELINE_CACHE_MAGIC.to_vec();
        data.extend_from_slice(&self.pipelines_created.to_le_bytes());
        data
    }

    fn set_pipeline_cache_data(&mut self, data: &[u8]) {
        let Some(count) = data
            .strip_prefix(PIPELINE_CACHE_MAGIC.as_slice())
            .and_then(|rest| rest.get(..8))
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
        else {
            log::debug!("NullBackend: ignoring foreign pipeline cache data");
            return;
        };
        self.pipelines_created = self.pipelines_created.max(count);
    }

    fn statistics(&self) -> BackendStatistics {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ColorAttachmentTarget;

    #[test]
    fn test_image_write_and_read_region() {
        let mut image = NullImage::new(TextureFormat::Rgba8, Size::new(4, 4), 1, 1);
        let pixels = [7u8; 2 * 2 * 4];
        image
            .write(0, 0, Point::new(2, 1), Size::new(2, 2), &pixels, 8)
            .unwrap();
        assert_eq!(image.read(0, 0, Point::new(2, 1), Size::new(2, 2)).unwrap(), pixels);
        assert_eq!(image.read(0, 0, Point::new(0, 0), Size::new(1, 1)).unwrap(), [0; 4]);
        assert!(image
            .write(0, 0, Point::new(3, 3), Size::new(2, 2), &pixels, 8)
            .is_err());
    }

    #[test]
    fn test_generate_mips_averages() {
        let mut image = NullImage::new(TextureFormat::R8, Size::new(2, 2), 1, 2);
        image
            .write(0, 0, Point::default(), Size::new(2, 2), &[0, 100, 200, 100], 2)
            .unwrap();
        image.generate_mips();
        assert_eq!(image.subresource(0, 1).unwrap(), &vec![100]);
    }

    #[test]
    fn test_clear_texel_formats() {
        let red = Color::new(1.0, 0.0, 0.0, 1.0);
        assert_eq!(clear_texel(TextureFormat::Rgba8, red), vec![255, 0, 0, 255]);
        assert_eq!(clear_texel(TextureFormat::Bgra8, red), vec![0, 0, 255, 255]);
        assert_eq!(clear_texel(TextureFormat::D32F, red).len(), 4);
    }

    #[test]
    fn test_render_pass_clears_and_reads_back() {
        let mut backend = NullBackend::new(NullInitParams::default());
        let texture = backend
            .create_texture(&TextureDescriptor::new_2d(
                2,
                2,
                TextureFormat::Rgba8,
                TextureFlags::RENDER_TARGET,
            ))
            .unwrap();
        let target = PassTarget {
            render_pass: None,
            colors: vec![ColorAttachmentTarget {
                target: AttachmentTarget::Texture(texture),
                format: TextureFormat::Rgba8,
                layer: 0,
                level: 0,
                resolve: None,
            }],
            depth_stencil: None,
            pixel_size: Size::new(2, 2),
            preserve_color: false,
            preserve_depth_stencil: false,
        };
        let commands = vec![
            Command::BeginRenderPass {
                target,
                clear_color: Color::new(0.0, 1.0, 0.0, 1.0),
                clear_depth_stencil: Default::default(),
            },
            Command::EndRenderPass,
            Command::ReadBack {
                ticket: 9,
                source: ReadbackSource::Texture {
                    texture,
                    layer: 0,
                    level: 0,
                },
            },
        ];
        backend.begin_frame(0, None).unwrap();
        backend.submit(0, &commands).unwrap();
        backend.end_frame(0, None, false).unwrap();

        let data = backend.take_readback(9).unwrap();
        assert_eq!(data.len(), 16);
        assert!(data.chunks(4).all(|p| p == [0, 255, 0, 255]));
        assert!(backend.take_readback(9).is_none());
        assert_eq!(backend.statistics().render_passes, 1);
    }

    #[test]
    fn test_device_loss_after_frames() {
        let mut backend =
            NullBackend::new(NullInitParams::default().with_lose_device_after_frames(1));
        backend.begin_frame(0, None).unwrap();
        backend.end_frame(0, None, false).unwrap();
        assert_eq!(backend.begin_frame(1, None), Err(FrameOpError::DeviceLost));
        assert_eq!(backend.wait_idle(), Err(RhiError::DeviceLost));
    }

    #[test]
    fn test_release_removes_objects() {
        let mut backend = NullBackend::new(NullInitParams::default());
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(
                crate::types::BufferType::Static,
                crate::types::BufferUsage::VERTEX,
                64,
            ))
            .unwrap();
        assert_eq!(backend.live_object_count(), 1);
        backend.release(NativeObject::Buffer(buffer));
        assert_eq!(backend.live_object_count(), 0);
    }

    #[test]
    fn test_pipeline_cache_round_trip() {
        let mut backend = NullBackend::new(NullInitParams::default());
        backend.set_pipeline_cache_data(b"garbage");
        let mut data = PIPELINE_CACHE_MAGIC.to_vec();
        data.extend_from_slice(&5u64.to_le_bytes());
        backend.set_pipeline_cache_data(&data);
        assert_eq!(backend.pipeline_cache_data(), data);
    }
}
