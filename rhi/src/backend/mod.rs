//! Native backend abstraction layer.
//!
//! The RHI core owns exactly one [`Backend`] per context and dispatches every
//! native operation to it. Backends deal only in opaque [`NativeHandle`]s and
//! in the [`Command`] log recorded by command buffers. Object lifetime,
//! validation, resource tracking and deferred release stay in the core.
//!
//! # Available Backends
//!
//! - `null-backend` (default): in-memory simulation for tests and tooling
//!
//! Native backends (Vulkan, Metal, Direct3D, OpenGL ES) plug in through
//! [`Rhi::with_backend`](crate::Rhi::with_backend).

pub(crate) mod deferred;

#[cfg(feature = "null-backend")]
pub mod null;

use std::num::NonZeroU64;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command::Command;
use crate::error::{FrameOpError, RhiError};
use crate::resources::{
    BindingLayoutEntry, ComputePipelineDescriptor, GraphicsPipelineDescriptor, RenderPassFormat,
    SwapChainFlags,
};
use crate::types::{
    BufferDescriptor, RenderBufferDescriptor, SamplerDescriptor, Size, TextureDescriptor,
    TextureFlags, TextureFormat,
};

#[cfg(feature = "null-backend")]
pub use null::{NullBackend, NullInitParams};

/// Opaque handle to a native object owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(NonZeroU64);

impl NativeHandle {
    /// Wrap a raw value. Returns `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn raw(&self) -> u64 {
        self.0.get()
    }
}

/// Native objects queued for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeObject {
    Buffer(NativeHandle),
    /// A texture. `owned` is false for textures imported with `create_from`.
    Texture { handle: NativeHandle, owned: bool },
    RenderBuffer(NativeHandle),
    Sampler(NativeHandle),
    RenderPass(NativeHandle),
    ShaderResourceBindings(NativeHandle),
    GraphicsPipeline(NativeHandle),
    ComputePipeline(NativeHandle),
    SwapChain(NativeHandle),
}

/// Native texture object exchanged with other graphics code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTexture {
    /// `VkImage`, `ID3D11Texture2D*`, `MTLTexture`, GL texture name...
    pub object: u64,
    /// Current image layout, where the API has one.
    pub layout: i32,
}

/// Native buffer objects. Dynamic buffers have one object per frame slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NativeBuffer {
    pub objects: Vec<u64>,
}

/// Selectable backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BackendKind {
    Null = 0,
    Vulkan = 1,
    OpenGLES2 = 2,
    D3D11 = 3,
    D3D12 = 4,
    Metal = 5,
}

/// Optional backend features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    MultisampleTexture,
    MultisampleRenderBuffer,
    DebugMarkers,
    Timestamps,
    Instancing,
    CustomInstanceStepRate,
    PrimitiveRestart,
    NonDynamicUniformBuffers,
    NonFourAlignedEffectiveIndexBufferOffset,
    NpotTextureRepeat,
    ElementIndexUint,
    Compute,
    WideLines,
    VertexShaderPointSize,
    BaseVertex,
    BaseInstance,
    TriangleFanTopology,
    ReadBackNonUniformBuffer,
    ReadBackNonBaseMipLevel,
    TexelFetch,
    RenderToNonBaseMipLevel,
    IntAttributes,
    ScreenSpaceDerivatives,
    ReadBackAnyTextureFormat,
    PipelineCache,
    TextureCompressionBc,
    TextureCompressionEtc2,
    TextureCompressionAstc,
    ThreeDimensionalTextures,
    RenderTo3DTextureSlice,
    TextureArrays,
    Tessellation,
    GeometryShader,
    NonFillPolygonMode,
    OneDimensionalTextures,
}

/// Queryable implementation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLimit {
    TextureSizeMin,
    TextureSizeMax,
    MaxColorAttachments,
    FramesInFlight,
    /// Number of frames after which an asynchronous readback is guaranteed to complete.
    MaxAsyncReadbackFrames,
    MaxThreadGroupsPerDimension,
    MaxThreadsPerThreadGroup,
    MaxThreadGroupX,
    MaxThreadGroupY,
    MaxThreadGroupZ,
    TextureArraySizeMax,
    MaxUniformBufferRange,
    MaxVertexInputs,
    MaxVertexOutputs,
}

/// Physical device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Integrated,
    Discrete,
    External,
    Virtual,
    Cpu,
}

/// Information about the device the backend runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DriverInfo {
    pub device_name: String,
    pub device_id: u64,
    pub vendor_id: u64,
    pub device_type: DeviceType,
}

/// Counters a backend may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendStatistics {
    pub draw_calls: u64,
    pub dispatches: u64,
    pub render_passes: u64,
    pub barriers: u64,
    pub bytes_uploaded: u64,
}

/// Parameters for creating a native swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapChainNativeDescriptor {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    pub pixel_size: Size,
    pub format: TextureFormat,
    pub sample_count: u32,
    pub flags: SwapChainFlags,
}

/// Per-backend initialization parameters.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum InitParams {
    #[cfg(feature = "null-backend")]
    Null(NullInitParams),
}

#[cfg(feature = "null-backend")]
impl Default for InitParams {
    fn default() -> Self {
        Self::Null(NullInitParams::default())
    }
}

/// Trait implemented by every native backend.
///
/// All methods are called with the context's backend lock held. Backends never
/// call back into the core.
pub trait Backend: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Human readable backend name.
    fn name(&self) -> &'static str;

    fn driver_info(&self) -> DriverInfo;

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    fn frames_in_flight(&self) -> u32;

    fn max_async_readback_frames(&self) -> u32 {
        self.frames_in_flight()
    }

    fn is_feature_supported(&self, feature: Feature) -> bool;

    fn resource_limit(&self, limit: ResourceLimit) -> u64;

    fn is_texture_format_supported(&self, format: TextureFormat, flags: TextureFlags) -> bool;

    /// Minimum alignment of uniform buffer offsets.
    fn ubuf_alignment(&self) -> u32;

    fn is_y_up_in_framebuffer(&self) -> bool;

    fn is_y_up_in_ndc(&self) -> bool;

    fn is_clip_depth_zero_to_one(&self) -> bool;

    // ------------------------------------------------------------------
    // Native objects
    // ------------------------------------------------------------------

    /// Create one native buffer. Called once per frame slot for dynamic buffers.
    fn create_buffer(&mut self, descriptor: &BufferDescriptor) -> Result<NativeHandle, RhiError>;

    /// Write host-visible buffer memory. Only used for dynamic buffers.
    fn write_buffer(
        &mut self,
        buffer: NativeHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), RhiError>;

    fn create_texture(&mut self, descriptor: &TextureDescriptor)
    -> Result<NativeHandle, RhiError>;

    /// Wrap an existing native texture without taking ownership.
    fn import_texture(
        &mut self,
        descriptor: &TextureDescriptor,
        native: NativeTexture,
    ) -> Result<NativeHandle, RhiError>;

    fn native_texture(&self, texture: NativeHandle) -> Option<NativeTexture>;

    fn create_render_buffer(
        &mut self,
        descriptor: &RenderBufferDescriptor,
    ) -> Result<NativeHandle, RhiError>;

    fn create_sampler(&mut self, descriptor: &SamplerDescriptor)
    -> Result<NativeHandle, RhiError>;

    fn create_render_pass(&mut self, format: &RenderPassFormat) -> Result<NativeHandle, RhiError>;

    fn create_shader_resource_bindings(
        &mut self,
        layout: &[BindingLayoutEntry],
    ) -> Result<NativeHandle, RhiError>;

    fn create_graphics_pipeline(
        &mut self,
        descriptor: &GraphicsPipelineDescriptor,
        render_pass: NativeHandle,
        layout: NativeHandle,
    ) -> Result<NativeHandle, RhiError>;

    fn create_compute_pipeline(
        &mut self,
        descriptor: &ComputePipelineDescriptor,
        layout: NativeHandle,
    ) -> Result<NativeHandle, RhiError>;

    fn create_swapchain(
        &mut self,
        descriptor: &SwapChainNativeDescriptor,
    ) -> Result<NativeHandle, RhiError>;

    fn resize_swapchain(&mut self, swapchain: NativeHandle, size: Size) -> Result<(), RhiError>;

    /// Release a native object. The core guarantees the GPU no longer uses it.
    fn release(&mut self, object: NativeObject);

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Wait for the frame slot to become free and acquire the next swapchain image.
    fn begin_frame(
        &mut self,
        slot: usize,
        swapchain: Option<NativeHandle>,
    ) -> Result<(), FrameOpError>;

    /// Translate and submit the recorded commands of one command buffer.
    fn submit(&mut self, slot: usize, commands: &[Command]) -> Result<(), RhiError>;

    /// Finish the frame slot, presenting when `present` is set.
    fn end_frame(
        &mut self,
        slot: usize,
        swapchain: Option<NativeHandle>,
        present: bool,
    ) -> Result<(), FrameOpError>;

    /// Block until all submitted work has completed.
    fn wait_idle(&mut self) -> Result<(), RhiError>;

    /// Fetch the bytes of a completed readback. Called once per ticket.
    fn take_readback(&mut self, ticket: u64) -> Option<Vec<u8>>;

    fn native_command_buffer(&self, slot: usize) -> Option<NativeHandle>;

    /// GPU time of the last completed submission in seconds, 0 when unknown.
    fn last_completed_gpu_time(&self) -> f64 {
        0.0
    }

    fn pipeline_cache_data(&self) -> Vec<u8> {
        Vec::new()
    }

    fn set_pipeline_cache_data(&mut self, data: &[u8]) {
        let _ = data;
    }

    fn statistics(&self) -> BackendStatistics {
        BackendStatistics::default()
    }
}

/// Create the backend for `kind`.
pub(crate) fn create_backend(
    kind: BackendKind,
    params: InitParams,
) -> Result<Box<dyn Backend>, RhiError> {
    match (kind, params) {
        #[cfg(feature = "null-backend")]
        (BackendKind::Null, InitParams::Null(params)) => {
            log::info!("Using Null backend");
            Ok(Box::new(NullBackend::new(params)))
        }
        (kind, _) => {
            log::warn!("Backend {:?} is not available in this build", kind);
            Err(RhiError::BackendUnavailable(kind))
        }
    }
}
