//! Recorded command log consumed by backends.
//!
//! Command buffers never call into the backend while recording. Every
//! operation is validated, resolved to native handles and appended here, and
//! the whole log is handed to [`Backend::submit`](crate::backend::Backend::submit)
//! when the frame ends.

use crate::backend::NativeHandle;
use crate::resource::ResourceId;
use crate::tracker::{PipelineStage, ResourceAccess};
use crate::types::{
    Color, DepthStencilClearValue, IndexFormat, Point, Scissor, Size, TextureFormat, Viewport,
};

/// Native object rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentTarget {
    Texture(NativeHandle),
    RenderBuffer(NativeHandle),
    /// The current backbuffer of a swapchain.
    SwapChain(NativeHandle),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColorAttachmentTarget {
    pub target: AttachmentTarget,
    pub format: TextureFormat,
    pub layer: u32,
    pub level: u32,
    pub resolve: Option<NativeHandle>,
}

/// Attachments of a render pass instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassTarget {
    pub render_pass: Option<NativeHandle>,
    pub colors: Vec<ColorAttachmentTarget>,
    pub depth_stencil: Option<AttachmentTarget>,
    pub pixel_size: Size,
    pub preserve_color: bool,
    pub preserve_depth_stencil: bool,
}

/// Resolved resource of one shader binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeBindingResource {
    Buffer {
        buffer: NativeHandle,
        offset: u32,
        size: u32,
    },
    SampledTextures(Vec<(NativeHandle, NativeHandle)>),
    Textures(Vec<NativeHandle>),
    Samplers(Vec<NativeHandle>),
    Image {
        texture: NativeHandle,
        level: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeBinding {
    pub binding: u32,
    pub resource: NativeBindingResource,
}

/// Where a readback takes its bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadbackSource {
    Buffer {
        buffer: NativeHandle,
        offset: u32,
        size: u32,
    },
    Texture {
        texture: NativeHandle,
        layer: u32,
        level: u32,
    },
    SwapChain(NativeHandle),
}

/// Region of a texture-to-texture copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureCopyRegion {
    pub source_layer: u32,
    pub source_level: u32,
    pub source_origin: Point,
    pub destination_layer: u32,
    pub destination_level: u32,
    pub destination_origin: Point,
    pub size: Size,
}

/// Object a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionTarget {
    Buffer(NativeHandle),
    Texture(NativeHandle),
}

/// Usage transition produced by the pass resource tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    pub resource: ResourceId,
    pub target: TransitionTarget,
    /// Access before the pass, `None` when the resource was never used.
    pub from: Option<ResourceAccess>,
    pub to: ResourceAccess,
    /// Earliest stage the pass touches the resource in.
    pub stage: PipelineStage,
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        target: PassTarget,
        clear_color: Color,
        clear_depth_stencil: DepthStencilClearValue,
    },
    EndRenderPass,
    BeginComputePass,
    EndComputePass,
    /// Inserted in front of the pass it belongs to once the pass has ended.
    Barrier(Vec<Transition>),

    WriteBuffer {
        buffer: NativeHandle,
        offset: u32,
        data: Vec<u8>,
    },
    UploadTexture {
        texture: NativeHandle,
        format: TextureFormat,
        layer: u32,
        level: u32,
        origin: Point,
        size: Size,
        /// Bytes per row of `data`.
        stride: u32,
        data: Vec<u8>,
    },
    CopyTexture {
        destination: NativeHandle,
        source: NativeHandle,
        format: TextureFormat,
        region: TextureCopyRegion,
    },
    ReadBack {
        ticket: u64,
        source: ReadbackSource,
    },
    GenerateMips {
        texture: NativeHandle,
    },

    SetGraphicsPipeline(NativeHandle),
    SetComputePipeline(NativeHandle),
    SetShaderResources {
        layout: NativeHandle,
        bindings: Vec<NativeBinding>,
        /// `(binding, offset)` pairs.
        dynamic_offsets: Vec<(u32, u32)>,
    },
    SetVertexInput {
        start_binding: u32,
        buffers: Vec<(NativeHandle, u32)>,
        index: Option<(NativeHandle, u32, IndexFormat)>,
    },
    SetViewport(Viewport),
    SetScissor(Scissor),
    SetBlendConstants(Color),
    SetStencilRef(u32),

    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },

    DebugMarkBegin(String),
    DebugMarkEnd,
    DebugMarkMsg(String),

    BeginExternal,
    EndExternal,
}
