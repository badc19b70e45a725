//! # RedLilium RHI
//!
//! Rendering hardware interface: one object and command model over several
//! native graphics APIs.
//!
//! ## Overview
//!
//! - [`Rhi`] - the context. Selects a backend, creates resources, runs frames
//! - [`resources`] - buffers, textures, samplers, pipelines, render targets, swapchains
//! - [`ResourceUpdateBatch`] - uploads, copies and readbacks applied by a command buffer
//! - [`CommandBuffer`] - render and compute pass recording
//! - [`Backend`] - trait implemented by native backends, with a built-in
//!   in-memory [`NullBackend`](backend::NullBackend)
//!
//! ## Example
//!
//! ```
//! use redlilium_rhi::{
//!     BackendKind, BeginFrameFlags, EndFrameFlags, InitParams, Rhi, RhiFlags, RhiResource,
//! };
//! use redlilium_rhi::types::{BufferDescriptor, BufferType, BufferUsage};
//!
//! let rhi = Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap();
//! let buffer = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 256));
//! buffer.create().unwrap();
//!
//! let cb = rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
//! let mut batch = rhi.next_resource_update_batch().unwrap();
//! batch.update_dynamic_buffer(&buffer, 0, &[0u8; 64]);
//! cb.resource_update(batch);
//! rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
//! ```

pub mod backend;
pub mod command;
pub mod error;
pub mod profiling;
pub mod resource;
pub mod resources;
mod rhi;
pub mod tracker;
pub mod types;
pub mod update_batch;

pub use backend::{
    Backend, BackendKind, BackendStatistics, DeviceType, DriverInfo, Feature, InitParams,
    NativeBuffer, NativeHandle, NativeTexture, ResourceLimit,
};
#[cfg(feature = "null-backend")]
pub use backend::{NullBackend, NullInitParams};
pub use command::{BeginPassFlags, CommandBuffer};
pub use error::{FrameOpError, FrameOpResult, RhiError};
pub use resource::{ResourceId, ResourceType, RhiResource};
pub use resources::{
    Binding, BindingKind, Buffer, ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline,
    GraphicsPipelineDescriptor, RenderBuffer, RenderPassDescriptor, RenderPassFormat,
    RenderTarget, Sampler, ShaderResourceBindings, SurfaceTarget, SwapChain, SwapChainFlags,
    Texture, TextureRenderTarget,
};
pub use rhi::{BeginFrameFlags, EndFrameFlags, Rhi, RhiFlags, RhiStatistics};
pub use tracker::{BufferAccess, PassResourceTracker, PipelineStage, TextureAccess};
pub use update_batch::{
    MAX_UPDATE_BATCHES, ReadbackData, ReadbackDescription, ReadbackResult, ResourceUpdateBatch,
    TextureCopyDescription, TextureUploadDescription,
};

/// RHI library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_types_are_thread_safe() {
        static_assertions::assert_impl_all!(Rhi: Send, Sync, Clone);
        static_assertions::assert_impl_all!(ResourceUpdateBatch: Send);
        static_assertions::assert_impl_all!(ReadbackResult: Send, Sync, Clone);
    }
}
