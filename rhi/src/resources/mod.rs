//! GPU resources.
//!
//! Every resource is created through a factory on [`Rhi`](crate::Rhi),
//! configured with setters and built with
//! [`RhiResource::create`](crate::resource::RhiResource::create). Calling
//! `create()` again rebuilds the native objects from the current settings.

mod bindings;
mod buffer;
mod pipeline;
mod render_buffer;
mod render_pass;
mod render_target;
mod sampler;
mod swapchain;
mod texture;

pub use bindings::{
    Binding, BindingKind, BindingLayoutEntry, BindingResource, ShaderResourceBindings,
};
pub(crate) use bindings::SrbSnapshot;
pub use buffer::Buffer;
pub use pipeline::{
    ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline, GraphicsPipelineDescriptor,
};
pub use render_buffer::RenderBuffer;
pub use render_pass::{AttachmentFormat, RenderPassDescriptor, RenderPassFormat};
pub use render_target::{
    AttachmentSource, ColorAttachment, RenderTarget, SwapChainRenderTarget, TextureRenderTarget,
    TextureRenderTargetDescription, TextureRenderTargetFlags,
};
pub use sampler::Sampler;
pub use swapchain::{SurfaceTarget, SwapChain, SwapChainFlags};
pub use texture::Texture;
