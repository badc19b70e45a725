//! Common types and descriptors for RHI resources.
//!
//! This module contains format enums, usage flags, fixed-function state and
//! descriptor structs used throughout the RHI.

mod buffer;
mod common;
mod pipeline;
mod sampler;
mod shader;
mod texture;

pub use buffer::{BufferDescriptor, BufferType, BufferUsage, IndexFormat};
pub use common::{Color, DepthStencilClearValue, Point, Scissor, Size, Viewport};
pub use pipeline::{
    BlendFactor, BlendOp, ColorMask, CompareOp, CullMode, DepthStencilState, FrontFace,
    GraphicsPipelineFlags, PolygonMode, StencilOp, StencilOpState, TargetBlend, Topology,
    VertexClassification, VertexFormat, VertexInputAttribute, VertexInputBinding,
    VertexInputLayout,
};
pub use sampler::{AddressMode, Filter, SamplerDescriptor};
pub use shader::{
    InOutVariable, Shader, ShaderCode, ShaderDescription, ShaderKey, ShaderResourceVariable,
    ShaderSource, ShaderStage, ShaderStageFlags, ShaderVariant, ShaderVersion,
};
pub use texture::{
    RenderBufferDescriptor, RenderBufferFlags, RenderBufferType, TextureDescriptor, TextureFlags,
    TextureFormat, mip_levels_for_size, size_for_mip_level,
};
