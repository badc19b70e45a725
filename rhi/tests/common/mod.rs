//! Shared setup for RHI integration tests.
//!
//! Everything runs on the null backend, which executes command logs in host
//! memory, so rendering results can be checked through readbacks.

#![allow(dead_code)]

use std::sync::Arc;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};
use redlilium_rhi::resources::{
    AttachmentFormat, ColorAttachment, TextureRenderTargetDescription, TextureRenderTargetFlags,
};
use redlilium_rhi::types::{
    BufferDescriptor, BufferType, BufferUsage, GraphicsPipelineFlags, Shader, ShaderCode,
    ShaderKey, ShaderSource, ShaderStage, ShaderVersion, Size, TextureDescriptor, TextureFlags,
    TextureFormat,
};
use redlilium_rhi::{
    BackendKind, BeginFrameFlags, Binding, Buffer, EndFrameFlags, Feature, GraphicsPipeline,
    GraphicsPipelineDescriptor, InitParams, NullInitParams, RenderPassDescriptor,
    RenderPassFormat, Rhi, RhiFlags, RhiResource, ShaderResourceBindings, SurfaceTarget,
    SwapChain, SwapChainFlags, Texture, TextureRenderTarget,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn null_rhi() -> Rhi {
    null_rhi_with(NullInitParams::default(), RhiFlags::empty())
}

pub fn null_rhi_with(params: NullInitParams, flags: RhiFlags) -> Rhi {
    init_logging();
    Rhi::create(BackendKind::Null, InitParams::Null(params), flags).expect("null backend")
}

/// Null backend with one feature turned off.
pub fn null_rhi_without(feature: Feature) -> Rhi {
    null_rhi_with(
        NullInitParams::default().with_disabled_feature(feature),
        RhiFlags::empty(),
    )
}

pub fn warnings(rhi: &Rhi) -> u64 {
    rhi.statistics().validation_warnings
}

pub fn shader(stage: ShaderStage) -> Shader {
    Shader::new(stage).with_code(
        ShaderKey::new(ShaderSource::SpirV, ShaderVersion::new(100)),
        ShaderCode::new(vec![0x03, 0x02, 0x23, 0x07]),
    )
}

pub fn surface(width: u32, height: u32) -> Arc<SurfaceTarget> {
    // SAFETY: the null backend never dereferences window handles.
    unsafe {
        SurfaceTarget::from_raw(
            RawWindowHandle::Web(WebWindowHandle::new(1)),
            RawDisplayHandle::Web(WebDisplayHandle::new()),
            Size::new(width, height),
        )
    }
}

/// A created swapchain on a fake surface.
pub fn swapchain(rhi: &Rhi, size: u32, flags: SwapChainFlags) -> (Arc<SwapChain>, Arc<SurfaceTarget>) {
    let window = surface(size, size);
    let sc = rhi.new_swapchain();
    sc.set_window(&window);
    sc.set_flags(flags);
    let rp = sc
        .new_compatible_render_pass_descriptor()
        .expect("render pass descriptor");
    rp.create().expect("render pass");
    sc.set_render_pass_descriptor(&rp);
    sc.create_or_resize().expect("swapchain");
    (sc, window)
}

pub fn run_swapchain_frame(rhi: &Rhi, sc: &Arc<SwapChain>) {
    rhi.begin_frame(sc, BeginFrameFlags::empty()).expect("begin_frame");
    rhi.end_frame(sc, EndFrameFlags::empty()).expect("end_frame");
}

/// Color texture with a texture render target and a compatible render pass.
pub struct OffscreenTarget {
    pub texture: Arc<Texture>,
    pub render_target: Arc<TextureRenderTarget>,
    pub render_pass: Arc<RenderPassDescriptor>,
}

pub fn offscreen_target(rhi: &Rhi, size: u32) -> OffscreenTarget {
    let texture = rhi.new_texture(TextureDescriptor::new_2d(
        size,
        size,
        TextureFormat::Rgba8,
        TextureFlags::RENDER_TARGET | TextureFlags::USED_AS_TRANSFER_SOURCE,
    ));
    texture.create().expect("texture");
    let render_target = rhi.new_texture_render_target(
        TextureRenderTargetDescription::new(vec![ColorAttachment::texture(&texture)]),
        TextureRenderTargetFlags::empty(),
    );
    let render_pass = render_target
        .new_compatible_render_pass_descriptor()
        .expect("render pass descriptor");
    render_pass.create().expect("render pass");
    render_target.set_render_pass_descriptor(&render_pass);
    render_target.create().expect("render target");
    OffscreenTarget {
        texture,
        render_target,
        render_pass,
    }
}

/// Render pass descriptor with one RGBA8 attachment and no depth.
pub fn rgba8_render_pass(rhi: &Rhi) -> Arc<RenderPassDescriptor> {
    let rp = rhi.new_render_pass_descriptor(RenderPassFormat {
        colors: vec![AttachmentFormat::new(TextureFormat::Rgba8, 1)],
        depth_stencil: None,
        has_resolve: false,
    });
    rp.create().expect("render pass");
    rp
}

pub fn srb(rhi: &Rhi, bindings: Vec<Binding>) -> Arc<ShaderResourceBindings> {
    let srb = rhi.new_shader_resource_bindings();
    srb.set_bindings(bindings);
    srb.create().expect("shader resource bindings");
    srb
}

pub fn graphics_pipeline(
    rhi: &Rhi,
    render_pass: &Arc<RenderPassDescriptor>,
    srb: &Arc<ShaderResourceBindings>,
    flags: GraphicsPipelineFlags,
) -> Arc<GraphicsPipeline> {
    let pipeline = rhi.new_graphics_pipeline(
        GraphicsPipelineDescriptor::new(vec![
            shader(ShaderStage::Vertex),
            shader(ShaderStage::Fragment),
        ])
        .with_flags(flags),
    );
    pipeline.set_render_pass_descriptor(render_pass);
    pipeline.set_shader_resource_bindings(srb);
    pipeline.create().expect("graphics pipeline");
    pipeline
}

pub fn buffer(rhi: &Rhi, buffer_type: BufferType, usage: BufferUsage, size: u32) -> Arc<Buffer> {
    let buffer = rhi.new_buffer(BufferDescriptor::new(buffer_type, usage, size));
    buffer.create().expect("buffer");
    buffer
}
