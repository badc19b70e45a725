//! Command buffers and pass recording.
//!
//! A [`CommandBuffer`] records one frame. Outside of passes it accepts
//! resource updates; inside a render or compute pass it accepts state changes,
//! draws and dispatches. Every call is validated immediately: invalid calls
//! log a warning and are skipped, so a recorded frame always submits.
//!
//! Resources used by a pass go through a [`PassResourceTracker`]. When the pass
//! ends its usage transitions are inserted in front of the pass as a
//! [`Command::Barrier`].

mod recorded;

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

pub use recorded::{
    AttachmentTarget, ColorAttachmentTarget, Command, NativeBinding, NativeBindingResource,
    PassTarget, ReadbackSource, TextureCopyRegion, Transition, TransitionTarget,
};

use crate::backend::{Feature, NativeHandle, ResourceLimit};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceId, ResourceType, RhiResource};
use crate::resources::{
    BindingKind, BindingResource, Buffer, ComputePipeline, GraphicsPipeline,
    RenderPassDescriptor, RenderTarget, ShaderResourceBindings, SrbSnapshot, SwapChain,
    SwapChainFlags, Texture,
};
use crate::rhi::{RhiFlags, RhiShared};
use crate::tracker::{BufferAccess, PassResourceTracker, PipelineStage, TextureAccess};
use crate::types::{
    BufferUsage, Color, DepthStencilClearValue, GraphicsPipelineFlags, IndexFormat, Scissor,
    ShaderStageFlags, Viewport,
};
use crate::update_batch::{ReadbackData, ResourceUpdateBatch, UpdateOp};

bitflags! {
    /// Flags for `begin_pass` and `begin_compute_pass`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BeginPassFlags: u32 {
        /// The pass will contain `begin_external`/`end_external` blocks.
        const EXTERNAL_CONTENT = 1 << 0;
        /// Skip usage tracking in a compute pass. The application is then
        /// responsible for hazards between dispatches.
        const DO_NOT_TRACK_RESOURCES_FOR_COMPUTE = 1 << 1;
    }
}

#[derive(Clone)]
struct Recording {
    frame: u64,
    slot: usize,
    swapchain: Option<Weak<SwapChain>>,
}

struct RenderPassState {
    begin_index: usize,
    render_pass: Arc<RenderPassDescriptor>,
    flags: BeginPassFlags,
}

struct ComputePassState {
    begin_index: usize,
    flags: BeginPassFlags,
}

#[derive(Default)]
enum PassState {
    #[default]
    Idle,
    Render(RenderPassState),
    Compute(ComputePassState),
}

struct BoundGraphicsPipeline {
    key: (ResourceId, u32),
    flags: GraphicsPipelineFlags,
    layout_description: Vec<u32>,
    bindings: Arc<ShaderResourceBindings>,
}

struct BoundComputePipeline {
    key: (ResourceId, u32),
    layout_description: Vec<u32>,
    bindings: Arc<ShaderResourceBindings>,
}

/// State bound inside the current pass, used to skip redundant calls.
#[derive(Default)]
struct BoundState {
    graphics: Option<BoundGraphicsPipeline>,
    compute: Option<BoundComputePipeline>,
    srb: Option<(ResourceId, u32, Vec<(u32, u32)>)>,
    vertex_input: Option<Command>,
    index_bound: bool,
}

#[derive(Default)]
struct CommandBufferState {
    recording: Option<Recording>,
    commands: Vec<Command>,
    pass: PassState,
    tracker: PassResourceTracker,
    bound: BoundState,
    external: bool,
}

/// Per-call context shared by the recording helpers.
struct Ctx<'a> {
    shared: &'a RhiShared,
    frame: u64,
    slot: usize,
    swapchain: Option<&'a Arc<SwapChain>>,
}

impl Ctx<'_> {
    fn warn(&self, args: std::fmt::Arguments<'_>) {
        self.shared.validation_warning(args);
    }

    fn feature(&self, feature: Feature) -> bool {
        self.shared.is_feature_supported(feature)
    }
}

/// Records the commands of one frame.
///
/// Obtained from [`SwapChain::current_frame_command_buffer`] or
/// [`Rhi::begin_offscreen_frame`](crate::Rhi::begin_offscreen_frame). Only
/// valid between the begin and end of that frame.
pub struct CommandBuffer {
    core: ResourceCore,
    state: Mutex<CommandBufferState>,
}

impl CommandBuffer {
    pub(crate) fn new(shared: &Arc<RhiShared>) -> Self {
        Self {
            core: ResourceCore::new(shared, None),
            state: Mutex::new(CommandBufferState::default()),
        }
    }

    pub(crate) fn begin_recording(
        &self,
        frame: u64,
        slot: usize,
        swapchain: Option<&Arc<SwapChain>>,
    ) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.pass = PassState::Idle;
        state.tracker.reset();
        state.bound = BoundState::default();
        state.external = false;
        state.recording = Some(Recording {
            frame,
            slot,
            swapchain: swapchain.map(Arc::downgrade),
        });
        self.core.mark_used(frame);
    }

    /// Stop recording and hand out the command log. A pass left open is
    /// closed with a warning.
    pub(crate) fn end_recording(&self) -> Vec<Command> {
        let mut state = self.state.lock();
        let Some(recording) = state.recording.clone() else {
            return Vec::new();
        };
        if let Some(shared) = self.core.shared() {
            let swapchain = recording.swapchain.as_ref().and_then(Weak::upgrade);
            let ctx = Ctx {
                shared: &shared,
                frame: recording.frame,
                slot: recording.slot,
                swapchain: swapchain.as_ref(),
            };
            match state.pass {
                PassState::Idle => {}
                PassState::Render(_) => {
                    ctx.warn(format_args!("frame ended inside a render pass"));
                    state.close_pass(&ctx);
                }
                PassState::Compute(_) => {
                    ctx.warn(format_args!("frame ended inside a compute pass"));
                    state.close_pass(&ctx);
                }
            }
        }
        state.recording = None;
        std::mem::take(&mut state.commands)
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.is_some()
    }

    /// Number of commands recorded so far in this frame.
    pub fn command_count(&self) -> usize {
        self.state.lock().commands.len()
    }

    fn record<F>(&self, op: &str, f: F)
    where
        F: FnOnce(&mut CommandBufferState, &Ctx<'_>),
    {
        let Some(shared) = self.core.shared() else {
            log::warn!("{op}: rendering context is gone");
            return;
        };
        let mut state = self.state.lock();
        let Some(recording) = state.recording.clone() else {
            shared.validation_warning(format_args!("{op} called outside of a frame"));
            return;
        };
        let swapchain = recording.swapchain.as_ref().and_then(Weak::upgrade);
        let ctx = Ctx {
            shared: &shared,
            frame: recording.frame,
            slot: recording.slot,
            swapchain: swapchain.as_ref(),
        };
        f(&mut state, &ctx);
    }

    /// Apply a batch outside of any pass.
    pub fn resource_update(&self, mut batch: ResourceUpdateBatch) {
        self.record("resource_update", |state, ctx| {
            if !matches!(state.pass, PassState::Idle) {
                ctx.warn(format_args!("resource_update inside a pass, batch dropped"));
                return;
            }
            state.commit_batch(ctx, &mut batch);
        });
    }

    /// Begin a render pass on `target`, applying `updates` first.
    pub fn begin_pass(
        &self,
        target: &dyn RenderTarget,
        clear_color: Color,
        clear_depth_stencil: DepthStencilClearValue,
        updates: Option<ResourceUpdateBatch>,
        flags: BeginPassFlags,
    ) {
        crate::profile_scope!("begin_pass");
        self.record("begin_pass", |state, ctx| {
            if !matches!(state.pass, PassState::Idle) {
                ctx.warn(format_args!("begin_pass while another pass is active"));
                return;
            }
            if let Some(mut batch) = updates {
                state.commit_batch(ctx, &mut batch);
            }
            let resolved = match target.resolve(ctx.frame) {
                Ok(resolved) => resolved,
                Err(e) => {
                    ctx.warn(format_args!("begin_pass: {e}"));
                    return;
                }
            };

            let begin_index = state.commands.len();
            state.commands.push(Command::BeginRenderPass {
                target: resolved.target,
                clear_color,
                clear_depth_stencil,
            });
            for (texture, access) in &resolved.textures {
                let stage = match access {
                    TextureAccess::DepthOutput => PipelineStage::DepthOutput,
                    _ => PipelineStage::ColorOutput,
                };
                let native = match texture.snapshot(ctx.frame) {
                    Ok(native) => native,
                    Err(e) => {
                        ctx.warn(format_args!("begin_pass: {e}"));
                        continue;
                    }
                };
                if let Err(conflict) = state.tracker.register_texture(texture, native, *access, stage)
                {
                    ctx.warn(format_args!("{conflict}"));
                }
            }
            log::trace!(
                "Render pass begins at command {begin_index}, {}x{}",
                resolved.pixel_size.width,
                resolved.pixel_size.height
            );
            state.bound = BoundState::default();
            state.pass = PassState::Render(RenderPassState {
                begin_index,
                render_pass: resolved.render_pass,
                flags,
            });
        });
    }

    /// End the current render pass, then apply `updates`.
    pub fn end_pass(&self, updates: Option<ResourceUpdateBatch>) {
        self.record("end_pass", |state, ctx| {
            if !matches!(state.pass, PassState::Render(_)) {
                ctx.warn(format_args!("end_pass without an active render pass"));
                return;
            }
            state.close_pass(ctx);
            if let Some(mut batch) = updates {
                state.commit_batch(ctx, &mut batch);
            }
        });
    }

    /// Begin a compute pass. Requires [`Feature::Compute`].
    pub fn begin_compute_pass(&self, updates: Option<ResourceUpdateBatch>, flags: BeginPassFlags) {
        self.record("begin_compute_pass", |state, ctx| {
            if !ctx.feature(Feature::Compute) {
                ctx.warn(format_args!("compute is not supported"));
                return;
            }
            if !matches!(state.pass, PassState::Idle) {
                ctx.warn(format_args!("begin_compute_pass while another pass is active"));
                return;
            }
            if let Some(mut batch) = updates {
                state.commit_batch(ctx, &mut batch);
            }
            let begin_index = state.commands.len();
            state.commands.push(Command::BeginComputePass);
            state.bound = BoundState::default();
            state.pass = PassState::Compute(ComputePassState { begin_index, flags });
        });
    }

    pub fn end_compute_pass(&self, updates: Option<ResourceUpdateBatch>) {
        self.record("end_compute_pass", |state, ctx| {
            if !matches!(state.pass, PassState::Compute(_)) {
                ctx.warn(format_args!("end_compute_pass without an active compute pass"));
                return;
            }
            state.close_pass(ctx);
            if let Some(mut batch) = updates {
                state.commit_batch(ctx, &mut batch);
            }
        });
    }

    /// Bind a graphics pipeline. Its render pass descriptor must be
    /// compatible with the one of the current render target.
    pub fn set_graphics_pipeline(&self, pipeline: &Arc<GraphicsPipeline>) {
        self.record("set_graphics_pipeline", |state, ctx| {
            let PassState::Render(pass) = &state.pass else {
                ctx.warn(format_args!("set_graphics_pipeline outside of a render pass"));
                return;
            };
            let Some(snapshot) = pipeline.snapshot(ctx.frame) else {
                ctx.warn(format_args!(
                    "graphics pipeline {} is not created",
                    pipeline.core().label()
                ));
                return;
            };
            if snapshot.render_pass_format != pass.render_pass.serialized_ref() {
                ctx.warn(format_args!(
                    "graphics pipeline {} was built for an incompatible render pass",
                    pipeline.core().label()
                ));
                return;
            }
            let key = (pipeline.id(), pipeline.core().generation());
            if state.bound.graphics.as_ref().map(|b| b.key) == Some(key) {
                return;
            }
            state.commands.push(Command::SetGraphicsPipeline(snapshot.native));
            state.bound.graphics = Some(BoundGraphicsPipeline {
                key,
                flags: snapshot.flags,
                layout_description: snapshot.layout_description,
                bindings: snapshot.bindings,
            });
            state.bound.srb = None;
        });
    }

    pub fn set_compute_pipeline(&self, pipeline: &Arc<ComputePipeline>) {
        self.record("set_compute_pipeline", |state, ctx| {
            if !matches!(state.pass, PassState::Compute(_)) {
                ctx.warn(format_args!("set_compute_pipeline outside of a compute pass"));
                return;
            }
            let Some(snapshot) = pipeline.snapshot(ctx.frame) else {
                ctx.warn(format_args!(
                    "compute pipeline {} is not created",
                    pipeline.core().label()
                ));
                return;
            };
            let key = (pipeline.id(), pipeline.core().generation());
            if state.bound.compute.as_ref().map(|b| b.key) == Some(key) {
                return;
            }
            state.commands.push(Command::SetComputePipeline(snapshot.native));
            state.bound.compute = Some(BoundComputePipeline {
                key,
                layout_description: snapshot.layout_description,
                bindings: snapshot.bindings,
            });
            state.bound.srb = None;
        });
    }

    /// Bind shader resources. `None` uses the SRB the current pipeline was
    /// built with; any other SRB must be layout-compatible with it.
    ///
    /// `dynamic_offsets` are `(binding, offset)` pairs for uniform buffers
    /// declared with a dynamic offset. Offsets must be multiples of
    /// `ubuf_alignment()`.
    pub fn set_shader_resources(
        &self,
        srb: Option<&Arc<ShaderResourceBindings>>,
        dynamic_offsets: &[(u32, u32)],
    ) {
        self.record("set_shader_resources", |state, ctx| {
            let (layout, default_srb, compute, track) = match &state.pass {
                PassState::Render(_) => match &state.bound.graphics {
                    Some(p) => (
                        p.layout_description.clone(),
                        Some(p.bindings.clone()),
                        false,
                        true,
                    ),
                    None => {
                        ctx.warn(format_args!("set_shader_resources without a pipeline"));
                        return;
                    }
                },
                PassState::Compute(pass) => match &state.bound.compute {
                    Some(p) => (
                        p.layout_description.clone(),
                        Some(p.bindings.clone()),
                        true,
                        !pass
                            .flags
                            .contains(BeginPassFlags::DO_NOT_TRACK_RESOURCES_FOR_COMPUTE),
                    ),
                    None => {
                        ctx.warn(format_args!("set_shader_resources without a pipeline"));
                        return;
                    }
                },
                PassState::Idle => {
                    ctx.warn(format_args!("set_shader_resources outside of a pass"));
                    return;
                }
            };
            let Some(srb) = srb.cloned().or(default_srb) else {
                ctx.warn(format_args!("no shader resource bindings to set"));
                return;
            };
            let Some(snapshot) = srb.snapshot() else {
                ctx.warn(format_args!(
                    "shader resource bindings {} are not created",
                    srb.core().label()
                ));
                return;
            };
            if snapshot.layout_description != layout {
                ctx.warn(format_args!(
                    "shader resource bindings {} are not layout-compatible with the pipeline",
                    srb.core().label()
                ));
                return;
            }
            if !state.check_dynamic_offsets(ctx, &snapshot, dynamic_offsets) {
                return;
            }

            let mut offsets = dynamic_offsets.to_vec();
            offsets.sort_unstable();
            let key = (srb.id(), srb.core().generation(), offsets.clone());
            if !snapshot.stale && state.bound.srb.as_ref() == Some(&key) {
                return;
            }
            let bindings = state.resolve_bindings(ctx, &snapshot, compute, track);
            srb.core().mark_used(ctx.frame);
            state.commands.push(Command::SetShaderResources {
                layout: snapshot.native,
                bindings,
                dynamic_offsets: offsets,
            });
            state.bound.srb = Some(key);
        });
    }

    /// Bind vertex buffers starting at `start_binding`, with `(buffer, offset)`
    /// pairs, and optionally an index buffer.
    pub fn set_vertex_input(
        &self,
        start_binding: u32,
        bindings: &[(&Arc<Buffer>, u32)],
        index: Option<(&Arc<Buffer>, u32, IndexFormat)>,
    ) {
        self.record("set_vertex_input", |state, ctx| {
            if !state.check_render_pass(ctx, "set_vertex_input") {
                return;
            }
            let mut buffers = Vec::with_capacity(bindings.len());
            for (buffer, offset) in bindings {
                if !buffer.usage().contains(BufferUsage::VERTEX) {
                    ctx.warn(format_args!(
                        "buffer {} is not a vertex buffer",
                        buffer.core().label()
                    ));
                    return;
                }
                let Some(native) = state.track_buffer(
                    ctx,
                    buffer,
                    BufferAccess::VertexInput,
                    PipelineStage::VertexInput,
                ) else {
                    return;
                };
                buffers.push((native, *offset));
            }
            let index = match index {
                Some((buffer, offset, format)) => {
                    if !buffer.usage().contains(BufferUsage::INDEX) {
                        ctx.warn(format_args!(
                            "buffer {} is not an index buffer",
                            buffer.core().label()
                        ));
                        return;
                    }
                    if format == IndexFormat::Uint32 && !ctx.feature(Feature::ElementIndexUint) {
                        ctx.warn(format_args!("32-bit indices are not supported"));
                        return;
                    }
                    if offset % 4 != 0
                        && !ctx.feature(Feature::NonFourAlignedEffectiveIndexBufferOffset)
                    {
                        ctx.warn(format_args!("index buffer offset {offset} is not 4-aligned"));
                        return;
                    }
                    let Some(native) = state.track_buffer(
                        ctx,
                        buffer,
                        BufferAccess::IndexRead,
                        PipelineStage::VertexInput,
                    ) else {
                        return;
                    };
                    Some((native, offset, format))
                }
                None => None,
            };
            let command = Command::SetVertexInput {
                start_binding,
                buffers,
                index,
            };
            if state.bound.vertex_input.as_ref() == Some(&command) {
                return;
            }
            state.bound.index_bound = index.is_some();
            state.commands.push(command.clone());
            state.bound.vertex_input = Some(command);
        });
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.record("set_viewport", |state, ctx| {
            if state.check_render_pass(ctx, "set_viewport") {
                state.commands.push(Command::SetViewport(viewport));
            }
        });
    }

    /// Requires a pipeline with [`GraphicsPipelineFlags::USES_SCISSOR`].
    pub fn set_scissor(&self, scissor: Scissor) {
        self.record("set_scissor", |state, ctx| {
            if state.check_pipeline_flag(ctx, GraphicsPipelineFlags::USES_SCISSOR, "set_scissor") {
                state.commands.push(Command::SetScissor(scissor));
            }
        });
    }

    /// Requires a pipeline with [`GraphicsPipelineFlags::USES_BLEND_CONSTANTS`].
    pub fn set_blend_constants(&self, color: Color) {
        self.record("set_blend_constants", |state, ctx| {
            if state.check_pipeline_flag(
                ctx,
                GraphicsPipelineFlags::USES_BLEND_CONSTANTS,
                "set_blend_constants",
            ) {
                state.commands.push(Command::SetBlendConstants(color));
            }
        });
    }

    /// Requires a pipeline with [`GraphicsPipelineFlags::USES_STENCIL_REF`].
    pub fn set_stencil_ref(&self, reference: u32) {
        self.record("set_stencil_ref", |state, ctx| {
            if state.check_pipeline_flag(
                ctx,
                GraphicsPipelineFlags::USES_STENCIL_REF,
                "set_stencil_ref",
            ) {
                state.commands.push(Command::SetStencilRef(reference));
            }
        });
    }

    /// Non-indexed draw. `first_instance` is ignored without
    /// [`Feature::BaseInstance`].
    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record("draw", |state, ctx| {
            if !state.check_draw(ctx, instance_count, "draw") {
                return;
            }
            let first_instance = if ctx.feature(Feature::BaseInstance) {
                first_instance
            } else {
                0
            };
            state.commands.push(Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            });
        });
    }

    /// Indexed draw. `vertex_offset` is ignored without
    /// [`Feature::BaseVertex`], `first_instance` without
    /// [`Feature::BaseInstance`].
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record("draw_indexed", |state, ctx| {
            if !state.check_draw(ctx, instance_count, "draw_indexed") {
                return;
            }
            if !state.bound.index_bound {
                ctx.warn(format_args!("draw_indexed without an index buffer"));
                return;
            }
            let vertex_offset = if ctx.feature(Feature::BaseVertex) {
                vertex_offset
            } else {
                0
            };
            let first_instance = if ctx.feature(Feature::BaseInstance) {
                first_instance
            } else {
                0
            };
            state.commands.push(Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            });
        });
    }

    /// Dispatch `x * y * z` work groups.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.record("dispatch", |state, ctx| {
            if !matches!(state.pass, PassState::Compute(_)) {
                ctx.warn(format_args!("dispatch outside of a compute pass"));
                return;
            }
            if state.bound.compute.is_none() {
                ctx.warn(format_args!("dispatch without a compute pipeline"));
                return;
            }
            let max = ctx
                .shared
                .resource_limit(ResourceLimit::MaxThreadGroupsPerDimension);
            if [x, y, z].iter().any(|&n| u64::from(n) > max) {
                ctx.warn(format_args!(
                    "dispatch ({x}, {y}, {z}) exceeds {max} groups per dimension"
                ));
                return;
            }
            state.commands.push(Command::Dispatch { x, y, z });
        });
    }

    pub fn debug_mark_begin(&self, name: &str) {
        self.record("debug_mark_begin", |state, ctx| {
            if ctx.shared.flags().contains(RhiFlags::ENABLE_DEBUG_MARKERS) {
                state.commands.push(Command::DebugMarkBegin(name.to_string()));
            }
        });
    }

    pub fn debug_mark_end(&self) {
        self.record("debug_mark_end", |state, ctx| {
            if ctx.shared.flags().contains(RhiFlags::ENABLE_DEBUG_MARKERS) {
                state.commands.push(Command::DebugMarkEnd);
            }
        });
    }

    pub fn debug_mark_msg(&self, msg: &str) {
        self.record("debug_mark_msg", |state, ctx| {
            if ctx.shared.flags().contains(RhiFlags::ENABLE_DEBUG_MARKERS) {
                state.commands.push(Command::DebugMarkMsg(msg.to_string()));
            }
        });
    }

    /// Start a block of natively recorded commands. The pass must have been
    /// begun with [`BeginPassFlags::EXTERNAL_CONTENT`].
    pub fn begin_external(&self) {
        self.record("begin_external", |state, ctx| {
            let flags = match &state.pass {
                PassState::Render(pass) => pass.flags,
                PassState::Compute(pass) => pass.flags,
                PassState::Idle => {
                    ctx.warn(format_args!("begin_external outside of a pass"));
                    return;
                }
            };
            if !flags.contains(BeginPassFlags::EXTERNAL_CONTENT) {
                ctx.warn(format_args!(
                    "begin_external in a pass begun without EXTERNAL_CONTENT"
                ));
                return;
            }
            if state.external {
                ctx.warn(format_args!("begin_external while already external"));
                return;
            }
            state.external = true;
            state.commands.push(Command::BeginExternal);
        });
    }

    /// End an external block. All bound state is forgotten and must be set
    /// again.
    pub fn end_external(&self) {
        self.record("end_external", |state, ctx| {
            if !state.external {
                ctx.warn(format_args!("end_external without begin_external"));
                return;
            }
            state.external = false;
            state.bound = BoundState::default();
            state.commands.push(Command::EndExternal);
        });
    }

    /// Native command buffer of the current frame slot, if the backend has one.
    pub fn native_handles(&self) -> Option<NativeHandle> {
        let slot = self.state.lock().recording.as_ref()?.slot;
        let shared = self.core.shared()?;
        let handle = shared.backend().native_command_buffer(slot);
        handle
    }

    /// GPU time in seconds of the last completed frame. Always 0 unless the
    /// context was created with `ENABLE_TIMESTAMPS`.
    pub fn last_completed_gpu_time(&self) -> f64 {
        let Some(shared) = self.core.shared() else {
            return 0.0;
        };
        if !shared.flags().contains(RhiFlags::ENABLE_TIMESTAMPS) {
            return 0.0;
        }
        let time = shared.backend().last_completed_gpu_time();
        time
    }
}

impl CommandBufferState {
    fn check_render_pass(&self, ctx: &Ctx<'_>, op: &str) -> bool {
        if !matches!(self.pass, PassState::Render(_)) {
            ctx.warn(format_args!("{op} outside of a render pass"));
            return false;
        }
        if self.external {
            ctx.warn(format_args!("{op} inside an external block"));
            return false;
        }
        true
    }

    fn check_pipeline_flag(&self, ctx: &Ctx<'_>, flag: GraphicsPipelineFlags, op: &str) -> bool {
        if !self.check_render_pass(ctx, op) {
            return false;
        }
        match &self.bound.graphics {
            Some(pipeline) if pipeline.flags.contains(flag) => true,
            Some(_) => {
                ctx.warn(format_args!("{op} needs a pipeline with {flag:?}"));
                false
            }
            None => {
                ctx.warn(format_args!("{op} without a pipeline"));
                false
            }
        }
    }

    fn check_draw(&self, ctx: &Ctx<'_>, instance_count: u32, op: &str) -> bool {
        if !self.check_render_pass(ctx, op) {
            return false;
        }
        if self.bound.graphics.is_none() {
            ctx.warn(format_args!("{op} without a graphics pipeline"));
            return false;
        }
        if instance_count > 1 && !ctx.feature(Feature::Instancing) {
            ctx.warn(format_args!("instanced drawing is not supported"));
            return false;
        }
        true
    }

    fn check_dynamic_offsets(
        &self,
        ctx: &Ctx<'_>,
        snapshot: &SrbSnapshot,
        offsets: &[(u32, u32)],
    ) -> bool {
        let alignment = ctx.shared.ubuf_alignment();
        for &(binding, offset) in offsets {
            let dynamic = snapshot.bindings.iter().any(|b| {
                b.binding == binding
                    && b.kind
                        == BindingKind::UniformBuffer {
                            dynamic_offset: true,
                        }
            });
            if !dynamic {
                ctx.warn(format_args!(
                    "dynamic offset for binding {binding}, which has no dynamic offset"
                ));
                return false;
            }
            if offset % alignment != 0 {
                ctx.warn(format_args!(
                    "dynamic offset {offset} is not aligned to {alignment}"
                ));
                return false;
            }
        }
        true
    }

    fn track_buffer(
        &mut self,
        ctx: &Ctx<'_>,
        buffer: &Arc<Buffer>,
        access: BufferAccess,
        stage: PipelineStage,
    ) -> Option<NativeHandle> {
        let native = match buffer.snapshot(ctx.slot, ctx.frame) {
            Ok(native) => native,
            Err(e) => {
                ctx.warn(format_args!("{e}"));
                return None;
            }
        };
        if let Err(conflict) = self.tracker.register_buffer(buffer, native, access, stage) {
            ctx.warn(format_args!("{conflict}"));
        }
        Some(native)
    }

    fn track_texture(
        &mut self,
        ctx: &Ctx<'_>,
        texture: &Arc<Texture>,
        access: TextureAccess,
        stage: PipelineStage,
        track: bool,
    ) -> Option<NativeHandle> {
        let native = match texture.snapshot(ctx.frame) {
            Ok(native) => native,
            Err(e) => {
                ctx.warn(format_args!("{e}"));
                return None;
            }
        };
        if track {
            if let Err(conflict) = self.tracker.register_texture(texture, native, access, stage) {
                ctx.warn(format_args!("{conflict}"));
            }
        }
        Some(native)
    }

    fn resolve_bindings(
        &mut self,
        ctx: &Ctx<'_>,
        snapshot: &SrbSnapshot,
        compute: bool,
        track: bool,
    ) -> Vec<NativeBinding> {
        let mut out = Vec::with_capacity(snapshot.bindings.len());
        for binding in &snapshot.bindings {
            let stage = if compute {
                PipelineStage::Compute
            } else {
                PipelineStage::earliest(binding.stages & !ShaderStageFlags::COMPUTE)
            };
            let resource = match &binding.resource {
                BindingResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let access = match binding.kind {
                        BindingKind::UniformBuffer { .. } => BufferAccess::UniformRead,
                        BindingKind::BufferStore => BufferAccess::StorageStore,
                        BindingKind::BufferLoadStore => BufferAccess::StorageLoadStore,
                        _ => BufferAccess::StorageLoad,
                    };
                    let native = if track {
                        self.track_buffer(ctx, buffer, access, stage)
                    } else {
                        buffer
                            .snapshot(ctx.slot, ctx.frame)
                            .map_err(|e| ctx.warn(format_args!("{e}")))
                            .ok()
                    };
                    let Some(native) = native else {
                        continue;
                    };
                    NativeBindingResource::Buffer {
                        buffer: native,
                        offset: *offset,
                        size: size.unwrap_or(buffer.size().saturating_sub(*offset)),
                    }
                }
                BindingResource::SampledTextures(pairs) => {
                    let mut natives = Vec::with_capacity(pairs.len());
                    for (texture, sampler) in pairs {
                        let texture =
                            self.track_texture(ctx, texture, TextureAccess::Sample, stage, track);
                        let sampler = sampler
                            .snapshot(ctx.frame)
                            .map_err(|e| ctx.warn(format_args!("{e}")))
                            .ok();
                        if let (Some(t), Some(s)) = (texture, sampler) {
                            natives.push((t, s));
                        }
                    }
                    NativeBindingResource::SampledTextures(natives)
                }
                BindingResource::Textures(textures) => NativeBindingResource::Textures(
                    textures
                        .iter()
                        .filter_map(|t| {
                            self.track_texture(ctx, t, TextureAccess::Sample, stage, track)
                        })
                        .collect(),
                ),
                BindingResource::Samplers(samplers) => NativeBindingResource::Samplers(
                    samplers
                        .iter()
                        .filter_map(|s| {
                            s.snapshot(ctx.frame)
                                .map_err(|e| ctx.warn(format_args!("{e}")))
                                .ok()
                        })
                        .collect(),
                ),
                BindingResource::Image { texture, level } => {
                    let access = match binding.kind {
                        BindingKind::ImageStore => TextureAccess::StorageStore,
                        BindingKind::ImageLoadStore => TextureAccess::StorageLoadStore,
                        _ => TextureAccess::StorageLoad,
                    };
                    let Some(native) = self.track_texture(ctx, texture, access, stage, track)
                    else {
                        continue;
                    };
                    NativeBindingResource::Image {
                        texture: native,
                        level: *level,
                    }
                }
            };
            out.push(NativeBinding {
                binding: binding.binding,
                resource,
            });
        }
        out
    }

    /// End the active pass and put its barrier in front of it.
    fn close_pass(&mut self, ctx: &Ctx<'_>) {
        if self.external {
            ctx.warn(format_args!("pass ended inside an external block"));
            self.external = false;
            self.commands.push(Command::EndExternal);
        }
        let begin_index = match std::mem::take(&mut self.pass) {
            PassState::Render(pass) => {
                self.commands.push(Command::EndRenderPass);
                pass.begin_index
            }
            PassState::Compute(pass) => {
                self.commands.push(Command::EndComputePass);
                pass.begin_index
            }
            PassState::Idle => return,
        };
        let transitions = self.tracker.finish();
        if !transitions.is_empty() {
            self.commands
                .insert(begin_index, Command::Barrier(transitions));
        }
        self.bound = BoundState::default();
    }

    /// Apply the operations of `batch` in order, outside of any pass.
    fn commit_batch(&mut self, ctx: &Ctx<'_>, batch: &mut ResourceUpdateBatch) {
        for op in batch.drain_ops() {
            match op {
                UpdateOp::DynamicBufferUpdate {
                    buffer,
                    offset,
                    data,
                } => {
                    if let Err(e) = buffer.write_dynamic(ctx.slot, offset, &data) {
                        ctx.warn(format_args!("{e}"));
                    }
                }
                UpdateOp::StaticBufferUpload {
                    buffer,
                    offset,
                    data,
                } => {
                    if buffer.mark_uploaded() {
                        ctx.warn(format_args!(
                            "immutable buffer {} uploaded more than once",
                            buffer.core().label()
                        ));
                    }
                    match buffer.snapshot(ctx.slot, ctx.frame) {
                        Ok(native) => self.commands.push(Command::WriteBuffer {
                            buffer: native,
                            offset,
                            data,
                        }),
                        Err(e) => ctx.warn(format_args!("{e}")),
                    }
                }
                UpdateOp::BufferReadback {
                    buffer,
                    offset,
                    size,
                    result,
                    unsupported,
                } => {
                    let source = if unsupported {
                        None
                    } else {
                        buffer
                            .snapshot(ctx.slot, ctx.frame)
                            .map_err(|e| ctx.warn(format_args!("{e}")))
                            .ok()
                            .map(|native| ReadbackSource::Buffer {
                                buffer: native,
                                offset,
                                size,
                            })
                    };
                    self.queue_readback(ctx, source, result, ReadbackData::default());
                }
                UpdateOp::TextureUpload { texture, uploads } => {
                    let native = match texture.snapshot(ctx.frame) {
                        Ok(native) => native,
                        Err(e) => {
                            ctx.warn(format_args!("{e}"));
                            continue;
                        }
                    };
                    let format = texture.format();
                    for upload in uploads {
                        self.commands.push(Command::UploadTexture {
                            texture: native,
                            format,
                            layer: upload.layer,
                            level: upload.level,
                            origin: upload.origin,
                            size: upload.size,
                            stride: upload.stride,
                            data: upload.data,
                        });
                    }
                }
                UpdateOp::TextureCopy {
                    destination,
                    source,
                    description,
                    size,
                } => {
                    let natives = destination
                        .snapshot(ctx.frame)
                        .and_then(|d| source.snapshot(ctx.frame).map(|s| (d, s)));
                    match natives {
                        Ok((destination_native, source_native)) => {
                            self.commands.push(Command::CopyTexture {
                                destination: destination_native,
                                source: source_native,
                                format: source.format(),
                                region: TextureCopyRegion {
                                    source_layer: description.source_layer,
                                    source_level: description.source_level,
                                    source_origin: description.source_top_left,
                                    destination_layer: description.destination_layer,
                                    destination_level: description.destination_level,
                                    destination_origin: description.destination_top_left,
                                    size,
                                },
                            })
                        }
                        Err(e) => ctx.warn(format_args!("{e}")),
                    }
                }
                UpdateOp::TextureReadback {
                    description,
                    result,
                    unsupported,
                } => {
                    let (source, info) = self.resolve_texture_readback(ctx, &description);
                    let source = if unsupported { None } else { source };
                    self.queue_readback(ctx, source, result, info);
                }
                UpdateOp::GenerateMips { texture } => match texture.snapshot(ctx.frame) {
                    Ok(native) => self.commands.push(Command::GenerateMips { texture: native }),
                    Err(e) => ctx.warn(format_args!("{e}")),
                },
            }
        }
    }

    fn resolve_texture_readback(
        &self,
        ctx: &Ctx<'_>,
        description: &crate::update_batch::ReadbackDescription,
    ) -> (Option<ReadbackSource>, ReadbackData) {
        match &description.texture {
            Some(texture) => {
                let info = ReadbackData {
                    format: Some(texture.format()),
                    pixel_size: crate::types::size_for_mip_level(
                        description.level,
                        texture.pixel_size(),
                    ),
                    data: Vec::new(),
                };
                let source = texture
                    .snapshot(ctx.frame)
                    .map_err(|e| ctx.warn(format_args!("{e}")))
                    .ok()
                    .map(|native| ReadbackSource::Texture {
                        texture: native,
                        layer: description.layer,
                        level: description.level,
                    });
                (source, info)
            }
            None => {
                let Some(swapchain) = ctx.swapchain else {
                    ctx.warn(format_args!("backbuffer readback outside of a swapchain frame"));
                    return (None, ReadbackData::default());
                };
                let info = ReadbackData {
                    format: Some(swapchain.format()),
                    pixel_size: swapchain.current_pixel_size(),
                    data: Vec::new(),
                };
                if !swapchain
                    .flags()
                    .contains(SwapChainFlags::USED_AS_TRANSFER_SOURCE)
                {
                    ctx.warn(format_args!(
                        "backbuffer readback needs a swapchain with USED_AS_TRANSFER_SOURCE"
                    ));
                    return (None, info);
                }
                (swapchain.native().map(ReadbackSource::SwapChain), info)
            }
        }
    }

    /// Record a readback, or queue an empty result when there is no source.
    fn queue_readback(
        &mut self,
        ctx: &Ctx<'_>,
        source: Option<ReadbackSource>,
        result: crate::update_batch::ReadbackResult,
        info: ReadbackData,
    ) {
        let ticket = source.map(|source| {
            let ticket = ctx.shared.next_readback_ticket();
            self.commands.push(Command::ReadBack { ticket, source });
            ticket
        });
        ctx.shared.queue_readback(ctx.frame, ticket, result, info);
    }
}

impl RhiResource for CommandBuffer {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::CommandBuffer
    }

    /// Command buffers are owned by swapchains and the context.
    fn create(&self) -> Result<(), RhiError> {
        Ok(())
    }

    fn destroy(&self) {}

    fn is_created(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandBuffer")
            .field("id", &self.core.id())
            .field("recording", &state.recording.is_some())
            .field("commands", &state.commands.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandBuffer: Send, Sync);
