//! The rendering context.
//!
//! [`Rhi`] owns the backend, creates resources and drives frames. It is a
//! cheap handle around a shared core; resources keep a weak reference to the
//! same core so they can queue native releases and report validation warnings
//! without keeping the context alive.
//!
//! # Frames
//!
//! ```text
//! begin_frame(n)    wait for slot n % FIF, completed = n - FIF
//!                   deliver readbacks and release natives up to `completed`
//! ... record ...
//! end_frame(n)      submit, present, run delete_later, advance the slot
//! ```
//!
//! Offscreen frames use the same numbering but wait for the GPU before
//! returning, so everything they recorded is complete afterwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use parking_lot::{Mutex, MutexGuard};

use crate::backend::deferred::DeferredReleaseQueue;
use crate::backend::{
    Backend, BackendKind, BackendStatistics, DriverInfo, Feature, InitParams, NativeObject,
    ResourceLimit, create_backend,
};
use crate::command::{Command, CommandBuffer};
use crate::error::{FrameOpError, FrameOpResult, RhiError};
use crate::resource::{ResourceId, ResourceType, RhiResource};
use crate::resources::{
    Buffer, ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline,
    GraphicsPipelineDescriptor, RenderBuffer, RenderPassDescriptor, RenderPassFormat, Sampler,
    ShaderResourceBindings, SwapChain, Texture, TextureRenderTarget,
    TextureRenderTargetDescription, TextureRenderTargetFlags,
};
use crate::types::{
    BufferDescriptor, RenderBufferDescriptor, SamplerDescriptor, Size, TextureDescriptor,
    TextureFlags, TextureFormat,
};
use crate::update_batch::{BatchPool, ReadbackData, ReadbackResult, ResourceUpdateBatch, UpdateOp};

bitflags! {
    /// Context creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RhiFlags: u32 {
        /// Record debug markers. Without it the `debug_mark_*` calls are no-ops.
        const ENABLE_DEBUG_MARKERS = 1 << 0;
        /// Collect GPU timestamps for `last_completed_gpu_time`.
        const ENABLE_TIMESTAMPS = 1 << 1;
        const PREFER_SOFTWARE_RENDERER = 1 << 2;
        /// Allow `pipeline_cache_data` to return data.
        const ENABLE_PIPELINE_CACHE_DATA_SAVE = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BeginFrameFlags: u32 {}
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EndFrameFlags: u32 {
        /// Submit without presenting.
        const SKIP_PRESENT = 1 << 0;
    }
}

/// Snapshot of context counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RhiStatistics {
    /// Number of the most recently begun frame.
    pub current_frame: u64,
    /// Highest frame number known to be complete on the GPU.
    pub completed_frame: u64,
    pub frames_submitted: u64,
    pub live_resources: usize,
    pub pending_releases: usize,
    pub pending_readbacks: usize,
    pub update_batches_in_use: usize,
    pub validation_warnings: u64,
    pub backend: BackendStatistics,
}

// ============================================================================
// Pipeline cache header
// ============================================================================

const PIPELINE_CACHE_MAGIC: u32 = u32::from_le_bytes(*b"RLPC");
const PIPELINE_CACHE_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct PipelineCacheHeader {
    magic: u32,
    version: u32,
    backend: u32,
    data_size: u32,
    driver_id: u64,
}

impl PipelineCacheHeader {
    fn new(backend: BackendKind, driver: &DriverInfo, data_size: u32) -> Self {
        Self {
            magic: PIPELINE_CACHE_MAGIC,
            version: PIPELINE_CACHE_VERSION,
            backend: backend as u32,
            data_size,
            driver_id: driver.device_id,
        }
    }
}

// ============================================================================
// Shared core
// ============================================================================

enum ActiveFrame {
    SwapChain(Arc<SwapChain>),
    Offscreen,
}

struct FrameState {
    /// Number of the most recently begun frame. Frames start at 1.
    number: u64,
    completed: u64,
    slot: usize,
    active: Option<ActiveFrame>,
    offscreen: Option<Arc<CommandBuffer>>,
}

struct PendingReadback {
    frame: u64,
    /// `None` when the readback could not be recorded; completes empty.
    ticket: Option<u64>,
    result: ReadbackResult,
    info: ReadbackData,
}

struct LiveResource {
    id: ResourceId,
    resource_type: ResourceType,
    resource: Weak<dyn RhiResource>,
}

/// State shared by the context handle and every resource.
pub(crate) struct RhiShared {
    backend: Mutex<Box<dyn Backend>>,
    kind: BackendKind,
    flags: RhiFlags,
    frames_in_flight: usize,
    frame: Mutex<FrameState>,
    releases: Mutex<DeferredReleaseQueue>,
    delete_later: Mutex<Vec<Arc<dyn RhiResource>>>,
    readbacks: Mutex<Vec<PendingReadback>>,
    next_ticket: AtomicU64,
    batch_pool: Mutex<BatchPool>,
    live: Mutex<Vec<LiveResource>>,
    validation_warnings: AtomicU64,
    frames_submitted: AtomicU64,
    device_lost: AtomicBool,
}

impl RhiShared {
    fn new(backend: Box<dyn Backend>, flags: RhiFlags) -> Self {
        let kind = backend.kind();
        let frames_in_flight = backend.frames_in_flight().max(1) as usize;
        Self {
            backend: Mutex::new(backend),
            kind,
            flags,
            frames_in_flight,
            frame: Mutex::new(FrameState {
                number: 0,
                completed: 0,
                slot: 0,
                active: None,
                offscreen: None,
            }),
            releases: Mutex::new(DeferredReleaseQueue::new()),
            delete_later: Mutex::new(Vec::new()),
            readbacks: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            batch_pool: Mutex::new(BatchPool::new()),
            live: Mutex::new(Vec::new()),
            validation_warnings: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            device_lost: AtomicBool::new(false),
        }
    }

    /// Lock the backend. Never held across calls back into the core.
    pub(crate) fn backend(&self) -> MutexGuard<'_, Box<dyn Backend>> {
        self.backend.lock()
    }

    pub(crate) fn flags(&self) -> RhiFlags {
        self.flags
    }

    pub(crate) fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub(crate) fn is_feature_supported(&self, feature: Feature) -> bool {
        self.backend().is_feature_supported(feature)
    }

    pub(crate) fn resource_limit(&self, limit: ResourceLimit) -> u64 {
        match limit {
            ResourceLimit::FramesInFlight => self.frames_in_flight as u64,
            _ => self.backend().resource_limit(limit),
        }
    }

    pub(crate) fn is_texture_format_supported(
        &self,
        format: TextureFormat,
        flags: TextureFlags,
    ) -> bool {
        self.backend().is_texture_format_supported(format, flags)
    }

    pub(crate) fn ubuf_alignment(&self) -> u32 {
        self.backend().ubuf_alignment().max(1)
    }

    /// Log a programming error and count it.
    pub(crate) fn validation_warning(&self, args: fmt::Arguments<'_>) {
        log::warn!("{}", args);
        self.validation_warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a newly created resource for statistics and the leak check.
    pub(crate) fn register<T: RhiResource + 'static>(&self, resource: Arc<T>) -> Arc<T> {
        let object: Arc<dyn RhiResource> = resource.clone();
        let mut live = self.live.lock();
        if live.len() >= 64 && live.len().is_power_of_two() {
            live.retain(|entry| entry.resource.strong_count() > 0);
        }
        live.push(LiveResource {
            id: resource.id(),
            resource_type: resource.resource_type(),
            resource: Arc::downgrade(&object),
        });
        log::trace!("Registered {:?} {}", resource.resource_type(), resource.id());
        resource
    }

    /// Release native objects last referenced by frame `last_used`, now if
    /// that frame has completed, otherwise once it does.
    pub(crate) fn release_natives(&self, objects: Vec<NativeObject>, last_used: u64) {
        if objects.is_empty() {
            return;
        }
        let completed = self.frame.lock().completed;
        if last_used <= completed {
            let mut backend = self.backend();
            for object in objects {
                backend.release(object);
            }
        } else {
            let mut releases = self.releases.lock();
            for object in objects {
                releases.push(last_used, object);
            }
        }
    }

    pub(crate) fn delete_later(&self, resource: Arc<dyn RhiResource>) {
        let in_frame = self.frame.lock().active.is_some();
        if in_frame {
            self.delete_later.lock().push(resource);
        } else {
            resource.destroy();
        }
    }

    pub(crate) fn release_batch(&self, ops: Vec<UpdateOp>) {
        self.batch_pool.lock().release(ops);
    }

    pub(crate) fn next_readback_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `result` for delivery once frame `frame` has completed.
    pub(crate) fn queue_readback(
        &self,
        frame: u64,
        ticket: Option<u64>,
        result: ReadbackResult,
        info: ReadbackData,
    ) {
        self.readbacks.lock().push(PendingReadback {
            frame,
            ticket,
            result,
            info,
        });
    }

    fn mark_device_lost(&self) {
        if !self.device_lost.swap(true, Ordering::AcqRel) {
            log::error!("Graphics device lost");
        }
    }

    fn frame_error(&self, err: FrameOpError) -> FrameOpError {
        if err == FrameOpError::DeviceLost {
            self.mark_device_lost();
        }
        err
    }

    /// Complete every readback recorded in a frame up to `frame`. Callbacks
    /// run with no lock held.
    fn deliver_readbacks(&self, frame: u64) {
        let ready: Vec<PendingReadback> = {
            let mut pending = self.readbacks.lock();
            let (ready, waiting) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|r| r.frame <= frame);
            *pending = waiting;
            ready
        };
        if ready.is_empty() {
            return;
        }
        log::trace!("Delivering {} readbacks up to frame {frame}", ready.len());
        for readback in ready {
            let data = readback
                .ticket
                .and_then(|ticket| self.backend().take_readback(ticket))
                .unwrap_or_default();
            readback.result.complete(ReadbackData {
                data,
                ..readback.info
            });
        }
    }

    fn drain_releases(&self, completed: u64) {
        let objects = self.releases.lock().drain_completed(completed);
        if objects.is_empty() {
            return;
        }
        log::trace!("Releasing {} native objects", objects.len());
        let mut backend = self.backend();
        for object in objects {
            backend.release(object);
        }
    }

    fn run_delete_later(&self) {
        let resources = std::mem::take(&mut *self.delete_later.lock());
        for resource in resources {
            resource.destroy();
        }
    }

    fn submit(&self, slot: usize, commands: &[Command]) -> FrameOpResult {
        crate::profile_scope!("submit");
        let result = self.backend().submit(slot, commands);
        result.map_err(|e| {
            log::error!("Submit failed: {e}");
            self.frame_error(e.into())
        })
    }

    fn live_resources(&self) -> Vec<(ResourceId, ResourceType, Arc<dyn RhiResource>)> {
        self.live
            .lock()
            .iter()
            .filter_map(|entry| {
                entry
                    .resource
                    .upgrade()
                    .map(|r| (entry.id, entry.resource_type, r))
            })
            .collect()
    }

    fn leak_check_enabled() -> bool {
        cfg!(debug_assertions) || std::env::var_os("RHI_LEAK_CHECK").is_some()
    }
}

impl Drop for RhiShared {
    fn drop(&mut self) {
        log::debug!("Tearing down {:?} context", self.kind);
        let backend = self.backend.get_mut();
        if let Err(e) = backend.wait_idle() {
            log::warn!("wait_idle during teardown failed: {e}");
        }
        for object in self.releases.get_mut().flush_all() {
            backend.release(object);
        }
        for readback in self.readbacks.get_mut().drain(..) {
            readback.result.complete(ReadbackData::default());
        }
        for resource in self.delete_later.get_mut().drain(..) {
            resource.destroy();
        }

        if Self::leak_check_enabled() {
            for entry in self.live.get_mut().iter() {
                let Some(resource) = entry.resource.upgrade() else {
                    continue;
                };
                if resource.is_created() {
                    log::warn!(
                        "Leaked {:?} {} ({})",
                        entry.resource_type,
                        entry.id,
                        resource.name().unwrap_or_default()
                    );
                }
            }
        }
    }
}

// ============================================================================
// Rhi
// ============================================================================

/// Handle to a rendering context.
///
/// Cloning is cheap and yields another handle to the same context. The context
/// is torn down when the last handle is dropped; resources that outlive it
/// can still be destroyed but no longer do anything.
#[derive(Clone)]
pub struct Rhi {
    shared: Arc<RhiShared>,
}

impl Rhi {
    /// Create a context on a built-in backend.
    ///
    /// Returns [`RhiError::BackendUnavailable`] for kinds without an
    /// implementation in this build.
    pub fn create(kind: BackendKind, params: InitParams, flags: RhiFlags) -> Result<Self, RhiError> {
        let backend = create_backend(kind, params)?;
        Ok(Self::with_backend(backend, flags))
    }

    /// Create a context on an externally provided backend.
    pub fn with_backend(backend: Box<dyn Backend>, flags: RhiFlags) -> Self {
        let info = backend.driver_info();
        log::info!(
            "Created RHI context: backend {} on '{}', {} frames in flight, flags {:?}",
            backend.name(),
            info.device_name,
            backend.frames_in_flight(),
            flags
        );
        Self {
            shared: Arc::new(RhiShared::new(backend, flags)),
        }
    }

    pub(crate) fn from_shared(shared: Arc<RhiShared>) -> Self {
        Self { shared }
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    pub fn new_buffer(&self, descriptor: BufferDescriptor) -> Arc<Buffer> {
        self.shared
            .register(Arc::new(Buffer::new(&self.shared, descriptor)))
    }

    pub fn new_texture(&self, descriptor: TextureDescriptor) -> Arc<Texture> {
        self.shared
            .register(Arc::new(Texture::new(&self.shared, descriptor)))
    }

    pub fn new_render_buffer(&self, descriptor: RenderBufferDescriptor) -> Arc<RenderBuffer> {
        self.shared
            .register(Arc::new(RenderBuffer::new(&self.shared, descriptor)))
    }

    pub fn new_sampler(&self, descriptor: SamplerDescriptor) -> Arc<Sampler> {
        self.shared
            .register(Arc::new(Sampler::new(&self.shared, descriptor)))
    }

    pub fn new_render_pass_descriptor(&self, format: RenderPassFormat) -> Arc<RenderPassDescriptor> {
        self.shared
            .register(Arc::new(RenderPassDescriptor::new(&self.shared, format)))
    }

    pub fn new_shader_resource_bindings(&self) -> Arc<ShaderResourceBindings> {
        self.shared
            .register(Arc::new(ShaderResourceBindings::new(&self.shared)))
    }

    pub fn new_graphics_pipeline(
        &self,
        descriptor: GraphicsPipelineDescriptor,
    ) -> Arc<GraphicsPipeline> {
        self.shared
            .register(Arc::new(GraphicsPipeline::new(&self.shared, descriptor)))
    }

    pub fn new_compute_pipeline(&self, descriptor: ComputePipelineDescriptor) -> Arc<ComputePipeline> {
        self.shared
            .register(Arc::new(ComputePipeline::new(&self.shared, descriptor)))
    }

    pub fn new_texture_render_target(
        &self,
        description: TextureRenderTargetDescription,
        flags: TextureRenderTargetFlags,
    ) -> Arc<TextureRenderTarget> {
        self.shared.register(Arc::new(TextureRenderTarget::new(
            &self.shared,
            description,
            flags,
        )))
    }

    pub fn new_swapchain(&self) -> Arc<SwapChain> {
        self.shared.register(SwapChain::new(&self.shared))
    }

    /// Take a batch from the pool. `None` when all
    /// [`MAX_UPDATE_BATCHES`](crate::MAX_UPDATE_BATCHES) are in use.
    pub fn next_resource_update_batch(&self) -> Option<ResourceUpdateBatch> {
        let ops = self.shared.batch_pool.lock().acquire();
        match ops {
            Some(ops) => Some(ResourceUpdateBatch::new(&self.shared, ops)),
            None => {
                self.shared.validation_warning(format_args!(
                    "resource update batch pool exhausted, release or submit batches"
                ));
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Start a frame on `swapchain`.
    ///
    /// Waits until the frame slot is free. Calling it while a frame is active
    /// only logs a warning. Fails with [`FrameOpError::SwapChainOutOfDate`]
    /// when the surface no longer matches the backbuffer size.
    pub fn begin_frame(&self, swapchain: &Arc<SwapChain>, _flags: BeginFrameFlags) -> FrameOpResult {
        crate::profile_function!();
        let shared = &self.shared;
        if shared.device_lost.load(Ordering::Acquire) {
            return Err(FrameOpError::DeviceLost);
        }
        let Some(native) = swapchain.native() else {
            shared.validation_warning(format_args!("begin_frame on a swapchain that is not created"));
            return Err(FrameOpError::Error);
        };
        let surface_size = swapchain.surface_pixel_size();
        let backbuffer_size = swapchain.current_pixel_size();

        let (frame, slot, completed) = {
            let mut state = shared.frame.lock();
            if state.active.is_some() {
                drop(state);
                shared.validation_warning(format_args!(
                    "begin_frame while a frame is already being recorded"
                ));
                return Ok(());
            }
            if surface_size != backbuffer_size {
                log::debug!(
                    "Swapchain {} is out of date: surface {}x{}, backbuffers {}x{}",
                    swapchain.core().label(),
                    surface_size.width,
                    surface_size.height,
                    backbuffer_size.width,
                    backbuffer_size.height
                );
                return Err(FrameOpError::SwapChainOutOfDate);
            }
            let slot = state.slot;
            let result = shared.backend().begin_frame(slot, Some(native));
            result.map_err(|e| shared.frame_error(e))?;

            state.number += 1;
            let frame = state.number;
            let waited = frame.saturating_sub(shared.frames_in_flight as u64);
            state.completed = state.completed.max(waited);
            state.active = Some(ActiveFrame::SwapChain(swapchain.clone()));
            (frame, slot, state.completed)
        };

        log::trace!("Frame {frame} begins in slot {slot}, completed {completed}");
        shared.deliver_readbacks(completed);
        shared.drain_releases(completed);
        swapchain
            .current_frame_command_buffer()
            .begin_recording(frame, slot, Some(swapchain));
        Ok(())
    }

    /// Submit the frame begun with `begin_frame` and present it unless
    /// [`EndFrameFlags::SKIP_PRESENT`] is set.
    pub fn end_frame(&self, swapchain: &Arc<SwapChain>, flags: EndFrameFlags) -> FrameOpResult {
        crate::profile_function!();
        let shared = &self.shared;
        let slot = {
            let mut state = shared.frame.lock();
            match &state.active {
                Some(ActiveFrame::SwapChain(active)) if Arc::ptr_eq(active, swapchain) => {}
                _ => {
                    drop(state);
                    shared.validation_warning(format_args!(
                        "end_frame without a matching begin_frame"
                    ));
                    return Err(FrameOpError::Error);
                }
            }
            state.active = None;
            state.slot
        };

        let commands = swapchain.current_frame_command_buffer().end_recording();
        let submitted = shared.submit(slot, &commands);
        let presented = submitted.and_then(|()| {
            let native = swapchain.native();
            let present = !flags.contains(EndFrameFlags::SKIP_PRESENT);
            let result = shared.backend().end_frame(slot, native, present);
            result.map_err(|e| shared.frame_error(e))
        });

        {
            let mut state = shared.frame.lock();
            state.slot = (slot + 1) % shared.frames_in_flight;
        }
        shared.frames_submitted.fetch_add(1, Ordering::Relaxed);
        shared.run_delete_later();
        crate::profile_plot!("rhi commands", commands.len() as f64);
        crate::frame_mark!();
        presented
    }

    /// Start a frame without a swapchain. The returned command buffer is
    /// valid until [`end_offscreen_frame`](Self::end_offscreen_frame).
    pub fn begin_offscreen_frame(
        &self,
        _flags: BeginFrameFlags,
    ) -> Result<Arc<CommandBuffer>, FrameOpError> {
        crate::profile_function!();
        let shared = &self.shared;
        if shared.device_lost.load(Ordering::Acquire) {
            return Err(FrameOpError::DeviceLost);
        }
        let (command_buffer, frame, slot, completed) = {
            let mut state = shared.frame.lock();
            match (&state.active, &state.offscreen) {
                (Some(ActiveFrame::Offscreen), Some(cb)) => {
                    let cb = cb.clone();
                    drop(state);
                    shared.validation_warning(format_args!(
                        "begin_offscreen_frame while a frame is already being recorded"
                    ));
                    return Ok(cb);
                }
                (Some(_), _) => {
                    drop(state);
                    shared.validation_warning(format_args!(
                        "begin_offscreen_frame inside a swapchain frame"
                    ));
                    return Err(FrameOpError::Error);
                }
                (None, _) => {}
            }
            let slot = state.slot;
            let result = shared.backend().begin_frame(slot, None);
            result.map_err(|e| shared.frame_error(e))?;

            state.number += 1;
            let frame = state.number;
            let waited = frame.saturating_sub(shared.frames_in_flight as u64);
            state.completed = state.completed.max(waited);
            state.active = Some(ActiveFrame::Offscreen);
            let command_buffer = state
                .offscreen
                .get_or_insert_with(|| Arc::new(CommandBuffer::new(shared)))
                .clone();
            (command_buffer, frame, slot, state.completed)
        };

        shared.deliver_readbacks(completed);
        shared.drain_releases(completed);
        command_buffer.begin_recording(frame, slot, None);
        Ok(command_buffer)
    }

    /// Submit the offscreen frame and wait for it. Readbacks recorded in the
    /// frame are complete when this returns.
    pub fn end_offscreen_frame(&self, _flags: EndFrameFlags) -> FrameOpResult {
        crate::profile_function!();
        let shared = &self.shared;
        let (command_buffer, frame, slot) = {
            let mut state = shared.frame.lock();
            let command_buffer = match (&state.active, &state.offscreen) {
                (Some(ActiveFrame::Offscreen), Some(cb)) => cb.clone(),
                _ => {
                    drop(state);
                    shared.validation_warning(format_args!(
                        "end_offscreen_frame without begin_offscreen_frame"
                    ));
                    return Err(FrameOpError::Error);
                }
            };
            state.active = None;
            (command_buffer, state.number, state.slot)
        };

        let commands = command_buffer.end_recording();
        let result = shared.submit(slot, &commands).and_then(|()| {
            let mut backend = shared.backend();
            backend
                .end_frame(slot, None, false)
                .and_then(|()| backend.wait_idle().map_err(FrameOpError::from))
        });
        let result = result.map_err(|e| shared.frame_error(e));

        {
            let mut state = shared.frame.lock();
            state.slot = (slot + 1) % shared.frames_in_flight;
            if result.is_ok() {
                state.completed = state.completed.max(frame);
            }
        }
        shared.frames_submitted.fetch_add(1, Ordering::Relaxed);
        if result.is_ok() {
            shared.deliver_readbacks(frame);
            shared.drain_releases(frame);
        }
        shared.run_delete_later();
        crate::frame_mark!();
        result
    }

    /// Wait for all submitted work. Inside a frame the commands recorded so
    /// far are submitted first and recording continues afterwards.
    pub fn finish(&self) -> FrameOpResult {
        crate::profile_function!();
        let shared = &self.shared;
        let (active_cb, frame, slot) = {
            let state = shared.frame.lock();
            let cb = match (&state.active, &state.offscreen) {
                (Some(ActiveFrame::SwapChain(sc)), _) => {
                    Some((sc.current_frame_command_buffer(), Some(sc.clone())))
                }
                (Some(ActiveFrame::Offscreen), Some(cb)) => Some((cb.clone(), None)),
                _ => None,
            };
            (cb, state.number, state.slot)
        };

        if let Some((command_buffer, swapchain)) = &active_cb {
            let commands = command_buffer.end_recording();
            shared.submit(slot, &commands)?;
            command_buffer.begin_recording(frame, slot, swapchain.as_ref());
        }
        let result = shared.backend().wait_idle();
        result.map_err(|e| shared.frame_error(e.into()))?;

        // Work of the frame still being recorded is not complete yet.
        let completed = if active_cb.is_some() {
            frame.saturating_sub(1)
        } else {
            frame
        };
        {
            let mut state = shared.frame.lock();
            state.completed = state.completed.max(completed);
        }
        shared.deliver_readbacks(frame);
        shared.drain_releases(completed);
        Ok(())
    }

    /// Whether a frame is currently being recorded.
    pub fn is_recording_frame(&self) -> bool {
        self.shared.frame.lock().active.is_some()
    }

    /// Number of the most recently begun frame.
    pub fn current_frame_number(&self) -> u64 {
        self.shared.frame.lock().number
    }

    /// Frame slot the next or current frame records into.
    pub fn current_frame_slot(&self) -> usize {
        self.shared.frame.lock().slot
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    pub fn backend(&self) -> BackendKind {
        self.shared.kind
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend().name()
    }

    pub fn driver_info(&self) -> DriverInfo {
        self.shared.backend().driver_info()
    }

    pub fn flags(&self) -> RhiFlags {
        self.shared.flags
    }

    pub fn is_feature_supported(&self, feature: Feature) -> bool {
        self.shared.is_feature_supported(feature)
    }

    pub fn resource_limit(&self, limit: ResourceLimit) -> u64 {
        self.shared.resource_limit(limit)
    }

    pub fn is_texture_format_supported(&self, format: TextureFormat, flags: TextureFlags) -> bool {
        self.shared.is_texture_format_supported(format, flags)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.shared.frames_in_flight
    }

    /// Minimum alignment of uniform buffer offsets, including dynamic offsets.
    pub fn ubuf_alignment(&self) -> u32 {
        self.shared.ubuf_alignment()
    }

    /// Round `size` up to [`ubuf_alignment`](Self::ubuf_alignment).
    pub fn ubuf_aligned(&self, size: u32) -> u32 {
        let alignment = self.ubuf_alignment();
        size.div_ceil(alignment) * alignment
    }

    pub fn is_y_up_in_framebuffer(&self) -> bool {
        self.shared.backend().is_y_up_in_framebuffer()
    }

    pub fn is_y_up_in_ndc(&self) -> bool {
        self.shared.backend().is_y_up_in_ndc()
    }

    pub fn is_clip_depth_zero_to_one(&self) -> bool {
        self.shared.backend().is_clip_depth_zero_to_one()
    }

    /// Column-major matrix mapping OpenGL-style clip space (Y up, depth
    /// -1..1) to the backend's clip space.
    pub fn clip_space_corr_matrix(&self) -> [[f32; 4]; 4] {
        let y = if self.is_y_up_in_ndc() { 1.0 } else { -1.0 };
        let (z_scale, z_offset) = if self.is_clip_depth_zero_to_one() {
            (0.5, 0.5)
        } else {
            (1.0, 0.0)
        };
        [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, y, 0.0, 0.0],
            [0.0, 0.0, z_scale, 0.0],
            [0.0, 0.0, z_offset, 1.0],
        ]
    }

    pub fn mip_levels_for_size(&self, size: Size) -> u32 {
        crate::types::mip_levels_for_size(size)
    }

    pub fn size_for_mip_level(&self, level: u32, base: Size) -> Size {
        crate::types::size_for_mip_level(level, base)
    }

    /// True once a frame operation reported device loss. All further frames
    /// fail; the context and its resources must be recreated.
    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Pipeline cache
    // ------------------------------------------------------------------

    /// Serialized pipeline cache. Empty unless the context was created with
    /// [`RhiFlags::ENABLE_PIPELINE_CACHE_DATA_SAVE`] and the backend supports
    /// [`Feature::PipelineCache`].
    pub fn pipeline_cache_data(&self) -> Vec<u8> {
        if !self.shared.flags.contains(RhiFlags::ENABLE_PIPELINE_CACHE_DATA_SAVE) {
            return Vec::new();
        }
        let (data, driver) = {
            let backend = self.shared.backend();
            if !backend.is_feature_supported(Feature::PipelineCache) {
                return Vec::new();
            }
            (backend.pipeline_cache_data(), backend.driver_info())
        };
        let Ok(size) = u32::try_from(data.len()) else {
            log::warn!("Pipeline cache too large to serialize");
            return Vec::new();
        };
        let header = PipelineCacheHeader::new(self.shared.kind, &driver, size);
        let mut out = bytemuck::bytes_of(&header).to_vec();
        out.extend_from_slice(&data);
        out
    }

    /// Seed the pipeline cache with data from [`pipeline_cache_data`](Self::pipeline_cache_data).
    /// Data from another backend, driver or format version is ignored.
    pub fn set_pipeline_cache_data(&self, data: &[u8]) {
        let header_size = std::mem::size_of::<PipelineCacheHeader>();
        let Some(header_bytes) = data.get(..header_size) else {
            log::info!("Ignoring pipeline cache data: too short");
            return;
        };
        let header: PipelineCacheHeader = bytemuck::pod_read_unaligned(header_bytes);
        let payload = &data[header_size..];
        let mut backend = self.shared.backend();
        let expected = PipelineCacheHeader::new(
            self.shared.kind,
            &backend.driver_info(),
            payload.len() as u32,
        );
        if header != expected {
            log::info!(
                "Ignoring pipeline cache data: header {:?} does not match {:?}",
                header,
                expected
            );
            return;
        }
        backend.set_pipeline_cache_data(payload);
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> RhiStatistics {
        let shared = &self.shared;
        let (current_frame, completed_frame) = {
            let state = shared.frame.lock();
            (state.number, state.completed)
        };
        RhiStatistics {
            current_frame,
            completed_frame,
            frames_submitted: shared.frames_submitted.load(Ordering::Relaxed),
            live_resources: shared.live_resources().len(),
            pending_releases: shared.releases.lock().pending_count(),
            pending_readbacks: shared.readbacks.lock().len(),
            update_batches_in_use: shared.batch_pool.lock().in_use(),
            validation_warnings: shared.validation_warnings.load(Ordering::Relaxed),
            backend: shared.backend().statistics(),
        }
    }

    /// Ids, kinds and names of all resources that are currently created.
    pub fn live_resource_report(&self) -> Vec<(ResourceId, ResourceType, Option<String>)> {
        self.shared
            .live_resources()
            .into_iter()
            .filter(|(_, _, r)| r.is_created())
            .map(|(id, ty, r)| (id, ty, r.name()))
            .collect()
    }
}

impl fmt::Debug for Rhi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rhi")
            .field("backend", &self.shared.kind)
            .field("flags", &self.shared.flags)
            .field("frames_in_flight", &self.shared.frames_in_flight)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Rhi: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullInitParams;

    fn null_rhi(flags: RhiFlags) -> Rhi {
        Rhi::create(
            BackendKind::Null,
            InitParams::Null(NullInitParams::default()),
            flags,
        )
        .unwrap()
    }

    #[test]
    fn test_unavailable_backend() {
        let err = Rhi::create(
            BackendKind::Vulkan,
            InitParams::default(),
            RhiFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err, RhiError::BackendUnavailable(BackendKind::Vulkan));
    }

    #[test]
    fn test_ubuf_aligned() {
        let rhi = null_rhi(RhiFlags::empty());
        assert_eq!(rhi.ubuf_alignment(), 256);
        assert_eq!(rhi.ubuf_aligned(1), 256);
        assert_eq!(rhi.ubuf_aligned(256), 256);
        assert_eq!(rhi.ubuf_aligned(257), 512);
    }

    #[test]
    fn test_clip_space_corr_matrix_flips_y_and_depth() {
        let rhi = null_rhi(RhiFlags::empty());
        let m = rhi.clip_space_corr_matrix();
        assert_eq!(m[1][1], -1.0);
        assert_eq!(m[2][2], 0.5);
        assert_eq!(m[3][2], 0.5);
    }

    #[test]
    fn test_pipeline_cache_requires_flag() {
        let rhi = null_rhi(RhiFlags::empty());
        assert!(rhi.pipeline_cache_data().is_empty());

        let rhi = null_rhi(RhiFlags::ENABLE_PIPELINE_CACHE_DATA_SAVE);
        let data = rhi.pipeline_cache_data();
        assert!(data.len() > std::mem::size_of::<PipelineCacheHeader>());
        rhi.set_pipeline_cache_data(&data);
        assert_eq!(rhi.pipeline_cache_data(), data);

        // Foreign data is ignored without a warning.
        rhi.set_pipeline_cache_data(b"not a cache");
        assert_eq!(rhi.statistics().validation_warnings, 0);
    }

    #[test]
    fn test_offscreen_frames_advance_slots() {
        let rhi = null_rhi(RhiFlags::empty());
        for expected in 1..=3 {
            let cb = rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
            assert!(cb.is_recording());
            assert!(rhi.is_recording_frame());
            rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
            assert_eq!(rhi.current_frame_number(), expected);
            assert_eq!(rhi.statistics().completed_frame, expected);
        }
        assert_eq!(rhi.current_frame_slot(), 3 % rhi.frames_in_flight());
        assert_eq!(rhi.statistics().frames_submitted, 3);
    }

    #[test]
    fn test_end_offscreen_frame_without_begin_warns() {
        let rhi = null_rhi(RhiFlags::empty());
        assert_eq!(
            rhi.end_offscreen_frame(EndFrameFlags::empty()),
            Err(FrameOpError::Error)
        );
        assert_eq!(rhi.statistics().validation_warnings, 1);
    }

    #[test]
    fn test_device_loss_is_sticky() {
        let rhi = Rhi::create(
            BackendKind::Null,
            InitParams::Null(NullInitParams::default().with_lose_device_after_frames(1)),
            RhiFlags::empty(),
        )
        .unwrap();
        rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
        rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
        assert!(!rhi.is_device_lost());

        let err = rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap_err();
        assert_eq!(err, FrameOpError::DeviceLost);
        assert!(rhi.is_device_lost());
        assert_eq!(
            rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap_err(),
            FrameOpError::DeviceLost
        );
    }

    #[test]
    fn test_delete_later_outside_frame_destroys_now() {
        let rhi = null_rhi(RhiFlags::empty());
        let sampler = rhi.new_sampler(SamplerDescriptor::linear());
        sampler.create().unwrap();
        sampler.clone().delete_later();
        assert!(!sampler.is_created());
    }

    #[test]
    fn test_delete_later_inside_frame_waits_for_end() {
        let rhi = null_rhi(RhiFlags::empty());
        let sampler = rhi.new_sampler(SamplerDescriptor::linear());
        sampler.create().unwrap();
        rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
        sampler.clone().delete_later();
        assert!(sampler.is_created());
        rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
        assert!(!sampler.is_created());
    }
}
