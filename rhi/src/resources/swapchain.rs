//! Swapchains and window surfaces.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use super::{
    AttachmentFormat, RenderBuffer, RenderPassDescriptor, RenderPassFormat, SwapChainRenderTarget,
};
use crate::backend::{Feature, NativeHandle, NativeObject, SwapChainNativeDescriptor};
use crate::command::CommandBuffer;
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::{Size, TextureFormat};

bitflags! {
    /// Swapchain creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SwapChainFlags: u32 {
        const SURFACE_HAS_PREMUL_ALPHA = 1 << 0;
        const SURFACE_HAS_NON_PREMUL_ALPHA = 1 << 1;
        const SRGB = 1 << 2;
        /// Allows reading back the current backbuffer.
        const USED_AS_TRANSFER_SOURCE = 1 << 3;
        const NO_VSYNC = 1 << 4;
        const MINIMAL_BUFFER_COUNT = 1 << 5;
    }
}

/// Window a swapchain presents to.
///
/// The pixel size is owned by the windowing system; update it with
/// [`SurfaceTarget::set_pixel_size`] when the window resizes.
pub struct SurfaceTarget {
    window: RawWindowHandle,
    display: RawDisplayHandle,
    pixel_size: Mutex<Size>,
}

// SAFETY: the raw handles are only passed to the backend, which uses them on
// the thread driving the Rhi. Callers of `new`/`from_raw` keep the window alive.
unsafe impl Send for SurfaceTarget {}
unsafe impl Sync for SurfaceTarget {}

impl SurfaceTarget {
    /// Capture the handles of a window.
    ///
    /// The window must outlive every swapchain using this surface.
    pub fn new<W>(window: &W, pixel_size: Size) -> Result<Arc<Self>, RhiError>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window.window_handle().map_err(|e| {
            RhiError::InvalidParameter(format!("Failed to get window handle: {e}"))
        })?;
        let display_handle = window.display_handle().map_err(|e| {
            RhiError::InvalidParameter(format!("Failed to get display handle: {e}"))
        })?;
        Ok(Arc::new(Self {
            window: window_handle.as_raw(),
            display: display_handle.as_raw(),
            pixel_size: Mutex::new(pixel_size),
        }))
    }

    /// # Safety
    ///
    /// The handles must stay valid for the lifetime of the surface.
    pub unsafe fn from_raw(
        window: RawWindowHandle,
        display: RawDisplayHandle,
        pixel_size: Size,
    ) -> Arc<Self> {
        Arc::new(Self {
            window,
            display,
            pixel_size: Mutex::new(pixel_size),
        })
    }

    pub fn pixel_size(&self) -> Size {
        *self.pixel_size.lock()
    }

    pub fn set_pixel_size(&self, size: Size) {
        *self.pixel_size.lock() = size;
    }
}

impl std::fmt::Debug for SurfaceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceTarget")
            .field("pixel_size", &self.pixel_size())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SwapChainState {
    surface: Option<Arc<SurfaceTarget>>,
    flags: SwapChainFlags,
    format: TextureFormat,
    sample_count: u32,
    depth_stencil: Option<Arc<RenderBuffer>>,
    render_pass: Option<Arc<RenderPassDescriptor>>,
    native: Option<NativeHandle>,
    /// Format and flags the native swapchain was built with.
    native_config: Option<(TextureFormat, u32, SwapChainFlags)>,
    current_pixel_size: Size,
}

/// Presentable image chain for a window.
///
/// Each frame the swapchain hands out a command buffer and a render target
/// for the current backbuffer between `Rhi::begin_frame` and `Rhi::end_frame`.
pub struct SwapChain {
    core: ResourceCore,
    state: Mutex<SwapChainState>,
    command_buffer: Arc<CommandBuffer>,
    render_target: Arc<SwapChainRenderTarget>,
}

impl SwapChain {
    pub(crate) fn new(shared: &Arc<RhiShared>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SwapChain>| Self {
            core: ResourceCore::new(shared, None),
            state: Mutex::new(SwapChainState {
                surface: None,
                flags: SwapChainFlags::empty(),
                format: TextureFormat::Rgba8,
                sample_count: 1,
                depth_stencil: None,
                render_pass: None,
                native: None,
                native_config: None,
                current_pixel_size: Size::default(),
            }),
            command_buffer: Arc::new(CommandBuffer::new(shared)),
            render_target: Arc::new(SwapChainRenderTarget::new(shared, weak.clone())),
        })
    }

    pub fn set_window(&self, surface: &Arc<SurfaceTarget>) {
        self.state.lock().surface = Some(surface.clone());
    }

    pub fn window(&self) -> Option<Arc<SurfaceTarget>> {
        self.state.lock().surface.clone()
    }

    pub fn flags(&self) -> SwapChainFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: SwapChainFlags) {
        self.state.lock().flags = flags;
    }

    pub fn format(&self) -> TextureFormat {
        self.state.lock().format
    }

    /// Backbuffer format. `Rgba8` unless changed.
    pub fn set_format(&self, format: TextureFormat) {
        self.state.lock().format = format;
    }

    pub fn sample_count(&self) -> u32 {
        self.state.lock().sample_count
    }

    /// Multisampled swapchains render into an intermediate target resolved
    /// into the backbuffer.
    pub fn set_sample_count(&self, sample_count: u32) {
        self.state.lock().sample_count = sample_count;
    }

    pub fn depth_stencil(&self) -> Option<Arc<RenderBuffer>> {
        self.state.lock().depth_stencil.clone()
    }

    /// Depth-stencil buffer resized along with the swapchain.
    pub fn set_depth_stencil(&self, depth_stencil: &Arc<RenderBuffer>) {
        self.state.lock().depth_stencil = Some(depth_stencil.clone());
    }

    pub fn render_pass_descriptor(&self) -> Option<Arc<RenderPassDescriptor>> {
        self.state.lock().render_pass.clone()
    }

    pub fn set_render_pass_descriptor(&self, render_pass: &Arc<RenderPassDescriptor>) {
        self.state.lock().render_pass = Some(render_pass.clone());
    }

    /// Attachment shape of the current configuration.
    pub fn render_pass_format(&self) -> RenderPassFormat {
        let state = self.state.lock();
        RenderPassFormat {
            colors: vec![AttachmentFormat::new(state.format, state.sample_count)],
            depth_stencil: state
                .depth_stencil
                .as_ref()
                .map(|ds| AttachmentFormat::new(ds.format(), ds.sample_count())),
            has_resolve: state.sample_count > 1,
        }
    }

    /// New, not yet created, render pass descriptor matching this swapchain.
    pub fn new_compatible_render_pass_descriptor(
        &self,
    ) -> Result<Arc<RenderPassDescriptor>, RhiError> {
        let shared = self.core.try_shared()?;
        let format = self.render_pass_format();
        Ok(shared.register(Arc::new(RenderPassDescriptor::new(&shared, format))))
    }

    /// Size of the window right now. May differ from
    /// [`current_pixel_size`](Self::current_pixel_size) until the next
    /// [`create_or_resize`](Self::create_or_resize).
    pub fn surface_pixel_size(&self) -> Size {
        self.state
            .lock()
            .surface
            .as_ref()
            .map(|s| s.pixel_size())
            .unwrap_or_default()
    }

    /// Size the backbuffers were last built with.
    pub fn current_pixel_size(&self) -> Size {
        self.state.lock().current_pixel_size
    }

    /// Command buffer for the frame being recorded.
    pub fn current_frame_command_buffer(&self) -> Arc<CommandBuffer> {
        self.command_buffer.clone()
    }

    /// Render target for the current backbuffer.
    pub fn current_frame_render_target(&self) -> Arc<SwapChainRenderTarget> {
        self.render_target.clone()
    }

    /// Build the native swapchain, or resize it to the current surface size.
    ///
    /// Fails for an empty surface, which typically means a minimized window;
    /// try again once it has a size.
    pub fn create_or_resize(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        let (surface, format, sample_count, flags, depth_stencil, has_rp, native, config) = {
            let state = self.state.lock();
            (
                state.surface.clone(),
                state.format,
                state.sample_count,
                state.flags,
                state.depth_stencil.clone(),
                state.render_pass.is_some(),
                state.native,
                state.native_config,
            )
        };
        let surface = surface.ok_or_else(|| {
            RhiError::InvalidParameter(format!("swapchain {} has no window", self.core.label()))
        })?;
        let size = surface.pixel_size();
        if size.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "surface of swapchain {} has an empty size",
                self.core.label()
            )));
        }
        if !has_rp {
            return Err(RhiError::InvalidParameter(format!(
                "swapchain {} has no render pass descriptor",
                self.core.label()
            )));
        }
        if !matches!(
            format,
            TextureFormat::Rgba8
                | TextureFormat::Bgra8
                | TextureFormat::Rgba16F
                | TextureFormat::Rgb10A2
        ) {
            return Err(RhiError::InvalidParameter(format!(
                "{format:?} is not a presentable format"
            )));
        }
        if !sample_count.is_power_of_two() {
            return Err(RhiError::InvalidParameter(format!(
                "sample count {sample_count} is not a power of two"
            )));
        }
        if sample_count > 1 && !shared.is_feature_supported(Feature::MultisampleRenderBuffer) {
            return Err(RhiError::FeatureNotSupported(
                "multisample swapchains".into(),
            ));
        }

        let same_config = config == Some((format, sample_count, flags));
        match native {
            Some(handle) if same_config => {
                shared.backend().resize_swapchain(handle, size)?;
                log::debug!("Resized swapchain {} to {}x{}", self.core.label(), size.width, size.height);
            }
            _ => {
                self.destroy();
                let descriptor = SwapChainNativeDescriptor {
                    window: surface.window,
                    display: surface.display,
                    pixel_size: size,
                    format,
                    sample_count,
                    flags,
                };
                let handle = shared.backend().create_swapchain(&descriptor)?;
                let mut state = self.state.lock();
                state.native = Some(handle);
                state.native_config = Some((format, sample_count, flags));
                self.core.bump_generation();
                log::info!(
                    "Created swapchain {} ({:?}, {}x{})",
                    self.core.label(),
                    format,
                    size.width,
                    size.height
                );
            }
        }
        self.state.lock().current_pixel_size = size;

        if let Some(ds) = depth_stencil {
            if ds.pixel_size() != size || !ds.is_created() {
                ds.set_pixel_size(size);
                ds.create()?;
            }
        }
        Ok(())
    }

    pub(crate) fn native(&self) -> Option<NativeHandle> {
        self.state.lock().native
    }
}

impl RhiResource for SwapChain {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::SwapChain
    }

    /// Same as [`SwapChain::create_or_resize`].
    fn create(&self) -> Result<(), RhiError> {
        self.create_or_resize()
    }

    fn destroy(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.native_config = None;
            state.current_pixel_size = Size::default();
            state.native.take()
        };
        let Some(handle) = handle else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::SwapChain(handle)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().native.is_some()
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SwapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SwapChain")
            .field("id", &self.core.id())
            .field("format", &state.format)
            .field("pixel_size", &state.current_pixel_size)
            .field("created", &state.native.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(SwapChain: Send, Sync);
static_assertions::assert_impl_all!(SurfaceTarget: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RenderBufferDescriptor, RenderBufferType};
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};
    use raw_window_handle::{WebDisplayHandle, WebWindowHandle};

    fn surface(width: u32, height: u32) -> Arc<SurfaceTarget> {
        unsafe {
            SurfaceTarget::from_raw(
                RawWindowHandle::Web(WebWindowHandle::new(1)),
                RawDisplayHandle::Web(WebDisplayHandle::new()),
                Size::new(width, height),
            )
        }
    }

    #[test]
    fn test_create_and_resize() {
        let rhi = Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap();
        let window = surface(320, 240);
        let ds = rhi.new_render_buffer(RenderBufferDescriptor::new(
            RenderBufferType::DepthStencil,
            1,
            1,
        ));
        let sc = rhi.new_swapchain();
        sc.set_window(&window);
        sc.set_depth_stencil(&ds);
        let rp = sc.new_compatible_render_pass_descriptor().unwrap();
        rp.create().unwrap();
        sc.set_render_pass_descriptor(&rp);

        sc.create_or_resize().unwrap();
        assert_eq!(sc.current_pixel_size(), Size::new(320, 240));
        assert_eq!(ds.pixel_size(), Size::new(320, 240));

        window.set_pixel_size(Size::new(640, 480));
        assert_eq!(sc.surface_pixel_size(), Size::new(640, 480));
        assert_eq!(sc.current_pixel_size(), Size::new(320, 240));
        sc.create_or_resize().unwrap();
        assert_eq!(sc.current_pixel_size(), Size::new(640, 480));
        assert_eq!(ds.pixel_size(), Size::new(640, 480));
    }

    #[test]
    fn test_empty_surface_fails() {
        let rhi = Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap();
        let sc = rhi.new_swapchain();
        assert!(sc.create_or_resize().is_err());

        sc.set_window(&surface(0, 0));
        let rp = sc.new_compatible_render_pass_descriptor().unwrap();
        sc.set_render_pass_descriptor(&rp);
        assert!(sc.create_or_resize().is_err());
        assert!(!sc.is_created());
    }
}
