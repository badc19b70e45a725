//! Render buffer resource.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Feature, NativeHandle, NativeObject};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::{RenderBufferDescriptor, RenderBufferFlags, RenderBufferType, Size, TextureFormat};

#[derive(Debug)]
struct RenderBufferState {
    descriptor: RenderBufferDescriptor,
    native: Option<NativeHandle>,
}

/// Attachment-only image that is never sampled, typically depth-stencil.
///
/// Render buffers let backends use transient or lazily allocated memory.
pub struct RenderBuffer {
    core: ResourceCore,
    state: Mutex<RenderBufferState>,
}

impl RenderBuffer {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: RenderBufferDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(RenderBufferState {
                descriptor,
                native: None,
            }),
        }
    }

    pub fn descriptor(&self) -> RenderBufferDescriptor {
        self.state.lock().descriptor.clone()
    }

    pub fn buffer_type(&self) -> RenderBufferType {
        self.state.lock().descriptor.buffer_type
    }

    pub fn pixel_size(&self) -> Size {
        self.state.lock().descriptor.pixel_size
    }

    pub fn sample_count(&self) -> u32 {
        self.state.lock().descriptor.sample_count
    }

    pub fn flags(&self) -> RenderBufferFlags {
        self.state.lock().descriptor.flags
    }

    /// Format the buffer is allocated with.
    pub fn format(&self) -> TextureFormat {
        self.state.lock().descriptor.effective_format()
    }

    /// Takes effect at the next `create()`.
    pub fn set_pixel_size(&self, size: Size) {
        self.state.lock().descriptor.pixel_size = size;
    }

    /// Takes effect at the next `create()`.
    pub fn set_sample_count(&self, sample_count: u32) {
        self.state.lock().descriptor.sample_count = sample_count;
    }

    pub(crate) fn snapshot(&self, frame: u64) -> Result<NativeHandle, String> {
        let handle = self
            .state
            .lock()
            .native
            .ok_or_else(|| format!("render buffer {} is not created", self.core.label()))?;
        self.core.mark_used(frame);
        Ok(handle)
    }
}

impl RhiResource for RenderBuffer {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::RenderBuffer
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let mut state = self.state.lock();
        let desc = &state.descriptor;
        if desc.pixel_size.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "render buffer {} has an empty size",
                self.core.label()
            )));
        }
        let format = desc.effective_format();
        match desc.buffer_type {
            RenderBufferType::DepthStencil if !format.is_depth_stencil() => {
                return Err(RhiError::InvalidParameter(format!(
                    "depth-stencil render buffer cannot use {format:?}"
                )));
            }
            RenderBufferType::Color if format.is_depth_stencil() || format.is_compressed() => {
                return Err(RhiError::InvalidParameter(format!(
                    "color render buffer cannot use {format:?}"
                )));
            }
            _ => {}
        }
        if desc.sample_count == 0 || !desc.sample_count.is_power_of_two() {
            return Err(RhiError::InvalidParameter(format!(
                "invalid sample count {}",
                desc.sample_count
            )));
        }
        if desc.sample_count > 1 && !shared.is_feature_supported(Feature::MultisampleRenderBuffer)
        {
            return Err(RhiError::FeatureNotSupported(
                "multisample render buffers".to_string(),
            ));
        }

        let handle = shared.backend().create_render_buffer(&state.descriptor)?;
        state.native = Some(handle);
        self.core.bump_generation();
        log::trace!(
            "Created render buffer {} ({:?}, {:?})",
            self.core.label(),
            state.descriptor.buffer_type,
            state.descriptor.pixel_size
        );
        Ok(())
    }

    fn destroy(&self) {
        let Some(handle) = self.state.lock().native.take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::RenderBuffer(handle)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().native.is_some()
    }
}

impl Drop for RenderBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for RenderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RenderBuffer")
            .field("id", &self.core.id())
            .field("type", &state.descriptor.buffer_type)
            .field("pixel_size", &state.descriptor.pixel_size)
            .field("created", &state.native.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderBuffer: Send, Sync);
