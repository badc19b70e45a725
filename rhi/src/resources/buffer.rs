//! Buffer resource.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Feature, NativeBuffer, NativeHandle, NativeObject};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::tracker::BufferAccess;
use crate::types::{BufferDescriptor, BufferType, BufferUsage};

#[derive(Debug, Clone)]
struct DynamicWrite {
    offset: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct BufferState {
    descriptor: BufferDescriptor,
    /// One native buffer, or one per frame slot for dynamic buffers.
    natives: Vec<NativeHandle>,
    /// Writes not yet applied to each slot's native buffer.
    pending_writes: Vec<Vec<DynamicWrite>>,
    uploaded: bool,
    usage_state: Option<BufferAccess>,
}

/// A GPU buffer.
///
/// Buffers are created by [`Rhi::new_buffer`](crate::Rhi::new_buffer) and are
/// reference-counted. Immutable and static buffers own one native buffer.
/// Dynamic buffers own one per frame in flight so the CPU can write the
/// current slot while the GPU reads the others.
///
/// # Example
///
/// ```ignore
/// let ubuf = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 256));
/// ubuf.create()?;
/// ```
pub struct Buffer {
    core: ResourceCore,
    state: Mutex<BufferState>,
}

impl Buffer {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: BufferDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(BufferState {
                descriptor,
                natives: Vec::new(),
                pending_writes: Vec::new(),
                uploaded: false,
                usage_state: None,
            }),
        }
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.state.lock().descriptor.clone()
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u32 {
        self.state.lock().descriptor.size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.state.lock().descriptor.buffer_type
    }

    pub fn usage(&self) -> BufferUsage {
        self.state.lock().descriptor.usage
    }

    /// Takes effect at the next `create()`.
    pub fn set_size(&self, size: u32) {
        self.state.lock().descriptor.size = size;
    }

    /// Takes effect at the next `create()`.
    pub fn set_usage(&self, usage: BufferUsage) {
        self.state.lock().descriptor.usage = usage;
    }

    /// Takes effect at the next `create()`.
    pub fn set_buffer_type(&self, buffer_type: BufferType) {
        self.state.lock().descriptor.buffer_type = buffer_type;
    }

    /// Native buffer objects, one per frame slot for dynamic buffers.
    pub fn native_buffer(&self) -> NativeBuffer {
        NativeBuffer {
            objects: self.state.lock().natives.iter().map(|h| h.raw()).collect(),
        }
    }

    /// Access recorded by the last pass that used this buffer.
    pub fn usage_state(&self) -> Option<BufferAccess> {
        self.state.lock().usage_state
    }

    pub(crate) fn set_usage_state(&self, access: BufferAccess) {
        self.state.lock().usage_state = Some(access);
    }

    /// Resolve the native buffer for `slot`, applying writes still pending
    /// for that slot, and mark the buffer as used by `frame`.
    pub(crate) fn snapshot(&self, slot: usize, frame: u64) -> Result<NativeHandle, String> {
        let mut state = self.state.lock();
        if state.natives.is_empty() {
            return Err(format!("buffer {} is not created", self.core.label()));
        }
        let index = slot % state.natives.len();
        self.flush_pending(&mut state, index)?;
        self.core.mark_used(frame);
        Ok(state.natives[index])
    }

    /// Apply a dynamic update to the current slot now and queue it for the others.
    pub(crate) fn write_dynamic(&self, slot: usize, offset: u32, data: &[u8]) -> Result<(), String> {
        let mut state = self.state.lock();
        if state.natives.is_empty() {
            return Err(format!("buffer {} is not created", self.core.label()));
        }
        if state.descriptor.buffer_type != BufferType::Dynamic {
            return Err(format!("buffer {} is not dynamic", self.core.label()));
        }
        let end = offset as u64 + data.len() as u64;
        if end > state.descriptor.size as u64 {
            return Err(format!(
                "update of {} bytes at offset {} overflows buffer {} of size {}",
                data.len(),
                offset,
                self.core.label(),
                state.descriptor.size
            ));
        }

        let index = slot % state.natives.len();
        self.flush_pending(&mut state, index)?;
        let shared = self.core.shared().ok_or("context lost")?;
        shared
            .backend()
            .write_buffer(state.natives[index], offset, data)
            .map_err(|e| e.to_string())?;

        for (i, pending) in state.pending_writes.iter_mut().enumerate() {
            if i != index {
                pending.push(DynamicWrite {
                    offset,
                    data: data.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Record a static upload. Returns true if an immutable buffer had
    /// already been uploaded before.
    pub(crate) fn mark_uploaded(&self) -> bool {
        let mut state = self.state.lock();
        let again = state.uploaded && state.descriptor.buffer_type == BufferType::Immutable;
        state.uploaded = true;
        again
    }

    fn flush_pending(&self, state: &mut BufferState, index: usize) -> Result<(), String> {
        let Some(pending) = state.pending_writes.get_mut(index) else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }
        let writes = std::mem::take(pending);
        let shared = self.core.shared().ok_or("context lost")?;
        let mut backend = shared.backend();
        for write in writes {
            backend
                .write_buffer(state.natives[index], write.offset, &write.data)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl RhiResource for Buffer {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Buffer
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let mut state = self.state.lock();
        let descriptor = state.descriptor.clone();
        if descriptor.size == 0 {
            return Err(RhiError::InvalidParameter(format!(
                "buffer {} has zero size",
                self.core.label()
            )));
        }
        if descriptor.usage.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "buffer {} has no usage flags",
                self.core.label()
            )));
        }
        if descriptor.usage.contains(BufferUsage::STORAGE)
            && descriptor.buffer_type == BufferType::Dynamic
        {
            return Err(RhiError::InvalidParameter(
                "storage buffers cannot be dynamic".to_string(),
            ));
        }
        if descriptor.usage.contains(BufferUsage::UNIFORM)
            && descriptor.buffer_type != BufferType::Dynamic
            && !shared.is_feature_supported(Feature::NonDynamicUniformBuffers)
        {
            return Err(RhiError::FeatureNotSupported(
                "non-dynamic uniform buffers".to_string(),
            ));
        }

        let count = match descriptor.buffer_type {
            BufferType::Dynamic => shared.frames_in_flight(),
            BufferType::Immutable | BufferType::Static => 1,
        };
        let mut natives = Vec::with_capacity(count);
        {
            let mut backend = shared.backend();
            for _ in 0..count {
                match backend.create_buffer(&descriptor) {
                    Ok(handle) => natives.push(handle),
                    Err(err) => {
                        for handle in natives {
                            backend.release(NativeObject::Buffer(handle));
                        }
                        log::error!("Failed to create buffer {}: {}", self.core.label(), err);
                        return Err(err);
                    }
                }
            }
        }

        state.natives = natives;
        state.pending_writes = vec![Vec::new(); count];
        state.uploaded = false;
        state.usage_state = None;
        self.core.bump_generation();
        log::trace!(
            "Created buffer {} ({:?}, {:?}, {} bytes)",
            self.core.label(),
            descriptor.buffer_type,
            descriptor.usage,
            descriptor.size
        );
        Ok(())
    }

    fn destroy(&self) {
        let natives = {
            let mut state = self.state.lock();
            state.pending_writes.clear();
            std::mem::take(&mut state.natives)
        };
        if natives.is_empty() {
            return;
        }
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                natives.into_iter().map(NativeObject::Buffer).collect(),
                self.core.last_used_frame(),
            );
        }
        log::trace!("Destroyed buffer {}", self.core.label());
    }

    fn is_created(&self) -> bool {
        !self.state.lock().natives.is_empty()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Buffer")
            .field("id", &self.core.id())
            .field("type", &state.descriptor.buffer_type)
            .field("usage", &state.descriptor.usage)
            .field("size", &state.descriptor.size)
            .field("natives", &state.natives.len())
            .finish()
    }
}

// Ensure Buffer is Send + Sync
static_assertions::assert_impl_all!(Buffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendKind, InitParams, NullInitParams, Rhi, RhiFlags};

    fn rhi_with(params: NullInitParams) -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::Null(params), RhiFlags::empty()).unwrap()
    }

    #[test]
    fn test_dynamic_buffer_has_one_native_per_slot() {
        let rhi = rhi_with(NullInitParams::default().with_frames_in_flight(3));
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Dynamic,
            BufferUsage::UNIFORM,
            256,
        ));
        buffer.create().unwrap();
        assert_eq!(buffer.native_buffer().objects.len(), 3);

        let immutable = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Immutable,
            BufferUsage::VERTEX,
            64,
        ));
        immutable.create().unwrap();
        assert_eq!(immutable.native_buffer().objects.len(), 1);
    }

    #[test]
    fn test_invalid_buffers_fail_to_create() {
        let rhi = rhi_with(NullInitParams::default());
        let zero = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::VERTEX,
            0,
        ));
        assert!(matches!(zero.create(), Err(RhiError::InvalidParameter(_))));
        assert!(!zero.is_created());

        let storage = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Dynamic,
            BufferUsage::STORAGE,
            64,
        ));
        assert!(storage.create().is_err());
        storage.destroy();
    }

    #[test]
    fn test_static_uniform_needs_feature() {
        let rhi = rhi_with(
            NullInitParams::default().with_disabled_feature(Feature::NonDynamicUniformBuffers),
        );
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::UNIFORM,
            64,
        ));
        assert!(matches!(
            buffer.create(),
            Err(RhiError::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_resize_by_recreate() {
        let rhi = rhi_with(NullInitParams::default());
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::VERTEX,
            64,
        ));
        buffer.create().unwrap();
        let first = buffer.native_buffer();
        buffer.set_size(128);
        assert_eq!(buffer.size(), 128);
        buffer.create().unwrap();
        assert_ne!(buffer.native_buffer(), first);
    }

    #[test]
    fn test_buffer_debug() {
        let rhi = rhi_with(NullInitParams::default());
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::VERTEX,
            1024,
        ));
        let debug = format!("{:?}", buffer);
        assert!(debug.contains("Buffer"));
        assert!(debug.contains("1024"));
    }
}
