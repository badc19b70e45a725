//! Resource identity and lifecycle.
//!
//! Every RHI object carries a [`ResourceCore`]: a process-wide unique id, an
//! optional debug name and a weak reference to the context that created it.
//! Resources are two-phase initialized: the `Rhi::new_*` factories return an
//! uncreated object, setters adjust its description, and [`RhiResource::create`]
//! allocates the native backing. `destroy()` is idempotent and defers the
//! native release until no in-flight frame references the object.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::RhiError;
use crate::rhi::{Rhi, RhiShared};

/// Process-wide unique resource identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resource kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Buffer,
    Texture,
    Sampler,
    RenderBuffer,
    RenderPassDescriptor,
    SwapChainRenderTarget,
    TextureRenderTarget,
    ShaderResourceBindings,
    GraphicsPipeline,
    ComputePipeline,
    SwapChain,
    CommandBuffer,
}

/// State shared by every resource type.
pub struct ResourceCore {
    id: ResourceId,
    name: Mutex<Option<String>>,
    rhi: Weak<RhiShared>,
    /// Number of the last frame whose commands referenced this resource.
    last_used_frame: AtomicU64,
    /// Bumped by every successful `create()`.
    generation: AtomicU32,
}

impl ResourceCore {
    pub(crate) fn new(rhi: &Arc<RhiShared>, name: Option<String>) -> Self {
        Self {
            id: ResourceId::next(),
            name: Mutex::new(name),
            rhi: Arc::downgrade(rhi),
            last_used_frame: AtomicU64::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = Some(name.to_string());
    }

    /// The owning context, if it is still alive.
    pub(crate) fn shared(&self) -> Option<Arc<RhiShared>> {
        self.rhi.upgrade()
    }

    pub(crate) fn try_shared(&self) -> Result<Arc<RhiShared>, RhiError> {
        self.shared().ok_or(RhiError::ContextLost)
    }

    pub(crate) fn mark_used(&self, frame: u64) {
        self.last_used_frame.fetch_max(frame, Ordering::AcqRel);
    }

    pub(crate) fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Label used in log messages.
    pub(crate) fn label(&self) -> String {
        match self.name.lock().as_deref() {
            Some(name) => format!("{} '{}'", self.id, name),
            None => self.id.to_string(),
        }
    }
}

impl fmt::Debug for ResourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCore")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Common interface of all RHI resources.
pub trait RhiResource: Send + Sync {
    #[doc(hidden)]
    fn core(&self) -> &ResourceCore;

    fn resource_type(&self) -> ResourceType;

    /// Allocate the native backing, destroying any previous one first.
    ///
    /// On failure the resource stays safely destroyable.
    fn create(&self) -> Result<(), RhiError>;

    /// Release the native backing. Idempotent.
    ///
    /// Native objects possibly referenced by an in-flight frame are released
    /// once that frame has completed.
    fn destroy(&self);

    fn is_created(&self) -> bool;

    fn id(&self) -> ResourceId {
        self.core().id()
    }

    fn name(&self) -> Option<String> {
        self.core().name()
    }

    fn set_name(&self, name: &str) {
        self.core().set_name(name);
    }

    /// The context that created this resource, if it still exists.
    fn rhi(&self) -> Option<Rhi> {
        self.core().shared().map(Rhi::from_shared)
    }

    /// Destroy after the frame currently being recorded has been submitted,
    /// or right away when no frame is active.
    fn delete_later(self: Arc<Self>)
    where
        Self: Sized + 'static,
    {
        match self.core().shared() {
            Some(shared) => shared.delete_later(self),
            None => self.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ids_are_unique_and_increasing() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert!(b > a);
        assert_ne!(a, b);
        assert!(a.to_string().starts_with('#'));
    }
}
