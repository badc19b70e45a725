//! Sampler resource.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{NativeHandle, NativeObject};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::{Filter, SamplerDescriptor};

#[derive(Debug)]
struct SamplerState {
    descriptor: SamplerDescriptor,
    native: Option<NativeHandle>,
}

/// Filtering and addressing state. Samplers are independent of textures.
pub struct Sampler {
    core: ResourceCore,
    state: Mutex<SamplerState>,
}

impl Sampler {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: SamplerDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(SamplerState {
                descriptor,
                native: None,
            }),
        }
    }

    pub fn descriptor(&self) -> SamplerDescriptor {
        self.state.lock().descriptor.clone()
    }

    /// Takes effect at the next `create()`.
    pub fn set_descriptor(&self, descriptor: SamplerDescriptor) {
        self.state.lock().descriptor = descriptor;
    }

    pub(crate) fn snapshot(&self, frame: u64) -> Result<NativeHandle, String> {
        let handle = self
            .state
            .lock()
            .native
            .ok_or_else(|| format!("sampler {} is not created", self.core.label()))?;
        self.core.mark_used(frame);
        Ok(handle)
    }
}

impl RhiResource for Sampler {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Sampler
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let mut state = self.state.lock();
        if state.descriptor.mag_filter == Filter::None || state.descriptor.min_filter == Filter::None
        {
            return Err(RhiError::InvalidParameter(
                "Filter::None is only valid as a mipmap filter".to_string(),
            ));
        }
        let handle = shared.backend().create_sampler(&state.descriptor)?;
        state.native = Some(handle);
        self.core.bump_generation();
        Ok(())
    }

    fn destroy(&self) {
        let Some(handle) = self.state.lock().native.take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::Sampler(handle)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().native.is_some()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("id", &self.core.id())
            .field("descriptor", &self.state.lock().descriptor)
            .finish()
    }
}

static_assertions::assert_impl_all!(Sampler: Send, Sync);
