//! Render pass descriptors.
//!
//! A render pass descriptor captures the shape of a set of attachments:
//! formats, sample counts, whether there is a depth-stencil attachment and
//! whether multisample resolves happen. Pipelines are built against one, and
//! can be used with any render target whose descriptor is compatible.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{NativeHandle, NativeObject};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::TextureFormat;

/// Format and sample count of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentFormat {
    pub format: TextureFormat,
    pub sample_count: u32,
}

impl AttachmentFormat {
    pub fn new(format: TextureFormat, sample_count: u32) -> Self {
        Self {
            format,
            sample_count,
        }
    }
}

/// Attachment shape of a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassFormat {
    pub colors: Vec<AttachmentFormat>,
    pub depth_stencil: Option<AttachmentFormat>,
    pub has_resolve: bool,
}

impl RenderPassFormat {
    /// Flatten into a comparable blob: color count, then format and sample
    /// count per color attachment, then depth-stencil presence, format and
    /// sample count, then the resolve flag.
    pub fn serialize(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(2 + self.colors.len() * 2 + 4);
        out.push(self.colors.len() as u32);
        for color in &self.colors {
            out.push(color.format as u32);
            out.push(color.sample_count);
        }
        match self.depth_stencil {
            Some(ds) => out.extend([1, ds.format as u32, ds.sample_count]),
            None => out.extend([0, 0, 0]),
        }
        out.push(u32::from(self.has_resolve));
        out
    }
}

/// Backend render pass object describing an attachment shape.
pub struct RenderPassDescriptor {
    core: ResourceCore,
    format: RenderPassFormat,
    serialized: Vec<u32>,
    native: Mutex<Option<NativeHandle>>,
}

impl RenderPassDescriptor {
    pub(crate) fn new(shared: &Arc<RhiShared>, format: RenderPassFormat) -> Self {
        let serialized = format.serialize();
        Self {
            core: ResourceCore::new(shared, None),
            format,
            serialized,
            native: Mutex::new(None),
        }
    }

    pub fn format(&self) -> &RenderPassFormat {
        &self.format
    }

    /// Serialized attachment shape. Two descriptors are compatible exactly
    /// when their blobs are equal, so blobs can be compared without live objects.
    pub fn serialized_format(&self) -> Vec<u32> {
        self.serialized.clone()
    }

    pub fn is_compatible(&self, other: &RenderPassDescriptor) -> bool {
        self.serialized == other.serialized
    }

    pub(crate) fn serialized_ref(&self) -> &[u32] {
        &self.serialized
    }

    pub(crate) fn native(&self) -> Option<NativeHandle> {
        *self.native.lock()
    }
}

impl RhiResource for RenderPassDescriptor {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::RenderPassDescriptor
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();
        let handle = shared.backend().create_render_pass(&self.format)?;
        *self.native.lock() = Some(handle);
        self.core.bump_generation();
        Ok(())
    }

    fn destroy(&self) {
        let Some(handle) = self.native.lock().take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::RenderPass(handle)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.native.lock().is_some()
    }
}

impl Drop for RenderPassDescriptor {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for RenderPassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPassDescriptor")
            .field("id", &self.core.id())
            .field("format", &self.format)
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderPassDescriptor: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_distinguishes_shapes() {
        let color = RenderPassFormat {
            colors: vec![AttachmentFormat::new(TextureFormat::Rgba8, 1)],
            depth_stencil: None,
            has_resolve: false,
        };
        let with_depth = RenderPassFormat {
            depth_stencil: Some(AttachmentFormat::new(TextureFormat::D24S8, 1)),
            ..color.clone()
        };
        let msaa = RenderPassFormat {
            colors: vec![AttachmentFormat::new(TextureFormat::Rgba8, 4)],
            ..color.clone()
        };

        assert_eq!(color.serialize(), color.clone().serialize());
        assert_ne!(color.serialize(), with_depth.serialize());
        assert_ne!(color.serialize(), msaa.serialize());
        assert_eq!(color.serialize(), vec![1, TextureFormat::Rgba8 as u32, 1, 0, 0, 0, 0]);
    }
}
