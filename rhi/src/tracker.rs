//! Per-pass resource usage tracking.
//!
//! While a pass is recorded, every buffer and texture it touches is registered
//! with the access the pass needs and the pipeline stage it first needs it in.
//! A resource may only be used one way within a pass. The only exception is a
//! texture bound both for image load and image store, which coalesces into
//! [`TextureAccess::StorageLoadStore`].
//!
//! When the pass ends the tracker produces one [`Transition`] per resource,
//! from the access the resource had after the previous pass to the access of
//! this one. Backends turn those into barriers or layout transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::NativeHandle;
use crate::command::{Transition, TransitionTarget};
use crate::resource::{ResourceId, RhiResource};
use crate::resources::{Buffer, Texture};
use crate::types::ShaderStageFlags;

/// How a buffer is used within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    VertexInput,
    IndexRead,
    UniformRead,
    StorageLoad,
    StorageStore,
    StorageLoadStore,
}

impl BufferAccess {
    pub fn is_write(self) -> bool {
        matches!(self, Self::StorageStore | Self::StorageLoadStore)
    }
}

/// How a texture is used within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureAccess {
    Sample,
    ColorOutput,
    DepthOutput,
    StorageLoad,
    StorageStore,
    StorageLoadStore,
}

impl TextureAccess {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::ColorOutput | Self::DepthOutput | Self::StorageStore | Self::StorageLoadStore
        )
    }

    fn is_storage(self) -> bool {
        matches!(
            self,
            Self::StorageLoad | Self::StorageStore | Self::StorageLoadStore
        )
    }
}

/// Access to either kind of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAccess {
    Buffer(BufferAccess),
    Texture(TextureAccess),
}

/// Pipeline stages in execution order. Compute sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStage {
    VertexInput,
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    ColorOutput,
    DepthOutput,
    Compute,
}

impl PipelineStage {
    /// Earliest stage in a shader stage mask. Empty masks map to `Vertex`.
    pub fn earliest(stages: ShaderStageFlags) -> Self {
        const ORDER: [(ShaderStageFlags, PipelineStage); 6] = [
            (ShaderStageFlags::VERTEX, PipelineStage::Vertex),
            (
                ShaderStageFlags::TESSELLATION_CONTROL,
                PipelineStage::TessellationControl,
            ),
            (
                ShaderStageFlags::TESSELLATION_EVALUATION,
                PipelineStage::TessellationEvaluation,
            ),
            (ShaderStageFlags::GEOMETRY, PipelineStage::Geometry),
            (ShaderStageFlags::FRAGMENT, PipelineStage::Fragment),
            (ShaderStageFlags::COMPUTE, PipelineStage::Compute),
        ];
        ORDER
            .iter()
            .find(|(flag, _)| stages.contains(*flag))
            .map_or(PipelineStage::Vertex, |(_, stage)| *stage)
    }
}

/// A resource registered with two incompatible accesses in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConflict {
    pub resource: ResourceId,
    pub name: Option<String>,
    pub existing: ResourceAccess,
    pub requested: ResourceAccess,
}

impl fmt::Display for TrackerConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource {}{} used with different accesses within the same pass ({:?} and {:?}), this is not allowed",
            self.resource,
            self.name
                .as_deref()
                .map(|n| format!(" '{n}'"))
                .unwrap_or_default(),
            self.existing,
            self.requested
        )
    }
}

impl std::error::Error for TrackerConflict {}

#[derive(Debug)]
enum TrackedResource {
    Buffer {
        buffer: Arc<Buffer>,
        access: BufferAccess,
        previous: Option<BufferAccess>,
    },
    Texture {
        texture: Arc<Texture>,
        access: TextureAccess,
        previous: Option<TextureAccess>,
    },
}

#[derive(Debug)]
struct TrackedEntry {
    resource: TrackedResource,
    native: NativeHandle,
    stage: PipelineStage,
}

/// Usage bookkeeping for one pass.
///
/// Entries keep the resources alive until the pass ends.
#[derive(Debug, Default)]
pub struct PassResourceTracker {
    entries: Vec<TrackedEntry>,
    index: HashMap<ResourceId, usize>,
    conflicts: Vec<TrackerConflict>,
}

impl PassResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer access. Any second access that differs is a conflict.
    pub fn register_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        native: NativeHandle,
        access: BufferAccess,
        stage: PipelineStage,
    ) -> Result<(), TrackerConflict> {
        let id = buffer.id();
        let Some(&i) = self.index.get(&id) else {
            self.insert(
                id,
                TrackedEntry {
                    resource: TrackedResource::Buffer {
                        buffer: buffer.clone(),
                        access,
                        previous: buffer.usage_state(),
                    },
                    native,
                    stage,
                },
            );
            return Ok(());
        };

        let entry = &mut self.entries[i];
        let existing = match &entry.resource {
            TrackedResource::Buffer { access, .. } => *access,
            TrackedResource::Texture { .. } => unreachable!("resource ids are unique per object"),
        };
        if existing != access {
            return Err(self.conflict(
                id,
                buffer.name(),
                ResourceAccess::Buffer(existing),
                ResourceAccess::Buffer(access),
            ));
        }
        entry.stage = entry.stage.min(stage);
        Ok(())
    }

    /// Register a texture access. Image load and image store coalesce, any
    /// other differing access is a conflict.
    pub fn register_texture(
        &mut self,
        texture: &Arc<Texture>,
        native: NativeHandle,
        access: TextureAccess,
        stage: PipelineStage,
    ) -> Result<(), TrackerConflict> {
        let id = texture.id();
        let Some(&i) = self.index.get(&id) else {
            self.insert(
                id,
                TrackedEntry {
                    resource: TrackedResource::Texture {
                        texture: texture.clone(),
                        access,
                        previous: texture.usage_state(),
                    },
                    native,
                    stage,
                },
            );
            return Ok(());
        };

        let entry = &mut self.entries[i];
        let TrackedResource::Texture {
            access: existing, ..
        } = &mut entry.resource
        else {
            unreachable!("resource ids are unique per object");
        };
        if *existing != access {
            if existing.is_storage() && access.is_storage() {
                *existing = TextureAccess::StorageLoadStore;
            } else {
                let existing = *existing;
                return Err(self.conflict(
                    id,
                    texture.name(),
                    ResourceAccess::Texture(existing),
                    ResourceAccess::Texture(access),
                ));
            }
        }
        entry.stage = entry.stage.min(stage);
        Ok(())
    }

    pub fn buffer_usage(&self, id: ResourceId) -> Option<(BufferAccess, PipelineStage)> {
        let entry = &self.entries[*self.index.get(&id)?];
        match entry.resource {
            TrackedResource::Buffer { access, .. } => Some((access, entry.stage)),
            TrackedResource::Texture { .. } => None,
        }
    }

    pub fn texture_usage(&self, id: ResourceId) -> Option<(TextureAccess, PipelineStage)> {
        let entry = &self.entries[*self.index.get(&id)?];
        match entry.resource {
            TrackedResource::Texture { access, .. } => Some((access, entry.stage)),
            TrackedResource::Buffer { .. } => None,
        }
    }

    /// Conflicts reported since the pass started.
    pub fn conflicts(&self) -> &[TrackerConflict] {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End the pass: store the final accesses on the resources and return the
    /// transitions in registration order. The tracker is empty afterwards.
    pub fn finish(&mut self) -> Vec<Transition> {
        self.index.clear();
        self.conflicts.clear();
        self.entries
            .drain(..)
            .map(|entry| match entry.resource {
                TrackedResource::Buffer {
                    buffer,
                    access,
                    previous,
                } => {
                    buffer.set_usage_state(access);
                    Transition {
                        resource: buffer.id(),
                        target: TransitionTarget::Buffer(entry.native),
                        from: previous.map(ResourceAccess::Buffer),
                        to: ResourceAccess::Buffer(access),
                        stage: entry.stage,
                    }
                }
                TrackedResource::Texture {
                    texture,
                    access,
                    previous,
                } => {
                    texture.set_usage_state(access);
                    Transition {
                        resource: texture.id(),
                        target: TransitionTarget::Texture(entry.native),
                        from: previous.map(ResourceAccess::Texture),
                        to: ResourceAccess::Texture(access),
                        stage: entry.stage,
                    }
                }
            })
            .collect()
    }

    /// Drop all entries without touching the resources.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.conflicts.clear();
    }

    fn insert(&mut self, id: ResourceId, entry: TrackedEntry) {
        self.index.insert(id, self.entries.len());
        self.entries.push(entry);
    }

    fn conflict(
        &mut self,
        resource: ResourceId,
        name: Option<String>,
        existing: ResourceAccess,
        requested: ResourceAccess,
    ) -> TrackerConflict {
        let conflict = TrackerConflict {
            resource,
            name,
            existing,
            requested,
        };
        self.conflicts.push(conflict.clone());
        conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BufferDescriptor, BufferType, BufferUsage, TextureDescriptor, TextureFlags, TextureFormat,
    };
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};

    fn rhi() -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
    }

    fn handle(raw: u64) -> NativeHandle {
        NativeHandle::new(raw).unwrap()
    }

    #[test]
    fn test_earliest_stage() {
        assert_eq!(
            PipelineStage::earliest(ShaderStageFlags::FRAGMENT | ShaderStageFlags::VERTEX),
            PipelineStage::Vertex
        );
        assert_eq!(
            PipelineStage::earliest(ShaderStageFlags::FRAGMENT),
            PipelineStage::Fragment
        );
        assert_eq!(
            PipelineStage::earliest(ShaderStageFlags::COMPUTE),
            PipelineStage::Compute
        );
        assert!(PipelineStage::VertexInput < PipelineStage::Fragment);
    }

    #[test]
    fn test_buffer_load_then_store_conflicts() {
        let rhi = rhi();
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::STORAGE,
            64,
        ));
        let mut tracker = PassResourceTracker::new();

        tracker
            .register_buffer(&buffer, handle(1), BufferAccess::StorageLoad, PipelineStage::Compute)
            .unwrap();
        let err = tracker
            .register_buffer(&buffer, handle(1), BufferAccess::StorageStore, PipelineStage::Compute)
            .unwrap_err();

        assert_eq!(err.resource, buffer.id());
        assert_eq!(tracker.conflicts().len(), 1);
        assert_eq!(
            tracker.buffer_usage(buffer.id()),
            Some((BufferAccess::StorageLoad, PipelineStage::Compute))
        );
    }

    #[test]
    fn test_texture_load_and_store_coalesce() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            16,
            16,
            TextureFormat::Rgba8,
            TextureFlags::USED_WITH_LOAD_STORE,
        ));
        let mut tracker = PassResourceTracker::new();

        tracker
            .register_texture(&texture, handle(7), TextureAccess::StorageLoad, PipelineStage::Compute)
            .unwrap();
        tracker
            .register_texture(&texture, handle(7), TextureAccess::StorageStore, PipelineStage::Compute)
            .unwrap();

        assert!(tracker.conflicts().is_empty());
        assert_eq!(
            tracker.texture_usage(texture.id()),
            Some((TextureAccess::StorageLoadStore, PipelineStage::Compute))
        );
    }

    #[test]
    fn test_texture_sample_vs_output_conflicts() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            16,
            16,
            TextureFormat::Rgba8,
            TextureFlags::RENDER_TARGET,
        ));
        let mut tracker = PassResourceTracker::new();

        tracker
            .register_texture(
                &texture,
                handle(3),
                TextureAccess::ColorOutput,
                PipelineStage::ColorOutput,
            )
            .unwrap();
        assert!(
            tracker
                .register_texture(&texture, handle(3), TextureAccess::Sample, PipelineStage::Fragment)
                .is_err()
        );
    }

    #[test]
    fn test_stage_widens_to_earliest() {
        let rhi = rhi();
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Dynamic,
            BufferUsage::UNIFORM,
            256,
        ));
        let mut tracker = PassResourceTracker::new();

        tracker
            .register_buffer(&buffer, handle(2), BufferAccess::UniformRead, PipelineStage::Fragment)
            .unwrap();
        tracker
            .register_buffer(&buffer, handle(2), BufferAccess::UniformRead, PipelineStage::Vertex)
            .unwrap();

        assert_eq!(
            tracker.buffer_usage(buffer.id()),
            Some((BufferAccess::UniformRead, PipelineStage::Vertex))
        );
    }

    #[test]
    fn test_finish_produces_transitions_and_updates_usage_state() {
        let rhi = rhi();
        let buffer = rhi.new_buffer(BufferDescriptor::new(
            BufferType::Static,
            BufferUsage::VERTEX,
            64,
        ));
        let mut tracker = PassResourceTracker::new();
        tracker
            .register_buffer(&buffer, handle(5), BufferAccess::VertexInput, PipelineStage::VertexInput)
            .unwrap();

        let transitions = tracker.finish();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, None);
        assert_eq!(
            transitions[0].to,
            ResourceAccess::Buffer(BufferAccess::VertexInput)
        );
        assert!(tracker.is_empty());
        assert_eq!(buffer.usage_state(), Some(BufferAccess::VertexInput));

        tracker
            .register_buffer(&buffer, handle(5), BufferAccess::VertexInput, PipelineStage::VertexInput)
            .unwrap();
        let transitions = tracker.finish();
        assert_eq!(
            transitions[0].from,
            Some(ResourceAccess::Buffer(BufferAccess::VertexInput))
        );
    }
}
