//! Shader resource bindings.
//!
//! A [`ShaderResourceBindings`] object (SRB) is an ordered list of
//! [`Binding`]s tying buffers, textures and samplers to shader binding points.
//! Its *layout* (binding numbers, stage masks, binding kinds and array sizes)
//! is what pipelines are built against. Any SRB with an equal layout can be
//! used with such a pipeline, which is what makes switching per-object
//! resources cheap.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Buffer, Sampler, Texture};
use crate::backend::{NativeHandle, NativeObject};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceId, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::{BufferUsage, ShaderStageFlags, TextureFlags};

/// Kind of a binding. Part of the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer { dynamic_offset: bool },
    SampledTexture,
    Texture,
    Sampler,
    ImageLoad,
    ImageStore,
    ImageLoadStore,
    BufferLoad,
    BufferStore,
    BufferLoadStore,
}

impl BindingKind {
    fn code(&self) -> u32 {
        match self {
            Self::UniformBuffer {
                dynamic_offset: false,
            } => 0,
            Self::UniformBuffer {
                dynamic_offset: true,
            } => 1,
            Self::SampledTexture => 2,
            Self::Texture => 3,
            Self::Sampler => 4,
            Self::ImageLoad => 5,
            Self::ImageStore => 6,
            Self::ImageLoadStore => 7,
            Self::BufferLoad => 8,
            Self::BufferStore => 9,
            Self::BufferLoadStore => 10,
        }
    }
}

/// Resource referenced by a binding.
#[derive(Debug, Clone)]
pub enum BindingResource {
    Buffer {
        buffer: Arc<Buffer>,
        offset: u32,
        /// `None` binds the rest of the buffer.
        size: Option<u32>,
    },
    SampledTextures(Vec<(Arc<Texture>, Arc<Sampler>)>),
    Textures(Vec<Arc<Texture>>),
    Samplers(Vec<Arc<Sampler>>),
    Image {
        texture: Arc<Texture>,
        level: u32,
    },
}

/// Layout of one binding, independent of the bound resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub stages: ShaderStageFlags,
    pub kind: BindingKind,
    pub array_size: u32,
}

/// One entry of a shader resource bindings list.
#[derive(Debug, Clone)]
pub struct Binding {
    pub binding: u32,
    pub stages: ShaderStageFlags,
    pub kind: BindingKind,
    pub resource: BindingResource,
}

impl Binding {
    fn buffer_binding(
        binding: u32,
        stages: ShaderStageFlags,
        kind: BindingKind,
        buffer: &Arc<Buffer>,
        offset: u32,
        size: Option<u32>,
    ) -> Self {
        Self {
            binding,
            stages,
            kind,
            resource: BindingResource::Buffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
        }
    }

    fn image_binding(
        binding: u32,
        stages: ShaderStageFlags,
        kind: BindingKind,
        texture: &Arc<Texture>,
        level: u32,
    ) -> Self {
        Self {
            binding,
            stages,
            kind,
            resource: BindingResource::Image {
                texture: texture.clone(),
                level,
            },
        }
    }

    /// Whole buffer as a uniform block.
    pub fn uniform_buffer(binding: u32, stages: ShaderStageFlags, buffer: &Arc<Buffer>) -> Self {
        Self::uniform_buffer_range(binding, stages, buffer, 0, None)
    }

    /// Range of a buffer as a uniform block.
    pub fn uniform_buffer_range(
        binding: u32,
        stages: ShaderStageFlags,
        buffer: &Arc<Buffer>,
        offset: u32,
        size: Option<u32>,
    ) -> Self {
        Self::buffer_binding(
            binding,
            stages,
            BindingKind::UniformBuffer {
                dynamic_offset: false,
            },
            buffer,
            offset,
            size,
        )
    }

    /// Uniform block of `size` bytes whose offset is supplied at
    /// `set_shader_resources` time.
    pub fn uniform_buffer_with_dynamic_offset(
        binding: u32,
        stages: ShaderStageFlags,
        buffer: &Arc<Buffer>,
        size: u32,
    ) -> Self {
        Self::buffer_binding(
            binding,
            stages,
            BindingKind::UniformBuffer {
                dynamic_offset: true,
            },
            buffer,
            0,
            Some(size),
        )
    }

    pub fn sampled_texture(
        binding: u32,
        stages: ShaderStageFlags,
        texture: &Arc<Texture>,
        sampler: &Arc<Sampler>,
    ) -> Self {
        Self::sampled_textures(binding, stages, &[(texture.clone(), sampler.clone())])
    }

    /// Array of combined image samplers.
    pub fn sampled_textures(
        binding: u32,
        stages: ShaderStageFlags,
        pairs: &[(Arc<Texture>, Arc<Sampler>)],
    ) -> Self {
        Self {
            binding,
            stages,
            kind: BindingKind::SampledTexture,
            resource: BindingResource::SampledTextures(pairs.to_vec()),
        }
    }

    /// Separate texture, sampled with a separate sampler.
    pub fn texture(binding: u32, stages: ShaderStageFlags, texture: &Arc<Texture>) -> Self {
        Self::textures(binding, stages, &[texture.clone()])
    }

    pub fn textures(binding: u32, stages: ShaderStageFlags, textures: &[Arc<Texture>]) -> Self {
        Self {
            binding,
            stages,
            kind: BindingKind::Texture,
            resource: BindingResource::Textures(textures.to_vec()),
        }
    }

    pub fn sampler(binding: u32, stages: ShaderStageFlags, sampler: &Arc<Sampler>) -> Self {
        Self::samplers(binding, stages, &[sampler.clone()])
    }

    pub fn samplers(binding: u32, stages: ShaderStageFlags, samplers: &[Arc<Sampler>]) -> Self {
        Self {
            binding,
            stages,
            kind: BindingKind::Sampler,
            resource: BindingResource::Samplers(samplers.to_vec()),
        }
    }

    pub fn image_load(
        binding: u32,
        stages: ShaderStageFlags,
        texture: &Arc<Texture>,
        level: u32,
    ) -> Self {
        Self::image_binding(binding, stages, BindingKind::ImageLoad, texture, level)
    }

    pub fn image_store(
        binding: u32,
        stages: ShaderStageFlags,
        texture: &Arc<Texture>,
        level: u32,
    ) -> Self {
        Self::image_binding(binding, stages, BindingKind::ImageStore, texture, level)
    }

    pub fn image_load_store(
        binding: u32,
        stages: ShaderStageFlags,
        texture: &Arc<Texture>,
        level: u32,
    ) -> Self {
        Self::image_binding(binding, stages, BindingKind::ImageLoadStore, texture, level)
    }

    pub fn buffer_load(binding: u32, stages: ShaderStageFlags, buffer: &Arc<Buffer>) -> Self {
        Self::buffer_binding(binding, stages, BindingKind::BufferLoad, buffer, 0, None)
    }

    pub fn buffer_store(binding: u32, stages: ShaderStageFlags, buffer: &Arc<Buffer>) -> Self {
        Self::buffer_binding(binding, stages, BindingKind::BufferStore, buffer, 0, None)
    }

    pub fn buffer_load_store(
        binding: u32,
        stages: ShaderStageFlags,
        buffer: &Arc<Buffer>,
    ) -> Self {
        Self::buffer_binding(binding, stages, BindingKind::BufferLoadStore, buffer, 0, None)
    }

    /// Number of array elements. 1 for non-array bindings.
    pub fn array_size(&self) -> u32 {
        match &self.resource {
            BindingResource::SampledTextures(pairs) => pairs.len() as u32,
            BindingResource::Textures(textures) => textures.len() as u32,
            BindingResource::Samplers(samplers) => samplers.len() as u32,
            BindingResource::Buffer { .. } | BindingResource::Image { .. } => 1,
        }
    }

    pub fn layout_entry(&self) -> BindingLayoutEntry {
        BindingLayoutEntry {
            binding: self.binding,
            stages: self.stages,
            kind: self.kind,
            array_size: self.array_size(),
        }
    }

    /// Ids and generations of every referenced resource.
    fn resource_generations(&self) -> Vec<(ResourceId, u32)> {
        let of = |r: &dyn RhiResource| (r.id(), r.core().generation());
        match &self.resource {
            BindingResource::Buffer { buffer, .. } => vec![of(buffer.as_ref())],
            BindingResource::SampledTextures(pairs) => pairs
                .iter()
                .flat_map(|(t, s)| [of(t.as_ref()), of(s.as_ref())])
                .collect(),
            BindingResource::Textures(textures) => {
                textures.iter().map(|t| of(t.as_ref())).collect()
            }
            BindingResource::Samplers(samplers) => {
                samplers.iter().map(|s| of(s.as_ref())).collect()
            }
            BindingResource::Image { texture, .. } => vec![of(texture.as_ref())],
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.array_size() == 0 {
            return Err(format!("binding {} is an empty array", self.binding));
        }
        match (&self.resource, self.kind) {
            (
                BindingResource::Buffer {
                    buffer,
                    offset,
                    size,
                },
                kind,
            ) => {
                if !buffer.is_created() {
                    return Err(format!("binding {}: buffer is not created", self.binding));
                }
                let required = match kind {
                    BindingKind::UniformBuffer { .. } => BufferUsage::UNIFORM,
                    _ => BufferUsage::STORAGE,
                };
                if !buffer.usage().contains(required) {
                    return Err(format!(
                        "binding {}: buffer lacks {:?} usage",
                        self.binding, required
                    ));
                }
                let end = u64::from(*offset) + u64::from(size.unwrap_or(0));
                if end > u64::from(buffer.size()) || *offset >= buffer.size() {
                    return Err(format!(
                        "binding {}: range exceeds buffer size {}",
                        self.binding,
                        buffer.size()
                    ));
                }
            }
            (BindingResource::Image { texture, level }, _) => {
                if !texture.is_created() {
                    return Err(format!("binding {}: texture is not created", self.binding));
                }
                if !texture.flags().contains(TextureFlags::USED_WITH_LOAD_STORE) {
                    return Err(format!(
                        "binding {}: texture lacks USED_WITH_LOAD_STORE",
                        self.binding
                    ));
                }
                if *level >= texture.mip_level_count() {
                    return Err(format!(
                        "binding {}: mip level {} out of range",
                        self.binding, level
                    ));
                }
            }
            (BindingResource::SampledTextures(pairs), _) => {
                if pairs
                    .iter()
                    .any(|(t, s)| !t.is_created() || !s.is_created())
                {
                    return Err(format!(
                        "binding {}: texture or sampler is not created",
                        self.binding
                    ));
                }
            }
            (BindingResource::Textures(textures), _) => {
                if textures.iter().any(|t| !t.is_created()) {
                    return Err(format!("binding {}: texture is not created", self.binding));
                }
            }
            (BindingResource::Samplers(samplers), _) => {
                if samplers.iter().any(|s| !s.is_created()) {
                    return Err(format!("binding {}: sampler is not created", self.binding));
                }
            }
        }
        Ok(())
    }
}

/// Serialize a layout into a comparable blob of four words per binding.
pub(crate) fn serialize_layout(layout: &[BindingLayoutEntry]) -> Vec<u32> {
    layout
        .iter()
        .flat_map(|e| [e.binding, e.stages.bits(), e.kind.code(), e.array_size])
        .collect()
}

#[derive(Debug)]
struct SrbState {
    bindings: Vec<Binding>,
    layout: Vec<BindingLayoutEntry>,
    layout_description: Vec<u32>,
    layout_hash: u64,
    created: Option<CreatedSrb>,
}

/// What the native object was built from. Fixed until the next `create()`.
#[derive(Debug)]
struct CreatedSrb {
    native: NativeHandle,
    bindings: Vec<Binding>,
    layout_description: Vec<u32>,
    bound_generations: Vec<(ResourceId, u32)>,
}

/// Snapshot handed to command buffers.
pub(crate) struct SrbSnapshot {
    pub native: NativeHandle,
    pub bindings: Vec<Binding>,
    pub layout_description: Vec<u32>,
    /// Some bound resource was re-created since the last snapshot.
    pub stale: bool,
}

/// Set of resources bound to shader binding points.
pub struct ShaderResourceBindings {
    core: ResourceCore,
    state: Mutex<SrbState>,
}

impl ShaderResourceBindings {
    pub(crate) fn new(shared: &Arc<RhiShared>) -> Self {
        Self {
            core: ResourceCore::new(shared, None),
            state: Mutex::new(SrbState {
                bindings: Vec::new(),
                layout: Vec::new(),
                layout_description: Vec::new(),
                layout_hash: layout_hash(&[]),
                created: None,
            }),
        }
    }

    /// Replace the binding list. Command buffers keep using the bindings of
    /// the last `create()` until `create()` is called again; the layout
    /// queries below describe the new list right away.
    pub fn set_bindings(&self, mut bindings: Vec<Binding>) {
        bindings.sort_by_key(|b| b.binding);
        let layout: Vec<_> = bindings.iter().map(Binding::layout_entry).collect();
        let description = serialize_layout(&layout);
        let mut state = self.state.lock();
        state.layout_hash = layout_hash(&description);
        state.layout_description = description;
        state.layout = layout;
        state.bindings = bindings;
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.clone()
    }

    pub fn layout(&self) -> Vec<BindingLayoutEntry> {
        self.state.lock().layout.clone()
    }

    /// Four words per binding: binding number, stage mask, kind, array size.
    pub fn serialized_layout_description(&self) -> Vec<u32> {
        self.state.lock().layout_description.clone()
    }

    pub fn layout_hash(&self) -> u64 {
        self.state.lock().layout_hash
    }

    /// True when both have the same binding numbers, stage masks, kinds and
    /// array sizes, pairwise. Reflexive and symmetric.
    pub fn is_layout_compatible(&self, other: &ShaderResourceBindings) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let (hash, description) = {
            let state = self.state.lock();
            (state.layout_hash, state.layout_description.clone())
        };
        let other = other.state.lock();
        hash == other.layout_hash && description == other.layout_description
    }

    /// Native layout object and the layout it was created with.
    pub(crate) fn created_layout(&self) -> Option<(NativeHandle, Vec<u32>)> {
        let state = self.state.lock();
        let created = state.created.as_ref()?;
        Some((created.native, created.layout_description.clone()))
    }

    pub(crate) fn snapshot(&self) -> Option<SrbSnapshot> {
        let (native, bindings, layout_description, recorded) = {
            let state = self.state.lock();
            let created = state.created.as_ref()?;
            (
                created.native,
                created.bindings.clone(),
                created.layout_description.clone(),
                created.bound_generations.clone(),
            )
        };
        let current: Vec<_> = bindings
            .iter()
            .flat_map(Binding::resource_generations)
            .collect();
        let stale = current != recorded;
        if stale {
            log::debug!(
                "Shader resource bindings {} refer to re-created resources, refreshing",
                self.core.label()
            );
            if let Some(created) = self.state.lock().created.as_mut() {
                created.bound_generations = current;
            }
        }
        Some(SrbSnapshot {
            native,
            bindings,
            layout_description,
            stale,
        })
    }
}

fn layout_hash(description: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    description.hash(&mut hasher);
    hasher.finish()
}

impl RhiResource for ShaderResourceBindings {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::ShaderResourceBindings
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let (bindings, layout, layout_description) = {
            let state = self.state.lock();
            (
                state.bindings.clone(),
                state.layout.clone(),
                state.layout_description.clone(),
            )
        };
        if let Some(pair) = bindings.windows(2).find(|w| w[0].binding == w[1].binding) {
            return Err(RhiError::InvalidParameter(format!(
                "duplicate binding {} in shader resource bindings {}",
                pair[0].binding,
                self.core.label()
            )));
        }
        for binding in &bindings {
            binding.validate().map_err(RhiError::InvalidParameter)?;
        }

        let handle = shared.backend().create_shader_resource_bindings(&layout)?;
        let generations = bindings
            .iter()
            .flat_map(Binding::resource_generations)
            .collect();

        log::trace!(
            "Created shader resource bindings {} with {} bindings",
            self.core.label(),
            bindings.len()
        );
        self.state.lock().created = Some(CreatedSrb {
            native: handle,
            bindings,
            layout_description,
            bound_generations: generations,
        });
        self.core.bump_generation();
        Ok(())
    }

    fn destroy(&self) {
        let Some(CreatedSrb { native: handle, .. }) = self.state.lock().created.take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::ShaderResourceBindings(handle)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().created.is_some()
    }
}

impl Drop for ShaderResourceBindings {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ShaderResourceBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ShaderResourceBindings")
            .field("id", &self.core.id())
            .field("layout", &state.layout)
            .field("created", &state.created.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(ShaderResourceBindings: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferDescriptor, BufferType, SamplerDescriptor};
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};

    fn rhi() -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
    }

    #[test]
    fn test_layout_ignores_resources() {
        let rhi = rhi();
        let a = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        let b = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 128));
        let stages = ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT;

        let srb1 = rhi.new_shader_resource_bindings();
        srb1.set_bindings(vec![Binding::uniform_buffer(0, stages, &a)]);
        let srb2 = rhi.new_shader_resource_bindings();
        srb2.set_bindings(vec![Binding::uniform_buffer(0, stages, &b)]);

        assert!(srb1.is_layout_compatible(&srb1));
        assert!(srb1.is_layout_compatible(&srb2));
        assert!(srb2.is_layout_compatible(&srb1));
        assert_eq!(srb1.layout_hash(), srb2.layout_hash());
    }

    #[test]
    fn test_layout_differs_on_stage_or_kind() {
        let rhi = rhi();
        let ubuf = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        let sampler = rhi.new_sampler(SamplerDescriptor::linear());

        let vs = rhi.new_shader_resource_bindings();
        vs.set_bindings(vec![Binding::uniform_buffer(0, ShaderStageFlags::VERTEX, &ubuf)]);
        let fs = rhi.new_shader_resource_bindings();
        fs.set_bindings(vec![Binding::uniform_buffer(0, ShaderStageFlags::FRAGMENT, &ubuf)]);
        let smp = rhi.new_shader_resource_bindings();
        smp.set_bindings(vec![Binding::sampler(0, ShaderStageFlags::VERTEX, &sampler)]);

        assert!(!vs.is_layout_compatible(&fs));
        assert!(!fs.is_layout_compatible(&vs));
        assert!(!vs.is_layout_compatible(&smp));
    }

    #[test]
    fn test_duplicate_binding_fails() {
        let rhi = rhi();
        let ubuf = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        ubuf.create().unwrap();
        let srb = rhi.new_shader_resource_bindings();
        srb.set_bindings(vec![
            Binding::uniform_buffer(1, ShaderStageFlags::VERTEX, &ubuf),
            Binding::uniform_buffer(1, ShaderStageFlags::FRAGMENT, &ubuf),
        ]);
        assert!(matches!(srb.create(), Err(RhiError::InvalidParameter(_))));
        assert!(!srb.is_created());
    }

    #[test]
    fn test_uncreated_resource_fails() {
        let rhi = rhi();
        let ubuf = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        let srb = rhi.new_shader_resource_bindings();
        srb.set_bindings(vec![Binding::uniform_buffer(0, ShaderStageFlags::VERTEX, &ubuf)]);
        assert!(srb.create().is_err());
        ubuf.create().unwrap();
        srb.create().unwrap();
    }

    #[test]
    fn test_snapshot_detects_recreated_resources() {
        let rhi = rhi();
        let ubuf = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        ubuf.create().unwrap();
        let srb = rhi.new_shader_resource_bindings();
        srb.set_bindings(vec![Binding::uniform_buffer(0, ShaderStageFlags::VERTEX, &ubuf)]);
        srb.create().unwrap();

        assert!(!srb.snapshot().unwrap().stale);
        ubuf.create().unwrap();
        assert!(srb.snapshot().unwrap().stale);
        assert!(!srb.snapshot().unwrap().stale);
    }
}
