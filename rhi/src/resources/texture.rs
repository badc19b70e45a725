//! Texture resource.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Feature, NativeHandle, NativeObject, NativeTexture, ResourceLimit};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::tracker::TextureAccess;
use crate::types::{Size, TextureDescriptor, TextureFlags, TextureFormat};

#[derive(Debug)]
struct TextureState {
    descriptor: TextureDescriptor,
    native: Option<NativeHandle>,
    /// Imported with `create_from`; the native object is not ours to free.
    imported: bool,
    usage_state: Option<TextureAccess>,
}

/// A GPU texture.
///
/// Flags such as [`TextureFlags::RENDER_TARGET`] or
/// [`TextureFlags::USED_AS_TRANSFER_SOURCE`] must be set before `create()`.
pub struct Texture {
    core: ResourceCore,
    state: Mutex<TextureState>,
}

impl Texture {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: TextureDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(TextureState {
                descriptor,
                native: None,
                imported: false,
                usage_state: None,
            }),
        }
    }

    pub fn descriptor(&self) -> TextureDescriptor {
        self.state.lock().descriptor.clone()
    }

    pub fn format(&self) -> TextureFormat {
        self.state.lock().descriptor.format
    }

    pub fn pixel_size(&self) -> Size {
        self.state.lock().descriptor.pixel_size
    }

    pub fn flags(&self) -> TextureFlags {
        self.state.lock().descriptor.flags
    }

    pub fn sample_count(&self) -> u32 {
        self.state.lock().descriptor.sample_count
    }

    pub fn mip_level_count(&self) -> u32 {
        self.state.lock().descriptor.mip_level_count()
    }

    /// Takes effect at the next `create()`.
    pub fn set_pixel_size(&self, size: Size) {
        self.state.lock().descriptor.pixel_size = size;
    }

    /// Takes effect at the next `create()`.
    pub fn set_format(&self, format: TextureFormat) {
        self.state.lock().descriptor.format = format;
    }

    /// Takes effect at the next `create()`.
    pub fn set_flags(&self, flags: TextureFlags) {
        self.state.lock().descriptor.flags = flags;
    }

    /// Takes effect at the next `create()`.
    pub fn set_sample_count(&self, sample_count: u32) {
        self.state.lock().descriptor.sample_count = sample_count;
    }

    /// Takes effect at the next `create()`.
    pub fn set_depth(&self, depth: u32) {
        self.state.lock().descriptor.depth = depth;
    }

    /// Takes effect at the next `create()`.
    pub fn set_array_size(&self, array_size: u32) {
        self.state.lock().descriptor.array_size = array_size;
    }

    /// Wrap an existing native texture described by the current descriptor.
    ///
    /// The texture does not take ownership: `destroy()` forgets the native
    /// object without freeing it.
    pub fn create_from(&self, native: NativeTexture) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let mut state = self.state.lock();
        self.validate(&shared, &state.descriptor)?;
        let handle = shared.backend().import_texture(&state.descriptor, native)?;
        state.native = Some(handle);
        state.imported = true;
        state.usage_state = None;
        self.core.bump_generation();
        log::debug!(
            "Imported native texture {:#x} as {}",
            native.object,
            self.core.label()
        );
        Ok(())
    }

    /// The native texture object, if created.
    pub fn native_texture(&self) -> Option<NativeTexture> {
        let handle = self.state.lock().native?;
        let shared = self.core.shared()?;
        let native = shared.backend().native_texture(handle);
        native
    }

    /// Access recorded by the last pass that used this texture.
    pub fn usage_state(&self) -> Option<TextureAccess> {
        self.state.lock().usage_state
    }

    pub(crate) fn set_usage_state(&self, access: TextureAccess) {
        self.state.lock().usage_state = Some(access);
    }

    /// Resolve the native texture and mark it as used by `frame`.
    pub(crate) fn snapshot(&self, frame: u64) -> Result<NativeHandle, String> {
        let handle = self
            .state
            .lock()
            .native
            .ok_or_else(|| format!("texture {} is not created", self.core.label()))?;
        self.core.mark_used(frame);
        Ok(handle)
    }

    fn validate(&self, shared: &RhiShared, desc: &TextureDescriptor) -> Result<(), RhiError> {
        let label = self.core.label();
        let invalid = |msg: String| Err(RhiError::InvalidParameter(msg));
        let unsupported = |what: &str| {
            Err(RhiError::FeatureNotSupported(format!(
                "{what} (texture {label})"
            )))
        };

        if desc.pixel_size.is_empty() {
            return invalid(format!("texture {label} has an empty size"));
        }
        let max = shared.resource_limit(ResourceLimit::TextureSizeMax);
        if u64::from(desc.pixel_size.width) > max || u64::from(desc.pixel_size.height) > max {
            return invalid(format!(
                "texture {label} size {}x{} exceeds the maximum of {max}",
                desc.pixel_size.width, desc.pixel_size.height
            ));
        }
        if desc.sample_count == 0 || !desc.sample_count.is_power_of_two() {
            return invalid(format!(
                "texture {label} has invalid sample count {}",
                desc.sample_count
            ));
        }

        let flags = desc.flags;
        if desc.sample_count > 1 {
            if !shared.is_feature_supported(Feature::MultisampleTexture) {
                return unsupported("multisample textures");
            }
            if flags.contains(TextureFlags::MIP_MAPPED) {
                return invalid(format!("multisample texture {label} cannot have mipmaps"));
            }
        }
        if flags.contains(TextureFlags::CUBE_MAP) {
            if desc.pixel_size.width != desc.pixel_size.height {
                return invalid(format!("cube map {label} is not square"));
            }
            if flags.intersects(TextureFlags::THREE_DIMENSIONAL | TextureFlags::TEXTURE_ARRAY) {
                return invalid(format!(
                    "cube map {label} cannot be a 3D texture or an array"
                ));
            }
        }
        if flags.contains(TextureFlags::THREE_DIMENSIONAL) {
            if !shared.is_feature_supported(Feature::ThreeDimensionalTextures) {
                return unsupported("3D textures");
            }
            if desc.depth == 0 {
                return invalid(format!("3D texture {label} has zero depth"));
            }
        }
        if flags.contains(TextureFlags::TEXTURE_ARRAY) {
            if !shared.is_feature_supported(Feature::TextureArrays) {
                return unsupported("texture arrays");
            }
            let max_layers = shared.resource_limit(ResourceLimit::TextureArraySizeMax);
            if desc.array_size == 0 || u64::from(desc.array_size) > max_layers {
                return invalid(format!(
                    "texture array {label} has invalid size {}",
                    desc.array_size
                ));
            }
        }
        if flags.contains(TextureFlags::ONE_DIMENSIONAL)
            && !shared.is_feature_supported(Feature::OneDimensionalTextures)
        {
            return unsupported("1D textures");
        }
        if flags.contains(TextureFlags::USED_WITH_LOAD_STORE) && desc.format.is_compressed() {
            return invalid(format!(
                "compressed texture {label} cannot be used for image load/store"
            ));
        }
        if flags.contains(TextureFlags::RENDER_TARGET) && desc.format.is_compressed() {
            return invalid(format!("compressed texture {label} cannot be rendered to"));
        }
        if !shared.is_texture_format_supported(desc.format, flags) {
            return Err(RhiError::FeatureNotSupported(format!(
                "texture format {:?} with flags {:?}",
                desc.format, flags
            )));
        }
        Ok(())
    }
}

impl RhiResource for Texture {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Texture
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let mut state = self.state.lock();
        self.validate(&shared, &state.descriptor)?;
        let handle = shared
            .backend()
            .create_texture(&state.descriptor)
            .inspect_err(|err| {
                log::error!("Failed to create texture {}: {}", self.core.label(), err)
            })?;

        state.native = Some(handle);
        state.imported = false;
        state.usage_state = None;
        self.core.bump_generation();
        log::trace!(
            "Created texture {} ({:?}, {}x{}, {:?})",
            self.core.label(),
            state.descriptor.format,
            state.descriptor.pixel_size.width,
            state.descriptor.pixel_size.height,
            state.descriptor.flags
        );
        Ok(())
    }

    fn destroy(&self) {
        let (native, imported) = {
            let mut state = self.state.lock();
            (state.native.take(), state.imported)
        };
        let Some(handle) = native else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::Texture {
                    handle,
                    owned: !imported,
                }],
                self.core.last_used_frame(),
            );
        }
        log::trace!("Destroyed texture {}", self.core.label());
    }

    fn is_created(&self) -> bool {
        self.state.lock().native.is_some()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Texture")
            .field("id", &self.core.id())
            .field("format", &state.descriptor.format)
            .field("pixel_size", &state.descriptor.pixel_size)
            .field("flags", &state.descriptor.flags)
            .field("created", &state.native.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(Texture: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendKind, InitParams, NullInitParams, Rhi, RhiFlags};

    fn rhi() -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
    }

    #[test]
    fn test_create_and_destroy() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Rgba8,
            TextureFlags::MIP_MAPPED,
        ));
        assert!(!texture.is_created());
        texture.create().unwrap();
        assert!(texture.is_created());
        assert_eq!(texture.mip_level_count(), 7);
        texture.destroy();
        texture.destroy();
        assert!(!texture.is_created());
    }

    #[test]
    fn test_cube_map_must_be_square() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            64,
            32,
            TextureFormat::Rgba8,
            TextureFlags::CUBE_MAP,
        ));
        assert!(matches!(
            texture.create(),
            Err(RhiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unsupported_compressed_format() {
        let rhi = Rhi::create(
            BackendKind::Null,
            InitParams::Null(
                NullInitParams::default().with_disabled_feature(Feature::TextureCompressionAstc),
            ),
            RhiFlags::empty(),
        )
        .unwrap();
        assert!(!rhi.is_texture_format_supported(TextureFormat::Astc4x4, TextureFlags::empty()));
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Astc4x4,
            TextureFlags::empty(),
        ));
        assert!(matches!(
            texture.create(),
            Err(RhiError::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_import_and_export_native() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8,
            TextureFlags::empty(),
        ));
        let native = NativeTexture {
            object: 0xdead_beef,
            layout: 0,
        };
        texture.create_from(native).unwrap();
        assert_eq!(texture.native_texture(), Some(native));
        texture.destroy();
        assert_eq!(texture.native_texture(), None);
    }
}
