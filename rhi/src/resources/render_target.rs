//! Render targets: what a render pass draws into.
//!
//! Two kinds exist. A [`TextureRenderTarget`] renders into textures and
//! render buffers the application owns. A [`SwapChainRenderTarget`] renders
//! into the current backbuffer of a [`SwapChain`](super::SwapChain) and is
//! obtained from it each frame.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

use super::{
    AttachmentFormat, RenderBuffer, RenderPassDescriptor, RenderPassFormat, SwapChain, Texture,
};
use crate::backend::Feature;
use crate::command::{AttachmentTarget, ColorAttachmentTarget, PassTarget};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::tracker::TextureAccess;
use crate::types::{size_for_mip_level, Size, TextureFlags, TextureFormat};

pub(crate) mod sealed {
    use std::sync::Arc;

    use super::super::{RenderPassDescriptor, Texture};
    use crate::command::PassTarget;
    use crate::tracker::TextureAccess;
    use crate::types::Size;

    /// Render target resolved to native handles for one pass.
    pub struct ResolvedTarget {
        pub(crate) target: PassTarget,
        pub(crate) textures: Vec<(Arc<Texture>, TextureAccess)>,
        pub(crate) render_pass: Arc<RenderPassDescriptor>,
        pub(crate) pixel_size: Size,
    }

    pub trait Sealed {
        fn resolve(&self, frame: u64) -> Result<ResolvedTarget, String>;
    }
}

use sealed::ResolvedTarget;

/// Something a render pass can draw into.
///
/// Implemented by [`TextureRenderTarget`] and [`SwapChainRenderTarget`] only.
pub trait RenderTarget: sealed::Sealed + Send + Sync {
    fn pixel_size(&self) -> Size;

    fn sample_count(&self) -> u32;

    fn render_pass_descriptor(&self) -> Option<Arc<RenderPassDescriptor>>;
}

/// Image backing a color attachment.
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    Texture(Arc<Texture>),
    RenderBuffer(Arc<RenderBuffer>),
}

impl AttachmentSource {
    fn format(&self) -> AttachmentFormat {
        match self {
            Self::Texture(t) => AttachmentFormat::new(t.format(), t.sample_count()),
            Self::RenderBuffer(rb) => AttachmentFormat::new(rb.format(), rb.sample_count()),
        }
    }

    fn is_created(&self) -> bool {
        match self {
            Self::Texture(t) => t.is_created(),
            Self::RenderBuffer(rb) => rb.is_created(),
        }
    }
}

/// One color attachment of a texture render target.
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub source: AttachmentSource,
    /// Array layer, cube face or 3D slice.
    pub layer: u32,
    pub level: u32,
    /// Single-sample texture a multisample attachment resolves into.
    pub resolve_texture: Option<Arc<Texture>>,
}

impl ColorAttachment {
    pub fn texture(texture: &Arc<Texture>) -> Self {
        Self {
            source: AttachmentSource::Texture(texture.clone()),
            layer: 0,
            level: 0,
            resolve_texture: None,
        }
    }

    pub fn render_buffer(render_buffer: &Arc<RenderBuffer>) -> Self {
        Self {
            source: AttachmentSource::RenderBuffer(render_buffer.clone()),
            layer: 0,
            level: 0,
            resolve_texture: None,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_resolve_texture(mut self, texture: &Arc<Texture>) -> Self {
        self.resolve_texture = Some(texture.clone());
        self
    }

    fn pixel_size(&self) -> Size {
        match &self.source {
            AttachmentSource::Texture(t) => size_for_mip_level(self.level, t.pixel_size()),
            AttachmentSource::RenderBuffer(rb) => rb.pixel_size(),
        }
    }
}

/// Attachments of a texture render target.
#[derive(Debug, Clone, Default)]
pub struct TextureRenderTargetDescription {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_buffer: Option<Arc<RenderBuffer>>,
    /// Depth texture used instead of a depth-stencil buffer, when sampling
    /// depth afterwards.
    pub depth_texture: Option<Arc<Texture>>,
}

impl TextureRenderTargetDescription {
    pub fn new(color_attachments: Vec<ColorAttachment>) -> Self {
        Self {
            color_attachments,
            ..Default::default()
        }
    }

    pub fn with_depth_stencil_buffer(mut self, buffer: &Arc<RenderBuffer>) -> Self {
        self.depth_stencil_buffer = Some(buffer.clone());
        self
    }

    pub fn with_depth_texture(mut self, texture: &Arc<Texture>) -> Self {
        self.depth_texture = Some(texture.clone());
        self
    }

    fn render_pass_format(&self) -> RenderPassFormat {
        let depth_stencil = match (&self.depth_stencil_buffer, &self.depth_texture) {
            (_, Some(t)) => Some(AttachmentFormat::new(t.format(), t.sample_count())),
            (Some(rb), None) => Some(AttachmentFormat::new(rb.format(), rb.sample_count())),
            (None, None) => None,
        };
        RenderPassFormat {
            colors: self
                .color_attachments
                .iter()
                .map(|a| a.source.format())
                .collect(),
            depth_stencil,
            has_resolve: self
                .color_attachments
                .iter()
                .any(|a| a.resolve_texture.is_some()),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureRenderTargetFlags: u32 {
        /// Load color contents instead of clearing them at pass begin.
        const PRESERVE_COLOR_CONTENTS = 1 << 0;
        const PRESERVE_DEPTH_STENCIL_CONTENTS = 1 << 1;
    }
}

#[derive(Debug)]
struct TextureRenderTargetState {
    description: TextureRenderTargetDescription,
    flags: TextureRenderTargetFlags,
    render_pass: Option<Arc<RenderPassDescriptor>>,
    created: bool,
}

/// Render target made of textures and render buffers.
pub struct TextureRenderTarget {
    core: ResourceCore,
    state: Mutex<TextureRenderTargetState>,
}

impl TextureRenderTarget {
    pub(crate) fn new(
        shared: &Arc<RhiShared>,
        description: TextureRenderTargetDescription,
        flags: TextureRenderTargetFlags,
    ) -> Self {
        Self {
            core: ResourceCore::new(shared, None),
            state: Mutex::new(TextureRenderTargetState {
                description,
                flags,
                render_pass: None,
                created: false,
            }),
        }
    }

    pub fn description(&self) -> TextureRenderTargetDescription {
        self.state.lock().description.clone()
    }

    /// Takes effect at the next `create()`.
    pub fn set_description(&self, description: TextureRenderTargetDescription) {
        self.state.lock().description = description;
    }

    pub fn flags(&self) -> TextureRenderTargetFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: TextureRenderTargetFlags) {
        self.state.lock().flags = flags;
    }

    pub fn set_render_pass_descriptor(&self, render_pass: &Arc<RenderPassDescriptor>) {
        self.state.lock().render_pass = Some(render_pass.clone());
    }

    /// New, not yet created, render pass descriptor matching the attachments.
    pub fn new_compatible_render_pass_descriptor(
        &self,
    ) -> Result<Arc<RenderPassDescriptor>, RhiError> {
        let shared = self.core.try_shared()?;
        let format = self.state.lock().description.render_pass_format();
        Ok(shared.register(Arc::new(RenderPassDescriptor::new(&shared, format))))
    }

    fn validate(
        &self,
        shared: &RhiShared,
        description: &TextureRenderTargetDescription,
    ) -> Result<(), RhiError> {
        let label = self.core.label();
        let invalid = |msg: String| Err(RhiError::InvalidParameter(msg));

        if description.color_attachments.is_empty()
            && description.depth_stencil_buffer.is_none()
            && description.depth_texture.is_none()
        {
            return invalid(format!("render target {label} has no attachments"));
        }
        let max_colors = shared.resource_limit(crate::backend::ResourceLimit::MaxColorAttachments);
        if description.color_attachments.len() as u64 > max_colors {
            return invalid(format!(
                "render target {label} has more than {max_colors} color attachments"
            ));
        }

        let mut size = None;
        let mut check_size = |s: Size| -> Result<(), RhiError> {
            match size {
                None => {
                    size = Some(s);
                    Ok(())
                }
                Some(expected) if expected == s => Ok(()),
                Some(expected) => Err(RhiError::InvalidParameter(format!(
                    "render target {label} mixes attachment sizes {}x{} and {}x{}",
                    expected.width, expected.height, s.width, s.height
                ))),
            }
        };

        for (i, attachment) in description.color_attachments.iter().enumerate() {
            if !attachment.source.is_created() {
                return invalid(format!("color attachment {i} of {label} is not created"));
            }
            if let AttachmentSource::Texture(texture) = &attachment.source {
                if !texture.flags().contains(TextureFlags::RENDER_TARGET) {
                    return invalid(format!(
                        "color attachment {i} of {label} lacks the RENDER_TARGET flag"
                    ));
                }
                if texture.format().is_depth_stencil() {
                    return invalid(format!("color attachment {i} of {label} is a depth format"));
                }
                if attachment.level >= texture.mip_level_count() {
                    return invalid(format!("color attachment {i} of {label}: bad mip level"));
                }
                if attachment.level > 0
                    && !shared.is_feature_supported(Feature::RenderToNonBaseMipLevel)
                {
                    return Err(RhiError::FeatureNotSupported(
                        "rendering to a non-base mip level".into(),
                    ));
                }
                if attachment.layer >= texture.descriptor().layer_count() {
                    return invalid(format!("color attachment {i} of {label}: bad layer"));
                }
            }
            if let Some(resolve) = &attachment.resolve_texture {
                if !resolve.is_created() || resolve.sample_count() != 1 {
                    return invalid(format!(
                        "resolve texture of attachment {i} of {label} must be created and single-sample"
                    ));
                }
            }
            check_size(attachment.pixel_size())?;
        }
        if let Some(rb) = &description.depth_stencil_buffer {
            if !rb.is_created() || !rb.format().is_depth_stencil() {
                return invalid(format!("depth-stencil buffer of {label} is unusable"));
            }
            if description.depth_texture.is_none() {
                check_size(rb.pixel_size())?;
            }
        }
        if let Some(texture) = &description.depth_texture {
            if !texture.is_created() || !texture.format().is_depth_stencil() {
                return invalid(format!("depth texture of {label} is unusable"));
            }
            check_size(texture.pixel_size())?;
        }
        Ok(())
    }
}

impl sealed::Sealed for TextureRenderTarget {
    fn resolve(&self, frame: u64) -> Result<ResolvedTarget, String> {
        let state = self.state.lock();
        if !state.created {
            return Err(format!("render target {} is not created", self.core.label()));
        }
        let render_pass = state
            .render_pass
            .clone()
            .ok_or_else(|| format!("render target {} has no render pass", self.core.label()))?;
        let description = &state.description;

        let mut textures = Vec::new();
        let mut colors = Vec::with_capacity(description.color_attachments.len());
        let mut pixel_size = None;
        for attachment in &description.color_attachments {
            let (target, format) = match &attachment.source {
                AttachmentSource::Texture(t) => {
                    textures.push((t.clone(), TextureAccess::ColorOutput));
                    (AttachmentTarget::Texture(t.snapshot(frame)?), t.format())
                }
                AttachmentSource::RenderBuffer(rb) => {
                    (AttachmentTarget::RenderBuffer(rb.snapshot(frame)?), rb.format())
                }
            };
            let resolve = match &attachment.resolve_texture {
                Some(t) => {
                    textures.push((t.clone(), TextureAccess::ColorOutput));
                    Some(t.snapshot(frame)?)
                }
                None => None,
            };
            pixel_size.get_or_insert_with(|| attachment.pixel_size());
            colors.push(ColorAttachmentTarget {
                target,
                format,
                layer: attachment.layer,
                level: attachment.level,
                resolve,
            });
        }

        let depth_stencil = match (&description.depth_texture, &description.depth_stencil_buffer) {
            (Some(t), _) => {
                textures.push((t.clone(), TextureAccess::DepthOutput));
                pixel_size.get_or_insert_with(|| t.pixel_size());
                Some(AttachmentTarget::Texture(t.snapshot(frame)?))
            }
            (None, Some(rb)) => {
                pixel_size.get_or_insert_with(|| rb.pixel_size());
                Some(AttachmentTarget::RenderBuffer(rb.snapshot(frame)?))
            }
            (None, None) => None,
        };
        let pixel_size = pixel_size.unwrap_or_default();
        self.core.mark_used(frame);

        Ok(ResolvedTarget {
            target: PassTarget {
                render_pass: render_pass.native(),
                colors,
                depth_stencil,
                pixel_size,
                preserve_color: state
                    .flags
                    .contains(TextureRenderTargetFlags::PRESERVE_COLOR_CONTENTS),
                preserve_depth_stencil: state
                    .flags
                    .contains(TextureRenderTargetFlags::PRESERVE_DEPTH_STENCIL_CONTENTS),
            },
            textures,
            render_pass,
            pixel_size,
        })
    }
}

impl RenderTarget for TextureRenderTarget {
    fn pixel_size(&self) -> Size {
        let state = self.state.lock();
        let description = &state.description;
        if let Some(first) = description.color_attachments.first() {
            return first.pixel_size();
        }
        match (&description.depth_texture, &description.depth_stencil_buffer) {
            (Some(t), _) => t.pixel_size(),
            (None, Some(rb)) => rb.pixel_size(),
            (None, None) => Size::default(),
        }
    }

    fn sample_count(&self) -> u32 {
        let state = self.state.lock();
        let description = &state.description;
        if let Some(first) = description.color_attachments.first() {
            return first.source.format().sample_count;
        }
        match (&description.depth_texture, &description.depth_stencil_buffer) {
            (Some(t), _) => t.sample_count(),
            (None, Some(rb)) => rb.sample_count(),
            (None, None) => 1,
        }
    }

    fn render_pass_descriptor(&self) -> Option<Arc<RenderPassDescriptor>> {
        self.state.lock().render_pass.clone()
    }
}

impl RhiResource for TextureRenderTarget {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::TextureRenderTarget
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let (description, render_pass) = {
            let state = self.state.lock();
            (state.description.clone(), state.render_pass.clone())
        };
        self.validate(&shared, &description)?;
        let render_pass = render_pass.ok_or_else(|| {
            RhiError::InvalidParameter(format!(
                "render target {} has no render pass descriptor",
                self.core.label()
            ))
        })?;
        if render_pass.format().serialize() != description.render_pass_format().serialize() {
            return Err(RhiError::InvalidParameter(format!(
                "render pass descriptor does not match the attachments of {}",
                self.core.label()
            )));
        }

        self.state.lock().created = true;
        self.core.bump_generation();
        Ok(())
    }

    fn destroy(&self) {
        self.state.lock().created = false;
    }

    fn is_created(&self) -> bool {
        self.state.lock().created
    }
}

impl std::fmt::Debug for TextureRenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TextureRenderTarget")
            .field("id", &self.core.id())
            .field("colors", &state.description.color_attachments.len())
            .field("created", &state.created)
            .finish()
    }
}

/// Render target for the current backbuffer of a swapchain.
pub struct SwapChainRenderTarget {
    core: ResourceCore,
    swapchain: Weak<SwapChain>,
}

impl SwapChainRenderTarget {
    pub(crate) fn new(shared: &Arc<RhiShared>, swapchain: Weak<SwapChain>) -> Self {
        Self {
            core: ResourceCore::new(shared, None),
            swapchain,
        }
    }

    pub fn swapchain(&self) -> Option<Arc<SwapChain>> {
        self.swapchain.upgrade()
    }
}

impl sealed::Sealed for SwapChainRenderTarget {
    fn resolve(&self, frame: u64) -> Result<ResolvedTarget, String> {
        let swapchain = self
            .swapchain
            .upgrade()
            .ok_or_else(|| "swapchain was dropped".to_string())?;
        let native = swapchain
            .native()
            .ok_or_else(|| format!("swapchain {} is not created", swapchain.core().label()))?;
        let render_pass = swapchain.render_pass_descriptor().ok_or_else(|| {
            format!("swapchain {} has no render pass", swapchain.core().label())
        })?;
        let depth_stencil = match swapchain.depth_stencil() {
            Some(rb) => Some(AttachmentTarget::RenderBuffer(rb.snapshot(frame)?)),
            None => None,
        };
        let pixel_size = swapchain.current_pixel_size();
        swapchain.core().mark_used(frame);
        self.core.mark_used(frame);

        let format: TextureFormat = swapchain.format();
        Ok(ResolvedTarget {
            target: PassTarget {
                render_pass: render_pass.native(),
                colors: vec![ColorAttachmentTarget {
                    target: AttachmentTarget::SwapChain(native),
                    format,
                    layer: 0,
                    level: 0,
                    resolve: None,
                }],
                depth_stencil,
                pixel_size,
                preserve_color: false,
                preserve_depth_stencil: false,
            },
            textures: Vec::new(),
            render_pass,
            pixel_size,
        })
    }
}

impl RenderTarget for SwapChainRenderTarget {
    fn pixel_size(&self) -> Size {
        self.swapchain
            .upgrade()
            .map(|sc| sc.current_pixel_size())
            .unwrap_or_default()
    }

    fn sample_count(&self) -> u32 {
        self.swapchain
            .upgrade()
            .map(|sc| sc.sample_count())
            .unwrap_or(1)
    }

    fn render_pass_descriptor(&self) -> Option<Arc<RenderPassDescriptor>> {
        self.swapchain.upgrade()?.render_pass_descriptor()
    }
}

impl RhiResource for SwapChainRenderTarget {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::SwapChainRenderTarget
    }

    /// Owned by the swapchain; nothing to build.
    fn create(&self) -> Result<(), RhiError> {
        Ok(())
    }

    fn destroy(&self) {}

    fn is_created(&self) -> bool {
        self.swapchain
            .upgrade()
            .map(|sc| sc.is_created())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SwapChainRenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChainRenderTarget")
            .field("id", &self.core.id())
            .finish()
    }
}

static_assertions::assert_impl_all!(TextureRenderTarget: Send, Sync);
static_assertions::assert_impl_all!(SwapChainRenderTarget: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RenderBufferDescriptor, RenderBufferType, TextureDescriptor};
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};

    fn rhi() -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
    }

    fn color_texture(rhi: &Rhi, size: u32) -> Arc<Texture> {
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            size,
            size,
            TextureFormat::Rgba8,
            TextureFlags::RENDER_TARGET,
        ));
        texture.create().unwrap();
        texture
    }

    #[test]
    fn test_compatible_render_pass() {
        let rhi = rhi();
        let texture = color_texture(&rhi, 64);
        let ds = rhi.new_render_buffer(RenderBufferDescriptor::new(
            RenderBufferType::DepthStencil,
            64,
            64,
        ));
        ds.create().unwrap();

        let rt = rhi.new_texture_render_target(
            TextureRenderTargetDescription::new(vec![ColorAttachment::texture(&texture)])
                .with_depth_stencil_buffer(&ds),
            TextureRenderTargetFlags::empty(),
        );
        let rp = rt.new_compatible_render_pass_descriptor().unwrap();
        rp.create().unwrap();
        rt.set_render_pass_descriptor(&rp);
        rt.create().unwrap();

        assert_eq!(rt.pixel_size(), Size::new(64, 64));
        assert_eq!(rp.format().colors.len(), 1);
        assert!(rp.format().depth_stencil.is_some());
    }

    #[test]
    fn test_mismatched_sizes_fail() {
        let rhi = rhi();
        let a = color_texture(&rhi, 64);
        let b = color_texture(&rhi, 32);
        let rt = rhi.new_texture_render_target(
            TextureRenderTargetDescription::new(vec![
                ColorAttachment::texture(&a),
                ColorAttachment::texture(&b),
            ]),
            TextureRenderTargetFlags::empty(),
        );
        let rp = rt.new_compatible_render_pass_descriptor().unwrap();
        rt.set_render_pass_descriptor(&rp);
        assert!(rt.create().is_err());
    }

    #[test]
    fn test_texture_without_render_target_flag_fails() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            16,
            16,
            TextureFormat::Rgba8,
            TextureFlags::empty(),
        ));
        texture.create().unwrap();
        let rt = rhi.new_texture_render_target(
            TextureRenderTargetDescription::new(vec![ColorAttachment::texture(&texture)]),
            TextureRenderTargetFlags::empty(),
        );
        let rp = rt.new_compatible_render_pass_descriptor().unwrap();
        rt.set_render_pass_descriptor(&rp);
        assert!(matches!(rt.create(), Err(RhiError::InvalidParameter(_))));
    }
}
