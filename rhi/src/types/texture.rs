//! Texture and render buffer types and descriptors.

use bitflags::bitflags;

use super::Size;

/// Texture format enumeration.
///
/// sRGB is not part of the format. Set [`TextureFlags::SRGB`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum TextureFormat {
    /// 8-bit RGBA, unsigned normalized.
    #[default]
    Rgba8 = 1,
    /// 8-bit BGRA, unsigned normalized.
    Bgra8,
    /// 8-bit red, unsigned normalized.
    R8,
    /// 8-bit RG, unsigned normalized.
    Rg8,
    /// 16-bit red, unsigned normalized.
    R16,
    /// 16-bit RG, unsigned normalized.
    Rg16,
    /// 8-bit red, unsigned integer.
    R8Ui,
    /// 32-bit red, unsigned integer.
    R32Ui,
    /// 16-bit RGBA, float.
    Rgba16F,
    /// 32-bit RGBA, float.
    Rgba32F,
    /// 16-bit red, float.
    R16F,
    /// 32-bit red, float.
    R32F,
    /// 10-bit RGB with 2-bit alpha.
    Rgb10A2,

    // Depth/stencil formats
    /// 16-bit depth.
    D16,
    /// 24-bit depth.
    D24,
    /// 24-bit depth with 8-bit stencil.
    D24S8,
    /// 32-bit float depth.
    D32F,

    // Block compressed formats
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc6H,
    Bc7,
    Etc2Rgb8,
    Etc2Rgb8A1,
    Etc2Rgba8,
    Astc4x4,
    Astc5x5,
    Astc6x6,
    Astc8x8,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(self, Self::D16 | Self::D24 | Self::D24S8 | Self::D32F)
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::D24S8)
    }

    /// Returns true for block compressed formats.
    pub fn is_compressed(&self) -> bool {
        self.block_dimensions() != (1, 1)
    }

    /// Returns true for formats in the BC family.
    pub fn is_bc(&self) -> bool {
        matches!(
            self,
            Self::Bc1 | Self::Bc2 | Self::Bc3 | Self::Bc4 | Self::Bc5 | Self::Bc6H | Self::Bc7
        )
    }

    /// Returns true for formats in the ETC2 family.
    pub fn is_etc2(&self) -> bool {
        matches!(self, Self::Etc2Rgb8 | Self::Etc2Rgb8A1 | Self::Etc2Rgba8)
    }

    /// Returns true for formats in the ASTC family.
    pub fn is_astc(&self) -> bool {
        matches!(
            self,
            Self::Astc4x4 | Self::Astc5x5 | Self::Astc6x6 | Self::Astc8x8
        )
    }

    /// Width and height of one block in pixels. `(1, 1)` for uncompressed formats.
    pub fn block_dimensions(&self) -> (u32, u32) {
        match self {
            Self::Bc1
            | Self::Bc2
            | Self::Bc3
            | Self::Bc4
            | Self::Bc5
            | Self::Bc6H
            | Self::Bc7
            | Self::Etc2Rgb8
            | Self::Etc2Rgb8A1
            | Self::Etc2Rgba8
            | Self::Astc4x4 => (4, 4),
            Self::Astc5x5 => (5, 5),
            Self::Astc6x6 => (6, 6),
            Self::Astc8x8 => (8, 8),
            _ => (1, 1),
        }
    }

    /// Returns the size in bytes per pixel, or per block for compressed formats.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8 | Self::R8Ui => 1,
            Self::Rg8 | Self::R16 | Self::R16F | Self::D16 => 2,
            Self::Rgba8
            | Self::Bgra8
            | Self::Rg16
            | Self::R32Ui
            | Self::R32F
            | Self::Rgb10A2
            | Self::D24
            | Self::D24S8
            | Self::D32F => 4,
            Self::Rgba16F => 8,
            Self::Rgba32F => 16,
            Self::Bc1 | Self::Bc4 | Self::Etc2Rgb8 | Self::Etc2Rgb8A1 => 8,
            Self::Bc2
            | Self::Bc3
            | Self::Bc5
            | Self::Bc6H
            | Self::Bc7
            | Self::Etc2Rgba8
            | Self::Astc4x4
            | Self::Astc5x5
            | Self::Astc6x6
            | Self::Astc8x8 => 16,
        }
    }

    /// Number of bytes in one tightly packed row (or row of blocks).
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        let (bw, _) = self.block_dimensions();
        width.div_ceil(bw) * self.block_size()
    }

    /// Number of rows (or rows of blocks) for the given height.
    pub fn line_count(&self, height: u32) -> u32 {
        let (_, bh) = self.block_dimensions();
        height.div_ceil(bh)
    }

    /// Total number of bytes for one tightly packed 2D image of the given size.
    pub fn image_byte_size(&self, size: Size) -> u32 {
        self.bytes_per_line(size.width) * self.line_count(size.height)
    }
}

bitflags! {
    /// Texture creation flags. Must be set before `create()`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        /// Texture is used as a color attachment.
        const RENDER_TARGET = 1 << 0;
        /// Cube map with six faces.
        const CUBE_MAP = 1 << 2;
        /// Texture has a full mip chain.
        const MIP_MAPPED = 1 << 3;
        /// Texture data is interpreted as sRGB.
        const SRGB = 1 << 4;
        /// Texture can be a copy or readback source.
        const USED_AS_TRANSFER_SOURCE = 1 << 5;
        /// Mip levels are generated with `generate_mips`.
        const USED_WITH_GENERATE_MIPS = 1 << 6;
        /// Texture is used as a storage image.
        const USED_WITH_LOAD_STORE = 1 << 7;
        /// Three dimensional texture.
        const THREE_DIMENSIONAL = 1 << 10;
        /// 2D texture array.
        const TEXTURE_ARRAY = 1 << 11;
        /// One dimensional texture.
        const ONE_DIMENSIONAL = 1 << 12;
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    pub format: TextureFormat,
    pub pixel_size: Size,
    /// Depth for 3D textures, otherwise 1.
    pub depth: u32,
    /// Layer count for texture arrays, otherwise 1.
    pub array_size: u32,
    pub sample_count: u32,
    pub flags: TextureFlags,
}

impl TextureDescriptor {
    /// Create a new 2D texture descriptor.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, flags: TextureFlags) -> Self {
        Self {
            label: None,
            format,
            pixel_size: Size::new(width, height),
            depth: 1,
            array_size: 1,
            sample_count: 1,
            flags,
        }
    }

    /// Create a new 3D texture descriptor.
    pub fn new_3d(
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
        flags: TextureFlags,
    ) -> Self {
        Self {
            depth,
            flags: flags | TextureFlags::THREE_DIMENSIONAL,
            ..Self::new_2d(width, height, format, TextureFlags::empty())
        }
    }

    /// Create a new 2D texture array descriptor.
    pub fn new_array(
        width: u32,
        height: u32,
        array_size: u32,
        format: TextureFormat,
        flags: TextureFlags,
    ) -> Self {
        Self {
            array_size,
            flags: flags | TextureFlags::TEXTURE_ARRAY,
            ..Self::new_2d(width, height, format, TextureFlags::empty())
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the sample count for multisampling.
    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    /// Number of mip levels implied by the flags and size.
    pub fn mip_level_count(&self) -> u32 {
        if self.flags.contains(TextureFlags::MIP_MAPPED) {
            mip_levels_for_size(self.pixel_size)
        } else {
            1
        }
    }

    /// Number of layers (array layers, cube faces or 3D slices).
    pub fn layer_count(&self) -> u32 {
        if self.flags.contains(TextureFlags::CUBE_MAP) {
            6
        } else if self.flags.contains(TextureFlags::THREE_DIMENSIONAL) {
            self.depth.max(1)
        } else {
            self.array_size.max(1)
        }
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self::new_2d(0, 0, TextureFormat::default(), TextureFlags::empty())
    }
}

/// Number of mip levels in a full chain for a base level of `size`.
///
/// `floor(log2(max(width, height))) + 1`, and 1 for an empty size.
pub fn mip_levels_for_size(size: Size) -> u32 {
    let max = size.width.max(size.height);
    (u32::BITS - max.leading_zeros()).max(1)
}

/// Size of mip `level` for a base level of `base`. Halves per level, never below 1.
pub fn size_for_mip_level(level: u32, base: Size) -> Size {
    let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
    Size::new(shrink(base.width), shrink(base.height))
}

// ============================================================================
// Render buffers
// ============================================================================

/// Kind of render buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderBufferType {
    #[default]
    DepthStencil,
    Color,
}

bitflags! {
    /// Render buffer creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderBufferFlags: u32 {
        /// Only ever used together with a swapchain.
        const USED_WITH_SWAPCHAIN_ONLY = 1 << 0;
    }
}

/// Descriptor for creating a render buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderBufferDescriptor {
    pub label: Option<String>,
    pub buffer_type: RenderBufferType,
    pub pixel_size: Size,
    pub sample_count: u32,
    pub flags: RenderBufferFlags,
    /// Preferred native format. Backends pick their own when `None`.
    pub backing_format: Option<TextureFormat>,
}

impl RenderBufferDescriptor {
    pub fn new(buffer_type: RenderBufferType, width: u32, height: u32) -> Self {
        Self {
            label: None,
            buffer_type,
            pixel_size: Size::new(width, height),
            sample_count: 1,
            flags: RenderBufferFlags::empty(),
            backing_format: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    pub fn with_flags(mut self, flags: RenderBufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_backing_format(mut self, format: TextureFormat) -> Self {
        self.backing_format = Some(format);
        self
    }

    /// Format the buffer is allocated with.
    pub fn effective_format(&self) -> TextureFormat {
        match (self.backing_format, self.buffer_type) {
            (Some(format), _) => format,
            (None, RenderBufferType::DepthStencil) => TextureFormat::D24S8,
            (None, RenderBufferType::Color) => TextureFormat::Rgba8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_math() {
        assert_eq!(TextureFormat::Rgba8.bytes_per_line(64), 256);
        assert_eq!(TextureFormat::Bc1.bytes_per_line(64), 128);
        assert_eq!(TextureFormat::Bc1.line_count(64), 16);
        assert_eq!(TextureFormat::Bc7.image_byte_size(Size::new(5, 5)), 64);
        assert_eq!(TextureFormat::Astc8x8.block_dimensions(), (8, 8));
        assert!(TextureFormat::Etc2Rgba8.is_compressed());
        assert!(!TextureFormat::D24S8.is_compressed());
    }

    #[test]
    fn test_mip_levels() {
        assert_eq!(mip_levels_for_size(Size::new(256, 256)), 9);
        assert_eq!(mip_levels_for_size(Size::new(256, 1)), 9);
        assert_eq!(mip_levels_for_size(Size::new(300, 100)), 9);
        assert_eq!(mip_levels_for_size(Size::new(1, 1)), 1);
        assert_eq!(mip_levels_for_size(Size::new(0, 0)), 1);
    }

    #[test]
    fn test_size_for_mip_level() {
        let base = Size::new(256, 64);
        assert_eq!(size_for_mip_level(0, base), base);
        assert_eq!(size_for_mip_level(1, base), Size::new(128, 32));
        assert_eq!(size_for_mip_level(7, base), Size::new(2, 1));
        assert_eq!(size_for_mip_level(8, base), Size::new(1, 1));
        assert_eq!(size_for_mip_level(40, base), Size::new(1, 1));
    }

    #[test]
    fn test_layer_count() {
        let cube = TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8, TextureFlags::CUBE_MAP);
        assert_eq!(cube.layer_count(), 6);
        let volume =
            TextureDescriptor::new_3d(16, 16, 8, TextureFormat::Rgba8, TextureFlags::empty());
        assert_eq!(volume.layer_count(), 8);
        let array = TextureDescriptor::new_array(16, 16, 4, TextureFormat::R8, TextureFlags::empty());
        assert_eq!(array.layer_count(), 4);
    }

    #[test]
    fn test_render_buffer_effective_format() {
        let ds = RenderBufferDescriptor::new(RenderBufferType::DepthStencil, 4, 4);
        assert_eq!(ds.effective_format(), TextureFormat::D24S8);
        let color = RenderBufferDescriptor::new(RenderBufferType::Color, 4, 4)
            .with_backing_format(TextureFormat::Rgba16F);
        assert_eq!(color.effective_format(), TextureFormat::Rgba16F);
    }
}
