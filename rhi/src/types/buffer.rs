//! Buffer types and descriptors.

use bitflags::bitflags;

/// How the contents of a buffer are expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferType {
    /// Uploaded once, never changes afterwards. Device local.
    Immutable,
    /// Changes rarely. Device local, updated through staged uploads.
    #[default]
    Static,
    /// Changes every frame. Host visible, one native buffer per frame slot.
    Dynamic,
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        /// Vertex buffer.
        const VERTEX = 1 << 0;
        /// Index buffer.
        const INDEX = 1 << 1;
        /// Uniform buffer.
        const UNIFORM = 1 << 2;
        /// Storage buffer, read and written from shaders.
        const STORAGE = 1 << 3;
    }
}

/// Index element format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Update frequency.
    pub buffer_type: BufferType,
    /// Usage flags.
    pub usage: BufferUsage,
    /// Size in bytes.
    pub size: u32,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(buffer_type: BufferType, usage: BufferUsage, size: u32) -> Self {
        Self {
            label: None,
            buffer_type,
            usage,
            size,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self::new(BufferType::Static, BufferUsage::empty(), 0)
    }
}
