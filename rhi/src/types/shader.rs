//! Shader bundles.
//!
//! The RHI does not compile shaders. A [`Shader`] carries precompiled code for
//! one stage, keyed by source kind, version and variant, plus the reflection
//! data backends use to validate bindings and vertex inputs.

use std::collections::HashMap;
use std::sync::Arc;

/// A programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// The stage as a single-bit stage mask.
    pub fn as_flags(&self) -> ShaderStageFlags {
        match self {
            Self::Vertex => ShaderStageFlags::VERTEX,
            Self::TessellationControl => ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => ShaderStageFlags::GEOMETRY,
            Self::Fragment => ShaderStageFlags::FRAGMENT,
            Self::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

bitflags::bitflags! {
    /// Shader stages that can access a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const TESSELLATION_CONTROL = 1 << 1;
        const TESSELLATION_EVALUATION = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

/// Kind of code stored for a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderSource {
    SpirV,
    Glsl,
    Hlsl,
    Dxbc,
    Dxil,
    Msl,
    MetalLib,
}

/// Source-language version, e.g. 100 for SPIR-V 1.0 or 450 for GLSL 4.50.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderVersion {
    pub version: u32,
    /// GLSL ES flavor.
    pub es: bool,
}

impl ShaderVersion {
    pub const fn new(version: u32) -> Self {
        Self { version, es: false }
    }

    pub const fn es(version: u32) -> Self {
        Self { version, es: true }
    }
}

/// Variant of a shader compiled for special use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderVariant {
    #[default]
    Standard,
    /// Vertex shader prepared for batched rendering.
    Batchable,
}

/// Lookup key of one code blob inside a [`Shader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    pub source: ShaderSource,
    pub version: ShaderVersion,
    pub variant: ShaderVariant,
}

impl ShaderKey {
    pub const fn new(source: ShaderSource, version: ShaderVersion) -> Self {
        Self {
            source,
            version,
            variant: ShaderVariant::Standard,
        }
    }

    pub fn with_variant(mut self, variant: ShaderVariant) -> Self {
        self.variant = variant;
        self
    }
}

/// Code for one key: bytecode or source text plus an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderCode {
    pub code: Arc<[u8]>,
    pub entry_point: String,
}

impl ShaderCode {
    pub fn new(code: impl Into<Arc<[u8]>>) -> Self {
        Self {
            code: code.into(),
            entry_point: "main".to_string(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

/// A stage input or output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InOutVariable {
    pub name: String,
    pub location: u32,
}

/// A uniform block, storage block, image or combined image sampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderResourceVariable {
    pub name: String,
    pub binding: u32,
    /// Block size in bytes, 0 for non-block resources.
    pub size: u32,
}

/// Reflection data of a shader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderDescription {
    pub input_variables: Vec<InOutVariable>,
    pub output_variables: Vec<InOutVariable>,
    pub uniform_blocks: Vec<ShaderResourceVariable>,
    pub storage_blocks: Vec<ShaderResourceVariable>,
    pub combined_image_samplers: Vec<ShaderResourceVariable>,
    pub storage_images: Vec<ShaderResourceVariable>,
    /// Local work group size for compute shaders.
    pub compute_work_group_size: [u32; 3],
}

/// Precompiled shader bundle for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Shader {
    stage: ShaderStage,
    description: ShaderDescription,
    codes: HashMap<ShaderKey, ShaderCode>,
}

impl Shader {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            description: ShaderDescription::default(),
            codes: HashMap::new(),
        }
    }

    pub fn with_code(mut self, key: ShaderKey, code: ShaderCode) -> Self {
        self.codes.insert(key, code);
        self
    }

    pub fn with_description(mut self, description: ShaderDescription) -> Self {
        self.description = description;
        self
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn description(&self) -> &ShaderDescription {
        &self.description
    }

    pub fn code(&self, key: &ShaderKey) -> Option<&ShaderCode> {
        self.codes.get(key)
    }

    /// All keys this bundle has code for.
    pub fn keys(&self) -> impl Iterator<Item = &ShaderKey> {
        self.codes.keys()
    }

    /// A shader with no code at all cannot be used in a pipeline.
    pub fn is_valid(&self) -> bool {
        !self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_lookup() {
        let key = ShaderKey::new(ShaderSource::SpirV, ShaderVersion::new(100));
        let shader = Shader::new(ShaderStage::Fragment)
            .with_code(key, ShaderCode::new(vec![0x03, 0x02, 0x23, 0x07]));

        assert!(shader.is_valid());
        assert!(shader.code(&key).is_some());
        assert!(
            shader
                .code(&key.with_variant(ShaderVariant::Batchable))
                .is_none()
        );
        assert_eq!(shader.stage().as_flags(), ShaderStageFlags::FRAGMENT);
        assert!(!Shader::new(ShaderStage::Vertex).is_valid());
    }
}
