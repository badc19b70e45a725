//! Fixed-function pipeline state.

use bitflags::bitflags;

/// Primitive topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Lines,
    LineStrip,
    Points,
    Patches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Comparison function used by depth/stencil tests and compare samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    /// Color channel write mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Blend state of one color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TargetBlend {
    pub color_write: ColorMask,
    pub enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub op_color: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub op_alpha: BlendOp,
}

impl TargetBlend {
    /// Premultiplied alpha blending.
    pub fn premultiplied_alpha() -> Self {
        Self {
            enable: true,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        }
    }

    /// Returns true if any factor reads the blend constants.
    pub fn uses_constants(&self) -> bool {
        [self.src_color, self.dst_color, self.src_alpha, self.dst_alpha]
            .iter()
            .any(|f| matches!(f, BlendFactor::ConstantColor | BlendFactor::OneMinusConstantColor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    Zero,
    #[default]
    Keep,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub compare_op: CompareOp,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            compare_op: CompareOp::Always,
        }
    }
}

/// Depth and stencil test state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_op: CompareOp,
    pub stencil_test: bool,
    pub stencil_front: StencilOpState,
    pub stencil_back: StencilOpState,
    pub stencil_read_mask: u32,
    pub stencil_write_mask: u32,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_op: CompareOp::Less,
            stencil_test: false,
            stencil_front: StencilOpState::default(),
            stencil_back: StencilOpState::default(),
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
        }
    }
}

// ============================================================================
// Vertex input
// ============================================================================

/// Vertex attribute format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float4,
    Float3,
    Float2,
    Float,
    UNormByte4,
    UNormByte2,
    UNormByte,
    UInt4,
    UInt2,
    UInt,
    SInt4,
    SInt,
}

impl VertexFormat {
    /// Size of one attribute in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::Float4 | Self::UInt4 | Self::SInt4 => 16,
            Self::Float3 => 12,
            Self::Float2 | Self::UInt2 => 8,
            Self::Float | Self::UNormByte4 | Self::UInt | Self::SInt => 4,
            Self::UNormByte2 => 2,
            Self::UNormByte => 1,
        }
    }

    /// Integer attributes need `Feature::IntAttributes`.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::UInt4 | Self::UInt2 | Self::UInt | Self::SInt4 | Self::SInt
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexClassification {
    #[default]
    PerVertex,
    PerInstance,
}

/// One vertex buffer binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub stride: u32,
    pub classification: VertexClassification,
    /// Instance step rate, only meaningful for per-instance data.
    pub step_rate: u32,
}

impl VertexInputBinding {
    pub fn per_vertex(stride: u32) -> Self {
        Self {
            stride,
            classification: VertexClassification::PerVertex,
            step_rate: 1,
        }
    }

    pub fn per_instance(stride: u32, step_rate: u32) -> Self {
        Self {
            stride,
            classification: VertexClassification::PerInstance,
            step_rate,
        }
    }
}

/// One vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputAttribute {
    pub binding: u32,
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

impl VertexInputAttribute {
    pub fn new(binding: u32, location: u32, format: VertexFormat, offset: u32) -> Self {
        Self {
            binding,
            location,
            format,
            offset,
        }
    }
}

/// Vertex input layout of a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: Vec<VertexInputAttribute>,
}

impl VertexInputLayout {
    pub fn new(bindings: Vec<VertexInputBinding>, attributes: Vec<VertexInputAttribute>) -> Self {
        Self {
            bindings,
            attributes,
        }
    }

    /// Checks that every attribute refers to a declared binding and fits its stride.
    pub fn validate(&self) -> Result<(), String> {
        for attr in &self.attributes {
            let Some(binding) = self.bindings.get(attr.binding as usize) else {
                return Err(format!(
                    "attribute at location {} refers to missing binding {}",
                    attr.location, attr.binding
                ));
            };
            if binding.stride != 0 && attr.offset + attr.format.size() > binding.stride {
                return Err(format!(
                    "attribute at location {} overflows stride {}",
                    attr.location, binding.stride
                ));
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Graphics pipeline flags declaring which dynamic state is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GraphicsPipelineFlags: u32 {
        const USES_BLEND_CONSTANTS = 1 << 0;
        const USES_STENCIL_REF = 1 << 1;
        const USES_SCISSOR = 1 << 2;
        const COMPILE_SHADERS_WITH_DEBUG_INFO = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_validation() {
        let layout = VertexInputLayout::new(
            vec![VertexInputBinding::per_vertex(20)],
            vec![
                VertexInputAttribute::new(0, 0, VertexFormat::Float3, 0),
                VertexInputAttribute::new(0, 1, VertexFormat::Float2, 12),
            ],
        );
        assert!(layout.validate().is_ok());

        let bad = VertexInputLayout::new(
            vec![VertexInputBinding::per_vertex(16)],
            vec![VertexInputAttribute::new(0, 0, VertexFormat::Float4, 4)],
        );
        assert!(bad.validate().is_err());

        let missing = VertexInputLayout::new(
            vec![],
            vec![VertexInputAttribute::new(1, 0, VertexFormat::Float, 0)],
        );
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_blend_constants_detection() {
        assert!(!TargetBlend::premultiplied_alpha().uses_constants());
        let blend = TargetBlend {
            enable: true,
            src_color: BlendFactor::ConstantColor,
            ..Default::default()
        };
        assert!(blend.uses_constants());
    }
}
