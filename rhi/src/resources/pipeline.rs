//! Graphics and compute pipelines.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{RenderPassDescriptor, ShaderResourceBindings};
use crate::backend::{Feature, NativeHandle, NativeObject, ResourceLimit};
use crate::error::RhiError;
use crate::resource::{ResourceCore, ResourceType, RhiResource};
use crate::rhi::RhiShared;
use crate::types::{
    CullMode, DepthStencilState, FrontFace, GraphicsPipelineFlags, PolygonMode, Shader,
    ShaderStage, TargetBlend, Topology, VertexClassification, VertexInputLayout,
};

/// Fixed-function state and shader stages of a graphics pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub shader_stages: Vec<Shader>,
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    pub line_width: f32,
    /// One entry per color attachment. Empty means a single opaque target.
    pub target_blends: Vec<TargetBlend>,
    pub depth_stencil: DepthStencilState,
    pub sample_count: u32,
    pub patch_control_points: u32,
    pub vertex_input_layout: VertexInputLayout,
    pub flags: GraphicsPipelineFlags,
}

impl Default for GraphicsPipelineDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            shader_stages: Vec::new(),
            topology: Topology::Triangles,
            cull_mode: CullMode::None,
            front_face: FrontFace::Ccw,
            polygon_mode: PolygonMode::Fill,
            line_width: 1.0,
            target_blends: Vec::new(),
            depth_stencil: DepthStencilState::default(),
            sample_count: 1,
            patch_control_points: 3,
            vertex_input_layout: VertexInputLayout::default(),
            flags: GraphicsPipelineFlags::empty(),
        }
    }
}

impl GraphicsPipelineDescriptor {
    pub fn new(shader_stages: Vec<Shader>) -> Self {
        Self {
            shader_stages,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_front_face(mut self, front_face: FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn with_polygon_mode(mut self, polygon_mode: PolygonMode) -> Self {
        self.polygon_mode = polygon_mode;
        self
    }

    pub fn with_target_blends(mut self, blends: Vec<TargetBlend>) -> Self {
        self.target_blends = blends;
        self
    }

    pub fn with_depth_stencil(mut self, depth_stencil: DepthStencilState) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_patch_control_points(mut self, count: u32) -> Self {
        self.patch_control_points = count;
        self
    }

    pub fn with_vertex_input_layout(mut self, layout: VertexInputLayout) -> Self {
        self.vertex_input_layout = layout;
        self
    }

    pub fn with_flags(mut self, flags: GraphicsPipelineFlags) -> Self {
        self.flags = flags;
        self
    }

    fn has_stage(&self, stage: ShaderStage) -> bool {
        self.shader_stages.iter().any(|s| s.stage() == stage)
    }

    fn validate(&self, shared: &RhiShared, color_count: usize) -> Result<(), RhiError> {
        let invalid = |msg: String| Err(RhiError::InvalidParameter(msg));
        let unsupported = |what: &str| Err(RhiError::FeatureNotSupported(what.to_string()));

        let vertex_stages = self
            .shader_stages
            .iter()
            .filter(|s| s.stage() == ShaderStage::Vertex)
            .count();
        if vertex_stages != 1 {
            return invalid(format!(
                "graphics pipeline needs exactly one vertex stage, got {vertex_stages}"
            ));
        }
        if let Some(stage) = self.shader_stages.iter().find(|s| !s.is_valid()) {
            return invalid(format!("{:?} shader has no code", stage.stage()));
        }
        if self.has_stage(ShaderStage::Compute) {
            return invalid("compute stage in a graphics pipeline".to_string());
        }
        if self.has_stage(ShaderStage::TessellationControl)
            != self.has_stage(ShaderStage::TessellationEvaluation)
        {
            return invalid("tessellation needs both control and evaluation stages".to_string());
        }
        if self.has_stage(ShaderStage::TessellationControl) {
            if !shared.is_feature_supported(Feature::Tessellation) {
                return unsupported("tessellation");
            }
            if self.topology != Topology::Patches || self.patch_control_points == 0 {
                return invalid("tessellation requires patch topology".to_string());
            }
        }
        if self.has_stage(ShaderStage::Geometry)
            && !shared.is_feature_supported(Feature::GeometryShader)
        {
            return unsupported("geometry shaders");
        }
        if self.topology == Topology::TriangleFan
            && !shared.is_feature_supported(Feature::TriangleFanTopology)
        {
            return unsupported("triangle fan topology");
        }
        if self.polygon_mode != PolygonMode::Fill
            && !shared.is_feature_supported(Feature::NonFillPolygonMode)
        {
            return unsupported("non-fill polygon mode");
        }

        let layout = &self.vertex_input_layout;
        layout.validate().map_err(RhiError::InvalidParameter)?;
        if layout.attributes.iter().any(|a| a.format.is_integer())
            && !shared.is_feature_supported(Feature::IntAttributes)
        {
            return unsupported("integer vertex attributes");
        }
        if layout.bindings.iter().any(|b| {
            b.classification == VertexClassification::PerInstance && b.step_rate > 1
        }) && !shared.is_feature_supported(Feature::CustomInstanceStepRate)
        {
            return unsupported("custom instance step rate");
        }
        let max_inputs = shared.resource_limit(ResourceLimit::MaxVertexInputs);
        if layout.attributes.len() as u64 > max_inputs {
            return invalid(format!(
                "{} vertex attributes exceed the limit of {max_inputs}",
                layout.attributes.len()
            ));
        }

        if self.target_blends.len() > color_count.max(1) {
            return invalid(format!(
                "{} target blends for {color_count} color attachments",
                self.target_blends.len()
            ));
        }
        if !self.sample_count.is_power_of_two() {
            return invalid(format!("sample count {} is not a power of two", self.sample_count));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GraphicsPipelineState {
    descriptor: GraphicsPipelineDescriptor,
    render_pass: Option<Arc<RenderPassDescriptor>>,
    bindings: Option<Arc<ShaderResourceBindings>>,
    created: Option<GraphicsPipelineSnapshot>,
}

/// State the native pipeline was built from, taken at `create()`. Setters
/// called afterwards do not change it.
#[derive(Debug, Clone)]
pub(crate) struct GraphicsPipelineSnapshot {
    pub native: NativeHandle,
    pub flags: GraphicsPipelineFlags,
    pub render_pass_format: Vec<u32>,
    pub layout_description: Vec<u32>,
    pub bindings: Arc<ShaderResourceBindings>,
}

/// A graphics pipeline state object.
///
/// Built against a render pass descriptor and a shader resource bindings
/// layout. Usable with any compatible render target and any SRB with an equal
/// layout.
pub struct GraphicsPipeline {
    core: ResourceCore,
    state: Mutex<GraphicsPipelineState>,
}

impl GraphicsPipeline {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: GraphicsPipelineDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(GraphicsPipelineState {
                descriptor,
                ..Default::default()
            }),
        }
    }

    pub fn descriptor(&self) -> GraphicsPipelineDescriptor {
        self.state.lock().descriptor.clone()
    }

    /// Takes effect at the next `create()`.
    pub fn set_descriptor(&self, descriptor: GraphicsPipelineDescriptor) {
        self.state.lock().descriptor = descriptor;
    }

    pub fn flags(&self) -> GraphicsPipelineFlags {
        self.state.lock().descriptor.flags
    }

    pub fn set_render_pass_descriptor(&self, render_pass: &Arc<RenderPassDescriptor>) {
        self.state.lock().render_pass = Some(render_pass.clone());
    }

    pub fn render_pass_descriptor(&self) -> Option<Arc<RenderPassDescriptor>> {
        self.state.lock().render_pass.clone()
    }

    pub fn set_shader_resource_bindings(&self, bindings: &Arc<ShaderResourceBindings>) {
        self.state.lock().bindings = Some(bindings.clone());
    }

    pub fn shader_resource_bindings(&self) -> Option<Arc<ShaderResourceBindings>> {
        self.state.lock().bindings.clone()
    }

    pub(crate) fn snapshot(&self, frame: u64) -> Option<GraphicsPipelineSnapshot> {
        let snapshot = self.state.lock().created.clone()?;
        self.core.mark_used(frame);
        Some(snapshot)
    }
}

impl RhiResource for GraphicsPipeline {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::GraphicsPipeline
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        let (descriptor, render_pass, bindings) = {
            let state = self.state.lock();
            (
                state.descriptor.clone(),
                state.render_pass.clone(),
                state.bindings.clone(),
            )
        };
        let render_pass = render_pass.ok_or_else(|| {
            RhiError::InvalidParameter("graphics pipeline has no render pass descriptor".into())
        })?;
        let bindings = bindings.ok_or_else(|| {
            RhiError::InvalidParameter("graphics pipeline has no shader resource bindings".into())
        })?;
        let rp_native = render_pass.native().ok_or_else(|| {
            RhiError::InvalidParameter("render pass descriptor is not created".into())
        })?;
        let (layout_native, layout_description) = bindings.created_layout().ok_or_else(|| {
            RhiError::InvalidParameter("shader resource bindings are not created".into())
        })?;
        descriptor.validate(&shared, render_pass.format().colors.len())?;

        let handle =
            shared
                .backend()
                .create_graphics_pipeline(&descriptor, rp_native, layout_native)?;

        self.state.lock().created = Some(GraphicsPipelineSnapshot {
            native: handle,
            flags: descriptor.flags,
            render_pass_format: render_pass.serialized_format(),
            layout_description,
            bindings,
        });
        self.core.bump_generation();
        log::debug!(
            "Created graphics pipeline {} with {} stages",
            self.core.label(),
            descriptor.shader_stages.len()
        );
        Ok(())
    }

    fn destroy(&self) {
        let Some(created) = self.state.lock().created.take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::GraphicsPipeline(created.native)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().created.is_some()
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GraphicsPipeline")
            .field("id", &self.core.id())
            .field("topology", &state.descriptor.topology)
            .field("created", &state.created.is_some())
            .finish()
    }
}

/// Compute pipeline description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: Option<Shader>,
}

impl ComputePipelineDescriptor {
    pub fn new(shader: Shader) -> Self {
        Self {
            label: None,
            shader: Some(shader),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Default)]
struct ComputePipelineState {
    descriptor: ComputePipelineDescriptor,
    bindings: Option<Arc<ShaderResourceBindings>>,
    created: Option<ComputePipelineSnapshot>,
}

#[derive(Debug, Clone)]
pub(crate) struct ComputePipelineSnapshot {
    pub native: NativeHandle,
    pub layout_description: Vec<u32>,
    pub bindings: Arc<ShaderResourceBindings>,
}

/// A compute pipeline. Requires [`Feature::Compute`].
pub struct ComputePipeline {
    core: ResourceCore,
    state: Mutex<ComputePipelineState>,
}

impl ComputePipeline {
    pub(crate) fn new(shared: &Arc<RhiShared>, descriptor: ComputePipelineDescriptor) -> Self {
        Self {
            core: ResourceCore::new(shared, descriptor.label.clone()),
            state: Mutex::new(ComputePipelineState {
                descriptor,
                ..Default::default()
            }),
        }
    }

    pub fn descriptor(&self) -> ComputePipelineDescriptor {
        self.state.lock().descriptor.clone()
    }

    pub fn set_shader(&self, shader: Shader) {
        self.state.lock().descriptor.shader = Some(shader);
    }

    pub fn set_shader_resource_bindings(&self, bindings: &Arc<ShaderResourceBindings>) {
        self.state.lock().bindings = Some(bindings.clone());
    }

    pub fn shader_resource_bindings(&self) -> Option<Arc<ShaderResourceBindings>> {
        self.state.lock().bindings.clone()
    }

    pub(crate) fn snapshot(&self, frame: u64) -> Option<ComputePipelineSnapshot> {
        let snapshot = self.state.lock().created.clone()?;
        self.core.mark_used(frame);
        Some(snapshot)
    }
}

impl RhiResource for ComputePipeline {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::ComputePipeline
    }

    fn create(&self) -> Result<(), RhiError> {
        let shared = self.core.try_shared()?;
        self.destroy();

        if !shared.is_feature_supported(Feature::Compute) {
            return Err(RhiError::FeatureNotSupported("compute".into()));
        }
        let (descriptor, bindings) = {
            let state = self.state.lock();
            (state.descriptor.clone(), state.bindings.clone())
        };
        match &descriptor.shader {
            Some(shader) if shader.stage() == ShaderStage::Compute && shader.is_valid() => {}
            Some(_) => {
                return Err(RhiError::InvalidParameter(
                    "compute pipeline needs a compute shader with code".into(),
                ))
            }
            None => {
                return Err(RhiError::InvalidParameter(
                    "compute pipeline has no shader".into(),
                ))
            }
        }
        let bindings = bindings.ok_or_else(|| {
            RhiError::InvalidParameter("compute pipeline has no shader resource bindings".into())
        })?;
        let (layout_native, layout_description) = bindings.created_layout().ok_or_else(|| {
            RhiError::InvalidParameter("shader resource bindings are not created".into())
        })?;

        let handle = shared
            .backend()
            .create_compute_pipeline(&descriptor, layout_native)?;

        self.state.lock().created = Some(ComputePipelineSnapshot {
            native: handle,
            layout_description,
            bindings,
        });
        self.core.bump_generation();
        Ok(())
    }

    fn destroy(&self) {
        let Some(created) = self.state.lock().created.take() else {
            return;
        };
        if let Some(shared) = self.core.shared() {
            shared.release_natives(
                vec![NativeObject::ComputePipeline(created.native)],
                self.core.last_used_frame(),
            );
        }
    }

    fn is_created(&self) -> bool {
        self.state.lock().created.is_some()
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("id", &self.core.id())
            .field("created", &self.is_created())
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsPipeline: Send, Sync);
static_assertions::assert_impl_all!(ComputePipeline: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullInitParams;
    use crate::resources::{AttachmentFormat, RenderPassFormat};
    use crate::types::{
        PolygonMode, ShaderCode, ShaderKey, ShaderSource, ShaderVersion, TextureFormat,
    };
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};

    fn shader(stage: ShaderStage) -> Shader {
        Shader::new(stage).with_code(
            ShaderKey::new(ShaderSource::SpirV, ShaderVersion::new(100)),
            ShaderCode::new(vec![0u8; 4]),
        )
    }

    fn setup(rhi: &Rhi) -> (Arc<RenderPassDescriptor>, Arc<ShaderResourceBindings>) {
        let rp = rhi.new_render_pass_descriptor(RenderPassFormat {
            colors: vec![AttachmentFormat::new(TextureFormat::Rgba8, 1)],
            depth_stencil: None,
            has_resolve: false,
        });
        rp.create().unwrap();
        let srb = rhi.new_shader_resource_bindings();
        srb.create().unwrap();
        (rp, srb)
    }

    #[test]
    fn test_create_requires_vertex_stage() {
        let rhi = Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap();
        let (rp, srb) = setup(&rhi);

        let ps = rhi.new_graphics_pipeline(GraphicsPipelineDescriptor::new(vec![shader(
            ShaderStage::Fragment,
        )]));
        ps.set_render_pass_descriptor(&rp);
        ps.set_shader_resource_bindings(&srb);
        assert!(ps.create().is_err());

        ps.set_descriptor(GraphicsPipelineDescriptor::new(vec![
            shader(ShaderStage::Vertex),
            shader(ShaderStage::Fragment),
        ]));
        ps.create().unwrap();
        assert!(ps.is_created());
    }

    #[test]
    fn test_line_mode_needs_feature() {
        let params = NullInitParams::default().with_disabled_feature(Feature::NonFillPolygonMode);
        let rhi = Rhi::create(BackendKind::Null, InitParams::Null(params), RhiFlags::empty()).unwrap();
        let (rp, srb) = setup(&rhi);

        let ps = rhi.new_graphics_pipeline(
            GraphicsPipelineDescriptor::new(vec![shader(ShaderStage::Vertex)])
                .with_polygon_mode(PolygonMode::Line),
        );
        ps.set_render_pass_descriptor(&rp);
        ps.set_shader_resource_bindings(&srb);
        assert!(matches!(ps.create(), Err(RhiError::FeatureNotSupported(_))));
    }

    #[test]
    fn test_compute_pipeline() {
        let rhi = Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap();
        let srb = rhi.new_shader_resource_bindings();
        srb.create().unwrap();

        let cp = rhi.new_compute_pipeline(ComputePipelineDescriptor::new(shader(
            ShaderStage::Vertex,
        )));
        cp.set_shader_resource_bindings(&srb);
        assert!(cp.create().is_err());

        cp.set_shader(shader(ShaderStage::Compute));
        cp.create().unwrap();
        cp.destroy();
        assert!(!cp.is_created());
    }
}
