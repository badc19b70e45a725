use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use redlilium_rhi::resources::{ColorAttachment, TextureRenderTargetDescription, TextureRenderTargetFlags};
use redlilium_rhi::types::{
    BufferDescriptor, BufferType, BufferUsage, Color, DepthStencilClearValue, Shader, ShaderCode,
    ShaderKey, ShaderSource, ShaderStage, ShaderStageFlags, ShaderVersion, TextureDescriptor,
    TextureFlags, TextureFormat,
};
use redlilium_rhi::{
    BackendKind, BeginFrameFlags, BeginPassFlags, Binding, Buffer, BufferAccess, EndFrameFlags,
    GraphicsPipelineDescriptor, InitParams, NativeHandle, PassResourceTracker, PipelineStage, Rhi,
    RhiFlags, RhiResource,
};

fn null_rhi() -> Rhi {
    Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
}

fn shader(stage: ShaderStage) -> Shader {
    Shader::new(stage).with_code(
        ShaderKey::new(ShaderSource::SpirV, ShaderVersion::new(100)),
        ShaderCode::new(vec![0x03, 0x02, 0x23, 0x07]),
    )
}

fn buffer(rhi: &Rhi, buffer_type: BufferType, usage: BufferUsage, size: u32) -> Arc<Buffer> {
    let buffer = rhi.new_buffer(BufferDescriptor::new(buffer_type, usage, size));
    buffer.create().unwrap();
    buffer
}

// ---------------------------------------------------------------------------
// Pass resource tracking
// ---------------------------------------------------------------------------

fn bench_tracker_register(c: &mut Criterion) {
    let rhi = null_rhi();
    let buffers: Vec<_> = (0..256)
        .map(|_| buffer(&rhi, BufferType::Static, BufferUsage::VERTEX, 64))
        .collect();
    let natives: Vec<_> = (1..=256u64).filter_map(NativeHandle::new).collect();

    c.bench_function("tracker_register_256_buffers_twice", |b| {
        let mut tracker = PassResourceTracker::new();
        b.iter(|| {
            for _ in 0..2 {
                for (buffer, native) in buffers.iter().zip(&natives) {
                    let _ = tracker.register_buffer(
                        buffer,
                        *native,
                        BufferAccess::VertexInput,
                        PipelineStage::VertexInput,
                    );
                }
            }
            black_box(tracker.finish());
        });
    });
}

// ---------------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------------

fn bench_record_draws(c: &mut Criterion) {
    let rhi = null_rhi();
    let texture = rhi.new_texture(TextureDescriptor::new_2d(
        64,
        64,
        TextureFormat::Rgba8,
        TextureFlags::RENDER_TARGET,
    ));
    texture.create().unwrap();
    let target = rhi.new_texture_render_target(
        TextureRenderTargetDescription::new(vec![ColorAttachment::texture(&texture)]),
        TextureRenderTargetFlags::empty(),
    );
    let render_pass = target.new_compatible_render_pass_descriptor().unwrap();
    render_pass.create().unwrap();
    target.set_render_pass_descriptor(&render_pass);
    target.create().unwrap();

    let ubuf = buffer(&rhi, BufferType::Dynamic, BufferUsage::UNIFORM, 256);
    let vbuf = buffer(&rhi, BufferType::Static, BufferUsage::VERTEX, 4096);
    let srb = rhi.new_shader_resource_bindings();
    srb.set_bindings(vec![Binding::uniform_buffer(
        0,
        ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT,
        &ubuf,
    )]);
    srb.create().unwrap();
    let pipeline = rhi.new_graphics_pipeline(GraphicsPipelineDescriptor::new(vec![
        shader(ShaderStage::Vertex),
        shader(ShaderStage::Fragment),
    ]));
    pipeline.set_render_pass_descriptor(&render_pass);
    pipeline.set_shader_resource_bindings(&srb);
    pipeline.create().unwrap();

    c.bench_function("record_frame_1000_draws", |b| {
        b.iter(|| {
            let cb = rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
            cb.begin_pass(
                &*target,
                Color::BLACK,
                DepthStencilClearValue::default(),
                None,
                BeginPassFlags::empty(),
            );
            for i in 0..1000u32 {
                cb.set_graphics_pipeline(&pipeline);
                cb.set_shader_resources(None, &[]);
                cb.set_vertex_input(0, &[(&vbuf, (i % 64) * 64)], None);
                cb.draw(3, 1, 0, 0);
            }
            cb.end_pass(None);
            rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
        });
    });
}

// ---------------------------------------------------------------------------
// Update batches
// ---------------------------------------------------------------------------

fn bench_update_batch_commit(c: &mut Criterion) {
    let rhi = null_rhi();
    let ubuf = buffer(&rhi, BufferType::Dynamic, BufferUsage::UNIFORM, 4096);
    let data = [7u8; 64];

    c.bench_function("update_batch_64_dynamic_writes", |b| {
        b.iter(|| {
            let cb = rhi.begin_offscreen_frame(BeginFrameFlags::empty()).unwrap();
            let mut batch = rhi.next_resource_update_batch().unwrap();
            for i in 0..64u32 {
                batch.update_dynamic_buffer(&ubuf, i * 64, &data);
            }
            cb.resource_update(batch);
            rhi.end_offscreen_frame(EndFrameFlags::empty()).unwrap();
        });
    });
}

// ---------------------------------------------------------------------------
// Binding layouts
// ---------------------------------------------------------------------------

fn bench_srb_layout(c: &mut Criterion) {
    let rhi = null_rhi();
    let ubuf = buffer(&rhi, BufferType::Dynamic, BufferUsage::UNIFORM, 256);
    let make = || {
        let srb = rhi.new_shader_resource_bindings();
        srb.set_bindings(
            (0..16)
                .map(|i| Binding::uniform_buffer(i, ShaderStageFlags::VERTEX, &ubuf))
                .collect(),
        );
        srb
    };
    let a = make();
    let b_srb = make();

    c.bench_function("srb_layout_compatible_16_bindings", |b| {
        b.iter(|| black_box(a.is_layout_compatible(&b_srb)));
    });
    c.bench_function("srb_layout_hash_16_bindings", |b| {
        b.iter(|| black_box(a.layout_hash()));
    });
}

criterion_group!(
    benches,
    bench_tracker_register,
    bench_record_draws,
    bench_update_batch_commit,
    bench_srb_layout
);
criterion_main!(benches);
